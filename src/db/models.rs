use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Composite identity of a tracked competition: the owning community plus the
/// competition/event id within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub owner_id: i64,
    pub target_id: i64,
}

impl TargetKey {
    pub fn new(owner_id: i64, target_id: i64) -> Self {
        TargetKey {
            owner_id,
            target_id,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.target_id)
    }
}

/// How a target's scoreboard is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON endpoint discovered by probing (CTFd-style platforms)
    Api,
    /// JSON captured from a headless browser session (rCTF-style platforms)
    Rendered,
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "api" | "ctfd" => Ok(SourceKind::Api),
            "rendered" | "rctf" => Ok(SourceKind::Rendered),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

/// A tracked competition scoreboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTarget {
    pub owner_id: i64,
    pub target_id: i64,
    /// "api" | "rendered" (also accepts "ctfd" / "rctf"); validated at dispatch
    pub kind: String,
    pub base_url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Restrict tracking to this participant (case-insensitive)
    #[serde(default)]
    pub tracked_name: Option<String>,
    /// Competition end; polling stops once this is in the past
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Competition title, carried into delta events
    #[serde(default)]
    pub label: Option<String>,
}

impl PollTarget {
    pub fn key(&self) -> TargetKey {
        TargetKey::new(self.owner_id, self.target_id)
    }

    pub fn source_kind(&self) -> Result<SourceKind, String> {
        self.kind.parse()
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|end| end < now)
    }
}

/// One normalized scoreboard row.
///
/// Field order is part of the canonical hash form; do not reorder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreboardEntry {
    pub rank: i64,
    pub name: String,
    pub score: f64,
}

/// Last known state of a target's scoreboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Lowercase hex SHA-256 of `payload`
    pub hash: String,
    /// Canonical JSON of the entry list, rank ascending
    pub payload: String,
    pub captured_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn entries(&self) -> serde_json::Result<Vec<ScoreboardEntry>> {
        serde_json::from_str(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// A single human-meaningful difference between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    RankMoved {
        name: String,
        from: i64,
        to: i64,
        direction: Direction,
        /// old rank minus new rank; positive when climbing
        magnitude: i64,
        score: f64,
    },
    ScoreChanged {
        name: String,
        from: f64,
        to: f64,
        rank: i64,
    },
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::RankMoved {
                name,
                to,
                direction,
                score,
                ..
            } => write!(f, "{} {} to {} ({})", name, direction, to, score),
            Change::ScoreChanged {
                name,
                from,
                to,
                rank,
            } => write!(f, "{} score {} -> {} (pos {})", name, from, to, rank),
        }
    }
}

/// Emitted to the notification sink whenever a target's scoreboard changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEvent {
    pub target: TargetKey,
    pub label: Option<String>,
    /// Current top-N entries
    pub entries: Vec<ScoreboardEntry>,
    pub changes: Vec<Change>,
    pub source_url: String,
    pub detected_at: DateTime<Utc>,
}
