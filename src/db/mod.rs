use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

/// Persistence contract consumed by the polling engine.
///
/// Keyed per target, so callers working on different targets need no
/// coordination; a single target must only ever have one writer at a time.
pub trait SnapshotStore: Send + Sync {
    fn get_snapshot(&self, key: TargetKey) -> Result<Option<Snapshot>>;
    fn put_snapshot(&self, key: TargetKey, snapshot: &Snapshot) -> Result<()>;
    fn list_targets(&self) -> Result<Vec<PollTarget>>;
}

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    // ── Targets ──────────────────────────────────────────────────────────────

    /// Insert or replace a target's configuration
    pub fn upsert_target(&self, target: &PollTarget) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO poll_targets (
                owner_id, target_id, kind, base_url, auth_token,
                tracked_name, ends_at, label
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(owner_id, target_id) DO UPDATE SET
                kind=excluded.kind,
                base_url=excluded.base_url,
                auth_token=excluded.auth_token,
                tracked_name=excluded.tracked_name,
                ends_at=excluded.ends_at,
                label=excluded.label",
            params![
                target.owner_id,
                target.target_id,
                target.kind,
                target.base_url,
                target.auth_token,
                target.tracked_name,
                target.ends_at,
                target.label,
            ],
        )?;
        Ok(())
    }

    pub fn get_target(&self, key: TargetKey) -> Result<Option<PollTarget>> {
        let conn = self.conn()?;
        let target = conn
            .query_row(
                "SELECT owner_id, target_id, kind, base_url, auth_token,
                        tracked_name, ends_at, label
                 FROM poll_targets WHERE owner_id=?1 AND target_id=?2",
                params![key.owner_id, key.target_id],
                map_target,
            )
            .optional()?;
        Ok(target)
    }

    /// Remove a target together with its snapshot. Returns whether it existed.
    pub fn delete_target(&self, key: TargetKey) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM poll_targets WHERE owner_id=?1 AND target_id=?2",
            params![key.owner_id, key.target_id],
        )?;
        tx.execute(
            "DELETE FROM scoreboard_snapshots WHERE owner_id=?1 AND target_id=?2",
            params![key.owner_id, key.target_id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    // ── Delta history ────────────────────────────────────────────────────────

    /// Record a delivered delta event for the admin API
    pub fn insert_delta_event(&self, event: &DeltaEvent) -> Result<i64> {
        let entries = serde_json::to_string(&event.entries)?;
        let changes = serde_json::to_string(&event.changes)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO delta_events (
                owner_id, target_id, label, entries_json, changes_json,
                source_url, detected_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                event.target.owner_id,
                event.target.target_id,
                event.label,
                entries,
                changes,
                event.source_url,
                event.detected_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List recent delta events, newest first
    pub fn list_recent_delta_events(&self, limit: i64) -> Result<Vec<DeltaEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner_id, target_id, label, entries_json, changes_json,
                    source_url, detected_at
             FROM delta_events ORDER BY detected_at DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    TargetKey::new(row.get(0)?, row.get(1)?),
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, chrono::DateTime<chrono::Utc>>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(target, label, entries, changes, source_url, detected_at)| -> Result<DeltaEvent> {
                Ok(DeltaEvent {
                    target,
                    label,
                    entries: serde_json::from_str(&entries)
                        .context("corrupt delta entries column")?,
                    changes: serde_json::from_str(&changes)
                        .context("corrupt delta changes column")?,
                    source_url,
                    detected_at,
                })
            })
            .collect()
    }
}

impl SnapshotStore for Database {
    fn get_snapshot(&self, key: TargetKey) -> Result<Option<Snapshot>> {
        let conn = self.conn()?;
        let snapshot = conn
            .query_row(
                "SELECT last_hash, last_payload, captured_at
                 FROM scoreboard_snapshots WHERE owner_id=?1 AND target_id=?2",
                params![key.owner_id, key.target_id],
                |row| {
                    Ok(Snapshot {
                        hash: row.get(0)?,
                        payload: row.get(1)?,
                        captured_at: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    fn put_snapshot(&self, key: TargetKey, snapshot: &Snapshot) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scoreboard_snapshots (owner_id, target_id, last_hash, last_payload, captured_at)
             VALUES (?1,?2,?3,?4,?5)
             ON CONFLICT(owner_id, target_id) DO UPDATE SET
                last_hash=excluded.last_hash,
                last_payload=excluded.last_payload,
                captured_at=excluded.captured_at",
            params![
                key.owner_id,
                key.target_id,
                snapshot.hash,
                snapshot.payload,
                snapshot.captured_at,
            ],
        )?;
        Ok(())
    }

    fn list_targets(&self) -> Result<Vec<PollTarget>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner_id, target_id, kind, base_url, auth_token,
                    tracked_name, ends_at, label
             FROM poll_targets ORDER BY owner_id, target_id",
        )?;
        let targets = stmt
            .query_map([], map_target)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(targets)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_target(row: &rusqlite::Row) -> rusqlite::Result<PollTarget> {
    Ok(PollTarget {
        owner_id: row.get(0)?,
        target_id: row.get(1)?,
        kind: row.get(2)?,
        base_url: row.get(3)?,
        auth_token: row.get(4)?,
        tracked_name: row.get(5)?,
        ends_at: row.get(6)?,
        label: row.get(7)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS poll_targets (
    owner_id     INTEGER NOT NULL,
    target_id    INTEGER NOT NULL,
    kind         TEXT    NOT NULL,
    base_url     TEXT    NOT NULL,
    auth_token   TEXT,
    tracked_name TEXT,
    ends_at      TEXT,
    label        TEXT,
    PRIMARY KEY (owner_id, target_id)
);

CREATE TABLE IF NOT EXISTS scoreboard_snapshots (
    owner_id     INTEGER NOT NULL,
    target_id    INTEGER NOT NULL,
    last_hash    TEXT    NOT NULL,
    last_payload TEXT    NOT NULL,
    captured_at  TEXT    NOT NULL,
    PRIMARY KEY (owner_id, target_id)
);

CREATE TABLE IF NOT EXISTS delta_events (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id     INTEGER NOT NULL,
    target_id    INTEGER NOT NULL,
    label        TEXT,
    entries_json TEXT    NOT NULL,
    changes_json TEXT    NOT NULL,
    source_url   TEXT    NOT NULL,
    detected_at  TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delta_events_target ON delta_events(owner_id, target_id);
CREATE INDEX IF NOT EXISTS idx_delta_events_detected ON delta_events(detected_at);
"#;
