use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};

use super::error::ScoreboardError;
use crate::db::models::{Change, DeltaEvent, Direction, PollTarget, ScoreboardEntry, Snapshot};
use crate::db::SnapshotStore;

/// Result of comparing a fresh fetch against the stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// The tracked participant is not on the board; nothing stored
    NotTracked,
    /// Same digest as last time; nothing stored
    Unchanged,
    /// New snapshot stored; the event is ready for the sink
    Changed(DeltaEvent),
}

/// Compact JSON of the entry list with a fixed field order.
pub fn canonical_payload(entries: &[ScoreboardEntry]) -> serde_json::Result<String> {
    serde_json::to_string(entries)
}

/// Lowercase hex SHA-256 of a canonical payload.
pub fn payload_hash(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Keep only the entry named `tracked` (case-insensitive).
pub fn filter_tracked(entries: Vec<ScoreboardEntry>, tracked: &str) -> Option<Vec<ScoreboardEntry>> {
    let wanted = tracked.trim().to_lowercase();
    entries
        .into_iter()
        .find(|e| e.name.to_lowercase() == wanted)
        .map(|e| vec![e])
}

/// Changes among the first `top_n` current entries, compared by name against
/// the previous list. One line per name; a rank move wins over a score change
/// and names not seen before produce nothing.
pub fn compute_changes(
    current: &[ScoreboardEntry],
    previous: &[ScoreboardEntry],
    top_n: usize,
) -> Vec<Change> {
    let prior: HashMap<&str, (i64, f64)> = previous
        .iter()
        .map(|e| (e.name.as_str(), (e.rank, e.score)))
        .collect();

    current
        .iter()
        .take(top_n)
        .filter_map(|entry| {
            let &(old_rank, old_score) = prior.get(entry.name.as_str())?;
            if old_rank != entry.rank {
                let magnitude = old_rank - entry.rank;
                Some(Change::RankMoved {
                    name: entry.name.clone(),
                    from: old_rank,
                    to: entry.rank,
                    direction: if magnitude > 0 {
                        Direction::Up
                    } else {
                        Direction::Down
                    },
                    magnitude,
                    score: entry.score,
                })
            } else if old_score != entry.score {
                Some(Change::ScoreChanged {
                    name: entry.name.clone(),
                    from: old_score,
                    to: entry.score,
                    rank: entry.rank,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Hash-based change detection with rank/score deltas.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    top_n: usize,
    max_change_lines: usize,
}

impl DiffEngine {
    pub fn new(top_n: usize, max_change_lines: usize) -> Self {
        DiffEngine {
            top_n,
            max_change_lines,
        }
    }

    /// Compare `entries` with the target's stored snapshot and, on change,
    /// replace the snapshot and build the delta event.
    ///
    /// The snapshot is written before the event is returned: a failed write
    /// fails the target's cycle and the change is picked up again next time.
    pub fn apply(
        &self,
        store: &dyn SnapshotStore,
        target: &PollTarget,
        entries: Vec<ScoreboardEntry>,
        tracked_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DiffOutcome, ScoreboardError> {
        let key = target.key();

        let entries = match tracked_name {
            Some(tracked) => match filter_tracked(entries, tracked) {
                Some(filtered) => filtered,
                None => {
                    debug!("[{}] '{}' not on the scoreboard", key, tracked);
                    return Ok(DiffOutcome::NotTracked);
                }
            },
            None => entries,
        };

        let payload = canonical_payload(&entries)
            .map_err(|e| ScoreboardError::Shape(format!("entries not serializable: {}", e)))?;
        let hash = payload_hash(&payload);

        let previous = store
            .get_snapshot(key)
            .map_err(ScoreboardError::Persistence)?;
        if previous.as_ref().is_some_and(|p| p.hash == hash) {
            return Ok(DiffOutcome::Unchanged);
        }

        let mut changes = match previous.as_ref().map(Snapshot::entries) {
            Some(Ok(old)) => compute_changes(&entries, &old, self.top_n),
            Some(Err(e)) => {
                warn!("[{}] Stored snapshot unreadable, skipping change lines: {}", key, e);
                Vec::new()
            }
            None => Vec::new(),
        };
        changes.truncate(self.max_change_lines);

        let snapshot = Snapshot {
            hash,
            payload,
            captured_at: now,
        };
        store
            .put_snapshot(key, &snapshot)
            .map_err(ScoreboardError::Persistence)?;

        let mut top = entries;
        top.truncate(self.top_n);

        Ok(DiffOutcome::Changed(DeltaEvent {
            target: key,
            label: target.label.clone(),
            entries: top,
            changes,
            source_url: target.base_url.clone(),
            detected_at: now,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TargetKey;
    use crate::db::Database;
    use anyhow::Result;
    use std::sync::Mutex;

    fn entry(rank: i64, name: &str, score: f64) -> ScoreboardEntry {
        ScoreboardEntry {
            rank,
            name: name.into(),
            score,
        }
    }

    fn target() -> PollTarget {
        PollTarget {
            owner_id: 1,
            target_id: 2,
            kind: "api".into(),
            base_url: "https://ctf.example.com".into(),
            auth_token: None,
            tracked_name: None,
            ends_at: None,
            label: Some("Example CTF".into()),
        }
    }

    /// In-memory store that counts writes.
    #[derive(Default)]
    struct CountingStore {
        snapshots: Mutex<HashMap<TargetKey, Snapshot>>,
        puts: Mutex<usize>,
    }

    impl CountingStore {
        fn puts(&self) -> usize {
            *self.puts.lock().unwrap()
        }
    }

    impl SnapshotStore for CountingStore {
        fn get_snapshot(&self, key: TargetKey) -> Result<Option<Snapshot>> {
            Ok(self.snapshots.lock().unwrap().get(&key).cloned())
        }

        fn put_snapshot(&self, key: TargetKey, snapshot: &Snapshot) -> Result<()> {
            *self.puts.lock().unwrap() += 1;
            self.snapshots.lock().unwrap().insert(key, snapshot.clone());
            Ok(())
        }

        fn list_targets(&self) -> Result<Vec<PollTarget>> {
            Ok(vec![])
        }
    }

    struct FailingStore;

    impl SnapshotStore for FailingStore {
        fn get_snapshot(&self, _key: TargetKey) -> Result<Option<Snapshot>> {
            Ok(None)
        }

        fn put_snapshot(&self, _key: TargetKey, _snapshot: &Snapshot) -> Result<()> {
            anyhow::bail!("disk full")
        }

        fn list_targets(&self) -> Result<Vec<PollTarget>> {
            Ok(vec![])
        }
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let entries = vec![entry(1, "A", 10.0), entry(2, "B", 5.0)];
        let a = payload_hash(&canonical_payload(&entries).unwrap());
        let b = payload_hash(&canonical_payload(&entries.clone()).unwrap());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_hash_ignores_source_key_order() {
        use crate::scoreboard::normalize::normalize_entries;
        let a: Vec<serde_json::Value> =
            serde_json::from_str(r#"[{"name":"A","score":10,"pos":1}]"#).unwrap();
        let b: Vec<serde_json::Value> =
            serde_json::from_str(r#"[{"pos":1,"score":10.0,"name":"A"}]"#).unwrap();
        let ha = payload_hash(&canonical_payload(&normalize_entries(&a)).unwrap());
        let hb = payload_hash(&canonical_payload(&normalize_entries(&b)).unwrap());
        assert_eq!(ha, hb);
    }

    #[test]
    fn test_canonical_field_order() {
        let payload = canonical_payload(&[entry(1, "A", 42.0)]).unwrap();
        assert_eq!(payload, r#"[{"rank":1,"name":"A","score":42.0}]"#);
    }

    #[test]
    fn test_rank_movement_down() {
        let changes = compute_changes(&[entry(2, "X", 100.0)], &[entry(1, "X", 100.0)], 10);
        assert_eq!(
            changes,
            vec![Change::RankMoved {
                name: "X".into(),
                from: 1,
                to: 2,
                direction: Direction::Down,
                magnitude: -1,
                score: 100.0,
            }]
        );
        assert_eq!(changes[0].to_string(), "X down to 2 (100)");
    }

    #[test]
    fn test_rank_movement_up_takes_priority_over_score() {
        let changes = compute_changes(&[entry(1, "Y", 300.0)], &[entry(3, "Y", 200.0)], 10);
        assert!(matches!(
            &changes[..],
            [Change::RankMoved { direction: Direction::Up, magnitude: 2, .. }]
        ));
    }

    #[test]
    fn test_score_change() {
        let changes = compute_changes(&[entry(1, "X", 150.0)], &[entry(1, "X", 100.0)], 10);
        assert_eq!(
            changes,
            vec![Change::ScoreChanged {
                name: "X".into(),
                from: 100.0,
                to: 150.0,
                rank: 1,
            }]
        );
        assert_eq!(changes[0].to_string(), "X score 100 -> 150 (pos 1)");
    }

    #[test]
    fn test_new_names_are_not_changes() {
        let changes = compute_changes(&[entry(1, "New", 1.0), entry(2, "Old", 1.0)], &[entry(1, "Old", 1.0)], 10);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to_string(), "Old down to 2 (1)");
    }

    #[test]
    fn test_top_n_restriction() {
        let old: Vec<_> = (1..=5).map(|r| entry(r, &format!("t{}", r), 0.0)).collect();
        let new: Vec<_> = (1..=5).map(|r| entry(r, &format!("t{}", 6 - r), 0.0)).collect();
        let changes = compute_changes(&new, &old, 2);
        let lines: Vec<String> = changes.iter().map(|c| c.to_string()).collect();
        assert_eq!(lines, vec!["t5 up to 1 (0)", "t4 up to 2 (0)"]);
    }

    #[test]
    fn test_first_run_persists_and_emits_without_changes() {
        let store = CountingStore::default();
        let engine = DiffEngine::new(10, 5);
        let outcome = engine
            .apply(&store, &target(), vec![entry(1, "A", 1.0)], None, Utc::now())
            .unwrap();
        match outcome {
            DiffOutcome::Changed(ev) => {
                assert!(ev.changes.is_empty());
                assert_eq!(ev.entries.len(), 1);
                assert_eq!(ev.label.as_deref(), Some("Example CTF"));
                assert_eq!(ev.source_url, "https://ctf.example.com");
            }
            other => panic!("expected change, got {:?}", other),
        }
        assert_eq!(store.puts(), 1);
    }

    #[test]
    fn test_identical_lists_are_noop() {
        let store = CountingStore::default();
        let engine = DiffEngine::new(10, 5);
        let entries = vec![entry(1, "A", 1.0), entry(2, "B", 0.5)];
        engine
            .apply(&store, &target(), entries.clone(), None, Utc::now())
            .unwrap();
        let before = store.get_snapshot(target().key()).unwrap().unwrap();

        let outcome = engine
            .apply(&store, &target(), entries, None, Utc::now())
            .unwrap();
        assert_eq!(outcome, DiffOutcome::Unchanged);
        assert_eq!(store.puts(), 1);
        assert_eq!(store.get_snapshot(target().key()).unwrap().unwrap(), before);
    }

    #[test]
    fn test_tracked_name_missing_is_not_tracked() {
        let store = CountingStore::default();
        let engine = DiffEngine::new(10, 5);
        let outcome = engine
            .apply(&store, &target(), vec![entry(1, "A", 1.0)], Some("teamX"), Utc::now())
            .unwrap();
        assert_eq!(outcome, DiffOutcome::NotTracked);
        assert_eq!(store.puts(), 0);
    }

    #[test]
    fn test_tracked_name_filters_case_insensitively() {
        let store = CountingStore::default();
        let engine = DiffEngine::new(10, 5);
        let board = |score| vec![entry(1, "A", 9.0), entry(2, "TeamX", score)];

        engine
            .apply(&store, &target(), board(1.0), Some("teamx"), Utc::now())
            .unwrap();
        let outcome = engine
            .apply(&store, &target(), board(2.0), Some("teamx"), Utc::now())
            .unwrap();
        let DiffOutcome::Changed(ev) = outcome else {
            panic!("expected a change");
        };
        assert_eq!(ev.entries, vec![entry(2, "TeamX", 2.0)]);
        assert_eq!(ev.changes.len(), 1);
    }

    #[test]
    fn test_change_lines_capped() {
        let store = CountingStore::default();
        let engine = DiffEngine::new(10, 3);
        let old: Vec<_> = (1..=8).map(|r| entry(r, &format!("t{}", r), 0.0)).collect();
        let new: Vec<_> = (1..=8).map(|r| entry(r, &format!("t{}", r), 1.0)).collect();
        engine.apply(&store, &target(), old, None, Utc::now()).unwrap();
        let DiffOutcome::Changed(ev) = engine.apply(&store, &target(), new, None, Utc::now()).unwrap()
        else {
            panic!("expected a change");
        };
        assert_eq!(ev.changes.len(), 3);
        assert_eq!(ev.entries.len(), 8);
    }

    #[test]
    fn test_corrupt_previous_payload_degrades_to_no_changes() {
        let store = CountingStore::default();
        store
            .put_snapshot(
                target().key(),
                &Snapshot {
                    hash: "stale".into(),
                    payload: "{not json".into(),
                    captured_at: Utc::now(),
                },
            )
            .unwrap();

        let outcome = DiffEngine::new(10, 5)
            .apply(&store, &target(), vec![entry(1, "A", 1.0)], None, Utc::now())
            .unwrap();
        let DiffOutcome::Changed(ev) = outcome else {
            panic!("expected a change");
        };
        assert!(ev.changes.is_empty());
        assert_eq!(store.puts(), 2);
        assert_ne!(store.get_snapshot(target().key()).unwrap().unwrap().hash, "stale");
    }

    #[test]
    fn test_persistence_failure_fails_the_target() {
        let err = DiffEngine::new(10, 5)
            .apply(&FailingStore, &target(), vec![entry(1, "A", 1.0)], None, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ScoreboardError::Persistence(_)));
    }

    #[test]
    fn test_against_sqlite_store() {
        let db = Database::open(":memory:").unwrap();
        let engine = DiffEngine::new(10, 5);
        engine
            .apply(&db, &target(), vec![entry(1, "X", 100.0)], None, Utc::now())
            .unwrap();
        let DiffOutcome::Changed(ev) = engine
            .apply(&db, &target(), vec![entry(1, "X", 150.0)], None, Utc::now())
            .unwrap()
        else {
            panic!("expected a change");
        };
        assert_eq!(ev.changes[0].to_string(), "X score 100 -> 150 (pos 1)");
    }
}
