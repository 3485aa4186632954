//! Canonicalization of heterogeneous scoreboard rows.
//!
//! Platforms disagree on key names (`name`/`team`/`account_name`/`username`,
//! `score`/`points`, `pos`/`place`/`rank`) and on value types (numbers vs.
//! numeric strings, nested team objects). Everything is folded into
//! [`ScoreboardEntry`] here so the rest of the engine sees one shape.

use serde_json::Value;
use std::collections::HashSet;

use crate::db::models::ScoreboardEntry;

pub const NAME_KEYS: [&str; 4] = ["name", "team", "account_name", "username"];
pub const SCORE_KEYS: [&str; 2] = ["score", "points"];
pub const RANK_KEYS: [&str; 3] = ["pos", "place", "rank"];

/// Normalize raw rows into entries sorted by rank ascending.
///
/// Rows without a usable name or score are dropped. When a name appears more
/// than once, only its best-ranked occurrence is kept.
pub fn normalize_entries(rows: &[Value]) -> Vec<ScoreboardEntry> {
    let mut entries: Vec<ScoreboardEntry> = rows
        .iter()
        .enumerate()
        .filter_map(|(idx, row)| normalize_row(row, idx as i64 + 1))
        .collect();

    // stable: equal ranks keep input order
    entries.sort_by_key(|e| e.rank);

    let mut seen = HashSet::new();
    entries.retain(|e| seen.insert(e.name.clone()));
    entries
}

fn normalize_row(row: &Value, position: i64) -> Option<ScoreboardEntry> {
    let obj = row.as_object()?;

    let name = NAME_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| is_truthy(v))
        .and_then(extract_name)?;

    // first key present wins, even when its value is null
    let score = SCORE_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(coerce_f64)?;

    let rank = RANK_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .and_then(coerce_rank)
        .filter(|r| *r >= 1)
        .unwrap_or(position);

    Some(ScoreboardEntry { rank, name, score })
}

fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

fn extract_name(v: &Value) -> Option<String> {
    let name = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        // nested team/user record: {"team": {"id": 3, "name": "A"}}
        Value::Object(o) => o.get("name")?.as_str()?.trim().to_string(),
        _ => return None,
    };
    (!name.is_empty()).then_some(name)
}

fn coerce_f64(v: &Value) -> Option<f64> {
    let n = v
        .as_f64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))?;
    n.is_finite().then_some(n)
}

fn coerce_rank(v: &Value) -> Option<i64> {
    v.as_i64()
        .or_else(|| v.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Whether a raw row carries both a name-like and a score-like key.
pub fn has_entry_keys(row: &Value) -> bool {
    let Some(obj) = row.as_object() else {
        return false;
    };
    NAME_KEYS.iter().any(|k| obj.contains_key(*k)) && SCORE_KEYS.iter().any(|k| obj.contains_key(*k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn test_alias_keys_resolve() {
        let rows = vec![json!({"team": "A", "points": 42, "place": 3})];
        let entries = normalize_entries(&rows);
        assert_eq!(
            entries,
            vec![ScoreboardEntry {
                rank: 3,
                name: "A".into(),
                score: 42.0
            }]
        );
    }

    #[test]
    fn test_alias_precedence() {
        let rows = vec![json!({
            "username": "u", "account_name": "acc", "team": "t", "name": "n",
            "points": 1, "score": 2,
            "rank": 9, "place": 8, "pos": 7
        })];
        let e = &normalize_entries(&rows)[0];
        assert_eq!(e.name, "n");
        assert_relative_eq!(e.score, 2.0);
        assert_eq!(e.rank, 7);

        let rows = vec![json!({"username": "u", "account_name": "acc", "score": 1, "rank": 4, "place": 2})];
        let e = &normalize_entries(&rows)[0];
        assert_eq!(e.name, "acc");
        assert_eq!(e.rank, 2);
    }

    #[test]
    fn test_nested_team_record() {
        let rows = vec![json!({"team": {"id": 5, "name": "Nested"}, "score": "13.5"})];
        let e = &normalize_entries(&rows)[0];
        assert_eq!(e.name, "Nested");
        assert_relative_eq!(e.score, 13.5);
        assert_eq!(e.rank, 1);
    }

    #[test]
    fn test_rank_falls_back_to_position() {
        let rows = vec![
            json!({"name": "first", "score": 30}),
            json!({"name": "second", "score": 20, "pos": "n/a"}),
            json!({"name": "third", "score": 10, "pos": 0}),
        ];
        let ranks: Vec<i64> = normalize_entries(&rows).iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[test]
    fn test_drops_incomplete_rows() {
        let rows = vec![
            json!({"name": "no-score"}),
            json!({"score": 10}),
            json!({"name": "", "score": 10}),
            json!({"name": "bad-score", "score": "lots"}),
            json!("not an object"),
            json!({"name": "ok", "score": 1}),
        ];
        let entries = normalize_entries(&rows);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "ok");
        // position counts every input row, kept or not
        assert_eq!(entries[0].rank, 6);
    }

    #[test]
    fn test_null_score_does_not_fall_through_to_points() {
        let rows = vec![
            json!({"name": "A", "score": null, "points": 5}),
            json!({"name": "B", "points": 7}),
        ];
        let entries = normalize_entries(&rows);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "B");
        assert_relative_eq!(entries[0].score, 7.0);
    }

    #[test]
    fn test_sorted_by_rank_without_duplicates() {
        let rows = vec![
            json!({"name": "C", "score": 1, "pos": 3}),
            json!({"name": "A", "score": 3, "pos": 1}),
            json!({"name": "B", "score": 2, "pos": 2}),
            json!({"name": "A", "score": 0, "pos": 4}),
        ];
        let names: Vec<String> = normalize_entries(&rows).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_has_entry_keys() {
        assert!(has_entry_keys(&json!({"team": "x", "points": 1})));
        assert!(!has_entry_keys(&json!({"team": "x"})));
        assert!(!has_entry_keys(&json!([1, 2])));
    }
}
