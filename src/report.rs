use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{BoardState, EntityKey, LeaderboardEntry};

/// One ranked leaderboard row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub rank: usize,
    pub entity_key: EntityKey,
    pub cumulative_hits: u64,
    pub last_election_hits: u64,
    pub times_elected: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// `cumulative_hits` per minute since `first_seen`.
    pub avg_hits_per_minute: f64,
}

/// Read-only projection of the leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaderboardReport {
    pub generated_at: DateTime<Utc>,
    pub version: u64,
    pub size: usize,
    pub last_merged_window: Option<DateTime<Utc>>,
    pub entries: Vec<ReportRow>,
}

/// Rank entries by `cumulative_hits` descending, ties by key ascending.
pub fn build(state: &BoardState, now: DateTime<Utc>, limit: Option<usize>) -> LeaderboardReport {
    let mut ranked: Vec<&LeaderboardEntry> = state.entries.values().collect();
    ranked.sort_by(|a, b| {
        b.cumulative_hits
            .cmp(&a.cumulative_hits)
            .then_with(|| a.entity_key.cmp(&b.entity_key))
    });

    let entries = ranked
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(i, entry)| ReportRow {
            rank: i + 1,
            entity_key: entry.entity_key.clone(),
            cumulative_hits: entry.cumulative_hits,
            last_election_hits: entry.last_election_hits,
            times_elected: entry.times_elected,
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
            avg_hits_per_minute: avg_per_minute(entry.cumulative_hits, entry.first_seen, now),
        })
        .collect();

    LeaderboardReport {
        generated_at: now,
        version: state.version,
        size: state.len(),
        last_merged_window: state.last_merged_window,
        entries,
    }
}

fn avg_per_minute(hits: u64, since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed_secs = (now - since).num_seconds().max(1);
    hits as f64 / elapsed_secs as f64 * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn board(entries: &[(&str, u64, &str)]) -> BoardState {
        let mut state = BoardState {
            version: 3,
            ..Default::default()
        };
        for (key, hits, first_seen) in entries {
            state.entries.insert(
                EntityKey::from(*key),
                LeaderboardEntry {
                    entity_key: EntityKey::from(*key),
                    first_seen: at(first_seen),
                    last_seen: at(first_seen),
                    cumulative_hits: *hits,
                    last_election_hits: *hits,
                    times_elected: 1,
                },
            );
        }
        state
    }

    #[test]
    fn test_sorted_by_hits_then_key() {
        let state = board(&[
            ("b.com", 500, "2024-05-01T10:00:00Z"),
            ("a.com", 500, "2024-05-01T10:00:00Z"),
            ("c.com", 900, "2024-05-01T10:00:00Z"),
        ]);
        let report = build(&state, at("2024-05-01T11:00:00Z"), None);

        let keys: Vec<&str> = report.entries.iter().map(|r| &*r.entity_key).collect();
        assert_eq!(keys, vec!["c.com", "a.com", "b.com"]);
        assert_eq!(report.entries[0].rank, 1);
        assert_eq!(report.entries[2].rank, 3);
        assert_eq!(report.size, 3);
        assert_eq!(report.version, 3);
    }

    #[test]
    fn test_limit_truncates_but_size_is_total() {
        let state = board(&[
            ("a.com", 1, "2024-05-01T10:00:00Z"),
            ("b.com", 2, "2024-05-01T10:00:00Z"),
        ]);
        let report = build(&state, at("2024-05-01T11:00:00Z"), Some(1));
        assert_eq!(report.entries.len(), 1);
        assert_eq!(&*report.entries[0].entity_key, "b.com");
        assert_eq!(report.size, 2);
    }

    #[test]
    fn test_average_rate_per_minute() {
        let state = board(&[("a.com", 6000, "2024-05-01T10:00:00Z")]);
        let report = build(&state, at("2024-05-01T11:00:00Z"), None);
        assert!((report.entries[0].avg_hits_per_minute - 100.0).abs() < 1e-9);

        // Elapsed clamps to one second.
        let report = build(&state, at("2024-05-01T10:00:00Z"), None);
        assert!((report.entries[0].avg_hits_per_minute - 360_000.0).abs() < 1e-6);
    }
}
