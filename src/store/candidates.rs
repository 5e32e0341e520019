use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::EntityKey;

/// An entity that met the hit threshold over one election window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateRecord {
    pub entity_key: EntityKey,
    pub window_time: DateTime<Utc>,
    pub hits: u64,
}

/// Candidate rows keyed by `(window_time, entity_key)`.
///
/// A window that was evaluated but had no qualifying entity is still
/// recorded (empty), so the latest snapshot is always the latest
/// evaluation.
#[derive(Default)]
pub struct CandidateTable {
    windows: RwLock<BTreeMap<DateTime<Utc>, HashMap<EntityKey, u64>>>,
}

impl CandidateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rows of `window_time` with `rows`. Entities absent from
    /// `rows` lose their row at this window. Returns the number written.
    pub fn replace_window(&self, window_time: DateTime<Utc>, rows: HashMap<EntityKey, u64>) -> usize {
        let written = rows.len();
        self.windows.write().insert(window_time, rows);
        written
    }

    /// Rows of the most recent evaluated window, sorted by entity key.
    pub fn latest(&self) -> Option<(DateTime<Utc>, Vec<CandidateRecord>)> {
        let windows = self.windows.read();
        let (window_time, rows) = windows.iter().next_back()?;
        Some((*window_time, to_records(*window_time, rows)))
    }

    pub fn window(&self, window_time: DateTime<Utc>) -> Vec<CandidateRecord> {
        self.windows
            .read()
            .get(&window_time)
            .map(|rows| to_records(window_time, rows))
            .unwrap_or_default()
    }

    pub fn get(&self, entity_key: &str, window_time: DateTime<Utc>) -> Option<u64> {
        self.windows
            .read()
            .get(&window_time)
            .and_then(|rows| rows.get(entity_key).copied())
    }

    /// Delete windows with `window_time < cutoff`. Returns rows removed.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut windows = self.windows.write();
        let kept = windows.split_off(&cutoff);
        let removed = windows.values().map(HashMap::len).sum();
        *windows = kept;
        removed
    }

    pub fn len(&self) -> usize {
        self.windows.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn to_records(window_time: DateTime<Utc>, rows: &HashMap<EntityKey, u64>) -> Vec<CandidateRecord> {
    let mut records: Vec<CandidateRecord> = rows
        .iter()
        .map(|(key, hits)| CandidateRecord {
            entity_key: key.clone(),
            window_time,
            hits: *hits,
        })
        .collect();
    records.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
    records
}
