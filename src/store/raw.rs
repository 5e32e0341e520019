use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::EntityKey;
use crate::clock::align_down;

/// A single accepted access event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub time: DateTime<Utc>,
    pub entity_key: EntityKey,
}

/// Append-only raw event log, segmented by time.
///
/// Segments are aligned to the finest rollup width, so a level-0 refresh
/// touches exactly one segment per window and retention drops whole
/// segments.
pub struct RawLog {
    segment_width: Duration,
    segments: RwLock<BTreeMap<DateTime<Utc>, Vec<RawEvent>>>,
    len: AtomicUsize,
}

impl RawLog {
    pub fn new(segment_width: Duration) -> Self {
        Self {
            segment_width,
            segments: RwLock::new(BTreeMap::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Append one event.
    pub fn append(&self, event: RawEvent) {
        let segment = align_down(event.time, self.segment_width);
        self.segments.write().entry(segment).or_default().push(event);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Append a batch under a single lock acquisition. Order within the
    /// batch is preserved per segment.
    pub fn append_batch(&self, events: impl IntoIterator<Item = RawEvent>) -> usize {
        let mut segments = self.segments.write();
        let mut appended = 0;
        for event in events {
            let segment = align_down(event.time, self.segment_width);
            segments.entry(segment).or_default().push(event);
            appended += 1;
        }
        self.len.fetch_add(appended, Ordering::Relaxed);
        appended
    }

    /// Count events per entity with `from <= time < to`.
    pub fn count_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> HashMap<EntityKey, u64> {
        let mut counts: HashMap<EntityKey, u64> = HashMap::new();
        if from >= to {
            return counts;
        }

        let segments = self.segments.read();
        for events in segments
            .range(align_down(from, self.segment_width)..to)
            .map(|(_, events)| events)
        {
            for event in events {
                if event.time >= from && event.time < to {
                    *counts.entry(event.entity_key.clone()).or_default() += 1;
                }
            }
        }

        counts
    }

    /// Delete every event with `time < cutoff`. Returns the number removed.
    pub fn delete_before(&self, cutoff: DateTime<Utc>) -> usize {
        let boundary = align_down(cutoff, self.segment_width);
        let mut segments = self.segments.write();

        let kept = segments.split_off(&boundary);
        let mut removed: usize = segments.values().map(Vec::len).sum();
        *segments = kept;

        if let Some(partial) = segments.get_mut(&boundary) {
            let before = partial.len();
            partial.retain(|event| event.time >= cutoff);
            removed += before - partial.len();
            if partial.is_empty() {
                segments.remove(&boundary);
            }
        }

        self.len.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Timestamp of the oldest retained event.
    pub fn oldest(&self) -> Option<DateTime<Utc>> {
        let segments = self.segments.read();
        segments
            .values()
            .next()
            .and_then(|events| events.iter().map(|e| e.time).min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn event(time: &str, key: &str) -> RawEvent {
        RawEvent {
            time: at(time),
            entity_key: EntityKey::from(key),
        }
    }

    #[test]
    fn test_count_range_half_open() {
        let log = RawLog::new(Duration::from_secs(60));
        log.append(event("2024-05-01T10:00:00Z", "a.com"));
        log.append(event("2024-05-01T10:00:59Z", "a.com"));
        log.append(event("2024-05-01T10:01:00Z", "a.com"));
        log.append(event("2024-05-01T10:00:30Z", "b.com"));

        let counts = log.count_range(at("2024-05-01T10:00:00Z"), at("2024-05-01T10:01:00Z"));
        assert_eq!(counts.get("a.com"), Some(&2));
        assert_eq!(counts.get("b.com"), Some(&1));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_count_range_empty_when_inverted() {
        let log = RawLog::new(Duration::from_secs(60));
        log.append(event("2024-05-01T10:00:00Z", "a.com"));
        let counts = log.count_range(at("2024-05-01T10:01:00Z"), at("2024-05-01T10:00:00Z"));
        assert!(counts.is_empty());
    }

    #[test]
    fn test_delete_before_splits_partial_segment() {
        let log = RawLog::new(Duration::from_secs(60));
        let appended = log.append_batch(vec![
            event("2024-05-01T09:58:10Z", "a.com"),
            event("2024-05-01T09:59:10Z", "a.com"),
            event("2024-05-01T09:59:50Z", "b.com"),
            event("2024-05-01T10:00:10Z", "c.com"),
        ]);
        assert_eq!(appended, 4);

        let removed = log.delete_before(at("2024-05-01T09:59:30Z"));
        assert_eq!(removed, 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.oldest(), Some(at("2024-05-01T09:59:50Z")));

        assert_eq!(log.delete_before(at("2024-05-01T09:59:30Z")), 0);
        assert_eq!(log.delete_before(at("2024-05-01T11:00:00Z")), 2);
        assert!(log.is_empty());
        assert_eq!(log.oldest(), None);
    }
}
