use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::EntityKey;
use crate::clock::{from_millis, saturating_sub};
use crate::config::LevelConfig;

const NO_WATERMARK: i64 = i64::MIN;

/// Spread of the child-window counts that make up a coarser bucket.
///
/// Only child windows where the entity was active contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Distribution {
    pub min: u64,
    pub max: u64,
    pub active_windows: u32,
}

impl Distribution {
    pub fn single(count: u64) -> Self {
        Self {
            min: count,
            max: count,
            active_windows: 1,
        }
    }

    pub fn observe(&mut self, count: u64) {
        self.min = self.min.min(count);
        self.max = self.max.max(count);
        self.active_windows += 1;
    }
}

/// Aggregated value of one entity in one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BucketValue {
    pub count: u64,
    pub distribution: Option<Distribution>,
}

/// Flattened bucket, as exposed to readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupBucket {
    pub level: String,
    pub window_start: DateTime<Utc>,
    pub entity_key: EntityKey,
    pub count: u64,
    pub distribution: Option<Distribution>,
}

pub type WindowBuckets = HashMap<EntityKey, BucketValue>;

/// Buckets and watermark of a single rollup level.
pub struct LevelStore {
    index: usize,
    config: LevelConfig,
    windows: RwLock<BTreeMap<DateTime<Utc>, WindowBuckets>>,
    watermark: AtomicI64,
}

impl LevelStore {
    pub fn new(index: usize, config: LevelConfig) -> Self {
        Self {
            index,
            config,
            windows: RwLock::new(BTreeMap::new()),
            watermark: AtomicI64::new(NO_WATERMARK),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LevelConfig {
        &self.config
    }

    /// End of the last settled window, if any refresh has completed.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self.watermark.load(Ordering::Acquire) {
            NO_WATERMARK => None,
            ms => Some(from_millis(ms)),
        }
    }

    /// Move the watermark forward. It never moves back.
    pub fn advance_watermark(&self, to: DateTime<Utc>) {
        self.watermark
            .fetch_max(to.timestamp_millis(), Ordering::AcqRel);
    }

    /// Atomically replace everything stored for one window.
    pub fn replace_window(&self, window_start: DateTime<Utc>, buckets: WindowBuckets) {
        let mut windows = self.windows.write();
        if buckets.is_empty() {
            windows.remove(&window_start);
        } else {
            windows.insert(window_start, buckets);
        }
    }

    /// Visit each stored window with `from <= window_start < to`.
    pub fn for_each_window<F>(&self, from: DateTime<Utc>, to: DateTime<Utc>, mut f: F)
    where
        F: FnMut(DateTime<Utc>, &WindowBuckets),
    {
        if from >= to {
            return;
        }
        let windows = self.windows.read();
        for (start, buckets) in windows.range(from..to) {
            f(*start, buckets);
        }
    }

    /// Summed counts per entity over windows starting in `[from, to)`.
    pub fn sum_counts(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> HashMap<EntityKey, u64> {
        let mut totals: HashMap<EntityKey, u64> = HashMap::new();
        self.for_each_window(from, to, |_, buckets| {
            for (key, value) in buckets {
                let total = totals.entry(key.clone()).or_default();
                *total = total.saturating_add(value.count);
            }
        });
        totals
    }

    /// Drop every window that ended at or before `cutoff`. Returns the
    /// number of buckets removed.
    pub fn delete_ended_before(&self, cutoff: DateTime<Utc>) -> usize {
        let boundary = saturating_sub(cutoff, self.config.width);
        let mut windows = self.windows.write();
        let mut removed = 0;
        while let Some(entry) = windows.first_entry() {
            if *entry.key() > boundary {
                break;
            }
            removed += entry.remove().len();
        }
        removed
    }

    pub fn bucket(&self, window_start: DateTime<Utc>, key: &str) -> Option<BucketValue> {
        self.windows
            .read()
            .get(&window_start)
            .and_then(|buckets| buckets.get(key).copied())
    }

    pub fn buckets_at(&self, window_start: DateTime<Utc>) -> Vec<RollupBucket> {
        let windows = self.windows.read();
        let Some(buckets) = windows.get(&window_start) else {
            return Vec::new();
        };
        let mut out: Vec<RollupBucket> = buckets
            .iter()
            .map(|(key, value)| RollupBucket {
                level: self.config.name.clone(),
                window_start,
                entity_key: key.clone(),
                count: value.count,
                distribution: value.distribution,
            })
            .collect();
        out.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        out
    }

    pub fn window_starts(&self) -> Vec<DateTime<Utc>> {
        self.windows.read().keys().copied().collect()
    }

    pub fn bucket_count(&self) -> usize {
        self.windows.read().values().map(HashMap::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn minute_level() -> LevelStore {
        LevelStore::new(
            0,
            LevelConfig {
                name: "minute".to_string(),
                width: Duration::from_secs(60),
                start_offset: Duration::from_secs(300),
                end_offset: Duration::from_secs(60),
                refresh_interval: Duration::from_secs(60),
                initial_delay: Duration::ZERO,
                cancel_on_overrun: false,
            },
        )
    }

    fn window(entries: &[(&str, u64)]) -> WindowBuckets {
        entries
            .iter()
            .map(|(k, c)| {
                (
                    EntityKey::from(*k),
                    BucketValue {
                        count: *c,
                        distribution: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_watermark_only_advances() {
        let level = minute_level();
        assert_eq!(level.watermark(), None);

        level.advance_watermark(at("2024-05-01T10:05:00Z"));
        level.advance_watermark(at("2024-05-01T10:03:00Z"));
        assert_eq!(level.watermark(), Some(at("2024-05-01T10:05:00Z")));
    }

    #[test]
    fn test_replace_window_is_wholesale() {
        let level = minute_level();
        let ws = at("2024-05-01T10:00:00Z");
        level.replace_window(ws, window(&[("a.com", 3), ("b.com", 1)]));
        level.replace_window(ws, window(&[("a.com", 4)]));

        assert_eq!(level.bucket(ws, "a.com").map(|b| b.count), Some(4));
        assert_eq!(level.bucket(ws, "b.com"), None);
        assert_eq!(level.bucket_count(), 1);

        level.replace_window(ws, WindowBuckets::new());
        assert!(level.window_starts().is_empty());
    }

    #[test]
    fn test_sum_counts_over_range() {
        let level = minute_level();
        level.replace_window(at("2024-05-01T10:00:00Z"), window(&[("a.com", 3)]));
        level.replace_window(at("2024-05-01T10:01:00Z"), window(&[("a.com", 2), ("b.com", 7)]));
        level.replace_window(at("2024-05-01T10:02:00Z"), window(&[("a.com", 100)]));

        let sums = level.sum_counts(at("2024-05-01T10:00:00Z"), at("2024-05-01T10:02:00Z"));
        assert_eq!(sums.get("a.com"), Some(&5));
        assert_eq!(sums.get("b.com"), Some(&7));
    }

    #[test]
    fn test_delete_ended_before() {
        let level = minute_level();
        level.replace_window(at("2024-05-01T10:00:00Z"), window(&[("a.com", 1), ("b.com", 1)]));
        level.replace_window(at("2024-05-01T10:01:00Z"), window(&[("a.com", 1)]));
        level.replace_window(at("2024-05-01T10:02:00Z"), window(&[("a.com", 1)]));

        // 10:01 window ends at 10:02, so it goes; 10:02 ends at 10:03 and stays.
        let removed = level.delete_ended_before(at("2024-05-01T10:02:30Z"));
        assert_eq!(removed, 3);
        assert_eq!(level.window_starts(), vec![at("2024-05-01T10:02:00Z")]);
    }

    #[test]
    fn test_distribution_observe() {
        let mut dist = Distribution::single(5);
        dist.observe(2);
        dist.observe(9);
        assert_eq!(
            dist,
            Distribution {
                min: 2,
                max: 9,
                active_windows: 3
            }
        );
    }
}
