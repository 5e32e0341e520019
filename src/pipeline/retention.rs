use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::PipelineContext;
use crate::clock::saturating_sub;
use crate::error::JobError;

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    pub raw_deleted: usize,
    pub raw_cutoff: Option<DateTime<Utc>>,
    /// Buckets removed per level name.
    pub buckets_deleted: BTreeMap<String, usize>,
}

/// Drops raw events and rollup buckets past their horizons.
///
/// Nothing is deleted that a consumer has not settled yet: raw events stay
/// until level 0's watermark passes them, and level `i` buckets stay until
/// level `i+1`'s watermark passes them.
#[derive(Clone)]
pub struct RetentionSweep {
    ctx: PipelineContext,
}

impl RetentionSweep {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<RetentionReport, JobError> {
        let store = &self.ctx.store;
        let runtime = store.runtime()?;
        let now = self.ctx.clock.now();
        let levels = store.levels();

        let mut report = RetentionReport::default();

        let raw_horizon = saturating_sub(now, runtime.raw_retention);
        if let Some(settled) = levels.first().and_then(|l| l.watermark()) {
            let cutoff = raw_horizon.min(settled);
            report.raw_deleted = store.raw().delete_before(cutoff);
            report.raw_cutoff = Some(cutoff);
        } else {
            debug!("level 0 has no watermark, keeping raw events");
        }

        for (i, level) in levels.iter().enumerate() {
            let Some(retention) = runtime.retention_for(level.name()) else {
                continue;
            };
            let horizon = saturating_sub(now, retention);

            let cutoff = match levels.get(i + 1) {
                Some(next) => match next.watermark() {
                    Some(settled) => horizon.min(settled),
                    None => continue,
                },
                None => horizon,
            };

            let removed = level.delete_ended_before(cutoff);
            report
                .buckets_deleted
                .insert(level.name().to_string(), removed);

            tokio::task::yield_now().await;
        }

        if let Some(health) = &self.ctx.health {
            health
                .retention_deleted
                .with_label_values(&["raw"])
                .inc_by(report.raw_deleted as f64);
            health.raw_events.set(store.raw().len() as f64);
            for level in levels {
                let removed = report.buckets_deleted.get(level.name()).copied().unwrap_or(0);
                health
                    .retention_deleted
                    .with_label_values(&[level.name()])
                    .inc_by(removed as f64);
                health
                    .rollup_buckets
                    .with_label_values(&[level.name()])
                    .set(level.bucket_count() as f64);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::clock::Clock;
    use crate::config::{Config, RuntimeConfig};
    use crate::error::ErrorKind;
    use crate::store::{BucketValue, EntityKey, RawEvent, Store, WindowBuckets};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn setup(now: &str, runtime: Option<RuntimeConfig>) -> PipelineContext {
        let levels = Config::default().levels;
        let runtime = runtime.map(|r| r.resolve(&levels));
        let store = Store::new(levels, runtime, None).expect("store");
        PipelineContext::new(Arc::new(store), Clock::manual(at(now)), None)
    }

    fn one_bucket() -> WindowBuckets {
        let mut buckets = WindowBuckets::new();
        buckets.insert(
            EntityKey::from("a.com"),
            BucketValue {
                count: 1,
                distribution: None,
            },
        );
        buckets
    }

    #[tokio::test]
    async fn test_requires_runtime_record() {
        let ctx = setup("2024-05-01T10:00:00Z", None);
        let err = RetentionSweep::new(ctx).run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    }

    #[tokio::test]
    async fn test_raw_events_kept_until_rolled_up() {
        let ctx = setup("2024-05-01T10:30:00Z", Some(RuntimeConfig::default()));
        ctx.store.raw().append(RawEvent {
            time: at("2024-05-01T10:00:00Z"),
            entity_key: EntityKey::from("a.com"),
        });

        let job = RetentionSweep::new(ctx.clone());
        let report = job.run().await.expect("sweep");
        assert_eq!(report.raw_deleted, 0);
        assert_eq!(ctx.store.raw().len(), 1);

        // Watermark behind the event: still kept.
        ctx.store
            .level(0)
            .expect("minute")
            .advance_watermark(at("2024-05-01T10:00:00Z"));
        assert_eq!(job.run().await.expect("sweep").raw_deleted, 0);

        ctx.store
            .level(0)
            .expect("minute")
            .advance_watermark(at("2024-05-01T10:01:00Z"));
        assert_eq!(job.run().await.expect("sweep").raw_deleted, 1);
        assert!(ctx.store.raw().is_empty());
    }

    #[tokio::test]
    async fn test_level_buckets_guarded_by_next_watermark() {
        let runtime = RuntimeConfig {
            level_retention: [("minute".to_string(), Duration::from_secs(8 * 3600).into())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let ctx = setup("2024-05-02T00:00:00Z", Some(runtime));
        let minute = ctx.store.level(0).expect("minute");
        minute.replace_window(at("2024-05-01T10:00:00Z"), one_bucket());
        minute.replace_window(at("2024-05-01T20:00:00Z"), one_bucket());

        let job = RetentionSweep::new(ctx.clone());
        let report = job.run().await.expect("sweep");
        assert_eq!(report.buckets_deleted.get("minute"), None);
        assert_eq!(minute.bucket_count(), 2);

        ctx.store
            .level(1)
            .expect("hour")
            .advance_watermark(at("2024-05-01T23:00:00Z"));
        let report = job.run().await.expect("sweep");
        assert_eq!(report.buckets_deleted.get("minute"), Some(&1));
        assert_eq!(minute.window_starts(), vec![at("2024-05-01T20:00:00Z")]);
    }

    #[tokio::test]
    async fn test_last_level_uses_horizon_only() {
        let ctx = setup("2024-07-01T00:00:00Z", Some(RuntimeConfig::default()));
        let day = ctx.store.level(2).expect("day");
        day.replace_window(at("2024-05-01T00:00:00Z"), one_bucket());
        day.replace_window(at("2024-06-20T00:00:00Z"), one_bucket());

        let report = RetentionSweep::new(ctx.clone()).run().await.expect("sweep");
        assert_eq!(report.buckets_deleted.get("day"), Some(&1));
        assert_eq!(day.window_starts(), vec![at("2024-06-20T00:00:00Z")]);
    }
}
