use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::PipelineContext;
use crate::clock::{align_down, align_up, saturating_add, saturating_sub, window_starts};
use crate::error::JobError;
use crate::store::{BucketValue, Distribution, EntityKey, LevelStore, RawLog, WindowBuckets};

/// Result of one level refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshReport {
    pub level: String,
    pub windows: usize,
    pub buckets: usize,
    pub watermark: Option<DateTime<Utc>>,
}

/// Recomputes the settled windows of one rollup level.
///
/// A refresh at `now` covers every window whose end lies in
/// `[now - start_offset, now - end_offset]`. Level 0 reads the raw log,
/// level `i` reads level `i-1` but never past that level's watermark.
/// Each window is replaced as a whole, so re-running is idempotent.
#[derive(Clone)]
pub struct RollupRefresh {
    ctx: PipelineContext,
    level: usize,
    name: String,
}

impl RollupRefresh {
    /// Returns `None` when the store has no level at `level`.
    pub fn new(ctx: PipelineContext, level: usize) -> Option<Self> {
        let name = ctx.store.level(level)?.name().to_string();
        Some(Self { ctx, level, name })
    }

    pub fn level_name(&self) -> &str {
        &self.name
    }

    pub async fn run(&self) -> Result<RefreshReport, JobError> {
        let store = &self.ctx.store;
        let Some(level) = store.level(self.level) else {
            return Err(JobError::StoreUnavailable(format!(
                "rollup level {} is not configured",
                self.name
            )));
        };
        let cfg = level.config();
        let width = cfg.width;
        let now = self.ctx.clock.now();

        let from = saturating_sub(align_up(saturating_sub(now, cfg.start_offset), width), width);
        let requested = align_down(saturating_sub(now, cfg.end_offset), width);
        let mut to = requested;

        let upstream = match self.level.checked_sub(1) {
            Some(i) => store.level(i),
            None => None,
        };

        if let Some(upstream) = upstream {
            let Some(settled) = upstream.watermark() else {
                return Err(JobError::RefreshLagExceeded {
                    level: self.name.clone(),
                    requested,
                    settled: None,
                });
            };

            let settled_end = align_down(settled, width);
            if settled_end < to {
                to = settled_end;
                if to <= from && from < requested {
                    return Err(JobError::RefreshLagExceeded {
                        level: self.name.clone(),
                        requested,
                        settled: Some(settled),
                    });
                }
                debug!(
                    level = %self.name,
                    requested = %requested,
                    settled = %settled,
                    "refresh clamped to upstream watermark"
                );
            }
        }

        let mut windows = 0;
        let mut buckets = 0;

        if from < to {
            for window_start in window_starts(from, to, width) {
                let computed = match upstream {
                    Some(upstream) => fold_children(upstream, window_start, width),
                    None => count_raw(store.raw(), window_start, width),
                };
                buckets += computed.len();
                level.replace_window(window_start, computed);
                windows += 1;

                tokio::task::yield_now().await;
            }
            level.advance_watermark(to);
        }

        if let Some(health) = &self.ctx.health {
            health
                .rollup_windows_refreshed
                .with_label_values(&[self.name.as_str()])
                .inc_by(windows as f64);
            health
                .rollup_buckets
                .with_label_values(&[self.name.as_str()])
                .set(level.bucket_count() as f64);
            if let Some(wm) = level.watermark() {
                health
                    .rollup_watermark
                    .with_label_values(&[self.name.as_str()])
                    .set(wm.timestamp() as f64);
            }
        }

        Ok(RefreshReport {
            level: self.name.clone(),
            windows,
            buckets,
            watermark: level.watermark(),
        })
    }
}

/// Level-0 buckets for one window, straight from raw events.
fn count_raw(raw: &RawLog, window_start: DateTime<Utc>, width: Duration) -> WindowBuckets {
    raw.count_range(window_start, saturating_add(window_start, width))
        .into_iter()
        .map(|(key, count)| {
            (
                key,
                BucketValue {
                    count,
                    distribution: None,
                },
            )
        })
        .collect()
}

/// Coarser buckets for one window: the sum of the child windows it spans,
/// with the spread of the child counts.
fn fold_children(child: &LevelStore, window_start: DateTime<Utc>, width: Duration) -> WindowBuckets {
    let mut folded: HashMap<EntityKey, BucketValue> = HashMap::new();

    child.for_each_window(window_start, saturating_add(window_start, width), |_, buckets| {
        for (key, value) in buckets {
            folded
                .entry(key.clone())
                .and_modify(|acc| {
                    acc.count = acc.count.saturating_add(value.count);
                    if let Some(dist) = acc.distribution.as_mut() {
                        dist.observe(value.count);
                    }
                })
                .or_insert_with(|| BucketValue {
                    count: value.count,
                    distribution: Some(Distribution::single(value.count)),
                });
        }
    });

    folded
}
