use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::PipelineContext;
use crate::clock::saturating_sub;
use crate::error::JobError;
use crate::store::EntityKey;

/// Result of one candidate selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionReport {
    pub window_time: DateTime<Utc>,
    /// Distinct entities seen in the election window.
    pub scanned: usize,
    /// Candidate rows written.
    pub candidates: usize,
}

/// Sums the finest level over the trailing election window and records
/// every entity at or above the hit threshold.
///
/// The window ends at level 0's watermark, so only settled buckets are
/// read and re-running on unchanged data rewrites the same rows.
#[derive(Clone)]
pub struct CandidateSelector {
    ctx: PipelineContext,
}

impl CandidateSelector {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<SelectionReport, JobError> {
        let store = &self.ctx.store;
        let runtime = store.runtime()?;

        let Some(level) = store.level(0) else {
            return Err(JobError::StoreUnavailable(
                "no rollup level configured".to_string(),
            ));
        };
        let Some(window_time) = level.watermark() else {
            return Err(JobError::RefreshLagExceeded {
                level: level.name().to_string(),
                requested: self.ctx.clock.now(),
                settled: None,
            });
        };

        let from = saturating_sub(window_time, runtime.election_window);
        let totals = level.sum_counts(from, window_time);
        let scanned = totals.len();

        let rows: HashMap<EntityKey, u64> = totals
            .into_iter()
            .filter(|(_, hits)| *hits >= runtime.min_hits_threshold)
            .collect();

        let candidates = store.candidates().replace_window(window_time, rows);

        if let Some(health) = &self.ctx.health {
            health.candidates_written.inc_by(candidates as f64);
        }

        Ok(SelectionReport {
            window_time,
            scanned,
            candidates,
        })
    }
}
