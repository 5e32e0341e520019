//! The periodic jobs of the pipeline: rollup refresh per level, retention,
//! candidate selection and election merge.

pub mod candidates;
pub mod election;
pub mod retention;
pub mod rollup;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::error::JobError;
use crate::export::health::HealthMetrics;
use crate::store::Store;

pub use candidates::{CandidateSelector, SelectionReport};
pub use election::{enforce_bounds, merge, ElectionMerger, MergeOutcome, MergeReport, MergeSettings};
pub use retention::{RetentionReport, RetentionSweep};
pub use rollup::{RefreshReport, RollupRefresh};

pub const RETENTION_JOB: &str = "retention";
pub const CANDIDATES_JOB: &str = "candidates";
pub const ELECTION_JOB: &str = "election";

/// Job name of the refresh job for a rollup level.
pub fn rollup_job_name(level: &str) -> String {
    format!("rollup_{level}")
}

/// Everything a job needs to run against shared state.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<Store>,
    pub clock: Clock,
    pub health: Option<Arc<HealthMetrics>>,
}

impl PipelineContext {
    pub fn new(store: Arc<Store>, clock: Clock, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            store,
            clock,
            health,
        }
    }
}

/// A schedulable pipeline job.
///
/// Enum dispatch keeps the scheduler free of boxed futures.
#[derive(Clone)]
pub enum PipelineJob {
    Rollup(RollupRefresh),
    Retention(RetentionSweep),
    Candidates(CandidateSelector),
    Election(ElectionMerger),
}

impl PipelineJob {
    /// Returns the job name used for scheduling, logging and metrics.
    pub fn name(&self) -> String {
        match self {
            Self::Rollup(j) => rollup_job_name(j.level_name()),
            Self::Retention(_) => RETENTION_JOB.to_string(),
            Self::Candidates(_) => CANDIDATES_JOB.to_string(),
            Self::Election(_) => ELECTION_JOB.to_string(),
        }
    }

    /// Run one invocation.
    pub async fn run(&self) -> Result<JobReport, JobError> {
        match self {
            Self::Rollup(j) => j.run().await.map(JobReport::Rollup),
            Self::Retention(j) => j.run().await.map(JobReport::Retention),
            Self::Candidates(j) => j.run().await.map(JobReport::Candidates),
            Self::Election(j) => j.run().await.map(JobReport::Election),
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobReport {
    Rollup(RefreshReport),
    Retention(RetentionReport),
    Candidates(SelectionReport),
    Election(MergeReport),
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rollup(r) => write!(
                f,
                "level={} windows={} buckets={} watermark={:?}",
                r.level, r.windows, r.buckets, r.watermark
            ),
            Self::Retention(r) => write!(
                f,
                "raw_deleted={} buckets_deleted={}",
                r.raw_deleted,
                r.buckets_deleted.values().sum::<usize>()
            ),
            Self::Candidates(r) => write!(
                f,
                "window_time={} scanned={} candidates={}",
                r.window_time, r.scanned, r.candidates
            ),
            Self::Election(r) => write!(
                f,
                "inserted={} updated={} evicted={} size={} version={}",
                r.inserted,
                r.updated,
                r.evicted_capacity + r.evicted_age,
                r.size,
                r.version
            ),
        }
    }
}
