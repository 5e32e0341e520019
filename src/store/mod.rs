//! Shared mutable state every job runs against.

pub mod candidates;
pub mod leaderboard;
pub mod raw;
pub mod rollup;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arc_swap::ArcSwapOption;

use crate::config::{LevelConfig, RuntimeConfig};
use crate::error::JobError;

pub use candidates::{CandidateRecord, CandidateTable};
pub use leaderboard::{BoardState, Leaderboard, LeaderboardEntry};
pub use raw::{RawEvent, RawLog};
pub use rollup::{BucketValue, Distribution, LevelStore, RollupBucket, WindowBuckets};

/// Normalized entity identifier (a domain name).
pub type EntityKey = Arc<str>;

/// Raw events, rollup levels, candidates, leaderboard and the runtime
/// record.
pub struct Store {
    raw: RawLog,
    levels: Vec<LevelStore>,
    layout: Vec<LevelConfig>,
    candidates: CandidateTable,
    leaderboard: Leaderboard,
    runtime: ArcSwapOption<RuntimeConfig>,
}

impl Store {
    /// Build a store for the given level layout.
    ///
    /// `runtime` is expected to be resolved and validated already.
    pub fn new(
        levels: Vec<LevelConfig>,
        runtime: Option<RuntimeConfig>,
        snapshot_path: Option<PathBuf>,
    ) -> Result<Self> {
        let Some(first) = levels.first() else {
            bail!("at least one rollup level is required");
        };

        let leaderboard = match snapshot_path {
            Some(path) => Leaderboard::open(&path)
                .with_context(|| format!("opening leaderboard snapshot {}", path.display()))?,
            None => Leaderboard::in_memory(),
        };

        Ok(Self {
            raw: RawLog::new(first.width),
            levels: levels
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, cfg)| LevelStore::new(i, cfg))
                .collect(),
            layout: levels,
            candidates: CandidateTable::new(),
            leaderboard,
            runtime: ArcSwapOption::new(runtime.map(Arc::new)),
        })
    }

    pub fn raw(&self) -> &RawLog {
        &self.raw
    }

    pub fn levels(&self) -> &[LevelStore] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&LevelStore> {
        self.levels.get(index)
    }

    pub fn level_by_name(&self, name: &str) -> Option<&LevelStore> {
        self.levels.iter().find(|l| l.name() == name)
    }

    pub fn layout(&self) -> &[LevelConfig] {
        &self.layout
    }

    pub fn candidates(&self) -> &CandidateTable {
        &self.candidates
    }

    pub fn leaderboard(&self) -> &Leaderboard {
        &self.leaderboard
    }

    /// The runtime record for one tick. Jobs call this once per run and
    /// use the returned snapshot throughout.
    pub fn runtime(&self) -> Result<Arc<RuntimeConfig>, JobError> {
        self.runtime.load_full().ok_or(JobError::ConfigMissing)
    }

    pub fn runtime_opt(&self) -> Option<Arc<RuntimeConfig>> {
        self.runtime.load_full()
    }

    /// Resolve, validate and publish a new runtime record.
    pub fn replace_runtime(&self, runtime: RuntimeConfig) -> Result<Arc<RuntimeConfig>> {
        let runtime = runtime.resolve(&self.layout);
        runtime.validate(&self.layout)?;

        let runtime = Arc::new(runtime);
        self.runtime.store(Some(Arc::clone(&runtime)));
        Ok(runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ErrorKind;

    #[test]
    fn test_missing_runtime_is_config_missing() {
        let store = Store::new(Config::default().levels, None, None).expect("store");
        assert_eq!(store.runtime().unwrap_err().kind(), ErrorKind::ConfigMissing);
    }

    #[test]
    fn test_replace_runtime_resolves_levels() {
        let store = Store::new(Config::default().levels, None, None).expect("store");
        let runtime = store
            .replace_runtime(RuntimeConfig::default())
            .expect("valid record");
        assert_eq!(runtime.level_retention.len(), 3);
        assert_eq!(store.runtime().expect("present").max_leaderboard_size, 1000);
    }

    #[test]
    fn test_replace_runtime_rejects_invalid() {
        let store = Store::new(Config::default().levels, None, None).expect("store");
        let err = store
            .replace_runtime(RuntimeConfig {
                min_hits_threshold: 0,
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("min_hits_threshold"));
        assert!(store.runtime_opt().is_none());
    }

    #[test]
    fn test_level_lookup() {
        let store = Store::new(Config::default().levels, None, None).expect("store");
        assert_eq!(store.levels().len(), 3);
        assert_eq!(store.level_by_name("hour").map(LevelStore::index), Some(1));
        assert!(store.level(3).is_none());
    }
}
