use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::RuntimeFlavor;

use super::snapshot::SnapshotFile;
use super::EntityKey;
use crate::error::JobError;

/// One elected entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub entity_key: EntityKey,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub cumulative_hits: u64,
    pub last_election_hits: u64,
    pub times_elected: u64,
}

/// Immutable leaderboard state. Every commit produces a new version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardState {
    pub version: u64,
    /// Newest candidate window folded into this state.
    pub last_merged_window: Option<DateTime<Utc>>,
    pub entries: BTreeMap<EntityKey, LeaderboardEntry>,
}

impl BoardState {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Size-bounded leaderboard with optimistic, versioned commits.
///
/// Readers load the current state lock-free. Writers build the next state
/// from a snapshot and commit it only if nobody else committed in between.
pub struct Leaderboard {
    current: ArcSwap<BoardState>,
    commit_lock: Mutex<()>,
    snapshot: Option<SnapshotFile>,
}

impl Default for Leaderboard {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl Leaderboard {
    pub fn in_memory() -> Self {
        Self {
            current: ArcSwap::from_pointee(BoardState::default()),
            commit_lock: Mutex::new(()),
            snapshot: None,
        }
    }

    /// Open a persisted leaderboard, loading the snapshot if one exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JobError> {
        let file = SnapshotFile::new(path);
        let state = file.load()?.unwrap_or_default();

        tracing::info!(
            path = %file.path().display(),
            entries = state.len(),
            version = state.version,
            "Loaded leaderboard snapshot"
        );

        Ok(Self {
            current: ArcSwap::from_pointee(state),
            commit_lock: Mutex::new(()),
            snapshot: Some(file),
        })
    }

    pub fn snapshot(&self) -> Arc<BoardState> {
        self.current.load_full()
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<LeaderboardEntry> {
        self.current.load().entries.get(key).cloned()
    }

    /// Publish `next` if the board is still at `expected_version`.
    ///
    /// On success the stored state carries `expected_version + 1`. On any
    /// error the visible state is unchanged.
    pub fn commit(&self, expected_version: u64, mut next: BoardState) -> Result<Arc<BoardState>, JobError> {
        let _guard = self.commit_lock.lock();

        let found = self.current.load().version;
        if found != expected_version {
            return Err(JobError::MergeConflict {
                expected: expected_version,
                found,
            });
        }

        next.version = expected_version + 1;
        if let Some(file) = &self.snapshot {
            persist(file, &next)?;
        }

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        Ok(next)
    }

    /// Remove one entry outside of an election. Bumps the version so an
    /// in-flight merge built on the old state fails to commit.
    pub fn remove(&self, key: &str) -> Result<Option<LeaderboardEntry>, JobError> {
        let _guard = self.commit_lock.lock();

        let current = self.current.load_full();
        if !current.entries.contains_key(key) {
            return Ok(None);
        }

        let mut next = BoardState::clone(&current);
        let removed = next.entries.remove(key);
        next.version = current.version + 1;

        if let Some(file) = &self.snapshot {
            persist(file, &next)?;
        }

        self.current.store(Arc::new(next));
        Ok(removed)
    }
}

/// Write the snapshot. On a multi-threaded runtime the worker is handed
/// over to the blocking pool first so the fsync does not stall other tasks.
fn persist(file: &SnapshotFile, state: &BoardState) -> std::io::Result<()> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| file.write(state))
        }
        _ => file.write(state),
    }
}
