use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::PipelineContext;
use crate::clock::saturating_sub;
use crate::config::RuntimeConfig;
use crate::error::JobError;
use crate::store::{BoardState, CandidateRecord, EntityKey, LeaderboardEntry};

/// Bounds applied by a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    pub max_size: usize,
    pub retention: Duration,
}

impl From<&RuntimeConfig> for MergeSettings {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            max_size: runtime.max_leaderboard_size,
            retention: runtime.leaderboard_retention,
        }
    }
}

/// Next leaderboard state and what changed to get there.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub state: BoardState,
    pub inserted: usize,
    pub updated: usize,
    /// Candidates ignored because their window was already merged.
    pub skipped: usize,
    pub evicted_capacity: Vec<EntityKey>,
    pub evicted_age: Vec<EntityKey>,
}

impl MergeOutcome {
    pub fn changed(&self, base: &BoardState) -> bool {
        self.inserted > 0
            || self.updated > 0
            || !self.evicted_capacity.is_empty()
            || !self.evicted_age.is_empty()
            || self.state.last_merged_window != base.last_merged_window
    }
}

/// Fold one candidate snapshot into `base`.
///
/// Each candidate is applied only when `window_time` is newer than both the
/// board's last merged window and the entry's `last_seen`, so replaying a
/// snapshot changes nothing. After the upserts, entries whose `last_seen`
/// is older than the retention horizon are dropped, then the oldest
/// entries by `(last_seen, entity_key)` until the board fits `max_size`.
pub fn merge(
    base: &BoardState,
    window_time: DateTime<Utc>,
    candidates: &[CandidateRecord],
    settings: MergeSettings,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut state = base.clone();
    let mut inserted = 0;
    let mut updated = 0;
    let mut skipped = 0;

    let window_is_new = base.last_merged_window.map_or(true, |last| window_time > last);

    for candidate in candidates {
        if !window_is_new {
            skipped += 1;
            continue;
        }

        match state.entries.get_mut(&candidate.entity_key) {
            Some(entry) if window_time > entry.last_seen => {
                entry.cumulative_hits = entry.cumulative_hits.saturating_add(candidate.hits);
                entry.last_election_hits = candidate.hits;
                entry.times_elected = entry.times_elected.saturating_add(1);
                entry.last_seen = window_time;
                updated += 1;
            }
            Some(_) => skipped += 1,
            None => {
                state.entries.insert(
                    candidate.entity_key.clone(),
                    LeaderboardEntry {
                        entity_key: candidate.entity_key.clone(),
                        first_seen: window_time,
                        last_seen: window_time,
                        cumulative_hits: candidate.hits,
                        last_election_hits: candidate.hits,
                        times_elected: 1,
                    },
                );
                inserted += 1;
            }
        }
    }

    if window_is_new {
        state.last_merged_window = Some(window_time);
    }

    let (evicted_age, evicted_capacity) = evict(&mut state, settings, now);

    MergeOutcome {
        state,
        inserted,
        updated,
        skipped,
        evicted_capacity,
        evicted_age,
    }
}

/// Apply the retention and size bounds to `base` without folding in any
/// candidates.
pub fn enforce_bounds(base: &BoardState, settings: MergeSettings, now: DateTime<Utc>) -> MergeOutcome {
    let mut state = base.clone();
    let (evicted_age, evicted_capacity) = evict(&mut state, settings, now);

    MergeOutcome {
        state,
        inserted: 0,
        updated: 0,
        skipped: 0,
        evicted_capacity,
        evicted_age,
    }
}

/// Drop entries past the retention horizon, then the least recently seen
/// until `max_size` holds. Returns `(evicted_age, evicted_capacity)`.
fn evict(
    state: &mut BoardState,
    settings: MergeSettings,
    now: DateTime<Utc>,
) -> (Vec<EntityKey>, Vec<EntityKey>) {
    let age_cutoff = saturating_sub(now, settings.retention);
    let mut evicted_age = Vec::new();
    state.entries.retain(|key, entry| {
        let keep = entry.last_seen >= age_cutoff;
        if !keep {
            evicted_age.push(key.clone());
        }
        keep
    });

    let mut evicted_capacity = Vec::new();
    if state.entries.len() > settings.max_size {
        let mut by_age: Vec<(DateTime<Utc>, EntityKey)> = state
            .entries
            .values()
            .map(|e| (e.last_seen, e.entity_key.clone()))
            .collect();
        by_age.sort();

        let excess = state.entries.len() - settings.max_size;
        for (_, key) in by_age.into_iter().take(excess) {
            state.entries.remove(&key);
            evicted_capacity.push(key);
        }
    }

    (evicted_age, evicted_capacity)
}

/// Result of one election run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergeReport {
    pub window_time: Option<DateTime<Utc>>,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub evicted_capacity: usize,
    pub evicted_age: usize,
    pub committed: bool,
    pub size: usize,
    pub version: u64,
    pub candidates_pruned: usize,
}

/// Folds the latest candidate snapshot into the leaderboard.
///
/// The merge is computed from a versioned snapshot and published with a
/// compare-and-set, so upsert and eviction land together or not at all.
/// Candidate rows are pruned only after a successful commit.
#[derive(Clone)]
pub struct ElectionMerger {
    ctx: PipelineContext,
}

impl ElectionMerger {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<MergeReport, JobError> {
        let store = &self.ctx.store;
        let runtime = store.runtime()?;
        let now = self.ctx.clock.now();
        let board = store.leaderboard();

        let settings = MergeSettings::from(&*runtime);
        let base = board.snapshot();

        let latest = store.candidates().latest();
        let outcome = match &latest {
            Some((window_time, candidates)) => merge(&base, *window_time, candidates, settings, now),
            None => {
                debug!("no candidate snapshot yet, enforcing bounds only");
                enforce_bounds(&base, settings, now)
            }
        };
        let window_time = latest.map(|(window_time, _)| window_time);

        let mut report = MergeReport {
            window_time,
            inserted: outcome.inserted,
            updated: outcome.updated,
            skipped: outcome.skipped,
            evicted_capacity: outcome.evicted_capacity.len(),
            evicted_age: outcome.evicted_age.len(),
            committed: false,
            size: base.len(),
            version: base.version,
            candidates_pruned: 0,
        };

        if outcome.changed(&base) {
            if !outcome.evicted_capacity.is_empty() {
                debug!(
                    evicted = ?outcome.evicted_capacity,
                    "evicting least recently seen entries"
                );
            }

            let committed = board.commit(base.version, outcome.state)?;
            report.committed = true;
            report.size = committed.len();
            report.version = committed.version;

            info!(
                window_time = ?window_time,
                inserted = report.inserted,
                updated = report.updated,
                evicted_capacity = report.evicted_capacity,
                evicted_age = report.evicted_age,
                size = report.size,
                version = report.version,
                "leaderboard merged"
            );
        }

        report.candidates_pruned = store
            .candidates()
            .prune_before(saturating_sub(now, runtime.candidate_retention));

        if let Some(health) = &self.ctx.health {
            health.leaderboard_size.set(report.size as f64);
            health.leaderboard_version.set(report.version as f64);
            health
                .leaderboard_evictions
                .with_label_values(&["capacity"])
                .inc_by(report.evicted_capacity as f64);
            health
                .leaderboard_evictions
                .with_label_values(&["age"])
                .inc_by(report.evicted_age as f64);
            health
                .candidates_pruned
                .inc_by(report.candidates_pruned as f64);
        }

        Ok(report)
    }
}
