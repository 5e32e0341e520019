use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Finest supported window width. Window math runs on millisecond timestamps.
pub const MIN_WIDTH: Duration = Duration::from_millis(1);

/// Top-level configuration for the hitrank daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ingestion boundary configuration.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Ordered rollup levels, finest first. Default: minute, hour, day.
    #[serde(default = "default_levels")]
    pub levels: Vec<LevelConfig>,

    /// Retention job schedule. Default: every 1m after 30s.
    #[serde(default = "default_retention_schedule")]
    pub retention: JobSchedule,

    /// Candidate selector schedule. Default: every 1m after 10s.
    #[serde(default = "default_candidates_schedule")]
    pub candidates: JobSchedule,

    /// Election merger schedule. Its interval comes from the runtime record.
    #[serde(default)]
    pub election: ElectionScheduleConfig,

    /// Leaderboard persistence configuration.
    #[serde(default)]
    pub leaderboard: LeaderboardConfig,

    /// Prometheus metrics and HTTP API server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Seed for the runtime record. Absent means no record until one is PUT.
    #[serde(default)]
    pub runtime: Option<RuntimeConfig>,
}

/// Ingestion boundary configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Bounded queue capacity between writers and the event log. Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Longest accepted entity key in bytes after normalization. Default: 253.
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,
}

/// One resolution level of the rollup cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Level name, also the job name suffix (`rollup_<name>`).
    pub name: String,

    /// Window width.
    #[serde(with = "humantime_serde")]
    pub width: Duration,

    /// How far back a refresh recomputes windows.
    #[serde(with = "humantime_serde")]
    pub start_offset: Duration,

    /// How long a window must be over before it is materialized.
    #[serde(default, with = "humantime_serde")]
    pub end_offset: Duration,

    /// Refresh job interval.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Delay before the first refresh.
    #[serde(default, with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Cancel a refresh still running at the next tick instead of skipping the tick.
    #[serde(default)]
    pub cancel_on_overrun: bool,
}

/// Interval, startup offset and overrun policy of a periodic job.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSchedule {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default, with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default)]
    pub cancel_on_overrun: bool,
}

/// Election merger schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ElectionScheduleConfig {
    /// Delay before the first election. Default: 15s.
    #[serde(default = "default_election_initial_delay", with = "humantime_serde")]
    pub initial_delay: Duration,

    #[serde(default)]
    pub cancel_on_overrun: bool,
}

/// Leaderboard persistence configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LeaderboardConfig {
    /// JSON snapshot file. When unset the board lives in memory only.
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

/// Prometheus health metrics and API server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// The process-wide runtime record read by every job once per tick.
///
/// Replaced wholesale through the config surface; a replacement takes
/// effect on each consumer's next tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Minimum summed hits over the election window to become a candidate. Default: 100.
    #[serde(default = "default_min_hits_threshold")]
    pub min_hits_threshold: u64,

    /// Trailing span the candidate selector sums over. Default: 5m.
    #[serde(default = "default_election_window", with = "humantime_serde")]
    pub election_window: Duration,

    /// Age after which candidate rows are pruned. Default: 1h.
    #[serde(default = "default_candidate_retention", with = "humantime_serde")]
    pub candidate_retention: Duration,

    /// Age of `last_seen` after which a leaderboard entry is evicted. Default: 7d.
    #[serde(default = "default_leaderboard_retention", with = "humantime_serde")]
    pub leaderboard_retention: Duration,

    /// Leaderboard population bound. Default: 1000.
    #[serde(default = "default_max_leaderboard_size")]
    pub max_leaderboard_size: usize,

    /// Election merger interval. Default: 5m.
    #[serde(default = "default_election_interval", with = "humantime_serde")]
    pub election_interval: Duration,

    /// Raw event retention horizon. Default: 5m.
    #[serde(default = "default_raw_retention", with = "humantime_serde")]
    pub raw_retention: Duration,

    /// Bucket retention per level name. Missing levels get a default.
    #[serde(default)]
    pub level_retention: BTreeMap<String, humantime_serde::Serde<Duration>>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    65_536
}

fn default_max_key_length() -> usize {
    253
}

fn default_levels() -> Vec<LevelConfig> {
    vec![
        LevelConfig {
            name: "minute".to_string(),
            width: Duration::from_secs(60),
            start_offset: Duration::from_secs(4 * 60),
            end_offset: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
            initial_delay: Duration::from_secs(5),
            cancel_on_overrun: false,
        },
        LevelConfig {
            name: "hour".to_string(),
            width: Duration::from_secs(3600),
            start_offset: Duration::from_secs(3 * 3600),
            end_offset: Duration::from_secs(10 * 60),
            refresh_interval: Duration::from_secs(10 * 60),
            initial_delay: Duration::from_secs(20),
            cancel_on_overrun: false,
        },
        LevelConfig {
            name: "day".to_string(),
            width: Duration::from_secs(86_400),
            start_offset: Duration::from_secs(3 * 86_400),
            end_offset: Duration::from_secs(3600),
            refresh_interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(40),
            cancel_on_overrun: false,
        },
    ]
}

fn default_retention_schedule() -> JobSchedule {
    JobSchedule {
        interval: Duration::from_secs(60),
        initial_delay: Duration::from_secs(30),
        cancel_on_overrun: false,
    }
}

fn default_candidates_schedule() -> JobSchedule {
    JobSchedule {
        interval: Duration::from_secs(60),
        initial_delay: Duration::from_secs(10),
        cancel_on_overrun: false,
    }
}

fn default_election_initial_delay() -> Duration {
    Duration::from_secs(15)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_min_hits_threshold() -> u64 {
    100
}

fn default_election_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_candidate_retention() -> Duration {
    Duration::from_secs(3600)
}

fn default_leaderboard_retention() -> Duration {
    Duration::from_secs(7 * 86_400)
}

fn default_max_leaderboard_size() -> usize {
    1000
}

fn default_election_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_raw_retention() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Retention for a level with no explicit entry: twice the span the next
/// level reads back, or 30 days for the coarsest level.
fn default_level_retention(levels: &[LevelConfig], index: usize) -> Duration {
    match levels.get(index + 1) {
        Some(next) => next
            .start_offset
            .checked_add(next.width)
            .and_then(|span| span.checked_mul(2))
            .unwrap_or(Duration::MAX),
        None => Duration::from_secs(30 * 86_400),
    }
}

/// Sum of durations, or an error naming `what` when it does not fit.
fn checked_span(parts: &[Duration], what: &str) -> Result<Duration> {
    parts
        .iter()
        .try_fold(Duration::ZERO, |acc, d| acc.checked_add(*d))
        .with_context(|| format!("{what} overflows"))
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ingest: IngestConfig::default(),
            levels: default_levels(),
            retention: default_retention_schedule(),
            candidates: default_candidates_schedule(),
            election: ElectionScheduleConfig::default(),
            leaderboard: LeaderboardConfig::default(),
            health: HealthConfig::default(),
            runtime: None,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_key_length: default_max_key_length(),
        }
    }
}

impl Default for ElectionScheduleConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_election_initial_delay(),
            cancel_on_overrun: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            min_hits_threshold: default_min_hits_threshold(),
            election_window: default_election_window(),
            candidate_retention: default_candidate_retention(),
            leaderboard_retention: default_leaderboard_retention(),
            max_leaderboard_size: default_max_leaderboard_size(),
            election_interval: default_election_interval(),
            raw_retention: default_raw_retention(),
            level_retention: BTreeMap::new(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg = Self::from_yaml(&data)
            .with_context(|| format!("loading config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Parse, resolve and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        if let Some(runtime) = cfg.runtime.take() {
            cfg.runtime = Some(runtime.resolve(&cfg.levels));
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.ingest.channel_capacity == 0 {
            bail!("ingest.channel_capacity must be positive");
        }
        if self.ingest.max_key_length == 0 {
            bail!("ingest.max_key_length must be positive");
        }

        validate_levels(&self.levels)?;

        for (name, schedule) in [
            ("retention", &self.retention),
            ("candidates", &self.candidates),
        ] {
            if schedule.interval.is_zero() {
                bail!("{name}.interval must be positive");
            }
        }

        if let Some(runtime) = &self.runtime {
            runtime
                .validate(&self.levels)
                .context("invalid runtime section")?;
        }

        Ok(())
    }
}

fn validate_levels(levels: &[LevelConfig]) -> Result<()> {
    if levels.is_empty() {
        bail!("at least one rollup level is required");
    }

    let mut names = HashSet::new();
    let mut previous: Option<&LevelConfig> = None;

    for level in levels {
        if level.name.is_empty() {
            bail!("level name must not be empty");
        }
        if !names.insert(level.name.as_str()) {
            bail!("duplicate level name: {}", level.name);
        }
        if level.width < MIN_WIDTH {
            bail!("level {}: width must be at least {:?}", level.name, MIN_WIDTH);
        }
        if level.refresh_interval.is_zero() {
            bail!("level {}: refresh_interval must be positive", level.name);
        }
        let span = checked_span(
            &[level.end_offset, level.width],
            &format!("level {}: end_offset + width", level.name),
        )?;
        if level.start_offset < span {
            bail!(
                "level {}: start_offset {:?} must cover at least one window past end_offset {:?}",
                level.name,
                level.start_offset,
                level.end_offset
            );
        }

        if let Some(prev) = previous {
            if level.width <= prev.width
                || level.width.as_millis().checked_rem(prev.width.as_millis()) != Some(0)
            {
                bail!(
                    "level {}: width {:?} must be a larger exact multiple of level {} width {:?}",
                    level.name,
                    level.width,
                    prev.name,
                    prev.width
                );
            }
        }
        previous = Some(level);
    }

    Ok(())
}

impl RuntimeConfig {
    /// Fill in a retention horizon for every level without an explicit one.
    pub fn resolve(mut self, levels: &[LevelConfig]) -> Self {
        for (i, level) in levels.iter().enumerate() {
            self.level_retention
                .entry(level.name.clone())
                .or_insert_with(|| default_level_retention(levels, i).into());
        }
        self
    }

    /// Retention horizon of the named level, if known.
    pub fn retention_for(&self, level: &str) -> Option<Duration> {
        self.level_retention.get(level).map(|d| **d)
    }

    /// Check the record against the level layout.
    ///
    /// Retention horizons must keep every input a later recompute still
    /// reads: raw events for level 0, level `i` buckets for level `i+1`,
    /// and level 0 buckets for the election window.
    pub fn validate(&self, levels: &[LevelConfig]) -> Result<()> {
        if self.min_hits_threshold == 0 {
            bail!("min_hits_threshold must be positive");
        }
        if self.election_window.is_zero() {
            bail!("election_window must be positive");
        }
        if self.max_leaderboard_size == 0 {
            bail!("max_leaderboard_size must be positive");
        }
        if self.election_interval.is_zero() {
            bail!("election_interval must be positive");
        }

        let Some(first) = levels.first() else {
            bail!("at least one rollup level is required");
        };

        for name in self.level_retention.keys() {
            if !levels.iter().any(|l| &l.name == name) {
                bail!("level_retention names unknown level: {name}");
            }
        }

        let raw_needed = checked_span(
            &[first.start_offset, first.width],
            &format!("level {} start_offset + width", first.name),
        )?;
        if self.raw_retention < raw_needed {
            bail!(
                "raw_retention {:?} must be at least {:?} (level {} start_offset + width)",
                self.raw_retention,
                raw_needed,
                first.name
            );
        }

        if self.election_window < first.width
            || self.election_window.as_millis().checked_rem(first.width.as_millis()) != Some(0)
        {
            bail!(
                "election_window {:?} must be a multiple of level {} width {:?}",
                self.election_window,
                first.name,
                first.width
            );
        }

        for (i, level) in levels.iter().enumerate() {
            let Some(retention) = self.retention_for(&level.name) else {
                bail!("level_retention missing for level {}", level.name);
            };

            if let Some(next) = levels.get(i + 1) {
                let needed = checked_span(
                    &[next.start_offset, next.width],
                    &format!("level {} start_offset + width", next.name),
                )?;
                if retention < needed {
                    bail!(
                        "level_retention.{} {:?} must be at least {:?} (level {} start_offset + width)",
                        level.name,
                        retention,
                        needed,
                        next.name
                    );
                }
            }

            if i == 0 {
                let needed = checked_span(
                    &[self.election_window, level.end_offset, level.width],
                    "election_window + end_offset + width",
                )?;
                if retention < needed {
                    bail!(
                        "level_retention.{} {:?} must be at least {:?} to cover election_window",
                        level.name,
                        retention,
                        needed
                    );
                }
            }
        }

        Ok(())
    }
}
