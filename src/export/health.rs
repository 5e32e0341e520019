use anyhow::{Context, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

const NAMESPACE: &str = "hitrank";

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "hitrank" namespace and live in a private registry
/// served on `/metrics`.
pub struct HealthMetrics {
    registry: Registry,

    // === Ingestion ===
    /// Events accepted into the ingest queue.
    pub ingest_accepted: Counter,
    /// Events rejected at the boundary by reason.
    pub ingest_rejected: CounterVec,
    /// Events currently queued between writers and the raw log.
    pub ingest_queue_length: Gauge,
    /// Configured ingest queue capacity.
    pub ingest_queue_capacity: Gauge,
    /// Raw events currently retained.
    pub raw_events: Gauge,

    // === Jobs ===
    /// Job invocations by job and outcome (success/failure).
    pub job_runs: CounterVec,
    /// Job failures by job and error kind.
    pub job_failures: CounterVec,
    /// Ticks skipped because the previous run was still going.
    pub job_skipped_ticks: CounterVec,
    /// Job run duration.
    pub job_duration: HistogramVec,

    // === Rollups ===
    /// Buckets currently stored per level.
    pub rollup_buckets: GaugeVec,
    /// Level watermark as unix seconds.
    pub rollup_watermark: GaugeVec,
    /// Windows recomputed per level.
    pub rollup_windows_refreshed: CounterVec,

    // === Election ===
    /// Candidate rows written by the selector.
    pub candidates_written: Counter,
    /// Candidate rows pruned after a merge.
    pub candidates_pruned: Counter,
    /// Current leaderboard population.
    pub leaderboard_size: Gauge,
    /// Current leaderboard version.
    pub leaderboard_version: Gauge,
    /// Leaderboard evictions by reason (capacity/age/manual).
    pub leaderboard_evictions: CounterVec,

    // === Retention ===
    /// Rows deleted by the retention job by target (raw or level name).
    pub retention_deleted: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let ingest_accepted = Counter::with_opts(
            Opts::new(
                "ingest_events_accepted_total",
                "Events accepted into the ingest queue.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_rejected = CounterVec::new(
            Opts::new(
                "ingest_events_rejected_total",
                "Events rejected at the ingestion boundary.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;
        let ingest_queue_length = Gauge::with_opts(
            Opts::new("ingest_queue_length", "Events waiting in the ingest queue.")
                .namespace(NAMESPACE),
        )?;
        let ingest_queue_capacity = Gauge::with_opts(
            Opts::new("ingest_queue_capacity", "Capacity of the ingest queue.")
                .namespace(NAMESPACE),
        )?;
        let raw_events = Gauge::with_opts(
            Opts::new("raw_events", "Raw events currently retained.").namespace(NAMESPACE),
        )?;

        // === Jobs ===
        let job_runs = CounterVec::new(
            Opts::new("job_runs_total", "Job invocations by outcome.").namespace(NAMESPACE),
            &["job", "outcome"],
        )?;
        let job_failures = CounterVec::new(
            Opts::new("job_failures_total", "Job failures by error kind.").namespace(NAMESPACE),
            &["job", "kind"],
        )?;
        let job_skipped_ticks = CounterVec::new(
            Opts::new(
                "job_skipped_ticks_total",
                "Ticks skipped because the previous run was still going.",
            )
            .namespace(NAMESPACE),
            &["job"],
        )?;
        let job_duration = HistogramVec::new(
            HistogramOpts::new("job_duration_seconds", "Job run duration.")
                .namespace(NAMESPACE)
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["job"],
        )?;

        // === Rollups ===
        let rollup_buckets = GaugeVec::new(
            Opts::new("rollup_buckets", "Buckets currently stored per level.")
                .namespace(NAMESPACE),
            &["level"],
        )?;
        let rollup_watermark = GaugeVec::new(
            Opts::new(
                "rollup_watermark_seconds",
                "End of the last settled window per level (unix seconds).",
            )
            .namespace(NAMESPACE),
            &["level"],
        )?;
        let rollup_windows_refreshed = CounterVec::new(
            Opts::new(
                "rollup_windows_refreshed_total",
                "Windows recomputed per level.",
            )
            .namespace(NAMESPACE),
            &["level"],
        )?;

        // === Election ===
        let candidates_written = Counter::with_opts(
            Opts::new(
                "candidates_written_total",
                "Candidate rows written by the selector.",
            )
            .namespace(NAMESPACE),
        )?;
        let candidates_pruned = Counter::with_opts(
            Opts::new("candidates_pruned_total", "Candidate rows pruned after merge.")
                .namespace(NAMESPACE),
        )?;
        let leaderboard_size = Gauge::with_opts(
            Opts::new("leaderboard_size", "Current leaderboard population.").namespace(NAMESPACE),
        )?;
        let leaderboard_version = Gauge::with_opts(
            Opts::new("leaderboard_version", "Current leaderboard version.").namespace(NAMESPACE),
        )?;
        let leaderboard_evictions = CounterVec::new(
            Opts::new(
                "leaderboard_evictions_total",
                "Leaderboard entries evicted by reason.",
            )
            .namespace(NAMESPACE),
            &["reason"],
        )?;

        // === Retention ===
        let retention_deleted = CounterVec::new(
            Opts::new(
                "retention_deleted_total",
                "Rows deleted by the retention job.",
            )
            .namespace(NAMESPACE),
            &["target"],
        )?;

        registry.register(Box::new(ingest_accepted.clone()))?;
        registry.register(Box::new(ingest_rejected.clone()))?;
        registry.register(Box::new(ingest_queue_length.clone()))?;
        registry.register(Box::new(ingest_queue_capacity.clone()))?;
        registry.register(Box::new(raw_events.clone()))?;

        registry.register(Box::new(job_runs.clone()))?;
        registry.register(Box::new(job_failures.clone()))?;
        registry.register(Box::new(job_skipped_ticks.clone()))?;
        registry.register(Box::new(job_duration.clone()))?;

        registry.register(Box::new(rollup_buckets.clone()))?;
        registry.register(Box::new(rollup_watermark.clone()))?;
        registry.register(Box::new(rollup_windows_refreshed.clone()))?;

        registry.register(Box::new(candidates_written.clone()))?;
        registry.register(Box::new(candidates_pruned.clone()))?;
        registry.register(Box::new(leaderboard_size.clone()))?;
        registry.register(Box::new(leaderboard_version.clone()))?;
        registry.register(Box::new(leaderboard_evictions.clone()))?;

        registry.register(Box::new(retention_deleted.clone()))?;

        Ok(Self {
            registry,
            ingest_accepted,
            ingest_rejected,
            ingest_queue_length,
            ingest_queue_capacity,
            raw_events,
            job_runs,
            job_failures,
            job_skipped_ticks,
            job_duration,
            rollup_buckets,
            rollup_watermark,
            rollup_windows_refreshed,
            candidates_written,
            candidates_pruned,
            leaderboard_size,
            leaderboard_version,
            leaderboard_evictions,
            retention_deleted,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .context("encoding metrics")?;

        String::from_utf8(buffer).context("converting metrics to string")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_encode() {
        let health = HealthMetrics::new().expect("metrics");
        health.ingest_accepted.inc();
        health
            .job_runs
            .with_label_values(&["election", "success"])
            .inc();
        health.leaderboard_size.set(3.0);

        let text = health.encode().expect("encode");
        assert!(text.contains("hitrank_ingest_events_accepted_total 1"));
        assert!(text.contains("hitrank_job_runs_total{job=\"election\",outcome=\"success\"} 1"));
        assert!(text.contains("hitrank_leaderboard_size 3"));
    }

    #[test]
    fn test_instances_do_not_share_registry() {
        let a = HealthMetrics::new().expect("metrics");
        let b = HealthMetrics::new().expect("metrics");
        a.candidates_written.inc_by(5.0);
        assert!(!b.encode().expect("encode").contains("candidates_written_total 5"));
    }
}
