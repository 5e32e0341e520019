//! Periodic, non-overlapping job runner.
//!
//! Every registered job gets its own task: an initial delay, then a ticker.
//! A tick that arrives while the previous run is still going is skipped
//! (or cancels the run, for jobs that opt in). Failures are recorded and
//! the job simply runs again on its next tick.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{saturating_add, Clock};
use crate::config::{JobSchedule, LevelConfig};
use crate::error::{ErrorKind, JobError};
use crate::export::health::HealthMetrics;

/// When and how a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub interval: Duration,
    pub initial_delay: Duration,
    pub cancel_on_overrun: bool,
}

impl From<&JobSchedule> for ScheduleSpec {
    fn from(s: &JobSchedule) -> Self {
        Self {
            interval: s.interval,
            initial_delay: s.initial_delay,
            cancel_on_overrun: s.cancel_on_overrun,
        }
    }
}

impl From<&LevelConfig> for ScheduleSpec {
    fn from(l: &LevelConfig) -> Self {
        Self {
            interval: l.refresh_interval,
            initial_delay: l.initial_delay,
            cancel_on_overrun: l.cancel_on_overrun,
        }
    }
}

/// Last failure of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Introspection view of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub cancel_on_overrun: bool,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<JobFailure>,
    pub last_report: Option<String>,
    pub runs: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
}

impl JobStatus {
    fn new(name: &str, spec: ScheduleSpec, next_run: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            interval: spec.interval,
            initial_delay: spec.initial_delay,
            cancel_on_overrun: spec.cancel_on_overrun,
            running: false,
            next_run: Some(next_run),
            last_started: None,
            last_finished: None,
            last_success: None,
            last_error: None,
            last_report: None,
            runs: 0,
            failures: 0,
            skipped_ticks: 0,
        }
    }
}

struct JobHandle {
    status: Arc<Mutex<JobStatus>>,
    interval_tx: watch::Sender<Duration>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs registered jobs until cancelled or shut down.
pub struct Scheduler {
    clock: Clock,
    health: Option<Arc<HealthMetrics>>,
    jobs: DashMap<String, JobHandle>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(clock: Clock, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            clock,
            health,
            jobs: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Register and start a job. `job` is called once per tick.
    pub fn register<F, Fut, R>(&self, name: &str, spec: ScheduleSpec, job: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: fmt::Display + Send + 'static,
    {
        if spec.interval.is_zero() {
            bail!("job {name}: interval must be positive");
        }
        if self.cancel.is_cancelled() {
            bail!("scheduler is shut down");
        }

        match self.jobs.entry(name.to_string()) {
            Entry::Occupied(_) => bail!("job {name} is already registered"),
            Entry::Vacant(slot) => {
                let first_run = saturating_add(self.clock.now(), spec.initial_delay);
                let status = Arc::new(Mutex::new(JobStatus::new(name, spec, first_run)));
                let (interval_tx, interval_rx) = watch::channel(spec.interval);
                let cancel = self.cancel.child_token();

                let runner = JobRunner {
                    name: name.to_string(),
                    spec,
                    status: Arc::clone(&status),
                    clock: self.clock.clone(),
                    health: self.health.clone(),
                };
                let task = tokio::spawn(runner.run(job, interval_rx, cancel.clone()));

                slot.insert(JobHandle {
                    status,
                    interval_tx,
                    cancel,
                    task,
                });
            }
        }

        info!(
            job = name,
            interval = ?spec.interval,
            initial_delay = ?spec.initial_delay,
            cancel_on_overrun = spec.cancel_on_overrun,
            "job registered"
        );

        Ok(())
    }

    /// Status of every registered job, sorted by name.
    pub fn list(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = self
            .jobs
            .iter()
            .map(|entry| entry.value().status.lock().clone())
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.jobs.get(name).map(|h| h.status.lock().clone())
    }

    /// Change a job's interval. Takes effect after the current period.
    pub fn reschedule(&self, name: &str, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            bail!("job {name}: interval must be positive");
        }
        let Some(handle) = self.jobs.get(name) else {
            bail!("unknown job: {name}");
        };

        if *handle.interval_tx.borrow() == interval {
            return Ok(());
        }

        handle.status.lock().interval = interval;
        handle.interval_tx.send_replace(interval);
        info!(job = name, interval = ?interval, "job rescheduled");

        Ok(())
    }

    /// Stop and remove a job. An in-flight run is dropped at its next
    /// await point. Returns false if no such job exists.
    pub async fn cancel(&self, name: &str) -> bool {
        let Some((_, handle)) = self.jobs.remove(name) else {
            return false;
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            error!(job = name, error = %e, "job task failed");
        }

        info!(job = name, "job cancelled");
        true
    }

    /// Cancel every job and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, handle)) = self.jobs.remove(&name) {
                if let Err(e) = handle.task.await {
                    error!(job = %name, error = %e, "job task failed");
                }
            }
        }

        info!("scheduler stopped");
    }
}

/// How a single run ended.
enum RunEnd<R> {
    Finished(Result<R, JobError>),
    Overrun,
    Shutdown,
}

struct JobRunner {
    name: String,
    spec: ScheduleSpec,
    status: Arc<Mutex<JobStatus>>,
    clock: Clock,
    health: Option<Arc<HealthMetrics>>,
}

impl JobRunner {
    async fn run<F, Fut, R>(
        self,
        job: F,
        mut interval_rx: watch::Receiver<Duration>,
        cancel: CancellationToken,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, JobError>> + Send + 'static,
        R: fmt::Display + Send + 'static,
    {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.spec.initial_delay) => {}
        }

        let mut period = *interval_rx.borrow_and_update();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    period = *interval_rx.borrow_and_update();
                    let start = tokio::time::Instant::now() + period;
                    ticker = tokio::time::interval_at(start, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    self.status.lock().next_run = Some(saturating_add(self.clock.now(), period));
                }

                fired = ticker.tick() => {
                    let mut last_tick = fired;
                    if let RunEnd::Shutdown = self
                        .run_once(&job, &mut ticker, &mut last_tick, period, &cancel)
                        .await
                    {
                        break;
                    }
                    self.refresh_next_run(last_tick, period);
                }
            }
        }

        let mut status = self.status.lock();
        status.running = false;
        status.next_run = None;
        debug!(job = %self.name, "job task stopped");
    }

    /// Point `next_run` at the deadline after the last consumed tick. A
    /// deadline that already passed fires immediately.
    fn refresh_next_run(&self, last_tick: tokio::time::Instant, period: Duration) {
        let now = tokio::time::Instant::now();
        let wait = (last_tick + period).saturating_duration_since(now);
        self.status.lock().next_run = Some(saturating_add(self.clock.now(), wait));
    }

    async fn run_once<F, Fut, R>(
        &self,
        job: &F,
        ticker: &mut Interval,
        last_tick: &mut tokio::time::Instant,
        period: Duration,
        cancel: &CancellationToken,
    ) -> RunEnd<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, JobError>>,
        R: fmt::Display,
    {
        let started_at = self.clock.now();
        {
            let mut status = self.status.lock();
            status.running = true;
            status.runs += 1;
            status.last_started = Some(started_at);
            status.next_run = Some(saturating_add(started_at, period));
        }

        let started = Instant::now();
        let run = job();
        tokio::pin!(run);

        let end = loop {
            tokio::select! {
                biased;

                result = &mut run => break RunEnd::Finished(result),

                _ = cancel.cancelled() => break RunEnd::Shutdown,

                fired = ticker.tick() => {
                    *last_tick = fired;
                    if self.spec.cancel_on_overrun {
                        break RunEnd::Overrun;
                    }
                    self.status.lock().skipped_ticks += 1;
                    if let Some(health) = &self.health {
                        health.job_skipped_ticks.with_label_values(&[self.name.as_str()]).inc();
                    }
                    warn!(job = %self.name, "tick skipped, previous run still in progress");
                }
            }
        };

        let elapsed = started.elapsed();
        let finished_at = self.clock.now();

        let result = match end {
            RunEnd::Finished(result) => result,
            RunEnd::Overrun => Err(JobError::Cancelled),
            RunEnd::Shutdown => {
                self.status.lock().running = false;
                return RunEnd::Shutdown;
            }
        };

        if let Some(health) = &self.health {
            health
                .job_duration
                .with_label_values(&[self.name.as_str()])
                .observe(elapsed.as_secs_f64());
        }

        let mut status = self.status.lock();
        status.running = false;
        status.last_finished = Some(finished_at);

        match result {
            Ok(report) => {
                status.last_success = Some(finished_at);
                status.last_report = Some(report.to_string());
                if let Some(health) = &self.health {
                    health
                        .job_runs
                        .with_label_values(&[self.name.as_str(), "success"])
                        .inc();
                }
                debug!(
                    job = %self.name,
                    duration_ms = elapsed.as_millis() as u64,
                    %report,
                    "job run succeeded"
                );
            }
            Err(e) => {
                let kind = e.kind();
                status.failures += 1;
                status.last_error = Some(JobFailure {
                    kind,
                    message: e.to_string(),
                    at: finished_at,
                });
                if let Some(health) = &self.health {
                    health
                        .job_runs
                        .with_label_values(&[self.name.as_str(), "failure"])
                        .inc();
                    health
                        .job_failures
                        .with_label_values(&[self.name.as_str(), kind.as_str()])
                        .inc();
                }
                error!(
                    job = %self.name,
                    kind = %kind,
                    at = %finished_at,
                    error = %e,
                    "job run failed"
                );
            }
        }

        RunEnd::Finished(Ok(()))
    }
}
