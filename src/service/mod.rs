use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::config::{Config, RuntimeConfig};
use crate::export::api::{self, ApiState};
use crate::export::health::HealthMetrics;
use crate::export::HttpServer;
use crate::ingest::{self, IngestHandle};
use crate::pipeline::{
    CandidateSelector, ElectionMerger, PipelineContext, PipelineJob, RetentionSweep,
    RollupRefresh,
};
use crate::scheduler::{ScheduleSpec, Scheduler};
use crate::store::{RawEvent, Store};

/// Service wires ingestion, the store, the scheduled pipeline jobs and the
/// HTTP surface together.
pub struct Service {
    cfg: Config,
    clock: Clock,
    health: Arc<HealthMetrics>,
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    ingest: IngestHandle,
    ingest_rx: Option<mpsc::Receiver<RawEvent>>,
    ingest_task: Option<JoinHandle<()>>,
    server: HttpServer,
    cancel: CancellationToken,
}

impl Service {
    /// Creates the service. Nothing runs until [`Service::start`].
    pub fn new(mut cfg: Config, clock: Clock) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        let runtime = cfg.runtime.take().map(|r| r.resolve(&cfg.levels));
        if let Some(runtime) = &runtime {
            runtime
                .validate(&cfg.levels)
                .context("invalid runtime section")?;
        }

        let store = Arc::new(
            Store::new(
                cfg.levels.clone(),
                runtime,
                cfg.leaderboard.snapshot_path.clone(),
            )
            .context("creating store")?,
        );

        let board = store.leaderboard().snapshot();
        health.leaderboard_size.set(board.len() as f64);
        health.leaderboard_version.set(board.version as f64);

        let (ingest, ingest_rx) = ingest::channel(&cfg.ingest, Some(Arc::clone(&health)));
        let scheduler = Arc::new(Scheduler::new(clock.clone(), Some(Arc::clone(&health))));
        let server = HttpServer::new(&cfg.health.addr);

        Ok(Self {
            cfg,
            clock,
            health,
            store,
            scheduler,
            ingest,
            ingest_rx: Some(ingest_rx),
            ingest_task: None,
            server,
            cancel: CancellationToken::new(),
        })
    }

    /// Start ingestion, register every pipeline job and serve HTTP.
    /// Returns the bound server address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let rx = self
            .ingest_rx
            .take()
            .context("service already started")?;

        // 1. Ingestion worker.
        self.ingest_task = Some(tokio::spawn(ingest::run(
            rx,
            Arc::clone(&self.store),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        )));
        info!(
            capacity = self.cfg.ingest.channel_capacity,
            "ingest worker started"
        );

        // 2. Pipeline jobs.
        let ctx = PipelineContext::new(
            Arc::clone(&self.store),
            self.clock.clone(),
            Some(Arc::clone(&self.health)),
        );

        for (index, level) in self.cfg.levels.iter().enumerate() {
            let Some(refresh) = RollupRefresh::new(ctx.clone(), index) else {
                continue;
            };
            self.register(PipelineJob::Rollup(refresh), ScheduleSpec::from(level))?;
        }

        self.register(
            PipelineJob::Retention(RetentionSweep::new(ctx.clone())),
            ScheduleSpec::from(&self.cfg.retention),
        )?;
        self.register(
            PipelineJob::Candidates(CandidateSelector::new(ctx.clone())),
            ScheduleSpec::from(&self.cfg.candidates),
        )?;

        let election_interval = match self.store.runtime_opt() {
            Some(runtime) => runtime.election_interval,
            None => {
                warn!("no runtime record configured, jobs will fail until one is provided");
                RuntimeConfig::default().election_interval
            }
        };
        self.register(
            PipelineJob::Election(ElectionMerger::new(ctx)),
            ScheduleSpec {
                interval: election_interval,
                initial_delay: self.cfg.election.initial_delay,
                cancel_on_overrun: self.cfg.election.cancel_on_overrun,
            },
        )?;

        // 3. HTTP surface.
        let app = api::router(ApiState {
            store: Arc::clone(&self.store),
            scheduler: Arc::clone(&self.scheduler),
            ingest: self.ingest.clone(),
            health: Arc::clone(&self.health),
            clock: self.clock.clone(),
            max_key_length: self.cfg.ingest.max_key_length,
        });
        let addr = self
            .server
            .start(app)
            .await
            .context("starting HTTP server")?;

        info!(
            %addr,
            levels = self.cfg.levels.len(),
            jobs = self.scheduler.list().len(),
            "service started"
        );

        Ok(addr)
    }

    fn register(&self, job: PipelineJob, spec: ScheduleSpec) -> Result<()> {
        let name = job.name();
        let job = Arc::new(job);

        self.scheduler
            .register(&name, spec, move || {
                let job = Arc::clone(&job);
                async move { job.run().await }
            })
            .with_context(|| format!("registering job {name}"))
    }

    /// Graceful shutdown: stop jobs, drain ingestion, stop the server.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping service");

        self.scheduler.shutdown().await;

        self.cancel.cancel();
        if let Some(task) = self.ingest_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "ingest worker panicked");
            }
        }

        self.server.stop().await.context("stopping HTTP server")?;

        info!(
            raw_events = self.store.raw().len(),
            leaderboard_size = self.store.leaderboard().len(),
            "service stopped"
        );

        Ok(())
    }

    pub fn ingest_handle(&self) -> IngestHandle {
        self.ingest.clone()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(runtime: bool) -> Config {
        let mut yaml = String::from("health:\n  addr: \"127.0.0.1:0\"\n");
        if runtime {
            yaml.push_str("runtime:\n  min_hits_threshold: 10\n");
        }
        Config::from_yaml(&yaml).expect("config")
    }

    #[tokio::test]
    async fn test_start_registers_every_job() {
        let clock = Clock::manual("2024-05-01T12:00:00Z".parse().expect("time"));
        let mut service = Service::new(test_config(true), clock).expect("service");

        let addr = service.start().await.expect("start");
        assert_ne!(addr.port(), 0);

        let names: Vec<String> = service
            .scheduler()
            .list()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "candidates",
                "election",
                "retention",
                "rollup_day",
                "rollup_hour",
                "rollup_minute"
            ]
        );

        let election = service.scheduler().status("election").expect("election");
        assert_eq!(election.interval, std::time::Duration::from_secs(300));

        service.stop().await.expect("stop");
        assert!(service.scheduler().list().is_empty());
    }

    #[tokio::test]
    async fn test_stop_drains_submitted_events() {
        let clock = Clock::manual("2024-05-01T12:00:00Z".parse().expect("time"));
        let mut service = Service::new(test_config(false), clock.clone()).expect("service");
        assert!(service.store().runtime_opt().is_none());

        service.start().await.expect("start");

        let handle = service.ingest_handle();
        for _ in 0..10 {
            handle.submit(clock.now(), "example.com").expect("submit");
        }

        service.stop().await.expect("stop");
        assert_eq!(service.store().raw().len(), 10);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let clock = Clock::manual("2024-05-01T12:00:00Z".parse().expect("time"));
        let mut service = Service::new(test_config(false), clock).expect("service");

        service.start().await.expect("start");
        assert!(service.start().await.is_err());
        service.stop().await.expect("stop");
    }
}
