//! HTTP surface: metrics, health, leaderboard report, job introspection,
//! runtime config and event ingestion.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::RuntimeConfig;
use crate::error::JobError;
use crate::export::health::HealthMetrics;
use crate::ingest::{normalize_key, IngestHandle};
use crate::pipeline::ELECTION_JOB;
use crate::report::{self, LeaderboardReport};
use crate::scheduler::{JobStatus, Scheduler};
use crate::store::Store;

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub ingest: IngestHandle,
    pub health: Arc<HealthMetrics>,
    pub clock: Clock,
    pub max_key_length: usize,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/leaderboard", get(leaderboard_handler))
        .route("/api/v1/leaderboard/:entity", delete(remove_entry_handler))
        .route("/api/v1/jobs", get(jobs_handler))
        .route("/api/v1/jobs/:name", delete(cancel_job_handler))
        .route("/api/v1/config", get(get_config_handler).put(put_config_handler))
        .route("/api/v1/events", post(events_handler))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::ConfigMissing => Self::NotFound(err.to_string()),
            JobError::StoreUnavailable(_) | JobError::MergeConflict { .. } => {
                Self::Unavailable(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<ApiState>) -> Result<String, ApiError> {
    state.health.encode().map_err(|e| {
        tracing::error!(error = %e, "encoding metrics");
        ApiError::Internal("encoding error".to_string())
    })
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<usize>,
}

/// GET /api/v1/leaderboard?limit=N
async fn leaderboard_handler(
    State(state): State<ApiState>,
    Query(query): Query<LeaderboardQuery>,
) -> Json<LeaderboardReport> {
    let board = state.store.leaderboard().snapshot();
    Json(report::build(&board, state.clock.now(), query.limit))
}

/// DELETE /api/v1/leaderboard/:entity
async fn remove_entry_handler(
    State(state): State<ApiState>,
    Path(entity): Path<String>,
) -> Result<StatusCode, ApiError> {
    let key = normalize_key(&entity, state.max_key_length)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    match state.store.leaderboard().remove(&key)? {
        Some(_) => {
            let board = state.store.leaderboard().snapshot();
            state
                .health
                .leaderboard_evictions
                .with_label_values(&["manual"])
                .inc();
            state.health.leaderboard_size.set(board.len() as f64);
            state.health.leaderboard_version.set(board.version as f64);
            tracing::info!(entity = %key, "leaderboard entry removed");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(format!("{key} is not on the leaderboard"))),
    }
}

/// GET /api/v1/jobs
async fn jobs_handler(State(state): State<ApiState>) -> Json<Vec<JobStatus>> {
    Json(state.scheduler.list())
}

/// DELETE /api/v1/jobs/:name
async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.scheduler.cancel(&name).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("unknown job: {name}")))
    }
}

/// GET /api/v1/config
async fn get_config_handler(State(state): State<ApiState>) -> Result<Json<RuntimeConfig>, ApiError> {
    let runtime = state.store.runtime()?;
    Ok(Json(RuntimeConfig::clone(&runtime)))
}

/// PUT /api/v1/config - replace the runtime record.
async fn put_config_handler(
    State(state): State<ApiState>,
    Json(body): Json<RuntimeConfig>,
) -> Result<Json<RuntimeConfig>, ApiError> {
    let runtime = state
        .store
        .replace_runtime(body)
        .map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;

    if state.scheduler.status(ELECTION_JOB).is_some() {
        if let Err(e) = state
            .scheduler
            .reschedule(ELECTION_JOB, runtime.election_interval)
        {
            tracing::warn!(error = %e, "rescheduling election job failed");
        }
    }

    tracing::info!(
        min_hits_threshold = runtime.min_hits_threshold,
        election_window = ?runtime.election_window,
        max_leaderboard_size = runtime.max_leaderboard_size,
        election_interval = ?runtime.election_interval,
        "runtime config replaced"
    );

    Ok(Json(RuntimeConfig::clone(&runtime)))
}

#[derive(Debug, Deserialize)]
struct EventIn {
    /// Defaults to the receive time.
    time: Option<DateTime<Utc>>,
    entity_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EventsBody {
    One(EventIn),
    Many(Vec<EventIn>),
}

#[derive(Debug, Serialize)]
struct IngestSummary {
    accepted: usize,
    rejected: Vec<Rejection>,
    /// Events waiting in the ingest queue after this request.
    queued: usize,
}

#[derive(Debug, Serialize)]
struct Rejection {
    index: usize,
    reason: &'static str,
    message: String,
}

/// POST /api/v1/events - accepts one event object or an array of them.
async fn events_handler(
    State(state): State<ApiState>,
    Json(body): Json<EventsBody>,
) -> (StatusCode, Json<IngestSummary>) {
    let events = match body {
        EventsBody::One(event) => vec![event],
        EventsBody::Many(events) => events,
    };

    let received_at = state.clock.now();
    let mut summary = IngestSummary {
        accepted: 0,
        rejected: Vec::new(),
        queued: 0,
    };

    for (index, event) in events.into_iter().enumerate() {
        let time = event.time.unwrap_or(received_at);
        match state.ingest.submit(time, &event.entity_key) {
            Ok(()) => summary.accepted += 1,
            Err(e) => summary.rejected.push(Rejection {
                index,
                reason: e.reason(),
                message: e.to_string(),
            }),
        }
    }

    summary.queued = state.ingest.queued();
    (StatusCode::ACCEPTED, Json(summary))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::config::{Config, IngestConfig};
    use crate::ingest;
    use crate::store::{BoardState, EntityKey, LeaderboardEntry, RawEvent};

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    fn state(runtime: Option<RuntimeConfig>) -> (ApiState, tokio::sync::mpsc::Receiver<RawEvent>) {
        let cfg = Config::default();
        let runtime = runtime.map(|r| r.resolve(&cfg.levels));
        let store = Arc::new(Store::new(cfg.levels, runtime, None).expect("store"));
        let health = Arc::new(HealthMetrics::new().expect("metrics"));
        let clock = Clock::manual(at("2024-05-01T12:00:00Z"));
        let (ingest, rx) = ingest::channel(&IngestConfig::default(), Some(Arc::clone(&health)));

        (
            ApiState {
                store,
                scheduler: Arc::new(Scheduler::new(clock.clone(), None)),
                ingest,
                health,
                clock,
                max_key_length: 253,
            },
            rx,
        )
    }

    async fn call(app: Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .expect("request");

        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, String::from_utf8(bytes.to_vec()).expect("utf8"))
    }

    fn seed_board(state: &ApiState) {
        let mut next = BoardState::default();
        for (key, hits) in [("a.com", 10u64), ("b.com", 30)] {
            next.entries.insert(
                EntityKey::from(key),
                LeaderboardEntry {
                    entity_key: EntityKey::from(key),
                    first_seen: at("2024-05-01T11:00:00Z"),
                    last_seen: at("2024-05-01T11:55:00Z"),
                    cumulative_hits: hits,
                    last_election_hits: hits,
                    times_elected: 1,
                },
            );
        }
        state.store.leaderboard().commit(0, next).expect("seed");
    }

    #[tokio::test]
    async fn test_healthz_and_metrics() {
        let (state, _rx) = state(None);
        let app = router(state);

        let (status, body) = call(app.clone(), Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");

        let (status, body) = call(app, Method::GET, "/metrics", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hitrank_ingest_events_accepted_total"));
    }

    #[tokio::test]
    async fn test_config_missing_then_put() {
        let (state, _rx) = state(None);
        let app = router(state.clone());

        let (status, body) = call(app.clone(), Method::GET, "/api/v1/config", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("missing"));

        let (status, body) = call(
            app.clone(),
            Method::PUT,
            "/api/v1/config",
            Some(r#"{"min_hits_threshold": 50, "election_window": "10m"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let returned: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(returned["min_hits_threshold"], 50);
        assert_eq!(returned["election_window"], "10m");

        assert_eq!(state.store.runtime().expect("present").min_hits_threshold, 50);

        let (status, _) = call(
            app,
            Method::PUT,
            "/api/v1/config",
            Some(r#"{"max_leaderboard_size": 0}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(state.store.runtime().expect("present").min_hits_threshold, 50);
    }

    #[tokio::test]
    async fn test_put_config_reschedules_election() {
        let (state, _rx) = state(Some(RuntimeConfig::default()));
        state
            .scheduler
            .register(
                ELECTION_JOB,
                crate::scheduler::ScheduleSpec {
                    interval: std::time::Duration::from_secs(300),
                    initial_delay: std::time::Duration::from_secs(3600),
                    cancel_on_overrun: false,
                },
                || async { Ok::<_, JobError>("noop") },
            )
            .expect("register");

        let app = router(state.clone());
        let (status, _) = call(
            app,
            Method::PUT,
            "/api/v1/config",
            Some(r#"{"election_interval": "1m"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            state.scheduler.status(ELECTION_JOB).map(|s| s.interval),
            Some(std::time::Duration::from_secs(60))
        );
        state.scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_post_events() {
        let (state, mut rx) = state(None);
        let app = router(state);

        let (status, body) = call(
            app,
            Method::POST,
            "/api/v1/events",
            Some(r#"[{"entity_key": "Example.com."}, {"entity_key": ""}, {"time": "2024-05-01T11:59:00Z", "entity_key": "b.com"}]"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let summary: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(summary["accepted"], 2);
        assert_eq!(summary["rejected"][0]["index"], 1);
        assert_eq!(summary["rejected"][0]["reason"], "empty_key");
        assert_eq!(summary["queued"], 2);

        let first = rx.recv().await.expect("queued");
        assert_eq!(&*first.entity_key, "example.com");
        assert_eq!(first.time, at("2024-05-01T12:00:00Z"));
        let second = rx.recv().await.expect("queued");
        assert_eq!(second.time, at("2024-05-01T11:59:00Z"));
    }

    #[tokio::test]
    async fn test_leaderboard_report_and_remove() {
        let (state, _rx) = state(None);
        seed_board(&state);
        let app = router(state.clone());

        let (status, body) = call(app.clone(), Method::GET, "/api/v1/leaderboard?limit=1", None).await;
        assert_eq!(status, StatusCode::OK);
        let report: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(report["size"], 2);
        assert_eq!(report["entries"][0]["entity_key"], "b.com");
        assert_eq!(report["entries"][0]["rank"], 1);
        assert_eq!(report["entries"].as_array().map(Vec::len), Some(1));

        let (status, _) = call(app.clone(), Method::DELETE, "/api/v1/leaderboard/B.com", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(state.store.leaderboard().get("b.com").is_none());

        let (status, _) = call(app, Method::DELETE, "/api/v1/leaderboard/b.com", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_jobs_list_and_cancel() {
        let (state, _rx) = state(None);
        state
            .scheduler
            .register(
                "candidates",
                crate::scheduler::ScheduleSpec {
                    interval: std::time::Duration::from_secs(60),
                    initial_delay: std::time::Duration::from_secs(3600),
                    cancel_on_overrun: false,
                },
                || async { Ok::<_, JobError>("noop") },
            )
            .expect("register");
        let app = router(state.clone());

        let (status, body) = call(app.clone(), Method::GET, "/api/v1/jobs", None).await;
        assert_eq!(status, StatusCode::OK);
        let jobs: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(jobs[0]["name"], "candidates");
        assert_eq!(jobs[0]["interval"], "1m");
        assert_eq!(jobs[0]["runs"], 0);

        let (status, _) = call(app.clone(), Method::DELETE, "/api/v1/jobs/candidates", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(app, Method::DELETE, "/api/v1/jobs/candidates", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
