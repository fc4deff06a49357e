//! HTTP control plane server for loopd (spec Section 4.4).
//!
//! Local-only REST + SSE surface over the job manager: start/stop/inspect
//! jobs, list them, watch one's event stream live, and request a graceful
//! shutdown. Every handler is a thin translation from an HTTP request to
//! `Storage`/`JobManager`/[`Daemon::spawn_job`] calls; none of the
//! scheduling or worker logic lives here.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use loop_core::{Config, Id, Run, RunStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::discovery;
use crate::job_manager::JobManager;
use crate::storage::Storage;

/// Shared state for HTTP handlers. `shutdown` is optional so the router can
/// be exercised in tests against bare storage/job-manager state without a
/// live `Daemon`; only the `Shutdown` handler needs it, and degrades to a
/// no-op acknowledgement when absent.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Storage>,
    pub jobs: Arc<JobManager>,
    pub shutdown: Option<Arc<Notify>>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", post(start_job).get(list_jobs))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}", get(get_job_status))
        .route("/jobs/{id}/watch", get(watch_job))
        .route("/shutdown", post(shutdown))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn internal_error(context: &str, err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    error!(context, error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: format!("{context}: {err}") }))
}

fn not_found(context: &str) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: context.to_string() }))
}

/// `POST /jobs` request body: the directories to discover units under and
/// an optional config override, serialized the same way a run persists its
/// own `config_json`.
#[derive(Debug, Deserialize)]
pub struct StartJobRequest {
    pub workspace_root: String,
    pub specs_dir: String,
    #[serde(default)]
    pub config: Option<Config>,
}

#[derive(Debug, Serialize)]
pub struct StartJobResponse {
    pub run: Run,
}

/// `POST /jobs` - discover units under `specs_dir`, persist the run and its
/// graph, spawn the job driving task, and register it with the job manager.
async fn start_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartJobRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let config = req.config.unwrap_or_default();
    let now = Utc::now();
    let run_id = Id::new();
    let specs_dir = PathBuf::from(&req.specs_dir);

    let discovery = discovery::discover(&run_id, &specs_dir, now)
        .map_err(|err| internal_error("discovery failed", err))?;

    let config_json = serde_json::to_string(&config).ok();
    let run = Run {
        id: run_id.clone(),
        status: RunStatus::Running,
        workspace_root: req.workspace_root,
        specs_dir: req.specs_dir,
        daemon_version: env!("CARGO_PKG_VERSION").to_string(),
        error: None,
        config_json,
        total_units: discovery.units.len() as i64,
        completed_units: 0,
        failed_units: 0,
        blocked_units: 0,
        created_at: now,
        updated_at: now,
    };

    state.storage.insert_run(&run).await.map_err(|err| internal_error("failed to persist run", err))?;
    state.storage.insert_units(&discovery.units).await.map_err(|err| internal_error("failed to persist units", err))?;
    state.storage.insert_tasks(&discovery.tasks).await.map_err(|err| internal_error("failed to persist tasks", err))?;
    state
        .storage
        .insert_graph_snapshot(&discovery.graph)
        .await
        .map_err(|err| internal_error("failed to persist graph snapshot", err))?;

    // Units start `pending`; the scheduler's first `next()` call promotes
    // the roots to `ready` before claiming one.
    crate::daemon::spawn_job(Arc::clone(&state.storage), Arc::clone(&state.jobs), run.clone(), Some(config), false)
        .await
        .map_err(|err| internal_error("failed to start job", err))?;

    info!(run_id = %run.id, units = run.total_units, "job started");
    Ok((StatusCode::CREATED, Json(StartJobResponse { run })))
}

/// `POST /jobs/{id}/stop` - cancel a live job and wait for it to exit.
async fn stop_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let run_id = Id::from_string(&id);
    state.jobs.stop(&run_id).await.map_err(|err| not_found(&err.to_string()))?;
    state
        .storage
        .update_run_status(&run_id, RunStatus::Stopped, None)
        .await
        .map_err(|err| internal_error("failed to persist stopped status", err))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct GetJobStatusResponse {
    pub run: Run,
    pub units: Vec<loop_core::types::Unit>,
}

/// `GET /jobs/{id}` - the run row plus its units' current statuses.
async fn get_job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let run_id = Id::from_string(&id);
    let run = state.storage.get_run(&run_id).await.map_err(|err| not_found(&err.to_string()))?;
    let units = state.storage.list_units(&run_id).await.map_err(|err| internal_error("failed to list units", err))?;
    Ok(Json(GetJobStatusResponse { run, units }))
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub runs: Vec<Run>,
}

/// `GET /jobs` - every run this daemon's database knows about.
async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let runs = state.storage.list_runs().await.map_err(|err| internal_error("failed to list runs", err))?;
    Ok(Json(ListJobsResponse { runs }))
}

/// `GET /jobs/{id}/watch` - SSE stream of a run's persisted event log, live
/// from the point the client connects. Polls storage rather than the
/// in-process dispatcher so a reconnecting client and one that was
/// connected from before a daemon restart both see the same history.
async fn watch_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, (StatusCode, Json<ErrorResponse>)> {
    let run_id = Id::from_string(&id);
    state.storage.get_run(&run_id).await.map_err(|err| not_found(&err.to_string()))?;

    let storage = Arc::clone(&state.storage);
    let stream = stream::unfold((storage, run_id, 0i64), move |(storage, run_id, after_sequence)| async move {
        loop {
            let events = match storage.list_events_since(&run_id, after_sequence).await {
                Ok(events) => events,
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "failed to poll events for watch stream");
                    return None;
                }
            };

            if let Some(last) = events.last() {
                let next_after = last.sequence;
                let sse_events: Vec<Result<SseEvent, Infallible>> = events
                    .iter()
                    .map(|event| {
                        Ok(SseEvent::default()
                            .event(event.event_type.clone())
                            .id(event.sequence.to_string())
                            .data(event.payload_json.clone()))
                    })
                    .collect();
                return Some((stream::iter(sse_events), (storage, run_id, next_after)));
            }

            let run = storage.get_run(&run_id).await.ok();
            if run.map(|r| r.status.is_terminal()).unwrap_or(true) {
                return None;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    })
    .flatten();

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// `POST /shutdown` - request a graceful daemon shutdown. The HTTP response
/// completes before shutdown finishes; the client should poll `/health`
/// (or simply expect the connection to go away) to confirm the process
/// has exited.
async fn shutdown(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("shutdown requested via HTTP");
    if let Some(shutdown) = &state.shutdown {
        shutdown.notify_one();
    } else {
        warn!("shutdown requested but this server was started without a daemon handle");
    }
    Json(serde_json::json!({ "status": "shutting down" }))
}

/// `GET /health` - liveness probe plus current job-manager load.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let active = state.jobs.active_count().await;
    Json(serde_json::json!({ "status": "ok", "active_jobs": active }))
}

/// Bind the router to `127.0.0.1:{port}` and serve until the listener is
/// dropped or the process is aborted. Kept separate from [`Daemon::run`]'s
/// call site only so tests can start a server against bare `AppState`
/// without constructing a full `Daemon`.
pub async fn start_server(state: Arc<AppState>, port: u16) -> std::io::Result<()> {
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");
    axum::serve(listener, create_router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_manager::JobManager;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let jobs = Arc::new(JobManager::new(4));
        Arc::new(AppState { storage, jobs, shutdown: None })
    }

    #[tokio::test]
    async fn health_reports_ok_with_zero_active_jobs() {
        let state = test_state().await;
        let router = create_router(state);
        let response = router.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_jobs_is_empty_for_fresh_database() {
        let state = test_state().await;
        let router = create_router(state);
        let response = router.oneshot(Request::builder().uri("/jobs").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_job_status_404s_for_unknown_run() {
        let state = test_state().await;
        let router = create_router(state);
        let response = router
            .oneshot(Request::builder().uri(format!("/jobs/{}", Id::new())).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stop_job_404s_for_unknown_run() {
        let state = test_state().await;
        let router = create_router(state);
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/jobs/{}/stop", Id::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
