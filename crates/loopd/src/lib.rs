//! loopd - Agent Loop Orchestrator Daemon
//!
//! Library components for the daemon process.

pub mod agent;
pub mod daemon;
pub mod discovery;
pub mod dispatcher;
pub mod escalation;
pub mod git;
pub mod job_manager;
pub mod merge_serializer;
pub mod pr_host;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worker;

pub use daemon::{Daemon, DaemonConfig, DaemonError};

/// Type alias for application-level errors with context and backtraces.
pub type AppResult<T> = eyre::Result<T>;

/// Persist an event and publish it on the run's bus in one call. Every
/// component that raises an event (scheduler, worker, merge serializer)
/// goes through this rather than picking one or the other, so the SQLite
/// event log and the live SSE stream never drift apart.
pub async fn emit(
    storage: &storage::Storage,
    dispatcher: &dispatcher::Dispatcher,
    run_id: &loop_core::Id,
    unit_id: Option<&loop_core::Id>,
    payload: &loop_core::EventPayload,
) {
    let event_type = payload.event_type().as_str();
    let payload_json = match payload.to_json() {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(error = %err, event_type, "failed to serialize event payload");
            return;
        }
    };

    match storage.append_event(run_id, unit_id, event_type, &payload_json).await {
        Ok(event) => dispatcher.emit(event).await,
        Err(err) => {
            tracing::error!(error = %err, event_type, "failed to persist event");
        }
    }
}
