//! Daemon process manager (spec Section 4.4).
//!
//! Owns process-level concerns that sit above any single run: the PID-file
//! single-instance lock, opening storage and resuming interrupted jobs at
//! startup, binding the HTTP listener, and a graceful shutdown with a
//! bounded deadline. Driving an individual job (claim/report loop over the
//! scheduler, spawning workers per ready unit) is [`drive_job`], called both
//! from the `StartJob` handler and from the startup resume pass so both
//! paths end up in the same place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loop_core::types::{Run, RunStatus, Task, Unit, UnitStatus};
use loop_core::{Config, EventPayload, Id};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::dispatcher::Dispatcher;
use crate::escalation::{ChatWebhookSink, Sink, TerminalSink, WebhookSink};
use crate::job_manager::{self, JobManager, JobManagerError};
use crate::merge_serializer::MergeSerializer;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::server;
use crate::storage::{Storage, StorageError};
use crate::worker::Worker;

/// Poll interval when a job's scheduler has nothing ready to claim right now.
const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Backoff after a scheduler error before the claim loop retries.
const SCHEDULER_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("another loopd instance is already running (pid {0})")]
    AlreadyRunning(i32),
    #[error("http server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// Daemon configuration: where it persists state and how its listener and
/// shutdown sequence behave. Distinct from [`Config`], which governs a
/// single run's scheduler/worker/merge-queue behavior.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub db_path: PathBuf,
    pub pid_path: PathBuf,
    pub listen_port: u16,
    pub max_jobs: usize,
    pub shutdown_timeout_sec: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let config = Config::default();
        Self {
            db_path: config.db_path,
            pid_path: config.pid_path,
            listen_port: config.listen_port,
            max_jobs: config.max_jobs,
            shutdown_timeout_sec: config.shutdown_timeout_sec,
        }
    }
}

/// Holds an exclusively-created PID file for the lifetime of the daemon
/// process; removed on drop so a clean shutdown never leaves a stale lock.
struct PidGuard {
    path: PathBuf,
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read an existing PID file and decide whether the process it names is
/// still alive. A stale file (parse failure, or a PID that no longer
/// answers a signal) is treated as absent.
fn read_live_pid(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let pid: i32 = contents.trim().parse().ok()?;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => Some(pid),
        Err(_) => None,
    }
}

/// Acquire the single-instance PID-file lock: read, liveness-probe, remove
/// if stale, then create exclusively so a concurrent second daemon loses
/// the race rather than silently co-running against the same database.
fn acquire_pid_lock(path: &Path) -> Result<PidGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        match read_live_pid(path) {
            Some(pid) => return Err(DaemonError::AlreadyRunning(pid)),
            None => {
                warn!(pid_path = %path.display(), "removing stale pid file");
                std::fs::remove_file(path)?;
            }
        }
    }

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())?;
    Ok(PidGuard { path: path.to_path_buf() })
}

/// The orchestrator daemon process: PID lock, storage, and the in-process
/// registry of live jobs. One instance runs per machine per database.
pub struct Daemon {
    config: DaemonConfig,
    storage: Arc<Storage>,
    jobs: Arc<JobManager>,
    shutdown: Arc<Notify>,
    _pid_guard: PidGuard,
}

impl Daemon {
    /// Acquire the PID lock, open (and migrate) storage. Does not yet
    /// resume jobs or bind the listener; that happens in [`Daemon::run`]
    /// so construction stays synchronous-feeling and side-effect-light
    /// beyond the process lock itself.
    pub async fn new(config: DaemonConfig) -> Result<Self> {
        let pid_guard = acquire_pid_lock(&config.pid_path)?;
        let storage = Arc::new(Storage::connect(&config.db_path).await?);
        let jobs = Arc::new(JobManager::new(config.max_jobs));

        Ok(Self {
            config,
            storage,
            jobs,
            shutdown: Arc::new(Notify::new()),
            _pid_guard: pid_guard,
        })
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Resume, bind the listener, and block until a shutdown is requested.
    pub async fn run(&self) -> Result<()> {
        info!(port = self.config.listen_port, db = %self.config.db_path.display(), "loopd starting");

        match self.resume().await {
            Ok(resumed) => {
                if resumed > 0 {
                    info!(resumed, "resumed interrupted run(s)");
                }
            }
            Err(err) => warn!(error = %err, "failed to resume interrupted runs"),
        }

        let state = server::AppState {
            storage: Arc::clone(&self.storage),
            jobs: Arc::clone(&self.jobs),
            shutdown: Some(Arc::clone(&self.shutdown)),
        };
        let router = server::create_router(Arc::new(state));
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.config.listen_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| DaemonError::Server(err.to_string()))?;
        info!(%addr, "HTTP listener bound");

        let http_handle: JoinHandle<()> = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!(error = %err, "HTTP server exited with an error");
            }
        });

        self.shutdown.notified().await;
        info!("shutdown signal received");

        let deadline = Duration::from_secs(self.config.shutdown_timeout_sec as u64);
        if tokio::time::timeout(deadline, self.jobs.stop_all()).await.is_err() {
            warn!(deadline_sec = self.config.shutdown_timeout_sec, "graceful shutdown deadline exceeded; aborting remaining jobs");
        }

        http_handle.abort();
        Ok(())
    }

    /// Request shutdown. Safe to call from a synchronous signal-handling
    /// branch; wakes the task blocked in [`Daemon::run`] rather than
    /// performing the shutdown itself.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.notify_one();
    }

    /// Re-attach drivers to every run left `Running` by a previous crash.
    /// Per run: validate in-flight units via `Scheduler::resume`, then spawn
    /// the same job-driving task `StartJob` would have, registering it with
    /// the job manager. Returns the number of runs resumed.
    async fn resume(&self) -> Result<usize> {
        let runs = self.storage.list_runs_by_status(RunStatus::Running).await?;
        let mut resumed = 0usize;

        for run in runs {
            if !job_manager::is_resumable(&run) {
                continue;
            }
            match self.spawn_job_resuming(run.clone()).await {
                Ok(()) => resumed += 1,
                Err(err) => {
                    warn!(run_id = %run.id, error = %err, "failed to resume run");
                    let _ = self.storage.update_run_status(&run.id, RunStatus::Failed, Some(&err.to_string())).await;
                }
            }
        }

        Ok(resumed)
    }

    /// Build the scheduler/worker/merge-serializer/agent stack for `run`,
    /// register it with the job manager, and spawn [`drive_job`]. Used by
    /// `StartJob` for a fresh run.
    pub async fn spawn_job(&self, run: Run, config: Option<Config>) -> Result<()> {
        spawn_job(Arc::clone(&self.storage), Arc::clone(&self.jobs), run, config, false).await
    }

    /// Re-attach an existing run left `Running` by a previous crash: config
    /// is re-derived from its persisted JSON and a `ResumeMarker` event is
    /// appended once the run's dispatcher exists.
    async fn spawn_job_resuming(&self, run: Run) -> Result<()> {
        spawn_job(Arc::clone(&self.storage), Arc::clone(&self.jobs), run, None, true).await
    }
}

/// Build the scheduler/worker/merge-serializer/agent stack for `run`,
/// register it with `jobs`, and spawn [`drive_job`]. Free function (rather
/// than a `Daemon` method) so the `StartJob` HTTP handler can call it with
/// only `storage`/`jobs` in hand, without needing a reference to the
/// daemon itself. `is_resume` marks a re-attach of a run left `Running` by
/// a previous crash, as opposed to a freshly submitted job; resumed runs
/// get a `ResumeMarker` event once their dispatcher is up, so the event
/// timeline records where the restart happened without losing ordering.
pub async fn spawn_job(storage: Arc<Storage>, jobs: Arc<JobManager>, run: Run, config: Option<Config>, is_resume: bool) -> Result<()> {
    let config = match config {
        Some(c) => c,
        None => run
            .config_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default(),
    };

    let workspace_root = PathBuf::from(&run.workspace_root);
    let mut sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(TerminalSink)];
    if let Some(url) = &config.escalation_webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url.clone(), Duration::from_secs(config.http_timeout_sec as u64))));
    }
    if let Some(url) = &config.escalation_chat_webhook_url {
        sinks.push(Arc::new(ChatWebhookSink::new(url.clone(), Duration::from_secs(config.http_timeout_sec as u64))));
    }

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&storage),
        run.id.clone(),
        workspace_root.clone(),
        config.parallelism,
        config.fail_fast,
    ));
    let merge_serializer = Arc::new(MergeSerializer::new(Arc::clone(&storage), sinks, workspace_root.clone(), &config));
    let worker = Arc::new(Worker::new(Arc::clone(&storage), merge_serializer, workspace_root, &config));
    let agent = Arc::new(Agent::from_config(&config));
    let dispatcher = Dispatcher::spawn(vec![]);
    let cancel = CancellationToken::new();

    let resumable = scheduler.resume().await.map_err(job_error)?;
    let mut resumed_in_flight: Vec<JoinHandle<Unit>> = Vec::with_capacity(resumable.len());
    for unit in resumable {
        info!(run_id = %run.id, unit = %unit.unit_key, "re-attaching worker to resumed unit");
        let tasks = match storage.list_tasks(&unit.id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(run_id = %run.id, unit = %unit.unit_key, error = %err, "failed to load tasks for resumed unit");
                continue;
            }
        };
        resumed_in_flight.push(spawn_unit_worker(
            Arc::clone(&worker),
            Arc::clone(&agent),
            Arc::clone(&scheduler),
            dispatcher.clone(),
            run.id.clone(),
            cancel.clone(),
            unit,
            tasks,
        ));
    }

    if is_resume {
        let last_sequence = storage.max_event_sequence(&run.id).await.unwrap_or(0);
        crate::emit(
            &storage,
            &dispatcher,
            &run.id,
            None,
            &EventPayload::ResumeMarker(loop_core::events::ResumeMarkerPayload {
                run_id: run.id.clone(),
                last_sequence,
                timestamp: chrono::Utc::now(),
            }),
        )
        .await;
    }

    let storage_for_driver = Arc::clone(&storage);
    let jobs_for_finish = Arc::clone(&jobs);
    let run_id = run.id.clone();
    let job_dispatcher = dispatcher.clone();
    let job_cancel = cancel.clone();

    let handle = tokio::spawn(async move {
        drive_job(
            storage_for_driver,
            scheduler,
            worker,
            agent,
            job_dispatcher.clone(),
            run_id.clone(),
            job_cancel,
            resumed_in_flight,
        )
        .await;
        jobs_for_finish.remove_finished(&run_id).await;
        job_dispatcher.close().await;
    });

    jobs.register(run.id, dispatcher, cancel, handle).await.map_err(job_error)?;
    Ok(())
}

fn job_error(err: JobManagerError) -> DaemonError {
    DaemonError::Server(err.to_string())
}

fn scheduler_error(err: SchedulerError) -> DaemonError {
    DaemonError::Server(err.to_string())
}

/// Spawn a single unit's worker run as its own task: run it to completion
/// (or synthesize a `Failed` unit if the worker itself errors out), report
/// the final status back to the scheduler, and return the finished unit.
/// Shared by the claim loop below and by [`spawn_job`]'s resume path, so a
/// unit reattached after a daemon restart is driven exactly the way a
/// freshly claimed one is.
fn spawn_unit_worker(
    worker: Arc<Worker>,
    agent: Arc<Agent>,
    scheduler: Arc<Scheduler>,
    dispatcher: Dispatcher,
    run_id: Id,
    cancel: CancellationToken,
    unit: Unit,
    tasks: Vec<Task>,
) -> JoinHandle<Unit> {
    tokio::spawn(async move {
        let result = worker.run_unit(&dispatcher, &agent, &run_id, unit.clone(), tasks, &cancel).await;
        let finished = match result {
            Ok(finished) => finished,
            Err(err) => {
                error!(run_id = %run_id, unit = %unit.unit_key, error = %err, "worker errored");
                let mut failed = unit;
                failed.status = UnitStatus::Failed;
                failed.error = Some(err.to_string());
                failed.updated_at = chrono::Utc::now();
                failed
            }
        };
        if let Err(err) = scheduler.report(&finished).await {
            error!(run_id = %run_id, error = %err, "failed to report unit completion to scheduler");
        }
        finished
    })
}

/// Drive a single run to completion: repeatedly claim ready units from the
/// scheduler, run each concurrently in its own spawned task, report its
/// final status back, and once nothing remains pending or in flight, settle
/// the run's terminal status and emit `RunCompleted`/`RunFailed`. `initial_in_flight`
/// seeds the in-flight set with units reattached by [`Scheduler::resume`] on
/// a daemon restart, so they're awaited the same as newly claimed ones
/// rather than left to hang forever.
async fn drive_job(
    storage: Arc<Storage>,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    agent: Arc<Agent>,
    dispatcher: Dispatcher,
    run_id: Id,
    cancel: CancellationToken,
    initial_in_flight: Vec<JoinHandle<Unit>>,
) {
    let mut in_flight: Vec<JoinHandle<Unit>> = initial_in_flight;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        in_flight.retain(|h| !h.is_finished());

        match scheduler.next().await {
            Ok(Some(unit)) => {
                let tasks = match storage.list_tasks(&unit.id).await {
                    Ok(tasks) => tasks,
                    Err(err) => {
                        error!(run_id = %run_id, unit = %unit.unit_key, error = %err, "failed to load unit tasks");
                        continue;
                    }
                };

                in_flight.push(spawn_unit_worker(
                    Arc::clone(&worker),
                    Arc::clone(&agent),
                    Arc::clone(&scheduler),
                    dispatcher.clone(),
                    run_id.clone(),
                    cancel.clone(),
                    unit,
                    tasks,
                ));
            }
            Ok(None) => {
                if in_flight.is_empty() && run_is_settled(&storage, &run_id).await {
                    break;
                }
                tokio::time::sleep(CLAIM_POLL_INTERVAL).await;
            }
            Err(err) => {
                error!(run_id = %run_id, error = %scheduler_error(err), "scheduler error");
                tokio::time::sleep(SCHEDULER_ERROR_BACKOFF).await;
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }

    if cancel.is_cancelled() {
        return;
    }

    settle_run(&storage, &dispatcher, &run_id).await;
}

/// `true` once every unit in the run has reached a terminal status
/// (`merged`, `failed`, or `blocked`) and none remain eligible for further
/// scheduling.
async fn run_is_settled(storage: &Storage, run_id: &Id) -> bool {
    match storage.list_units(run_id).await {
        Ok(units) => units.iter().all(|u| u.status.is_terminal()),
        Err(_) => false,
    }
}

/// Once every unit is terminal, persist the run's own terminal status
/// (`Failed` if any unit failed or was blocked by a failed dependency,
/// `Completed` otherwise) and emit the matching event.
async fn settle_run(storage: &Storage, dispatcher: &Dispatcher, run_id: &Id) {
    let units = match storage.list_units(run_id).await {
        Ok(units) => units,
        Err(err) => {
            error!(run_id = %run_id, error = %err, "failed to load units while settling run");
            return;
        }
    };

    if let Err(err) = storage.refresh_run_counts(run_id).await {
        warn!(run_id = %run_id, error = %err, "failed to refresh run counts");
    }

    let any_failed = units
        .iter()
        .any(|u| matches!(u.status, UnitStatus::Failed | UnitStatus::Blocked));
    let status = if any_failed { RunStatus::Failed } else { RunStatus::Completed };
    let reason = any_failed.then(|| "one or more units failed or were blocked".to_string());

    if let Err(err) = storage.update_run_status(run_id, status, reason.as_deref()).await {
        error!(run_id = %run_id, error = %err, "failed to persist run status");
        return;
    }

    let payload = if any_failed {
        EventPayload::RunFailed(loop_core::events::RunFailedPayload {
            run_id: run_id.clone(),
            reason: reason.unwrap_or_default(),
            timestamp: chrono::Utc::now(),
        })
    } else {
        EventPayload::RunCompleted(loop_core::events::RunCompletedPayload {
            run_id: run_id.clone(),
            timestamp: chrono::Utc::now(),
        })
    };
    crate::emit(storage, dispatcher, run_id, None, &payload).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_pid_lock_writes_current_pid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        let guard = acquire_pid_lock(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.parse::<u32>().unwrap(), std::process::id());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn acquire_pid_lock_rejects_when_process_is_alive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, std::process::id().to_string()).unwrap();

        let err = acquire_pid_lock(&path).unwrap_err();
        assert!(matches!(err, DaemonError::AlreadyRunning(_)));
    }

    #[test]
    fn acquire_pid_lock_removes_stale_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("daemon.pid");
        // A PID essentially guaranteed not to be alive in the test sandbox.
        std::fs::write(&path, "999999").unwrap();

        let guard = acquire_pid_lock(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.parse::<u32>().unwrap(), std::process::id());
        drop(guard);
    }

    #[tokio::test]
    async fn daemon_config_defaults_match_run_config() {
        let daemon_config = DaemonConfig::default();
        let run_config = Config::default();
        assert_eq!(daemon_config.listen_port, run_config.listen_port);
        assert_eq!(daemon_config.max_jobs, run_config.max_jobs);
    }

    #[tokio::test]
    async fn settle_run_marks_completed_when_no_units_failed() {
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let run_id = Id::new();
        let now = chrono::Utc::now();
        let run = Run {
            id: run_id.clone(),
            status: RunStatus::Running,
            workspace_root: "/tmp/ws".to_string(),
            specs_dir: "/tmp/ws/specs".to_string(),
            daemon_version: "test".to_string(),
            error: None,
            config_json: None,
            total_units: 1,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            created_at: now,
            updated_at: now,
        };
        storage.insert_run(&run).await.unwrap();

        let unit = Unit {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_key: "a".to_string(),
            title: "A".to_string(),
            status: UnitStatus::Merged,
            level: 0,
            depends_on: vec![],
            spec_path: "a.md".to_string(),
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_units(&[unit]).await.unwrap();

        let dispatcher = Dispatcher::spawn(vec![]);
        settle_run(&storage, &dispatcher, &run_id).await;

        let reloaded = storage.get_run(&run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn settle_run_marks_failed_when_a_unit_failed() {
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let run_id = Id::new();
        let now = chrono::Utc::now();
        let run = Run {
            id: run_id.clone(),
            status: RunStatus::Running,
            workspace_root: "/tmp/ws".to_string(),
            specs_dir: "/tmp/ws/specs".to_string(),
            daemon_version: "test".to_string(),
            error: None,
            config_json: None,
            total_units: 1,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            created_at: now,
            updated_at: now,
        };
        storage.insert_run(&run).await.unwrap();

        let unit = Unit {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_key: "a".to_string(),
            title: "A".to_string(),
            status: UnitStatus::Failed,
            level: 0,
            depends_on: vec![],
            spec_path: "a.md".to_string(),
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: Some("boom".to_string()),
            created_at: now,
            updated_at: now,
        };
        storage.insert_units(&[unit]).await.unwrap();

        let dispatcher = Dispatcher::spawn(vec![]);
        settle_run(&storage, &dispatcher, &run_id).await;

        let reloaded = storage.get_run(&run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn settle_run_marks_failed_when_a_unit_is_only_blocked() {
        // A fails, B depends on A and never gets scheduled: no unit's status
        // is literally `Failed` here, but the run must still be reported
        // `Failed` rather than `Completed`.
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let run_id = Id::new();
        let now = chrono::Utc::now();
        let run = Run {
            id: run_id.clone(),
            status: RunStatus::Running,
            workspace_root: "/tmp/ws".to_string(),
            specs_dir: "/tmp/ws/specs".to_string(),
            daemon_version: "test".to_string(),
            error: None,
            config_json: None,
            total_units: 2,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            created_at: now,
            updated_at: now,
        };
        storage.insert_run(&run).await.unwrap();

        let blocked = Unit {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_key: "b".to_string(),
            title: "B".to_string(),
            status: UnitStatus::Blocked,
            level: 1,
            depends_on: vec!["a".to_string()],
            spec_path: "b.md".to_string(),
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_units(&[blocked]).await.unwrap();

        assert!(run_is_settled(&storage, &run_id).await);

        let dispatcher = Dispatcher::spawn(vec![]);
        settle_run(&storage, &dispatcher, &run_id).await;

        let reloaded = storage.get_run(&run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn drive_job_awaits_a_seeded_resumed_unit_before_settling() {
        // Stand in for a unit `Scheduler::resume` handed back after a daemon
        // restart: `drive_job` must await it via `initial_in_flight` rather
        // than only noticing units it claims itself.
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let run_id = Id::new();
        let now = chrono::Utc::now();
        let run = Run {
            id: run_id.clone(),
            status: RunStatus::Running,
            workspace_root: "/tmp/ws".to_string(),
            specs_dir: "/tmp/ws/specs".to_string(),
            daemon_version: "test".to_string(),
            error: None,
            config_json: None,
            total_units: 1,
            completed_units: 0,
            failed_units: 0,
            blocked_units: 0,
            created_at: now,
            updated_at: now,
        };
        storage.insert_run(&run).await.unwrap();

        let unit = Unit {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_key: "a".to_string(),
            title: "A".to_string(),
            status: UnitStatus::InProgress,
            level: 0,
            depends_on: vec![],
            spec_path: "a.md".to_string(),
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        storage.insert_units(&[unit.clone()]).await.unwrap();

        let config = Config::default();
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&storage),
            run_id.clone(),
            PathBuf::from("/tmp/ws"),
            config.parallelism,
            config.fail_fast,
        ));
        let merge_serializer = Arc::new(MergeSerializer::new(Arc::clone(&storage), vec![], PathBuf::from("/tmp/ws"), &config));
        let worker = Arc::new(Worker::new(Arc::clone(&storage), merge_serializer, PathBuf::from("/tmp/ws"), &config));
        let agent = Arc::new(Agent::from_config(&config));
        let dispatcher = Dispatcher::spawn(vec![]);
        let cancel = CancellationToken::new();

        let mut merged = unit;
        merged.status = UnitStatus::Merged;
        let scheduler_for_report = Arc::clone(&scheduler);
        let seeded = tokio::spawn(async move {
            scheduler_for_report.report(&merged).await.unwrap();
            merged
        });

        drive_job(Arc::clone(&storage), scheduler, worker, agent, dispatcher, run_id.clone(), cancel, vec![seeded]).await;

        let reloaded = storage.get_run(&run_id).await.unwrap();
        assert_eq!(reloaded.status, RunStatus::Completed);
    }
}
