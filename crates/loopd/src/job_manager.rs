//! In-memory job registry (spec Section 4.7).
//!
//! A "job" is one daemon-managed run: the scheduler driving it, the worker
//! tasks executing its units, and the per-run event bus they publish
//! through. [`JobManager`] is the single place that knows which jobs are
//! currently live, so [`crate::server`] and [`crate::daemon`] can start,
//! stop, and enumerate them without reaching into storage for anything that
//! is purely in-process state (cancellation tokens, join handles).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use loop_core::{Id, Run, RunStatus};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;

#[derive(Debug, Error)]
pub enum JobManagerError {
    #[error("job {0} not found")]
    NotFound(Id),
    #[error("at job capacity ({0} running)")]
    AtCapacity(usize),
}

pub type Result<T> = std::result::Result<T, JobManagerError>;

/// Everything the daemon needs to track about one in-flight run, beyond what
/// is already durable in SQLite.
pub struct ManagedJob {
    pub run_id: Id,
    pub dispatcher: Dispatcher,
    pub cancel: CancellationToken,
    pub started_at: Instant,
    handle: JoinHandle<()>,
}

impl ManagedJob {
    /// Request cancellation and wait for the driving task to observe it and
    /// exit. Does not enforce a deadline; callers wanting a bounded wait
    /// should race this against `tokio::time::timeout`.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            warn!(run_id = %self.run_id, error = %err, "job task exited abnormally");
        }
    }
}

/// Registry of currently-managed jobs, capped at `max_jobs` concurrently
/// running at once. Completed jobs are removed by whoever drives them to
/// completion (typically the daemon's run-completion handler), not by the
/// registry itself.
pub struct JobManager {
    jobs: RwLock<HashMap<Id, ManagedJob>>,
    max_jobs: usize,
}

impl JobManager {
    pub fn new(max_jobs: usize) -> Self {
        Self { jobs: RwLock::new(HashMap::new()), max_jobs: max_jobs.max(1) }
    }

    /// Register a newly-started job, spawned by the caller as `handle`.
    /// Rejects registration once `max_jobs` are already tracked.
    pub async fn register(
        &self,
        run_id: Id,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
        handle: JoinHandle<()>,
    ) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.len() >= self.max_jobs {
            return Err(JobManagerError::AtCapacity(jobs.len()));
        }
        info!(run_id = %run_id, active = jobs.len() + 1, max_jobs = self.max_jobs, "job registered");
        jobs.insert(
            run_id.clone(),
            ManagedJob { run_id, dispatcher, cancel, started_at: Instant::now(), handle },
        );
        Ok(())
    }

    /// Number of jobs currently tracked (running or finishing cancellation).
    pub async fn active_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Whether a new job could be registered right now.
    pub async fn has_capacity(&self) -> bool {
        self.jobs.read().await.len() < self.max_jobs
    }

    /// Cancel a job and wait for it to exit, removing it from the registry.
    pub async fn stop(&self, run_id: &Id) -> Result<()> {
        let job = self.jobs.write().await.remove(run_id).ok_or_else(|| JobManagerError::NotFound(run_id.clone()))?;
        job.stop().await;
        Ok(())
    }

    /// Remove a job from the registry without cancelling it, because it has
    /// already finished on its own (run reached a terminal status).
    pub async fn remove_finished(&self, run_id: &Id) {
        self.jobs.write().await.remove(run_id);
    }

    /// The event bus for a live job, if it is currently tracked.
    pub async fn dispatcher_for(&self, run_id: &Id) -> Option<Dispatcher> {
        self.jobs.read().await.get(run_id).map(|j| j.dispatcher.clone())
    }

    /// `true` if the run is tracked as currently live (not yet removed after
    /// completion or explicit stop).
    pub async fn is_active(&self, run_id: &Id) -> bool {
        self.jobs.read().await.contains_key(run_id)
    }

    /// Cancel every tracked job and wait for all of them to exit, draining
    /// the registry. Used during daemon shutdown.
    pub async fn stop_all(&self) -> Vec<Id> {
        let jobs: Vec<ManagedJob> = self.jobs.write().await.drain().map(|(_, job)| job).collect();
        let run_ids: Vec<Id> = jobs.iter().map(|j| j.run_id.clone()).collect();
        for job in jobs {
            job.stop().await;
        }
        run_ids
    }
}

/// Whether a [`Run`] row's status means the job is still worth tracking as
/// live across a daemon restart.
pub fn is_resumable(run: &Run) -> bool {
    run.status == RunStatus::Running
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn spawn_noop(cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            cancel.cancelled().await;
        })
    }

    #[tokio::test]
    async fn register_and_stop_round_trip() {
        let manager = JobManager::new(2);
        let run_id = Id::new();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::spawn(vec![]);
        let handle = spawn_noop(cancel.clone());

        manager.register(run_id.clone(), dispatcher, cancel, handle).await.unwrap();
        assert_eq!(manager.active_count().await, 1);
        assert!(manager.is_active(&run_id).await);

        manager.stop(&run_id).await.unwrap();
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn rejects_registration_over_capacity() {
        let manager = JobManager::new(1);
        let first = Id::new();
        let cancel1 = CancellationToken::new();
        manager
            .register(first.clone(), Dispatcher::spawn(vec![]), cancel1.clone(), spawn_noop(cancel1))
            .await
            .unwrap();

        let second = Id::new();
        let cancel2 = CancellationToken::new();
        let err = manager
            .register(second, Dispatcher::spawn(vec![]), cancel2.clone(), spawn_noop(cancel2))
            .await
            .unwrap_err();
        assert!(matches!(err, JobManagerError::AtCapacity(1)));
    }

    #[tokio::test]
    async fn stop_unknown_job_errors() {
        let manager = JobManager::new(2);
        let err = manager.stop(&Id::new()).await.unwrap_err();
        assert!(matches!(err, JobManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_all_drains_registry() {
        let manager = JobManager::new(4);
        for _ in 0..3 {
            let run_id = Id::new();
            let cancel = CancellationToken::new();
            manager
                .register(run_id, Dispatcher::spawn(vec![]), cancel.clone(), spawn_noop(cancel))
                .await
                .unwrap();
        }
        let stopped = manager.stop_all().await;
        assert_eq!(stopped.len(), 3);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn dispatcher_for_unknown_job_is_none() {
        let manager = JobManager::new(1);
        assert!(manager.dispatcher_for(&Id::new()).await.is_none());
    }

    #[tokio::test]
    async fn remove_finished_drops_without_cancelling() {
        let manager = JobManager::new(1);
        let run_id = Id::new();
        let (_tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = rx.await;
        });
        manager
            .register(run_id.clone(), Dispatcher::spawn(vec![]), CancellationToken::new(), handle)
            .await
            .unwrap();
        manager.remove_finished(&run_id).await;
        assert_eq!(manager.active_count().await, 0);
    }
}
