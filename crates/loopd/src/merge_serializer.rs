//! Merge serializer with delegated conflict resolution (spec Section 4.3).
//!
//! Owns the one thing that must never run concurrently across a run's
//! units: a write against the target branch. A worker hands its unit to
//! [`MergeSerializer::process`] once its pull request is open; everything
//! from review polling through the final merge (or its failure) happens
//! here, single-threaded per run via the FCFS queue token.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use loop_core::prompt::{conflict_resolution_prompt, review_feedback_prompt};
use loop_core::types::{PullRequest, ReviewState, Unit, UnitStatus};
use loop_core::{Config, EventPayload, Id};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::agent::{Agent, AgentError};
use crate::dispatcher::Dispatcher;
use crate::escalation::{self, Escalation, Severity, Sink};
use crate::git::{self, GitError};
use crate::pr_host::{self, PrHostError};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum MergeSerializerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("git-host error: {0}")]
    PrHost(#[from] PrHostError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
}

pub type Result<T> = std::result::Result<T, MergeSerializerError>;

/// Outcome of [`MergeSerializer::process`]: either the unit merged, the
/// unit failed outright, or review polling timed out and the unit is left
/// `in_review` for a later resume to re-enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Merged,
    Failed,
    ReviewTimedOut,
    /// Cooperative shutdown observed mid-protocol; the unit is left in
    /// whatever non-terminal status it already had so resume can re-enter.
    Cancelled,
}

/// Single-writer FCFS token plus the review/merge protocol that runs while
/// holding it. One instance is shared across every unit in a run.
pub struct MergeSerializer {
    storage: Arc<Storage>,
    sinks: Vec<Arc<dyn Sink>>,
    workspace_root: std::path::PathBuf,
    target_branch: String,
    token: Arc<Mutex<()>>,
    review_poll_interval: Duration,
    review_timeout: Duration,
    max_conflict_retries: u32,
    conflict_retry_initial_delay: Duration,
    conflict_retry_max_delay: Duration,
    conflict_retry_multiplier: f64,
}

impl MergeSerializer {
    pub fn new(
        storage: Arc<Storage>,
        sinks: Vec<Arc<dyn Sink>>,
        workspace_root: std::path::PathBuf,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            sinks,
            workspace_root,
            target_branch: config.target_branch.clone(),
            token: Arc::new(Mutex::new(())),
            review_poll_interval: Duration::from_secs(config.review_poll_interval_sec as u64),
            review_timeout: Duration::from_secs(config.review_timeout_sec as u64),
            max_conflict_retries: config.max_conflict_retries,
            conflict_retry_initial_delay: Duration::from_secs(config.conflict_retry_initial_delay_sec as u64),
            conflict_retry_max_delay: Duration::from_secs(config.conflict_retry_max_delay_sec as u64),
            conflict_retry_multiplier: config.conflict_retry_multiplier,
        }
    }

    async fn emit(&self, dispatcher: &Dispatcher, run_id: &Id, unit_id: Option<&Id>, payload: &EventPayload) {
        crate::emit(&self.storage, dispatcher, run_id, unit_id, payload).await;
    }

    async fn escalate(&self, run_id: &Id, unit_id: Option<&Id>, severity: Severity, title: &str, message: &str) {
        let escalation = Escalation {
            run_id: run_id.clone(),
            unit_id: unit_id.cloned(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            context: Default::default(),
        };
        if let Err(err) = escalation::escalate(&self.sinks, &escalation).await {
            warn!(error = %err, "escalation delivery failed for every sink");
        }
    }

    /// Drive review polling and (once approved) the merge protocol for one
    /// unit's pull request. Returns the final unit/PR rows and which of the
    /// three terminal-ish outcomes was reached; the caller (worker.rs)
    /// decides whether that warrants worktree teardown.
    pub async fn process(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        mut unit: Unit,
        mut pr: PullRequest,
        worktree: &Path,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(Unit, PullRequest, Outcome)> {
        match self.poll_reviews(dispatcher, agent, run_id, &mut unit, &mut pr, worktree, log_dir, cancel).await? {
            ReviewOutcome::Approved => {}
            ReviewOutcome::TimedOut => return Ok((unit, pr, Outcome::ReviewTimedOut)),
            ReviewOutcome::Cancelled => return Ok((unit, pr, Outcome::Cancelled)),
        }

        self.emit(
            dispatcher,
            run_id,
            Some(&unit.id),
            &EventPayload::MergeQueued(loop_core::events::MergeQueuedPayload {
                unit_id: unit.id.clone(),
                pr_number: pr.number,
                timestamp: chrono::Utc::now(),
            }),
        )
        .await;

        let _permit = tokio::select! {
            guard = self.token.lock() => guard,
            _ = cancel.cancelled() => return Ok((unit, pr, Outcome::Cancelled)),
        };

        unit.status = UnitStatus::Merging;
        unit.updated_at = chrono::Utc::now();
        self.storage.update_unit(&unit).await?;

        let outcome = self
            .merge_with_retries(dispatcher, agent, run_id, &mut unit, &mut pr, worktree, log_dir, cancel)
            .await?;

        Ok((unit, pr, outcome))
    }

    async fn poll_reviews(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        unit: &mut Unit,
        pr: &mut PullRequest,
        worktree: &Path,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ReviewOutcome> {
        let mut deadline = Instant::now() + self.review_timeout;
        let mut feedback_iteration = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(ReviewOutcome::Cancelled);
            }

            let state = pr_host::review_state(&self.workspace_root, pr.number).await?;
            if state != pr.review_state {
                pr.review_state = state;
                pr.updated_at = chrono::Utc::now();
                self.storage.update_pull_request(pr).await?;
                self.emit(
                    dispatcher,
                    run_id,
                    Some(&unit.id),
                    &EventPayload::PrReviewUpdated(loop_core::events::PrReviewUpdatedPayload {
                        unit_id: unit.id.clone(),
                        pr_number: pr.number,
                        review_state: state,
                        timestamp: chrono::Utc::now(),
                    }),
                )
                .await;
            }

            match state {
                ReviewState::Approved => return Ok(ReviewOutcome::Approved),
                ReviewState::ChangesRequested => {
                    let comments = pr_host::list_review_comments(&self.workspace_root, pr.number).await?;
                    let pairs: Vec<(String, String)> =
                        comments.into_iter().map(|c| (c.author, c.body)).collect();
                    let prompt = review_feedback_prompt(&unit.title, &pairs);
                    let step = agent
                        .run_step(worktree, &log_dir.join("review"), feedback_iteration, &prompt, cancel)
                        .await;
                    feedback_iteration += 1;

                    match step {
                        Ok(_) => {
                            if !git::is_working_tree_clean(worktree)? {
                                git::stage_all(worktree)?;
                                git::commit(worktree, &format!("address review feedback ({})", unit.unit_key))?;
                            }
                            if let Some(branch) = unit.branch.as_deref() {
                                git::force_push_with_lease(worktree, "origin", branch)?;
                            }
                        }
                        Err(AgentError::Cancelled) => return Ok(ReviewOutcome::Cancelled),
                        Err(AgentError::Timeout(secs)) => {
                            warn!(unit = %unit.unit_key, timeout_sec = secs, "review-feedback agent step timed out; will retry on the next poll");
                        }
                        Err(err) => return Err(err.into()),
                    }

                    deadline = Instant::now() + self.review_timeout;
                }
                ReviewState::InProgress | ReviewState::Pending => {}
            }

            if Instant::now() >= deadline {
                self.escalate(
                    run_id,
                    Some(&unit.id),
                    Severity::Warning,
                    "review timeout",
                    &format!("unit {} received no approval within the review deadline", unit.unit_key),
                )
                .await;
                return Ok(ReviewOutcome::TimedOut);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(ReviewOutcome::Cancelled),
                _ = tokio::time::sleep(self.review_poll_interval) => {}
            }
        }
    }

    async fn merge_with_retries(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        unit: &mut Unit,
        pr: &mut PullRequest,
        worktree: &Path,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let mut attempt = 0u32;
        let mut delay = self.conflict_retry_initial_delay;
        let mut rebase_already_done = false;

        loop {
            let branch = unit.branch.clone().unwrap_or_default();
            let rebase_result = if rebase_already_done {
                rebase_already_done = false;
                Ok(())
            } else {
                git::fetch(&self.workspace_root, "origin")?;
                git::rebase_onto(worktree, &format!("origin/{}", self.target_branch))
            };

            match rebase_result {
                Ok(()) => {
                    if let Err(GitError::PushRejected(reason)) =
                        git::force_push_with_lease(worktree, "origin", &branch)
                    {
                        warn!(unit = %unit.unit_key, attempt, %reason, "push rejected after rebase, retrying from fetch");
                        if attempt >= self.max_conflict_retries {
                            self.escalate(
                                run_id,
                                Some(&unit.id),
                                Severity::Blocking,
                                "push rejected after rebase",
                                &format!(
                                    "unit {} could not push to {} after {} attempts: {}",
                                    unit.unit_key,
                                    self.target_branch,
                                    attempt + 1,
                                    reason
                                ),
                            )
                            .await;

                            self.emit(
                                dispatcher,
                                run_id,
                                Some(&unit.id),
                                &EventPayload::MergeFailed(loop_core::events::MergeFailedPayload {
                                    unit_id: unit.id.clone(),
                                    pr_number: pr.number,
                                    reason: "push rejected after rebase".to_string(),
                                    timestamp: chrono::Utc::now(),
                                }),
                            )
                            .await;

                            unit.status = UnitStatus::Failed;
                            unit.error = Some("push rejected after rebase".to_string());
                            unit.updated_at = chrono::Utc::now();
                            self.storage.update_unit(unit).await?;
                            return Ok(Outcome::Failed);
                        }

                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = Duration::from_secs_f64(
                            (delay.as_secs_f64() * self.conflict_retry_multiplier)
                                .min(self.conflict_retry_max_delay.as_secs_f64()),
                        );
                        continue;
                    }
                    let merge_commit = pr_host::merge_pr(&self.workspace_root, pr.number, pr.merge_strategy).await?;

                    pr.merged = true;
                    pr.merge_commit = Some(merge_commit);
                    pr.updated_at = chrono::Utc::now();
                    self.storage.update_pull_request(pr).await?;

                    self.emit(
                        dispatcher,
                        run_id,
                        Some(&unit.id),
                        &EventPayload::MergeSucceeded(loop_core::events::MergeSucceededPayload {
                            unit_id: unit.id.clone(),
                            pr_number: pr.number,
                            timestamp: chrono::Utc::now(),
                        }),
                    )
                    .await;

                    unit.status = UnitStatus::Merged;
                    unit.updated_at = chrono::Utc::now();
                    self.storage.update_unit(unit).await?;
                    return Ok(Outcome::Merged);
                }
                Err(GitError::RebaseConflict(files)) => {
                    self.emit(
                        dispatcher,
                        run_id,
                        Some(&unit.id),
                        &EventPayload::MergeConflict(loop_core::events::MergeConflictPayload {
                            unit_id: unit.id.clone(),
                            attempt,
                            unmerged_files: files.clone(),
                            timestamp: chrono::Utc::now(),
                        }),
                    )
                    .await;

                    if attempt >= self.max_conflict_retries {
                        let _ = git::rebase_abort(worktree);
                        self.escalate(
                            run_id,
                            Some(&unit.id),
                            Severity::Blocking,
                            "unresolved merge conflict",
                            &format!(
                                "unit {} could not be rebased onto {} after {} attempts; conflicted files: {}",
                                unit.unit_key,
                                self.target_branch,
                                attempt + 1,
                                files.join(", ")
                            ),
                        )
                        .await;

                        self.emit(
                            dispatcher,
                            run_id,
                            Some(&unit.id),
                            &EventPayload::MergeFailed(loop_core::events::MergeFailedPayload {
                                unit_id: unit.id.clone(),
                                pr_number: pr.number,
                                reason: "unresolved merge conflict".to_string(),
                                timestamp: chrono::Utc::now(),
                            }),
                        )
                        .await;

                        unit.status = UnitStatus::Failed;
                        unit.error = Some("unresolved merge conflict".to_string());
                        unit.updated_at = chrono::Utc::now();
                        self.storage.update_unit(unit).await?;
                        return Ok(Outcome::Failed);
                    }

                    let prompt = conflict_resolution_prompt(&unit.title, &files);
                    let agent_timed_out = match agent.run_step(worktree, &log_dir.join("conflict"), attempt, &prompt, cancel).await {
                        Ok(_) => false,
                        Err(AgentError::Cancelled) => {
                            let _ = git::rebase_abort(worktree);
                            return Ok(Outcome::Cancelled);
                        }
                        Err(AgentError::Timeout(secs)) => {
                            warn!(unit = %unit.unit_key, timeout_sec = secs, "conflict-resolution agent step timed out");
                            true
                        }
                        Err(err) => return Err(err.into()),
                    };

                    if agent_timed_out || git::rebase_in_progress(worktree) {
                        // The agent didn't finish the rebase (no `rebase --continue`,
                        // or it left conflicts). This attempt is a failure; abort so
                        // the next attempt starts from a clean fetch+rebase, and back
                        // off before retrying.
                        warn!(unit = %unit.unit_key, attempt, "rebase still in progress after agent attempt");
                        let _ = git::rebase_abort(worktree);

                        attempt += 1;
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                let _ = git::rebase_abort(worktree);
                                return Ok(Outcome::Cancelled);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = Duration::from_secs_f64(
                            (delay.as_secs_f64() * self.conflict_retry_multiplier)
                                .min(self.conflict_retry_max_delay.as_secs_f64()),
                        );
                    } else {
                        // Agent resolved the conflicts and completed the rebase
                        // itself; proceed straight to push+merge without
                        // re-running fetch+rebase_onto on an already-rebased tree
                        // or waiting out a pointless backoff.
                        rebase_already_done = true;
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

enum ReviewOutcome {
    Approved,
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_until_cap() {
        let mut delay = Duration::from_secs(1);
        let multiplier = 2.0;
        let cap = Duration::from_secs(30);
        let mut samples = Vec::new();
        for _ in 0..6 {
            samples.push(delay.as_secs());
            delay = Duration::from_secs_f64((delay.as_secs_f64() * multiplier).min(cap.as_secs_f64()));
        }
        assert_eq!(samples, vec![1, 2, 4, 8, 16, 30]);
    }

    #[tokio::test]
    async fn merge_serializer_token_is_single_holder() {
        let token = Arc::new(Mutex::new(()));
        let first = token.clone().try_lock_owned();
        assert!(first.is_ok());
        let second = token.clone().try_lock_owned();
        assert!(second.is_err());
    }
}
