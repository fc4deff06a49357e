//! Worker execution loop: the "Ralph loop" (spec Section 4.2).
//!
//! Carries one unit from `ready` to a merged pull request inside a dedicated
//! git worktree, through four sequential phases: Setup, the task loop,
//! baseline checks, and PR creation/merge. Internally single-threaded —
//! every phase runs its operations one after another; isolation across
//! concurrently-running units comes from each owning its own worktree, not
//! from any lock here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use loop_core::prompt::{baseline_fix_prompt, pr_creation_prompt, task_prompt, ReadyTaskSummary};
use loop_core::spec_header::{self, SpecHeaderError};
use loop_core::types::{MergeStrategy, PullRequest, ReviewState, Task, TaskStatus, Unit, UnitStatus};
use loop_core::{Config, EventPayload, Id};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{Agent, AgentError};
use crate::dispatcher::Dispatcher;
use crate::git::{self, GitError};
use crate::merge_serializer::{MergeSerializer, MergeSerializerError, Outcome as MergeOutcome};
use crate::pr_host::{self, PrHostError};
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("git-host error: {0}")]
    PrHost(#[from] PrHostError),
    #[error("merge serializer error: {0}")]
    MergeSerializer(#[from] MergeSerializerError),
    #[error("spec header error: {0}")]
    SpecHeader(#[from] SpecHeaderError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Tail a string to its last `n` lines, for handing command output to the
/// agent without dumping an unbounded log into a prompt.
fn tail_lines(s: &str, n: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    if lines.len() <= n {
        s.to_string()
    } else {
        lines[lines.len() - n..].join("\n")
    }
}

/// Outcome of a worker phase that can exit early without reaching the next
/// phase.
enum PhaseOutcome {
    Continue,
    Failed,
    Cancelled,
}

/// Drives one unit through Setup, task loop, baseline, and PR/merge.
pub struct Worker {
    storage: Arc<Storage>,
    merge_serializer: Arc<MergeSerializer>,
    workspace_root: PathBuf,
    worktree_base: PathBuf,
    target_branch: String,
    branch_prefix: String,
    max_agent_retries: u32,
    max_baseline_retries: u32,
    baseline_checks: Vec<String>,
    task_validation_timeout: Duration,
    baseline_timeout: Duration,
    no_pr: bool,
    merge_strategy: MergeStrategy,
}

impl Worker {
    pub fn new(
        storage: Arc<Storage>,
        merge_serializer: Arc<MergeSerializer>,
        workspace_root: PathBuf,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            merge_serializer,
            workspace_root,
            worktree_base: config.worktree_base.clone(),
            target_branch: config.target_branch.clone(),
            branch_prefix: config.branch_prefix.clone(),
            max_agent_retries: config.max_agent_retries,
            max_baseline_retries: config.max_baseline_retries,
            baseline_checks: config.baseline_checks.clone(),
            task_validation_timeout: Duration::from_secs(config.task_validation_timeout_sec as u64),
            baseline_timeout: Duration::from_secs(config.baseline_timeout_sec as u64),
            no_pr: config.no_pr,
            merge_strategy: config.merge_strategy,
        }
    }

    async fn emit(&self, dispatcher: &Dispatcher, run_id: &Id, unit_id: Option<&Id>, payload: &EventPayload) {
        crate::emit(&self.storage, dispatcher, run_id, unit_id, payload).await;
    }

    async fn transition(&self, dispatcher: &Dispatcher, run_id: &Id, unit: &mut Unit, to: UnitStatus) -> Result<()> {
        let from = unit.status;
        unit.status = to;
        unit.updated_at = chrono::Utc::now();
        self.storage.update_unit(unit).await?;
        self.emit(
            dispatcher,
            run_id,
            Some(&unit.id),
            &EventPayload::UnitStatusChanged(loop_core::events::UnitStatusChangedPayload {
                unit_id: unit.id.clone(),
                unit_key: unit.unit_key.clone(),
                from,
                to,
                timestamp: chrono::Utc::now(),
            }),
        )
        .await;
        Ok(())
    }

    async fn fail_unit(&self, dispatcher: &Dispatcher, run_id: &Id, unit: &mut Unit, reason: &str) -> Result<()> {
        unit.error = Some(reason.to_string());
        self.transition(dispatcher, run_id, unit, UnitStatus::Failed).await?;
        self.emit(
            dispatcher,
            run_id,
            Some(&unit.id),
            &EventPayload::UnitFailed(loop_core::events::UnitFailedPayload {
                unit_id: unit.id.clone(),
                unit_key: unit.unit_key.clone(),
                reason: reason.to_string(),
                timestamp: chrono::Utc::now(),
            }),
        )
        .await;
        Ok(())
    }

    /// Map an absolute spec path (resolved against the main workspace root at
    /// discovery time) to the equivalent path inside a unit's worktree. Spec
    /// files are tracked in git, so they appear at the same relative
    /// location in every worktree checked out from the same repository.
    fn in_worktree(&self, absolute_spec_path: &str, worktree: &Path) -> PathBuf {
        let path = Path::new(absolute_spec_path);
        match path.strip_prefix(&self.workspace_root) {
            Ok(rel) => worktree.join(rel),
            Err(_) => path.to_path_buf(),
        }
    }

    async fn run_validation(&self, worktree: &Path, command: &str, timeout: Duration) -> (bool, String) {
        let result = tokio::time::timeout(
            timeout,
            Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(worktree)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) => {
                let combined = format!(
                    "{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                );
                (output.status.success(), combined)
            }
            Ok(Err(err)) => (false, format!("failed to run `{command}`: {err}")),
            Err(_) => (false, format!("`{command}` timed out after {}s", timeout.as_secs())),
        }
    }

    /// Drive one unit to completion: worktree setup, task loop, baseline,
    /// PR/merge, and guaranteed teardown on every terminal exit path.
    ///
    /// Returns the unit's final row. Caller (the job driving loop) is
    /// responsible for handing this back to `Scheduler::report`.
    pub async fn run_unit(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        mut unit: Unit,
        mut tasks: Vec<Task>,
        cancel: &CancellationToken,
    ) -> Result<Unit> {
        self.transition(dispatcher, run_id, &mut unit, UnitStatus::InProgress).await?;

        let (worktree, branch) = match self.setup(&mut unit).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(unit = %unit.unit_key, error = %err, "worker setup failed");
                self.fail_unit(dispatcher, run_id, &mut unit, &format!("setup failed: {err}")).await?;
                return Ok(unit);
            }
        };
        let log_dir = self.worktree_base.join("logs").join(unit.unit_key.as_str());

        let outcome = self
            .run_task_loop(dispatcher, agent, run_id, &mut unit, &mut tasks, &worktree, &log_dir, cancel)
            .await?;

        let outcome = match outcome {
            PhaseOutcome::Continue => {
                self.run_baseline(dispatcher, agent, run_id, &mut unit, &worktree, &log_dir, cancel).await?
            }
            other => other,
        };

        match outcome {
            PhaseOutcome::Continue => {}
            PhaseOutcome::Failed => {
                self.teardown(&worktree, &branch);
                return Ok(unit);
            }
            PhaseOutcome::Cancelled => {
                return Ok(unit);
            }
        }

        match self.run_pr_phase(dispatcher, agent, run_id, &mut unit, &tasks, &worktree, &branch, &log_dir, cancel).await {
            Ok(true) => self.teardown(&worktree, &branch),
            Ok(false) => {}
            Err(err) => {
                warn!(unit = %unit.unit_key, error = %err, "PR/merge phase errored");
                self.fail_unit(dispatcher, run_id, &mut unit, &format!("pr/merge phase error: {err}")).await?;
                self.teardown(&worktree, &branch);
            }
        }

        Ok(unit)
    }

    /// Phase A. Create an isolated worktree rooted under the configured
    /// worktree base, on a new branch derived from the unit key. If the unit
    /// already carries a worktree/branch pair that still exists on disk -
    /// true after a daemon restart reattaches a worker via
    /// `Scheduler::resume` - reuse it instead of recreating it out from
    /// under the in-progress work.
    async fn setup(&self, unit: &mut Unit) -> Result<(PathBuf, String)> {
        if let (Some(worktree_path), Some(branch)) = (unit.worktree_path.clone(), unit.branch.clone()) {
            let path = PathBuf::from(&worktree_path);
            if path.exists() {
                return Ok((path, branch));
            }
        }

        let suffix: String = unit.id.as_ref().chars().filter(|c| c.is_ascii_alphanumeric()).take(8).collect();
        let branch = format!("{}/{}-{}", self.branch_prefix, git::slugify(&unit.unit_key), suffix);

        let template = format!("{}/{{{{ branch | sanitize }}}}", self.worktree_base.display());
        let expanded = git::expand_worktree_template(&template, &self.workspace_root, &branch);
        let worktree_path = git::resolve_worktree_path(&expanded, &self.workspace_root);

        if let Err(err) = git::create_worktree(&self.workspace_root, &worktree_path, &branch, &self.target_branch) {
            let _ = git::remove_worktree_force(&self.workspace_root, &worktree_path);
            return Err(err.into());
        }

        unit.worktree_path = Some(worktree_path.display().to_string());
        unit.branch = Some(branch.clone());
        unit.updated_at = chrono::Utc::now();
        self.storage.update_unit(unit).await?;

        info!(unit = %unit.unit_key, branch = %branch, worktree = %worktree_path.display(), "worktree created");
        Ok((worktree_path, branch))
    }

    /// Phase B. Repeatedly re-read task headers, compute the ready set,
    /// invoke the agent, and re-verify completion independently.
    async fn run_task_loop(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        unit: &mut Unit,
        tasks: &mut [Task],
        worktree: &Path,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome> {
        let mut round = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }

            for task in tasks.iter_mut() {
                let header = spec_header::load_task(&self.in_worktree(&task.spec_path, worktree))?;
                if header.header.status != task.status || header.header.error != task.error {
                    task.status = header.header.status;
                    task.error = header.header.error.clone();
                    task.updated_at = chrono::Utc::now();
                    self.storage.update_task(task).await?;
                }
            }

            if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
                self.fail_unit(dispatcher, run_id, unit, "a task failed").await?;
                return Ok(PhaseOutcome::Failed);
            }

            // `InProgress` tasks are admitted alongside `Pending` ones: a task
            // reverted to `InProgress` after a failed validation (below) must
            // stay retryable here, and the same status is what a crash mid-
            // attempt leaves on disk for `Scheduler::resume` to hand back.
            let ready_numbers: Vec<u32> = tasks
                .iter()
                .filter(|t| {
                    matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress)
                        && t.depends_on.iter().all(|dep| {
                            tasks.iter().any(|x| x.task_number == *dep && x.status == TaskStatus::Complete)
                        })
                })
                .map(|t| t.task_number)
                .collect();

            if ready_numbers.is_empty() {
                if tasks.iter().all(|t| t.status == TaskStatus::Complete) {
                    return Ok(PhaseOutcome::Continue);
                }
                self.fail_unit(dispatcher, run_id, unit, "deadlocked: no ready tasks remain").await?;
                return Ok(PhaseOutcome::Failed);
            }

            let ready: Vec<&Task> = tasks.iter().filter(|t| ready_numbers.contains(&t.task_number)).collect();
            let summaries: Vec<ReadyTaskSummary> = ready
                .iter()
                .map(|t| ReadyTaskSummary {
                    task_number: t.task_number,
                    title: &t.title,
                    spec_path: &t.spec_path,
                    validation: &t.validation,
                })
                .collect();
            let attempt = ready.iter().map(|t| t.agent_retries).max().unwrap_or(0) + 1;
            let prompt = task_prompt(&unit.title, &summaries, attempt);

            for task in tasks.iter() {
                if ready_numbers.contains(&task.task_number) {
                    self.emit(
                        dispatcher,
                        run_id,
                        Some(&unit.id),
                        &EventPayload::TaskStarted(loop_core::events::TaskStartedPayload {
                            unit_id: unit.id.clone(),
                            task_id: task.id.clone(),
                            task_number: task.task_number,
                            attempt,
                            timestamp: chrono::Utc::now(),
                        }),
                    )
                    .await;
                }
            }

            let outcome = agent.run_step(worktree, &log_dir.join("task"), round, &prompt, cancel).await;
            round += 1;
            // A timed-out agent process is a transient subprocess failure, not
            // grounds to fail the unit outright: treat it like the agent made
            // no progress and fall through to the retry-with-backoff path
            // below, still re-reading headers in case partial work landed
            // before the process was killed.
            let step = match outcome {
                Ok(step) => Some(step),
                Err(AgentError::Cancelled) => return Ok(PhaseOutcome::Cancelled),
                Err(AgentError::Timeout(secs)) => {
                    warn!(unit = %unit.unit_key, timeout_sec = secs, "agent step timed out; treating as no progress");
                    None
                }
                Err(err) => return Err(err.into()),
            };

            let mut advanced_numbers = Vec::new();
            for number in &ready_numbers {
                let task = tasks.iter().find(|t| t.task_number == *number).expect("ready task exists");
                let header = spec_header::load_task(&self.in_worktree(&task.spec_path, worktree))?;
                if header.header.status == TaskStatus::Complete {
                    advanced_numbers.push(*number);
                }
            }

            if advanced_numbers.is_empty() {
                let mut exhausted = true;
                for number in &ready_numbers {
                    let task = tasks.iter_mut().find(|t| t.task_number == *number).expect("ready task exists");
                    task.agent_retries += 1;
                    task.updated_at = chrono::Utc::now();
                    self.storage.update_task(task).await?;
                    if task.agent_retries < self.max_agent_retries {
                        exhausted = false;
                    }
                }
                if exhausted {
                    self.fail_unit(dispatcher, run_id, unit, "agent retries exhausted without progress").await?;
                    return Ok(PhaseOutcome::Failed);
                }
                continue;
            }

            for number in advanced_numbers {
                let (passed, output) = {
                    let task = tasks.iter().find(|t| t.task_number == number).expect("advanced task exists");
                    self.run_validation(worktree, &task.validation, self.task_validation_timeout).await
                };

                let task = tasks.iter_mut().find(|t| t.task_number == number).expect("advanced task exists");
                let task_path = self.in_worktree(&task.spec_path, worktree);

                if passed {
                    git::stage_all(worktree)?;
                    git::commit(worktree, &format!("{}({}): task #{} {}", self.branch_prefix, unit.unit_key, task.task_number, task.title))?;
                    task.status = TaskStatus::Complete;
                    task.error = None;
                    task.updated_at = chrono::Utc::now();
                    self.storage.update_task(task).await?;

                    self.emit(
                        dispatcher,
                        run_id,
                        Some(&unit.id),
                        &EventPayload::TaskFinished(loop_core::events::TaskFinishedPayload {
                            unit_id: unit.id.clone(),
                            task_id: task.id.clone(),
                            task_number: task.task_number,
                            exit_code: step.as_ref().map(|s| s.exit_code),
                            duration_ms: step.as_ref().map_or(0, |s| s.duration_ms),
                            timestamp: chrono::Utc::now(),
                        }),
                    )
                    .await;
                } else {
                    let mut header = spec_header::load_task(&task_path)?;
                    header.header.status = TaskStatus::InProgress;
                    header.header.error = Some(tail_lines(&output, 200));
                    spec_header::write_task(&task_path, &header)?;

                    task.status = TaskStatus::InProgress;
                    task.error = Some(tail_lines(&output, 200));
                    task.agent_retries += 1;
                    task.updated_at = chrono::Utc::now();
                    self.storage.update_task(task).await?;

                    self.emit(
                        dispatcher,
                        run_id,
                        Some(&unit.id),
                        &EventPayload::TaskFinished(loop_core::events::TaskFinishedPayload {
                            unit_id: unit.id.clone(),
                            task_id: task.id.clone(),
                            task_number: task.task_number,
                            exit_code: Some(1),
                            duration_ms: step.as_ref().map_or(0, |s| s.duration_ms),
                            timestamp: chrono::Utc::now(),
                        }),
                    )
                    .await;

                    if task.agent_retries >= self.max_agent_retries {
                        self.fail_unit(dispatcher, run_id, unit, "validation kept failing after agent retries").await?;
                        return Ok(PhaseOutcome::Failed);
                    }
                }
            }
        }
    }

    /// Phase C. Run the configured baseline checks, delegating fixes to the
    /// agent on failure up to a retry cap.
    async fn run_baseline(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        unit: &mut Unit,
        worktree: &Path,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PhaseOutcome> {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Ok(PhaseOutcome::Cancelled);
            }

            self.emit(
                dispatcher,
                run_id,
                Some(&unit.id),
                &EventPayload::BaselineStarted(loop_core::events::BaselineStartedPayload {
                    unit_id: unit.id.clone(),
                    attempt,
                    timestamp: chrono::Utc::now(),
                }),
            )
            .await;

            let started = std::time::Instant::now();
            let mut failing_command = None;
            let mut failure_output = String::new();

            for command in &self.baseline_checks {
                let (passed, output) = self.run_validation(worktree, command, self.baseline_timeout).await;
                if !passed {
                    failing_command = Some(command.clone());
                    failure_output = output;
                    break;
                }
            }

            let duration_ms = started.elapsed().as_millis() as u64;
            let passed = failing_command.is_none();
            self.emit(
                dispatcher,
                run_id,
                Some(&unit.id),
                &EventPayload::BaselineFinished(loop_core::events::BaselineFinishedPayload {
                    unit_id: unit.id.clone(),
                    passed,
                    duration_ms,
                    timestamp: chrono::Utc::now(),
                }),
            )
            .await;

            let Some(failing_command) = failing_command else {
                return Ok(PhaseOutcome::Continue);
            };

            if attempt >= self.max_baseline_retries {
                self.fail_unit(dispatcher, run_id, unit, &format!("baseline check failing: {failing_command}")).await?;
                return Ok(PhaseOutcome::Failed);
            }

            let prompt = baseline_fix_prompt(&failing_command, &tail_lines(&failure_output, 200));
            match agent.run_step(worktree, &log_dir.join("baseline"), attempt, &prompt, cancel).await {
                Ok(_) => {}
                Err(AgentError::Cancelled) => return Ok(PhaseOutcome::Cancelled),
                Err(AgentError::Timeout(secs)) => {
                    warn!(unit = %unit.unit_key, timeout_sec = secs, "baseline-fix agent step timed out; retrying within the baseline retry cap");
                }
                Err(err) => return Err(err.into()),
            }

            if !git::is_working_tree_clean(worktree)? {
                git::stage_all(worktree)?;
                git::commit(worktree, &format!("{}({}): fix baseline", self.branch_prefix, unit.unit_key))?;
            }

            attempt += 1;
        }
    }

    /// Phase D. Push the branch, delegate PR creation to the agent, and hand
    /// the unit to the merge serializer. Returns `Ok(true)` if the worktree
    /// should be torn down (a terminal outcome was reached in this call).
    async fn run_pr_phase(
        &self,
        dispatcher: &Dispatcher,
        agent: &Agent,
        run_id: &Id,
        unit: &mut Unit,
        tasks: &[Task],
        worktree: &Path,
        branch: &str,
        log_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Ok(false);
        }

        if self.no_pr {
            git::merge_to_target(&self.workspace_root, branch, &self.target_branch, &self.target_branch, self.merge_strategy)?;
            self.transition(dispatcher, run_id, unit, UnitStatus::Merged).await?;
            return Ok(true);
        }

        git::push(worktree, "origin", branch)?;

        let completed_titles: Vec<&str> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| t.title.as_str())
            .collect();
        let prompt = pr_creation_prompt(&unit.title, branch, &self.target_branch, &completed_titles);
        agent.run_step(worktree, &log_dir.join("pr"), 0, &prompt, cancel).await?;

        let (number, url) = pr_host::pr_number_for_branch(&self.workspace_root, branch).await?;

        let pr = PullRequest {
            id: Id::new(),
            unit_id: unit.id.clone(),
            number,
            url: url.clone(),
            source_branch: branch.to_string(),
            target_branch: self.target_branch.clone(),
            review_state: ReviewState::Pending,
            merge_strategy: self.merge_strategy,
            merged: false,
            merge_commit: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        self.storage.insert_pull_request(&pr).await?;

        self.transition(dispatcher, run_id, unit, UnitStatus::PrOpen).await?;
        self.emit(
            dispatcher,
            run_id,
            Some(&unit.id),
            &EventPayload::PrOpened(loop_core::events::PrOpenedPayload {
                unit_id: unit.id.clone(),
                pr_number: number,
                url,
                timestamp: chrono::Utc::now(),
            }),
        )
        .await;

        self.transition(dispatcher, run_id, unit, UnitStatus::InReview).await?;

        let (final_unit, _final_pr, outcome) = self
            .merge_serializer
            .process(dispatcher, agent, run_id, unit.clone(), pr, worktree, log_dir, cancel)
            .await?;
        *unit = final_unit;

        match outcome {
            MergeOutcome::Merged => {
                self.emit(
                    dispatcher,
                    run_id,
                    Some(&unit.id),
                    &EventPayload::UnitStatusChanged(loop_core::events::UnitStatusChangedPayload {
                        unit_id: unit.id.clone(),
                        unit_key: unit.unit_key.clone(),
                        from: UnitStatus::Merging,
                        to: UnitStatus::Merged,
                        timestamp: chrono::Utc::now(),
                    }),
                )
                .await;
                Ok(true)
            }
            MergeOutcome::Failed => Ok(true),
            MergeOutcome::ReviewTimedOut | MergeOutcome::Cancelled => Ok(false),
        }
    }

    /// Remove the worktree and its branch. Called on every terminal exit
    /// path (merged, failed) but deliberately skipped on cooperative
    /// cancellation and on review timeout, so a daemon restart's resume can
    /// re-enter the worktree untouched.
    fn teardown(&self, worktree: &Path, branch: &str) {
        if let Err(err) = git::remove_worktree_force(&self.workspace_root, worktree) {
            warn!(worktree = %worktree.display(), error = %err, "failed to remove worktree during teardown");
            return;
        }
        if let Err(err) = git::delete_branch(&self.workspace_root, branch) {
            warn!(branch, error = %err, "failed to delete branch during teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_serializer::MergeSerializer;
    use loop_core::types::MergeStrategy;

    #[test]
    fn tail_lines_passes_through_short_input() {
        assert_eq!(tail_lines("a\nb\nc", 10), "a\nb\nc");
    }

    #[test]
    fn tail_lines_keeps_only_the_last_n_lines() {
        let input = (1..=5).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail_lines(&input, 2), "4\n5");
    }

    async fn test_worker() -> (tempfile::TempDir, Worker) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let merge_serializer = Arc::new(MergeSerializer::new(
            Arc::clone(&storage),
            vec![],
            dir.path().to_path_buf(),
            &Config::default(),
        ));
        let worker = Worker::new(storage, merge_serializer, dir.path().to_path_buf(), &Config::default());
        (dir, worker)
    }

    #[tokio::test]
    async fn in_worktree_maps_paths_under_the_workspace_root() {
        let (dir, worker) = test_worker().await;
        let absolute = dir.path().join("specs/unit-a.md");
        let worktree = Path::new("/tmp/worktrees/unit-a");
        let mapped = worker.in_worktree(&absolute.display().to_string(), worktree);
        assert_eq!(mapped, worktree.join("specs/unit-a.md"));
    }

    #[tokio::test]
    async fn in_worktree_passes_through_paths_outside_the_workspace_root() {
        let (_dir, worker) = test_worker().await;
        let worktree = Path::new("/tmp/worktrees/unit-a");
        let mapped = worker.in_worktree("/elsewhere/unit-a.md", worktree);
        assert_eq!(mapped, PathBuf::from("/elsewhere/unit-a.md"));
    }

    #[tokio::test]
    async fn setup_reuses_an_existing_worktree_instead_of_recreating_it() {
        let (dir, worker) = test_worker().await;
        let mut unit = Unit {
            id: loop_core::Id::new(),
            run_id: loop_core::Id::new(),
            unit_key: "a".to_string(),
            title: "A".to_string(),
            status: UnitStatus::InProgress,
            level: 0,
            depends_on: vec![],
            spec_path: "a.md".to_string(),
            worktree_path: Some(dir.path().display().to_string()),
            branch: Some("unit/a-resumed".to_string()),
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };

        let (worktree, branch) = worker.setup(&mut unit).await.unwrap();
        assert_eq!(worktree, dir.path());
        assert_eq!(branch, "unit/a-resumed");
    }

    #[tokio::test]
    async fn worker_reads_merge_strategy_from_config() {
        let (dir, _worker) = test_worker().await;
        let mut config = Config::default();
        config.merge_strategy = MergeStrategy::Rebase;
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let merge_serializer = Arc::new(MergeSerializer::new(Arc::clone(&storage), vec![], dir.path().to_path_buf(), &config));
        let worker = Worker::new(storage, merge_serializer, dir.path().to_path_buf(), &config);
        assert_eq!(worker.merge_strategy, MergeStrategy::Rebase);
    }
}
