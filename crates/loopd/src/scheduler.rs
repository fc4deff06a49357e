//! Scheduler and dependency engine (spec Section 4.1).
//!
//! Discovery builds the unit DAG once at run start; from then on the
//! scheduler is a thin, storage-backed claim/report protocol. `next()` never
//! blocks: it returns `None` immediately if no unit is currently eligible,
//! whether because none are ready or because the concurrency cap is
//! exhausted. Eligibility favors the lowest dependency-depth level first,
//! then first-come-first-served (discovery order) within a level.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use loop_core::types::{Id, Unit, UnitStatus};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::git;
use crate::storage::{Storage, StorageError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Non-blocking claim/report protocol over a single run's unit DAG.
pub struct Scheduler {
    storage: Arc<Storage>,
    run_id: Id,
    workspace_root: PathBuf,
    semaphore: Arc<Semaphore>,
    fail_fast: bool,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        run_id: Id,
        workspace_root: PathBuf,
        max_concurrency: usize,
        fail_fast: bool,
    ) -> Self {
        Self {
            storage,
            run_id,
            workspace_root,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            fail_fast,
        }
    }

    /// Recompute `ready`/`blocked` status for every pending unit, then try to
    /// claim the single best eligible unit. Returns `Ok(None)` without
    /// blocking if nothing can be claimed right now.
    pub async fn next(&self) -> Result<Option<Unit>> {
        let units = self.storage.list_units(&self.run_id).await?;
        if self.fail_fast && units.iter().any(|u| u.status == UnitStatus::Failed) {
            return Ok(None);
        }

        self.sync_dependent_statuses(&units).await?;

        // Re-read: the sync pass above may have flipped some units to
        // blocked/ready in storage.
        let units = self.storage.list_units(&self.run_id).await?;
        let by_key: HashMap<&str, &Unit> =
            units.iter().map(|u| (u.unit_key.as_str(), u)).collect();

        let mut eligible: Vec<&Unit> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Ready)
            .filter(|u| {
                u.depends_on
                    .iter()
                    .all(|dep| by_key.get(dep.as_str()).is_some_and(|d| d.status == UnitStatus::Merged))
            })
            .collect();
        eligible.sort_by(|a, b| a.level.cmp(&b.level).then(a.created_at.cmp(&b.created_at)));

        let Some(unit) = eligible.into_iter().next() else {
            return Ok(None);
        };

        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => return Ok(None),
        };

        let mut claimed = unit.clone();
        claimed.status = UnitStatus::InProgress;
        claimed.updated_at = chrono::Utc::now();
        self.storage.update_unit(&claimed).await?;

        // The permit is held until report() releases it for this unit.
        std::mem::forget(permit);

        Ok(Some(claimed))
    }

    /// Release the concurrency slot claimed by `next()` and persist the
    /// unit's terminal (or resumed-intermediate) status.
    pub async fn report(&self, unit: &Unit) -> Result<()> {
        self.storage.update_unit(unit).await?;
        if unit.status.is_terminal() {
            self.semaphore.add_permits(1);
        }
        Ok(())
    }

    /// Mark every pending unit whose dependencies are all merged as `ready`,
    /// and every pending/ready unit with a transitively failed dependency as
    /// `blocked`. Blocked propagation is transitive: a unit blocked by a
    /// failed grandparent is blocked even if its immediate parent merged.
    async fn sync_dependent_statuses(&self, units: &[Unit]) -> Result<()> {
        let by_key: HashMap<String, Unit> =
            units.iter().map(|u| (u.unit_key.clone(), u.clone())).collect();

        let mut failed_transitively: std::collections::HashSet<String> = units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .map(|u| u.unit_key.clone())
            .collect();

        // Fixed-point propagation: a unit depending on a failed/blocked unit
        // is itself blocked, which can in turn block further dependents.
        loop {
            let mut changed = false;
            for unit in units {
                if failed_transitively.contains(&unit.unit_key) {
                    continue;
                }
                if unit
                    .depends_on
                    .iter()
                    .any(|dep| failed_transitively.contains(dep))
                {
                    failed_transitively.insert(unit.unit_key.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for unit in units {
            if matches!(unit.status, UnitStatus::Merged | UnitStatus::Failed) {
                continue;
            }

            let should_block =
                failed_transitively.contains(&unit.unit_key) && unit.status != UnitStatus::Failed;
            if should_block {
                if unit.status != UnitStatus::Blocked {
                    let mut blocked = unit.clone();
                    blocked.status = UnitStatus::Blocked;
                    blocked.updated_at = chrono::Utc::now();
                    self.storage.update_unit(&blocked).await?;
                }
                continue;
            }

            if unit.status == UnitStatus::Pending {
                let deps_merged = unit
                    .depends_on
                    .iter()
                    .all(|dep| by_key.get(dep).is_some_and(|d| d.status == UnitStatus::Merged));
                if deps_merged {
                    let mut ready = unit.clone();
                    ready.status = UnitStatus::Ready;
                    ready.updated_at = chrono::Utc::now();
                    self.storage.update_unit(&ready).await?;
                }
            } else if unit.status == UnitStatus::Blocked {
                // A previously blocked unit becomes pending again only if its
                // blocking ancestor is no longer failed (shouldn't normally
                // happen since failures are terminal, but keeps this pass
                // idempotent under concurrent updates).
                let deps_merged = unit
                    .depends_on
                    .iter()
                    .all(|dep| by_key.get(dep).is_some_and(|d| d.status == UnitStatus::Merged));
                if deps_merged {
                    let mut ready = unit.clone();
                    ready.status = UnitStatus::Ready;
                    ready.updated_at = chrono::Utc::now();
                    self.storage.update_unit(&ready).await?;
                }
            }
        }

        Ok(())
    }

    /// Validate in-flight units at daemon startup (spec Section 4.1 Resume).
    /// Units whose worktree is gone, or whose worktree exists without the
    /// expected branch checked out, are failed outright. Everything else is
    /// returned so the caller can re-attach a worker to continue it, holding
    /// a concurrency permit the same way `next()` would have for a freshly
    /// claimed unit - otherwise `report()`'s matching `add_permits(1)` once
    /// the resumed unit finishes would mint a permit out of thin air and
    /// the run would end up running above `max_concurrency`.
    pub async fn resume(&self) -> Result<Vec<Unit>> {
        let units = self.storage.list_units(&self.run_id).await?;
        let mut resumable = Vec::new();

        for unit in units {
            if !matches!(
                unit.status,
                UnitStatus::InProgress
                    | UnitStatus::PrOpen
                    | UnitStatus::InReview
                    | UnitStatus::Merging
            ) {
                continue;
            }

            match self.validate_worktree(&unit) {
                ResumeCheck::Ok => {
                    let permit = Arc::clone(&self.semaphore)
                        .acquire_owned()
                        .await
                        .expect("semaphore is never closed");
                    std::mem::forget(permit);
                    resumable.push(unit)
                }
                ResumeCheck::WorktreeLost => {
                    let mut failed = unit;
                    failed.status = UnitStatus::Failed;
                    failed.error = Some("worktree lost".to_string());
                    failed.updated_at = chrono::Utc::now();
                    self.storage.update_unit(&failed).await?;
                }
                ResumeCheck::BranchMissing => {
                    let mut failed = unit;
                    failed.status = UnitStatus::Failed;
                    failed.error =
                        Some("worktree exists but expected branch is missing".to_string());
                    failed.updated_at = chrono::Utc::now();
                    self.storage.update_unit(&failed).await?;
                }
            }
        }

        Ok(resumable)
    }

    fn validate_worktree(&self, unit: &Unit) -> ResumeCheck {
        let Some(worktree_path) = unit.worktree_path.as_deref() else {
            return ResumeCheck::WorktreeLost;
        };
        let Some(branch) = unit.branch.as_deref() else {
            return ResumeCheck::WorktreeLost;
        };

        if !Path::new(worktree_path).exists() {
            return ResumeCheck::WorktreeLost;
        }

        let worktrees = match git::list_worktrees(&self.workspace_root) {
            Ok(w) => w,
            Err(_) => return ResumeCheck::WorktreeLost,
        };

        let found = worktrees.iter().find(|w| Path::new(&w.path) == Path::new(worktree_path));
        match found {
            None => ResumeCheck::WorktreeLost,
            Some(info) if info.branch.as_deref() != Some(branch) => ResumeCheck::BranchMissing,
            Some(_) => ResumeCheck::Ok,
        }
    }

    /// Current number of free concurrency slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

enum ResumeCheck {
    Ok,
    WorktreeLost,
    BranchMissing,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn unit(run_id: &Id, key: &str, level: i64, depends_on: Vec<&str>, status: UnitStatus) -> Unit {
        let now = Utc::now();
        Unit {
            id: Id::new(),
            run_id: run_id.clone(),
            unit_key: key.to_string(),
            title: key.to_string(),
            status,
            level,
            depends_on: depends_on.into_iter().map(str::to_string).collect(),
            spec_path: format!("{key}.md"),
            worktree_path: None,
            branch: None,
            agent_retries: 0,
            baseline_retries: 0,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn setup() -> (tempfile::TempDir, Arc<Storage>, Id) {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(Storage::connect_in_memory().await.unwrap());
        let run_id = Id::new();
        (dir, storage, run_id)
    }

    #[tokio::test]
    async fn claims_root_unit_first() {
        let (dir, storage, run_id) = setup().await;
        let a = unit(&run_id, "a", 0, vec![], UnitStatus::Ready);
        let b = unit(&run_id, "b", 1, vec!["a"], UnitStatus::Pending);
        storage.insert_units(&[a.clone(), b]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id, dir.path().to_path_buf(), 2, false);
        let claimed = scheduler.next().await.unwrap().unwrap();
        assert_eq!(claimed.unit_key, "a");
        assert_eq!(claimed.status, UnitStatus::InProgress);
    }

    #[tokio::test]
    async fn dependent_becomes_ready_after_merge() {
        let (dir, storage, run_id) = setup().await;
        let mut a = unit(&run_id, "a", 0, vec![], UnitStatus::Merged);
        a.status = UnitStatus::Merged;
        let b = unit(&run_id, "b", 1, vec!["a"], UnitStatus::Pending);
        storage.insert_units(&[a, b]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id, dir.path().to_path_buf(), 2, false);
        let claimed = scheduler.next().await.unwrap().unwrap();
        assert_eq!(claimed.unit_key, "b");
    }

    #[tokio::test]
    async fn blocks_transitively_on_failed_dependency() {
        let (dir, storage, run_id) = setup().await;
        let a = unit(&run_id, "a", 0, vec![], UnitStatus::Failed);
        let b = unit(&run_id, "b", 1, vec!["a"], UnitStatus::Pending);
        let c = unit(&run_id, "c", 2, vec!["b"], UnitStatus::Pending);
        storage.insert_units(&[a, b, c]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id.clone(), dir.path().to_path_buf(), 2, false);
        let claimed = scheduler.next().await.unwrap();
        assert!(claimed.is_none());

        let units = storage.list_units(&run_id).await.unwrap();
        let b = units.iter().find(|u| u.unit_key == "b").unwrap();
        let c = units.iter().find(|u| u.unit_key == "c").unwrap();
        assert_eq!(b.status, UnitStatus::Blocked);
        assert_eq!(c.status, UnitStatus::Blocked);
    }

    #[tokio::test]
    async fn respects_concurrency_cap() {
        let (dir, storage, run_id) = setup().await;
        let a = unit(&run_id, "a", 0, vec![], UnitStatus::Ready);
        let b = unit(&run_id, "b", 0, vec![], UnitStatus::Ready);
        storage.insert_units(&[a, b]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id, dir.path().to_path_buf(), 1, false);
        assert!(scheduler.next().await.unwrap().is_some());
        assert!(scheduler.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn report_releases_capacity() {
        let (dir, storage, run_id) = setup().await;
        let a = unit(&run_id, "a", 0, vec![], UnitStatus::Ready);
        storage.insert_units(&[a]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id, dir.path().to_path_buf(), 1, false);
        let mut claimed = scheduler.next().await.unwrap().unwrap();
        assert_eq!(scheduler.available_permits(), 0);

        claimed.status = UnitStatus::Merged;
        scheduler.report(&claimed).await.unwrap();
        assert_eq!(scheduler.available_permits(), 1);
    }

    #[tokio::test]
    async fn resume_fails_unit_with_missing_worktree() {
        let (dir, storage, run_id) = setup().await;
        let mut a = unit(&run_id, "a", 0, vec![], UnitStatus::InProgress);
        a.worktree_path = Some(dir.path().join("missing").display().to_string());
        a.branch = Some("unit/a".to_string());
        storage.insert_units(&[a]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id.clone(), dir.path().to_path_buf(), 2, false);
        let resumable = scheduler.resume().await.unwrap();
        assert!(resumable.is_empty());

        let units = storage.list_units(&run_id).await.unwrap();
        assert_eq!(units[0].status, UnitStatus::Failed);
        assert_eq!(units[0].error.as_deref(), Some("worktree lost"));
    }

    #[tokio::test]
    async fn resume_reserves_a_concurrency_permit_for_each_resumed_unit() {
        let (dir, storage, run_id) = setup().await;
        let root = dir.path();

        let run_git = |args: &[&str]| {
            let output = std::process::Command::new("git").args(args).current_dir(root).output().unwrap();
            assert!(output.status.success());
        };
        run_git(&["init"]);
        run_git(&["config", "user.email", "test@test.com"]);
        run_git(&["config", "user.name", "Test"]);
        std::fs::write(root.join("README.md"), "hi").unwrap();
        run_git(&["add", "-A"]);
        run_git(&["commit", "-m", "init"]);
        run_git(&["branch", "-M", "main"]);

        let worktree_path = root.join("wt-a");
        git::create_worktree(root, &worktree_path, "unit/a", "main").unwrap();

        let mut a = unit(&run_id, "a", 0, vec![], UnitStatus::InProgress);
        a.worktree_path = Some(worktree_path.display().to_string());
        a.branch = Some("unit/a".to_string());
        storage.insert_units(&[a]).await.unwrap();

        let scheduler = Scheduler::new(Arc::clone(&storage), run_id, root.to_path_buf(), 1, false);
        assert_eq!(scheduler.available_permits(), 1);

        let resumable = scheduler.resume().await.unwrap();
        assert_eq!(resumable.len(), 1);
        // The resumed unit holds the run's only concurrency slot, just as it
        // would if `next()` had claimed it.
        assert_eq!(scheduler.available_permits(), 0);
    }
}
