//! Core data model for the orchestrator daemon.
//!
//! Mirrors the Run / Unit / Task / `PullRequest` / Event / Graph entities and
//! their state machines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for runs, units, tasks, pull requests, and events.
/// Uses `UUIDv7` so values sort lexicographically by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Daemon run lifecycle status (one run per `loopd` job submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Unit lifecycle status. A unit is a single scheduled unit of work carrying
/// one or more tasks through to a merged pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    InProgress,
    Blocked,
    PrOpen,
    InReview,
    Merging,
    Merged,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::PrOpen => "pr_open",
            Self::InReview => "in_review",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }

    /// Terminal states no longer participate in scheduling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Merged | Self::Failed | Self::Blocked)
    }
}

/// Task lifecycle status, tracked in the task's own spec-file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Review state of an open pull request, derived from reactions and review
/// comments by the precedence rule: approved > in-progress > changes
/// requested > pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Pending,
    InProgress,
    ChangesRequested,
    Approved,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::ChangesRequested => "changes_requested",
            Self::Approved => "approved",
        }
    }

    /// Rank used to resolve conflicting signals on the same pull request;
    /// higher wins.
    fn precedence(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::ChangesRequested => 1,
            Self::InProgress => 2,
            Self::Approved => 3,
        }
    }

    /// Combine two simultaneously observed signals, keeping the
    /// higher-precedence one.
    pub fn merge(self, other: Self) -> Self {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

/// Merge strategy used when a unit's pull request is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    Squash,
    Merge,
    Rebase,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squash => "squash",
            Self::Merge => "merge",
            Self::Rebase => "rebase",
        }
    }
}

/// A single orchestrator run: one invocation against one target repository,
/// carrying a dependency graph of units through to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Id,
    pub status: RunStatus,
    /// Absolute path to the target repository's workspace root.
    pub workspace_root: String,
    /// Directory that was walked to discover unit/task spec files.
    pub specs_dir: String,
    /// Daemon version that created this run, for postmortem/debugging.
    pub daemon_version: String,
    /// Human-readable failure reason, set only when `status == Failed`.
    pub error: Option<String>,
    /// JSON-serialized config overrides applied to this run.
    pub config_json: Option<String>,
    /// Total units discovered for this run.
    pub total_units: i64,
    /// Units that reached `Merged`.
    pub completed_units: i64,
    /// Units that reached `Failed`.
    pub failed_units: i64,
    /// Units that reached `Blocked` (a transitive dependency failure).
    pub blocked_units: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single unit of work: one isolated worktree, one branch, one pull
/// request, zero or more ordered tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: Id,
    pub run_id: Id,
    /// Stable identifier from the unit's spec-file header, used for
    /// dependency references.
    pub unit_key: String,
    pub title: String,
    pub status: UnitStatus,
    /// Dependency-level in the unit DAG (0 for roots).
    pub level: i64,
    /// Unit keys this unit depends on.
    pub depends_on: Vec<String>,
    /// Absolute path to the unit's spec file.
    pub spec_path: String,
    /// Worktree directory once created.
    pub worktree_path: Option<String>,
    /// Branch created for this unit's work.
    pub branch: Option<String>,
    /// Number of coding-agent retries consumed so far in the task loop.
    pub agent_retries: u32,
    /// Number of baseline-check retries consumed so far.
    pub baseline_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single task within a unit, the smallest piece of work handed to the
/// coding agent in one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub unit_id: Id,
    /// 1-indexed position within the unit's task list.
    pub task_number: u32,
    pub title: String,
    /// Absolute path to this task's spec file.
    pub spec_path: String,
    /// Task numbers (within the same unit) that must be `complete` before
    /// this task is ready.
    pub depends_on: Vec<u32>,
    /// The backpressure command that must exit zero for this task to count
    /// as done.
    pub validation: String,
    pub status: TaskStatus,
    /// Number of agent-invocation retries consumed without advancing this
    /// task's status.
    pub agent_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A pull request opened for a unit's branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Id,
    pub unit_id: Id,
    /// Host-assigned pull request number.
    pub number: u64,
    pub url: String,
    pub source_branch: String,
    pub target_branch: String,
    pub review_state: ReviewState,
    pub merge_strategy: MergeStrategy,
    pub merged: bool,
    /// Set once the merge lands.
    pub merge_commit: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted snapshot of a run's unit dependency graph, recorded once at
/// discovery time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub run_id: Id,
    /// Unit keys present in the graph.
    pub nodes: Vec<String>,
    /// `(from, to)` edges meaning `from` depends on `to`.
    pub edges: Vec<(String, String)>,
    /// Unit key -> dependency level.
    pub levels: std::collections::HashMap<String, i64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generates_unique_values() {
        let id1 = Id::new();
        let id2 = Id::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn run_status_serializes_correctly() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Running).unwrap(),
            "\"running\""
        );
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
    }

    #[test]
    fn unit_status_terminal_states() {
        assert!(UnitStatus::Merged.is_terminal());
        assert!(UnitStatus::Failed.is_terminal());
        assert!(UnitStatus::Blocked.is_terminal());
        assert!(!UnitStatus::InReview.is_terminal());
    }

    #[test]
    fn unit_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&UnitStatus::PrOpen).unwrap(),
            "\"pr_open\""
        );
    }

    #[test]
    fn merge_strategy_default_is_squash() {
        assert_eq!(MergeStrategy::default(), MergeStrategy::Squash);
    }

    #[test]
    fn review_state_precedence_keeps_approved() {
        assert_eq!(
            ReviewState::Approved.merge(ReviewState::ChangesRequested),
            ReviewState::Approved
        );
        assert_eq!(
            ReviewState::ChangesRequested.merge(ReviewState::Approved),
            ReviewState::Approved
        );
    }

    #[test]
    fn review_state_precedence_favors_in_progress_over_changes_requested() {
        assert_eq!(
            ReviewState::ChangesRequested.merge(ReviewState::InProgress),
            ReviewState::InProgress
        );
    }

    #[test]
    fn review_state_precedence_keeps_higher_when_merging_lower() {
        assert_eq!(
            ReviewState::Approved.merge(ReviewState::Pending),
            ReviewState::Approved
        );
    }
}
