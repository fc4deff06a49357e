//! Event taxonomy for the orchestrator's dispatcher.
//!
//! Event type names are dot-separated (`unit.started`, not `UNIT_STARTED`)
//! and every payload carries a `timestamp` field, per the resolved
//! wire-format questions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Id, ReviewState, UnitStatus};

/// Discriminant for every event the dispatcher can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.completed")]
    RunCompleted,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.resume_marker")]
    ResumeMarker,
    #[serde(rename = "graph.discovered")]
    GraphDiscovered,
    #[serde(rename = "unit.status_changed")]
    UnitStatusChanged,
    #[serde(rename = "unit.failed")]
    UnitFailed,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.finished")]
    TaskFinished,
    #[serde(rename = "baseline.started")]
    BaselineStarted,
    #[serde(rename = "baseline.finished")]
    BaselineFinished,
    #[serde(rename = "pr.opened")]
    PrOpened,
    #[serde(rename = "pr.review_updated")]
    PrReviewUpdated,
    #[serde(rename = "merge.queued")]
    MergeQueued,
    #[serde(rename = "merge.conflict")]
    MergeConflict,
    #[serde(rename = "merge.succeeded")]
    MergeSucceeded,
    #[serde(rename = "merge.failed")]
    MergeFailed,
    #[serde(rename = "escalation.raised")]
    EscalationRaised,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::ResumeMarker => "run.resume_marker",
            Self::GraphDiscovered => "graph.discovered",
            Self::UnitStatusChanged => "unit.status_changed",
            Self::UnitFailed => "unit.failed",
            Self::TaskStarted => "task.started",
            Self::TaskFinished => "task.finished",
            Self::BaselineStarted => "baseline.started",
            Self::BaselineFinished => "baseline.finished",
            Self::PrOpened => "pr.opened",
            Self::PrReviewUpdated => "pr.review_updated",
            Self::MergeQueued => "merge.queued",
            Self::MergeConflict => "merge.conflict",
            Self::MergeSucceeded => "merge.succeeded",
            Self::MergeFailed => "merge.failed",
            Self::EscalationRaised => "escalation.raised",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: Id,
    pub workspace_root: String,
    pub specs_dir: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompletedPayload {
    pub run_id: Id,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailedPayload {
    pub run_id: Id,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeMarkerPayload {
    pub run_id: Id,
    /// Last event sequence number observed before the daemon restarted.
    pub last_sequence: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDiscoveredPayload {
    pub run_id: Id,
    pub unit_count: usize,
    pub task_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStatusChangedPayload {
    pub unit_id: Id,
    pub unit_key: String,
    pub from: UnitStatus,
    pub to: UnitStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitFailedPayload {
    pub unit_id: Id,
    pub unit_key: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStartedPayload {
    pub unit_id: Id,
    pub task_id: Id,
    pub task_number: u32,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinishedPayload {
    pub unit_id: Id,
    pub task_id: Id,
    pub task_number: u32,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineStartedPayload {
    pub unit_id: Id,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineFinishedPayload {
    pub unit_id: Id,
    pub passed: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrOpenedPayload {
    pub unit_id: Id,
    pub pr_number: u64,
    pub url: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrReviewUpdatedPayload {
    pub unit_id: Id,
    pub pr_number: u64,
    pub review_state: ReviewState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeQueuedPayload {
    pub unit_id: Id,
    pub pr_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflictPayload {
    pub unit_id: Id,
    pub attempt: u32,
    pub unmerged_files: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSucceededPayload {
    pub unit_id: Id,
    pub pr_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeFailedPayload {
    pub unit_id: Id,
    pub pr_number: u64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRaisedPayload {
    pub unit_id: Option<Id>,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Union of every event payload. Untagged so each payload's native JSON
/// shape reaches the wire unwrapped; `event_type()` recovers the
/// discriminant for indexing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    RunCompleted(RunCompletedPayload),
    RunFailed(RunFailedPayload),
    ResumeMarker(ResumeMarkerPayload),
    GraphDiscovered(GraphDiscoveredPayload),
    UnitStatusChanged(UnitStatusChangedPayload),
    UnitFailed(UnitFailedPayload),
    TaskStarted(TaskStartedPayload),
    TaskFinished(TaskFinishedPayload),
    BaselineStarted(BaselineStartedPayload),
    BaselineFinished(BaselineFinishedPayload),
    PrOpened(PrOpenedPayload),
    PrReviewUpdated(PrReviewUpdatedPayload),
    MergeQueued(MergeQueuedPayload),
    MergeConflict(MergeConflictPayload),
    MergeSucceeded(MergeSucceededPayload),
    MergeFailed(MergeFailedPayload),
    EscalationRaised(EscalationRaisedPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::RunStarted(_) => EventType::RunStarted,
            Self::RunCompleted(_) => EventType::RunCompleted,
            Self::RunFailed(_) => EventType::RunFailed,
            Self::ResumeMarker(_) => EventType::ResumeMarker,
            Self::GraphDiscovered(_) => EventType::GraphDiscovered,
            Self::UnitStatusChanged(_) => EventType::UnitStatusChanged,
            Self::UnitFailed(_) => EventType::UnitFailed,
            Self::TaskStarted(_) => EventType::TaskStarted,
            Self::TaskFinished(_) => EventType::TaskFinished,
            Self::BaselineStarted(_) => EventType::BaselineStarted,
            Self::BaselineFinished(_) => EventType::BaselineFinished,
            Self::PrOpened(_) => EventType::PrOpened,
            Self::PrReviewUpdated(_) => EventType::PrReviewUpdated,
            Self::MergeQueued(_) => EventType::MergeQueued,
            Self::MergeConflict(_) => EventType::MergeConflict,
            Self::MergeSucceeded(_) => EventType::MergeSucceeded,
            Self::MergeFailed(_) => EventType::MergeFailed,
            Self::EscalationRaised(_) => EventType::EscalationRaised,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A dispatcher event as carried on the bus and persisted to storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Id,
    pub run_id: Id,
    pub unit_id: Option<Id>,
    pub sequence: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload_json: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_dot_separated() {
        assert_eq!(EventType::UnitStatusChanged.as_str(), "unit.status_changed");
        assert_eq!(EventType::MergeSucceeded.as_str(), "merge.succeeded");
    }

    #[test]
    fn event_type_serializes_to_dot_string() {
        assert_eq!(
            serde_json::to_string(&EventType::PrOpened).unwrap(),
            "\"pr.opened\""
        );
    }

    #[test]
    fn payload_event_type_matches_variant() {
        let payload = EventPayload::UnitFailed(UnitFailedPayload {
            unit_id: Id::from_string("u1"),
            unit_key: "unit-1".into(),
            reason: "boom".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(payload.event_type(), EventType::UnitFailed);
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = EventPayload::MergeConflict(MergeConflictPayload {
            unit_id: Id::from_string("u1"),
            attempt: 2,
            unmerged_files: vec!["src/lib.rs".into()],
            timestamp: Utc::now(),
        });
        let json = payload.to_json().unwrap();
        assert!(json.contains("\"attempt\":2"));
        assert!(json.contains("src/lib.rs"));
    }
}
