//! Match-pipeline records: internal task events, candidate matches and the
//! results the repository's match engine resolves them into.
//!
//! ## Flow
//!
//! ```text
//! state transition ─► InternalTaskEvent ─► match engine ─► EventMatchResults
//! user event ───────► CandidateEventMatch ─┘                 ├─ created tasks
//!                                                            ├─ replayed tasks
//!                                                            └─ satisfied callbacks
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::{EventExternalId, MessageId, RunExternalId, TaskExternalId, TenantId};

use crate::task::{Dag, Task, TaskRef};

/// Kind of state transition an internal event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalEventType {
    /// The attempt completed successfully.
    Completed,
    /// The attempt failed.
    Failed,
    /// The attempt was cancelled or skipped.
    Cancelled,
}

impl InternalEventType {
    /// Event key the match engine indexes conditions on.
    #[must_use]
    pub const fn event_key(self) -> &'static str {
        match self {
            Self::Completed => "task.completed",
            Self::Failed => "task.failed",
            Self::Cancelled => "task.cancelled",
        }
    }
}

impl fmt::Display for InternalEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_key())
    }
}

/// A task state transition forwarded to the match engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalTaskEvent {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Task id.
    pub task_id: i64,
    /// Attempt the event belongs to.
    pub retry_count: i32,
    /// Stable task external id.
    pub task_external_id: TaskExternalId,
    /// Transition kind.
    pub event_type: InternalEventType,
    /// Optional user-facing key (e.g. the output key of a durable event).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_key: Option<String>,
    /// Serialized terminal payload.
    pub data: Value,
    /// When the transition happened.
    pub event_timestamp: DateTime<Utc>,
}

impl InternalTaskEvent {
    /// Creates an internal event for `task` with the given payload.
    #[must_use]
    pub fn for_task(
        tenant_id: TenantId,
        task: &TaskRef,
        event_type: InternalEventType,
        data: Value,
    ) -> Self {
        Self {
            tenant_id,
            task_id: task.id,
            retry_count: task.retry_count,
            task_external_id: task.external_id,
            event_type,
            event_key: None,
            data,
            event_timestamp: Utc::now(),
        }
    }

    /// Converts the event into a candidate match for the match engine.
    #[must_use]
    pub fn to_candidate(&self) -> CandidateEventMatch {
        CandidateEventMatch {
            id: MessageId::generate(),
            event_timestamp: self.event_timestamp,
            key: self.event_type.event_key().to_string(),
            data: self.data.clone(),
            resource_hint: Some(self.task_external_id.to_string()),
        }
    }
}

/// Terminal output payload carried by internal events and monitoring events.
///
/// Each terminal state has its own shape: failures carry the error string,
/// cancellations and skips carry a marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminalOutput {
    /// Task finished successfully.
    Completed {
        /// Task output.
        output: Value,
    },
    /// Task failed.
    Failed {
        /// Error message.
        error_message: String,
    },
    /// Task was cancelled.
    Cancelled {
        /// Why it was cancelled.
        reason: String,
    },
    /// Task was skipped.
    Skipped {
        /// Marker, always true.
        skipped: bool,
    },
}

impl TerminalOutput {
    /// Serializes the payload into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A prospective condition submitted to the match engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateEventMatch {
    /// Candidate id, for idempotent resolution.
    pub id: MessageId,
    /// When the underlying event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Key conditions are registered on.
    pub key: String,
    /// Event data.
    pub data: Value,
    /// Narrows matching to one resource (e.g. a task external id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_hint: Option<String>,
}

/// A durable callback that became deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SatisfiedCallback {
    /// Task awaiting the callback.
    pub task_external_id: TaskExternalId,
    /// Node within the task's durable execution.
    pub node_id: i64,
    /// Worker running the task.
    pub worker_id: String,
    /// Data that satisfied the callback.
    pub data: Value,
}

/// What the match engine resolved a batch of candidates into.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMatchResults {
    /// Tasks created because their trigger condition fired.
    pub created_tasks: Vec<Task>,
    /// Existing tasks replayed because a condition fired again.
    pub replayed_tasks: Vec<Task>,
    /// Durable callbacks that can now be delivered.
    pub satisfied_callbacks: Vec<SatisfiedCallback>,
}

impl EventMatchResults {
    /// Returns true when nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created_tasks.is_empty()
            && self.replayed_tasks.is_empty()
            && self.satisfied_callbacks.is_empty()
    }

    /// Appends another result set.
    pub fn extend(&mut self, other: Self) {
        self.created_tasks.extend(other.created_tasks);
        self.replayed_tasks.extend(other.replayed_tasks);
        self.satisfied_callbacks.extend(other.satisfied_callbacks);
    }
}

/// An ingested user event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// External id assigned at ingestion.
    pub external_id: EventExternalId,
    /// Event key workflows subscribe to.
    pub key: String,
    /// Event payload.
    pub data: Value,
    /// Free-form metadata propagated to created runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_metadata: Option<Value>,
    /// Optional scope narrowing which filters apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// When the event was ingested.
    pub seen_at: DateTime<Utc>,
}

impl EventRecord {
    /// Creates an event record with a fresh external id.
    #[must_use]
    pub fn new(key: impl Into<String>, data: Value) -> Self {
        Self {
            external_id: EventExternalId::generate(),
            key: key.into(),
            data,
            additional_metadata: None,
            scope: None,
            seen_at: Utc::now(),
        }
    }

    /// Converts the event into a candidate match.
    #[must_use]
    pub fn to_candidate(&self) -> CandidateEventMatch {
        CandidateEventMatch {
            id: MessageId::generate(),
            event_timestamp: self.seen_at,
            key: self.key.clone(),
            data: self.data.clone(),
            resource_hint: None,
        }
    }
}

/// A workflow run produced by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRef {
    /// Run external id.
    pub external_id: RunExternalId,
    /// Run insertion time.
    pub inserted_at: DateTime<Utc>,
}

/// Where a CEL expression that failed to evaluate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CelSource {
    /// An event filter expression.
    EventFilter,
    /// A workflow trigger expression.
    WorkflowTrigger,
}

/// A CEL expression failure reported by the repository during triggering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CelEvaluationFailure {
    /// Expression origin.
    pub source: CelSource,
    /// Evaluation error.
    pub error_message: String,
}

/// Result of triggering runs from events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerFromEventsResult {
    /// Tasks created.
    pub tasks: Vec<Task>,
    /// DAGs created.
    pub dags: Vec<Dag>,
    /// Every event that was observed, whether or not it triggered anything.
    pub events: Vec<EventRecord>,
    /// Runs produced per event external id.
    pub event_runs: std::collections::HashMap<EventExternalId, Vec<RunRef>>,
    /// CEL failures hit while evaluating filters and triggers.
    pub cel_evaluation_failures: Vec<CelEvaluationFailure>,
}

/// Result of triggering runs by workflow name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerResult {
    /// Tasks created.
    pub tasks: Vec<Task>,
    /// DAGs created.
    pub dags: Vec<Dag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_output_shapes() {
        let failed = TerminalOutput::Failed {
            error_message: "boom".into(),
        }
        .to_value();
        assert_eq!(failed["kind"], "failed");
        assert_eq!(failed["error_message"], "boom");

        let skipped = TerminalOutput::Skipped { skipped: true }.to_value();
        assert_eq!(skipped["skipped"], true);
    }

    #[test]
    fn internal_event_candidate_uses_event_key_and_hint() {
        let task = TaskRef::new(1, Utc::now(), 0, TaskExternalId::generate());
        let event = InternalTaskEvent::for_task(
            TenantId::new_unchecked("acme"),
            &task,
            InternalEventType::Completed,
            serde_json::json!({"ok": true}),
        );
        let candidate = event.to_candidate();
        assert_eq!(candidate.key, "task.completed");
        assert_eq!(
            candidate.resource_hint.as_deref(),
            Some(task.external_id.to_string().as_str())
        );
    }

    #[test]
    fn match_results_extend() {
        let mut results = EventMatchResults::default();
        assert!(results.is_empty());
        results.extend(EventMatchResults {
            satisfied_callbacks: vec![SatisfiedCallback {
                task_external_id: TaskExternalId::generate(),
                node_id: 1,
                worker_id: "worker-1".into(),
                data: Value::Null,
            }],
            ..EventMatchResults::default()
        });
        assert!(!results.is_empty());
    }
}
