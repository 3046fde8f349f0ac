//! Monitoring records published to the analytics (OLAP) queue.
//!
//! These records are best-effort copies of authoritative state; losing one
//! never affects task execution.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::EventExternalId;

use crate::events::{CelEvaluationFailure, RunRef};
use crate::messages::Payload;
use crate::task::{Dag, Task, TaskRef};

/// Task lifecycle event shown in monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OlapEventType {
    /// Task is waiting for a worker slot.
    Queued,
    /// Task finished successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was cancelled.
    Cancelled,
    /// Task was skipped.
    Skipped,
    /// Task exceeded its execution timeout.
    TimedOut,
    /// Task was moved off an unresponsive worker.
    Reassigned,
    /// Task failed and will be retried.
    Retrying,
}

impl OlapEventType {
    /// Wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
            Self::TimedOut => "TIMED_OUT",
            Self::Reassigned => "REASSIGNED",
            Self::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for OlapEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One task lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OlapTaskEvent {
    /// The attempt.
    pub task: TaskRef,
    /// Event type.
    pub event_type: OlapEventType,
    /// When the event happened.
    pub event_timestamp: DateTime<Utc>,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Structured payload (terminal output, error text).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Worker involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl OlapTaskEvent {
    /// Creates an event with an empty message and payload.
    #[must_use]
    pub fn new(task: TaskRef, event_type: OlapEventType) -> Self {
        Self {
            task,
            event_type,
            event_timestamp: Utc::now(),
            message: String::new(),
            payload: Value::Null,
            worker_id: None,
        }
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the worker.
    #[must_use]
    pub fn with_worker(mut self, worker_id: Option<String>) -> Self {
        self.worker_id = worker_id;
        self
    }
}

/// Record of an ingested event and the run it produced, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSeen {
    /// Event external id.
    pub event_external_id: EventExternalId,
    /// Event key.
    pub key: String,
    /// When the event was ingested.
    pub seen_at: DateTime<Utc>,
    /// Run the event produced; `None` when it triggered nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRef>,
}

/// A monitoring record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OlapRecord {
    /// A task was created.
    TaskCreated {
        /// The created task.
        task: Box<Task>,
    },
    /// A task lifecycle event.
    TaskEvent(OlapTaskEvent),
    /// A DAG was created.
    DagCreated {
        /// The created DAG.
        dag: Dag,
    },
    /// An event was ingested.
    EventSeen(EventSeen),
    /// A CEL expression failed to evaluate.
    CelEvaluationFailure(CelEvaluationFailure),
}

impl OlapRecord {
    /// Short name of the record variant, used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task_created",
            Self::TaskEvent(_) => "task_event",
            Self::DagCreated { .. } => "dag_created",
            Self::EventSeen(_) => "event_seen",
            Self::CelEvaluationFailure(_) => "cel_evaluation_failure",
        }
    }
}

impl Payload for OlapRecord {
    const KIND: &'static str = "olap-record";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CelSource;
    use weft_core::TaskExternalId;

    #[test]
    fn event_type_wire_names() {
        let json = serde_json::to_string(&OlapEventType::TimedOut).unwrap();
        assert_eq!(json, "\"TIMED_OUT\"");
        assert_eq!(OlapEventType::Retrying.to_string(), "RETRYING");
    }

    #[test]
    fn task_event_builder() {
        let task = TaskRef::new(1, Utc::now(), 0, TaskExternalId::generate());
        let event = OlapTaskEvent::new(task, OlapEventType::Failed)
            .with_message("boom")
            .with_worker(Some("w1".into()));
        assert_eq!(event.message, "boom");
        assert_eq!(event.worker_id.as_deref(), Some("w1"));
        assert!(event.payload.is_null());
    }

    #[test]
    fn record_serializes_with_type_tag() {
        let record = OlapRecord::CelEvaluationFailure(CelEvaluationFailure {
            source: CelSource::EventFilter,
            error_message: "no such key".into(),
        });
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "cel_evaluation_failure");
        assert_eq!(record.name(), "cel_evaluation_failure");
    }
}
