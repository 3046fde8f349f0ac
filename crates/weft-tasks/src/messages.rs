//! Transport message envelope and payload types.
//!
//! Every message is tenant-scoped and carries a batch of payloads of one
//! kind. Inbound kinds are parsed into [`MessageKind`]; an unrecognized kind
//! is a hard error. Outbound payloads implement [`Payload`] so the envelope
//! kind can never disagree with the payload type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::{MessageId, RunExternalId, TaskExternalId, TenantId};

use crate::error::{Error, Result};
use crate::events::{EventRecord, InternalTaskEvent};
use crate::task::{CancelReason, TaskRef};

/// A payload type that travels inside a [`Message`].
pub trait Payload: Serialize + DeserializeOwned {
    /// The envelope kind for this payload.
    const KIND: &'static str;
}

/// Transport envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id.
    pub id: MessageId,
    /// Tenant the message is scoped to.
    pub tenant_id: TenantId,
    /// Payload kind.
    pub kind: String,
    /// Batched payloads.
    pub payloads: Vec<Value>,
    /// When the message was built.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds a message from typed payloads.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if a payload cannot be encoded.
    pub fn new<P: Payload>(tenant_id: TenantId, payloads: &[P]) -> Result<Self> {
        let payloads = payloads
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::serialization(format!("failed to encode {}: {e}", P::KIND)))?;

        Ok(Self {
            id: MessageId::generate(),
            tenant_id,
            kind: P::KIND.to_string(),
            payloads,
            created_at: Utc::now(),
        })
    }

    /// Builds a message from a single payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be encoded.
    pub fn single<P: Payload>(tenant_id: TenantId, payload: &P) -> Result<Self> {
        Self::new(tenant_id, std::slice::from_ref(payload))
    }

    /// Decodes every payload as `P`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the kind does not match or a payload
    /// does not decode.
    pub fn decode<P: Payload>(&self) -> Result<Vec<P>> {
        if self.kind != P::KIND {
            return Err(Error::serialization(format!(
                "expected {} payloads, message {} has kind {}",
                P::KIND,
                self.id,
                self.kind
            )));
        }

        self.payloads
            .iter()
            .map(|value| {
                P::deserialize(value).map_err(|e| {
                    Error::serialization(format!(
                        "failed to decode {} payload of message {}: {e}",
                        P::KIND,
                        self.id
                    ))
                })
            })
            .collect()
    }

    /// Parses the inbound kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMessageKind`] for kinds the controller does
    /// not handle.
    pub fn inbound_kind(&self) -> Result<MessageKind> {
        self.kind.parse()
    }
}

/// Message kinds the task controller consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A worker reported success.
    TaskCompleted,
    /// A worker reported failure.
    TaskFailed,
    /// Tasks were cancelled and need their state updated.
    TaskCancelled,
    /// A bulk cancellation request.
    CancelTasks,
    /// A bulk replay request.
    ReplayTasks,
    /// Ingested user events.
    UserEvent,
    /// Internal task events to resolve against conditions.
    InternalEvent,
    /// Name-based workflow triggers.
    TaskTrigger,
}

impl MessageKind {
    /// Every inbound kind.
    pub const ALL: [Self; 8] = [
        Self::TaskCompleted,
        Self::TaskFailed,
        Self::TaskCancelled,
        Self::CancelTasks,
        Self::ReplayTasks,
        Self::UserEvent,
        Self::InternalEvent,
        Self::TaskTrigger,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskCompleted => "task-completed",
            Self::TaskFailed => "task-failed",
            Self::TaskCancelled => "task-cancelled",
            Self::CancelTasks => "cancel-tasks",
            Self::ReplayTasks => "replay-tasks",
            Self::UserEvent => "user-event",
            Self::InternalEvent => "internal-event",
            Self::TaskTrigger => "task-trigger",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownMessageKind { kind: s.to_string() })
    }
}

// ============================================================================
// Inbound payloads
// ============================================================================

/// A worker finished a task attempt successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletedPayload {
    /// The attempt.
    pub task: TaskRef,
    /// Task output.
    #[serde(default)]
    pub output: Value,
}

impl Payload for TaskCompletedPayload {
    const KIND: &'static str = "task-completed";
}

/// A worker reported a failed task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailedPayload {
    /// The attempt.
    pub task: TaskRef,
    /// Failure reported by the worker.
    pub error_message: String,
    /// True when user code failed (counts against retries).
    #[serde(default = "default_true")]
    pub is_app_error: bool,
    /// True when user code asked not to be retried.
    #[serde(default)]
    pub should_not_retry: bool,
    /// Worker that ran the attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

const fn default_true() -> bool {
    true
}

impl Payload for TaskFailedPayload {
    const KIND: &'static str = "task-failed";
}

/// A task attempt must be moved to CANCELLED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelledPayload {
    /// The attempt.
    pub task: TaskRef,
    /// Why the attempt is cancelled.
    pub reason: CancelReason,
    /// Whether the owning worker should be told to stop.
    #[serde(default = "default_true")]
    pub should_notify_worker: bool,
}

impl Payload for TaskCancelledPayload {
    const KIND: &'static str = "task-cancelled";
}

/// Bulk cancellation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTasksPayload {
    /// Attempts to cancel.
    pub tasks: Vec<TaskRef>,
    /// Why they are cancelled.
    #[serde(default = "default_cancel_reason")]
    pub reason: CancelReason,
}

const fn default_cancel_reason() -> CancelReason {
    CancelReason::CancelledByUser
}

impl Payload for CancelTasksPayload {
    const KIND: &'static str = "cancel-tasks";
}

/// One task to replay, with the workflow run it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTask {
    /// The attempt to replay.
    pub task: TaskRef,
    /// Owning workflow run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<RunExternalId>,
}

/// Bulk replay request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayTasksPayload {
    /// Tasks to replay.
    pub tasks: Vec<ReplayTask>,
}

impl Payload for ReplayTasksPayload {
    const KIND: &'static str = "replay-tasks";
}

impl Payload for EventRecord {
    const KIND: &'static str = "user-event";
}

impl Payload for InternalTaskEvent {
    const KIND: &'static str = "internal-event";
}

/// Request to start a workflow by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNameTrigger {
    /// Workflow to start.
    pub workflow_name: String,
    /// External id the new run will take.
    pub external_id: RunExternalId,
    /// Run input.
    #[serde(default)]
    pub input: Value,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_metadata: Option<Value>,
    /// Deduplicates repeated triggers until the key expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Queue priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

impl WorkflowNameTrigger {
    /// Creates a trigger with a fresh run external id.
    #[must_use]
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            external_id: RunExternalId::generate(),
            input,
            additional_metadata: None,
            idempotency_key: None,
            priority: None,
        }
    }
}

impl Payload for WorkflowNameTrigger {
    const KIND: &'static str = "task-trigger";
}

// ============================================================================
// Outbound payloads
// ============================================================================

/// Why a scheduler partition is being woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeReason {
    /// New queued work exists.
    TasksCreated,
    /// Worker slots were released.
    SlotsReleased,
}

/// Wakes a scheduler partition to re-check a tenant's queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckTenantQueues {
    /// Why the scheduler is woken.
    pub reason: WakeReason,
    /// Queues with new or freed work.
    pub queue_names: Vec<String>,
    /// Number of tasks behind the wake-up.
    pub task_count: usize,
}

impl Payload for CheckTenantQueues {
    const KIND: &'static str = "check-tenant-queues";
}

/// Tells a dispatcher to stop a running attempt on one of its workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancellationSignal {
    /// The attempt.
    pub task: TaskRef,
    /// Worker running it.
    pub worker_id: String,
    /// Why it is cancelled.
    pub reason: CancelReason,
}

impl Payload for TaskCancellationSignal {
    const KIND: &'static str = "task-cancellation-signal";
}

/// Delivers a satisfied durable callback to the worker awaiting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DurableCallbackCompleted {
    /// Task awaiting the callback.
    pub task_external_id: TaskExternalId,
    /// Node within the durable execution.
    pub node_id: i64,
    /// Worker awaiting it.
    pub worker_id: String,
    /// Callback data.
    pub payload: Value,
}

impl Payload for DurableCallbackCompleted {
    const KIND: &'static str = "durable-callback-completed";
}

/// A run may have finished; the event consumer re-evaluates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishedRunCandidate {
    /// The released attempt.
    pub task: TaskRef,
    /// Owning workflow run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<RunExternalId>,
}

impl Payload for FinishedRunCandidate {
    const KIND: &'static str = "check-run-finished";
}
