//! Repository contract for task state.
//!
//! The [`TaskRepository`] trait is the controller's only view of persistent
//! state. Every call is tenant-scoped and transactional on the implementor's
//! side; the controller never assumes ordering between calls.
//!
//! Mutations return envelopes that distinguish three things the controller
//! acts on independently:
//!
//! - **released tasks**: attempts that gave back a worker slot
//! - **retried tasks**: failed attempts that were re-armed
//! - **internal events**: raw transitions for the match engine
//!
//! Scan-and-mutate calls used by the operation pools take a `limit` and
//! report `should_continue` when more work remains.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::{RunExternalId, TenantId};

use crate::error::Result;
use crate::events::{
    CandidateEventMatch, EventMatchResults, EventRecord, InternalTaskEvent,
    TriggerFromEventsResult, TriggerResult,
};
use crate::messages::WorkflowNameTrigger;
use crate::task::{CancelReason, RetryPolicy, Task, TaskRef};

/// A tenant as seen by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    /// Tenant id.
    pub id: TenantId,
    /// Scheduler partition that owns the tenant's queues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler_partition_id: Option<String>,
    /// Controller partition that owns the tenant's maintenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_partition_id: Option<String>,
}

impl Tenant {
    /// Creates a tenant without partition assignments.
    #[must_use]
    pub fn new(id: TenantId) -> Self {
        Self {
            id,
            scheduler_partition_id: None,
            controller_partition_id: None,
        }
    }

    /// Assigns a scheduler partition.
    #[must_use]
    pub fn with_scheduler_partition(mut self, partition: impl Into<String>) -> Self {
        self.scheduler_partition_id = Some(partition.into());
        self
    }
}

/// Input to [`TaskRepository::complete_tasks`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompleteTaskOpts {
    /// The attempt.
    pub task: TaskRef,
    /// Task output.
    pub output: Value,
}

/// Input to [`TaskRepository::fail_tasks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailTaskOpts {
    /// The attempt.
    pub task: TaskRef,
    /// Failure message.
    pub error_message: String,
    /// Whether user code failed (counts against retries).
    pub is_app_error: bool,
    /// Whether user code asked not to be retried.
    pub should_not_retry: bool,
}

/// Input to [`TaskRepository::cancel_tasks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelTaskOpts {
    /// The attempt.
    pub task: TaskRef,
    /// Why it is cancelled.
    pub reason: CancelReason,
}

/// An attempt that released its worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedTask {
    /// The attempt.
    pub task: TaskRef,
    /// Queue the attempt was scheduled on.
    pub queue: String,
    /// Worker that held the slot, if the attempt was running.
    pub worker_id: Option<String>,
    /// Owning workflow run, if any.
    pub workflow_run_id: Option<RunExternalId>,
}

/// A failed attempt that was re-armed for another try.
#[derive(Debug, Clone, PartialEq)]
pub struct RetriedTask {
    /// The failed attempt.
    pub task: TaskRef,
    /// Application retries consumed including this one.
    pub app_retry_count: i32,
    /// Backoff configuration of the task.
    pub retry_policy: RetryPolicy,
}

/// Released tasks plus internal events from a finalizing mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizedTaskResponse {
    /// Attempts that released a worker slot.
    pub released_tasks: Vec<ReleasedTask>,
    /// Raw transitions for the match engine.
    pub internal_events: Vec<InternalTaskEvent>,
}

/// Result of [`TaskRepository::fail_tasks`] and the timeout paths.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailTasksResponse {
    /// Released tasks and internal events.
    pub finalized: FinalizedTaskResponse,
    /// Failed attempts that will be retried.
    pub retried_tasks: Vec<RetriedTask>,
}

impl FailTasksResponse {
    /// Merges another response into this one.
    pub fn extend(&mut self, other: Self) {
        self.finalized
            .released_tasks
            .extend(other.finalized.released_tasks);
        self.finalized
            .internal_events
            .extend(other.finalized.internal_events);
        self.retried_tasks.extend(other.retried_tasks);
    }
}

/// An attempt that exceeded its execution timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOutTask {
    /// The attempt.
    pub task: TaskRef,
    /// Worker that was running it.
    pub worker_id: Option<String>,
    /// Configured timeout in seconds.
    pub timeout_secs: u64,
}

/// Result of [`TaskRepository::process_task_timeouts`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeoutResponse {
    /// Outcome of failing the timed-out attempts.
    pub fail: FailTasksResponse,
    /// Attempts that timed out.
    pub timed_out: Vec<TimedOutTask>,
    /// True when the scan hit its limit.
    pub should_continue: bool,
}

/// An attempt taken away from an unresponsive worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassignedTask {
    /// The attempt that lost its worker.
    pub task: TaskRef,
    /// The unresponsive worker.
    pub worker_id: String,
}

/// Result of [`TaskRepository::process_task_reassignments`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReassignResponse {
    /// Outcome of failing exhausted attempts and releasing slots.
    pub fail: FailTasksResponse,
    /// Attempts requeued for another worker.
    pub reassigned: Vec<ReassignedTask>,
    /// Attempts failed because their reassignment budget ran out.
    pub failed_exhausted: Vec<ReassignedTask>,
    /// True when the scan hit its limit.
    pub should_continue: bool,
}

/// A retry whose backoff elapsed and that was requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryQueueItem {
    /// The new attempt.
    pub task: TaskRef,
    /// Queue it was put back on.
    pub queue: String,
}

/// Result of [`TaskRepository::process_task_retry_queue_items`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryQueueResponse {
    /// Requeued attempts.
    pub items: Vec<RetryQueueItem>,
    /// True when the scan hit its limit.
    pub should_continue: bool,
}

/// Result of [`TaskRepository::process_durable_sleeps`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DurableSleepResponse {
    /// Matches resolved by the woken sleeps.
    pub matches: EventMatchResults,
    /// True when the scan hit its limit.
    pub should_continue: bool,
}

/// Persistent task state, scoped per tenant.
///
/// Implementations must be thread-safe and make each call atomic for its
/// tenant.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Marks attempts completed.
    async fn complete_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CompleteTaskOpts],
    ) -> Result<FinalizedTaskResponse>;

    /// Marks attempts failed, re-arming those with retries left.
    async fn fail_tasks(&self, tenant: &TenantId, tasks: &[FailTaskOpts])
    -> Result<FailTasksResponse>;

    /// Marks attempts cancelled.
    async fn cancel_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CancelTaskOpts],
    ) -> Result<FinalizedTaskResponse>;

    /// Starts a fresh attempt for each task.
    async fn replay_tasks(&self, tenant: &TenantId, tasks: &[TaskRef]) -> Result<Vec<Task>>;

    /// Returns the current attempts of the tasks that still exist.
    async fn filter_valid_tasks(&self, tenant: &TenantId, tasks: &[TaskRef])
    -> Result<Vec<TaskRef>>;

    /// Fails attempts past their execution timeout.
    async fn process_task_timeouts(&self, tenant: &TenantId, limit: usize)
    -> Result<TimeoutResponse>;

    /// Requeues or fails attempts whose worker stopped heartbeating.
    async fn process_task_reassignments(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<ReassignResponse>;

    /// Requeues retries whose backoff elapsed.
    async fn process_task_retry_queue_items(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<RetryQueueResponse>;

    /// Wakes elapsed durable sleeps and resolves what they gate.
    async fn process_durable_sleeps(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<DurableSleepResponse>;

    /// Fails queued attempts past their scheduling deadline.
    async fn process_batched_queue_item_timeouts(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<FailTasksResponse>;

    /// Resolves user events against registered conditions.
    async fn process_user_event_matches(
        &self,
        tenant: &TenantId,
        candidates: &[CandidateEventMatch],
    ) -> Result<EventMatchResults>;

    /// Resolves internal task events against registered conditions.
    async fn process_internal_event_matches(
        &self,
        tenant: &TenantId,
        events: &[InternalTaskEvent],
    ) -> Result<EventMatchResults>;

    /// Creates runs for workflows listening to the events' keys.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ResourceExhausted`] when the tenant is over a
    /// resource limit.
    async fn trigger_from_events(
        &self,
        tenant: &TenantId,
        events: &[EventRecord],
    ) -> Result<TriggerFromEventsResult>;

    /// Creates runs for workflows by name.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ResourceExhausted`] when the tenant is over a
    /// resource limit.
    async fn trigger_from_workflow_names(
        &self,
        tenant: &TenantId,
        triggers: &[WorkflowNameTrigger],
    ) -> Result<TriggerResult>;

    /// Removes expired idempotency keys, returning how many were removed.
    async fn evict_expired_idempotency_keys(&self, tenant: &TenantId) -> Result<usize>;

    /// Maps worker ids to the dispatcher each is connected to.
    ///
    /// Workers without a known dispatcher are absent from the result.
    async fn get_dispatcher_ids_for_workers(
        &self,
        tenant: &TenantId,
        worker_ids: &[String],
    ) -> Result<HashMap<String, String>>;

    /// Loads a tenant.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::TenantNotFound`] for unknown tenants.
    async fn get_tenant_by_id(&self, tenant: &TenantId) -> Result<Tenant>;

    /// Lists tenants that maintenance should run for.
    async fn list_active_tenants(&self) -> Result<Vec<Tenant>>;
}
