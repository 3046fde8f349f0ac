//! In-memory task repository for testing.
//!
//! [`InMemoryRepository`] keeps every tenant's tasks, retry queue, durable
//! sleeps, idempotency keys, workflow definitions and match conditions in a
//! single lock, so each trait call is atomic per repository.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence
//! - **Single-process only**: state is not shared across processes
//! - **Match engine is key-based**: conditions match on event key and an
//!   optional resource hint; there is no expression evaluation
//!
//! ## Attempt dedup
//!
//! Mutations only apply to the *current* attempt of a task, and only while
//! it is active (queued, running or backing off). A repeated or stale
//! completion/failure/cancellation is ignored and produces no released
//! task, retry or internal event.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use weft_core::{RunExternalId, TaskExternalId, TenantId};

use super::{
    CancelTaskOpts, CompleteTaskOpts, DurableSleepResponse, FailTaskOpts, FailTasksResponse,
    FinalizedTaskResponse, ReassignResponse, ReassignedTask, ReleasedTask, RetriedTask,
    RetryQueueItem, RetryQueueResponse, TaskRepository, Tenant, TimedOutTask, TimeoutResponse,
};
use crate::error::{Error, Result};
use crate::events::{
    CandidateEventMatch, CelEvaluationFailure, CelSource, EventMatchResults, EventRecord,
    InternalEventType, InternalTaskEvent, RunRef, SatisfiedCallback, TerminalOutput,
    TriggerFromEventsResult, TriggerResult,
};
use crate::messages::WorkflowNameTrigger;
use crate::task::{CancelReason, Dag, InitialState, RetryPolicy, Task, TaskRef};

/// Repository behaviour knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// A running attempt whose worker has not heartbeated for this long is
    /// reassigned.
    pub heartbeat_timeout: Duration,
    /// Reassignments allowed per task before it is failed.
    pub max_reassignments: i32,
    /// Lifetime of idempotency keys written by name-based triggers.
    pub idempotency_ttl: Duration,
    /// Maximum tasks a tenant may hold; `None` is unlimited.
    pub max_tasks_per_tenant: Option<usize>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            max_reassignments: 3,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            max_tasks_per_tenant: None,
        }
    }
}

/// Lifecycle status of a stored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Waiting for a worker.
    Queued,
    /// Assigned to a worker.
    Running,
    /// Failed and waiting in the retry queue.
    Backoff,
    /// Finished successfully.
    Completed,
    /// Failed for good.
    Failed,
    /// Cancelled.
    Cancelled,
    /// Skipped.
    Skipped,
}

impl TaskStatus {
    const fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running | Self::Backoff)
    }

    const fn from_initial(state: InitialState) -> Self {
        match state {
            InitialState::Queued => Self::Queued,
            InitialState::Failed => Self::Failed,
            InitialState::Cancelled => Self::Cancelled,
            InitialState::Skipped => Self::Skipped,
        }
    }
}

/// A workflow that triggers can start.
///
/// A run creates one task per action. Runs with more than one task are
/// recorded as a DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// Workflow name.
    pub name: String,
    /// Event keys that trigger the workflow.
    pub event_keys: Vec<String>,
    /// Queue the workflow's tasks go to.
    pub queue: String,
    /// Action ids, one task each.
    pub actions: Vec<String>,
    /// State new tasks are created in.
    pub initial_state: InitialState,
    /// Reason attached to tasks created in a terminal state.
    pub initial_state_reason: Option<String>,
    /// Concurrency keys stamped on new tasks.
    pub concurrency_keys: Vec<String>,
    /// Retry backoff.
    pub retry_policy: RetryPolicy,
    /// Application retries allowed.
    pub max_retries: i32,
    /// Execution timeout per attempt.
    pub step_timeout_secs: Option<u64>,
    /// When set, evaluating the workflow's event filter fails with this
    /// message and the event does not trigger it.
    pub filter_error: Option<String>,
}

impl WorkflowDefinition {
    /// Creates a workflow with the given actions on the `default` queue.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            event_keys: Vec::new(),
            queue: "default".to_string(),
            actions: actions.into_iter().map(Into::into).collect(),
            initial_state: InitialState::Queued,
            initial_state_reason: None,
            concurrency_keys: Vec::new(),
            retry_policy: RetryPolicy::default(),
            max_retries: 0,
            step_timeout_secs: None,
            filter_error: None,
        }
    }

    /// Triggers the workflow on events with `key`.
    #[must_use]
    pub fn on_event(mut self, key: impl Into<String>) -> Self {
        self.event_keys.push(key.into());
        self
    }

    /// Sets the queue.
    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Creates tasks in `state` with `reason`.
    #[must_use]
    pub fn with_initial_state(mut self, state: InitialState, reason: Option<&str>) -> Self {
        self.initial_state = state;
        self.initial_state_reason = reason.map(str::to_string);
        self
    }

    /// Sets concurrency keys.
    #[must_use]
    pub fn with_concurrency_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concurrency_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Allows `max_retries` application retries with `policy`.
    #[must_use]
    pub fn with_retries(mut self, max_retries: i32, policy: RetryPolicy) -> Self {
        self.max_retries = max_retries;
        self.retry_policy = policy;
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.step_timeout_secs = Some(secs);
        self
    }

    /// Makes filter evaluation fail.
    #[must_use]
    pub fn with_filter_error(mut self, message: impl Into<String>) -> Self {
        self.filter_error = Some(message.into());
        self
    }
}

/// What a match condition does when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchAction {
    /// Start a run of the named workflow with the event data as input.
    CreateRun {
        /// Workflow to start.
        workflow_name: String,
    },
    /// Start a fresh attempt of an existing task.
    ReplayTask {
        /// Task to replay.
        task_id: i64,
    },
    /// Complete a durable callback.
    SatisfyCallback {
        /// Task awaiting the callback.
        task_external_id: TaskExternalId,
        /// Node within the durable execution.
        node_id: i64,
        /// Worker awaiting it.
        worker_id: String,
    },
}

/// A one-shot condition registered with the match engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchCondition {
    /// Event key to match.
    pub key: String,
    /// When set, the candidate's resource hint must equal it.
    pub resource_hint: Option<String>,
    /// Action taken on match.
    pub action: MatchAction,
}

/// A durable task sleeping until `wake_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSleep {
    /// Sleeping task.
    pub task_external_id: TaskExternalId,
    /// Sleep node.
    pub node_id: i64,
    /// Worker awaiting the wake-up.
    pub worker_id: String,
    /// When the sleep ends.
    pub wake_at: DateTime<Utc>,
}

impl DurableSleep {
    /// Key under which conditions gated by this sleep are matched.
    #[must_use]
    pub fn match_key(&self) -> String {
        format!("sleep:{}:{}", self.task_external_id, self.node_id)
    }
}

#[derive(Debug, Clone)]
struct TaskRow {
    task: Task,
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    heartbeat_at: Option<DateTime<Utc>>,
    schedule_deadline: Option<DateTime<Utc>>,
    reassign_count: i32,
    output: Option<Value>,
}

impl TaskRow {
    fn released(&self) -> ReleasedTask {
        ReleasedTask {
            task: self.task.task_ref.clone(),
            queue: self.task.queue.clone(),
            worker_id: self.task.worker_id.clone(),
            workflow_run_id: self.task.workflow_run_id,
        }
    }

    fn clear_assignment(&mut self) {
        self.task.worker_id = None;
        self.started_at = None;
        self.heartbeat_at = None;
    }

    fn start_attempt(&mut self) {
        self.task.task_ref.retry_count += 1;
        self.clear_assignment();
    }
}

#[derive(Debug, Clone)]
struct RetryEntry {
    task: TaskRef,
    retry_after: DateTime<Utc>,
}

#[derive(Debug)]
struct TenantState {
    tenant: Tenant,
    tasks: BTreeMap<i64, TaskRow>,
    dags: Vec<Dag>,
    retry_queue: Vec<RetryEntry>,
    sleeps: Vec<DurableSleep>,
    idempotency_keys: HashMap<String, DateTime<Utc>>,
    workflows: BTreeMap<String, WorkflowDefinition>,
    conditions: Vec<MatchCondition>,
    workers: HashMap<String, String>,
}

impl TenantState {
    fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            tasks: BTreeMap::new(),
            dags: Vec::new(),
            retry_queue: Vec::new(),
            sleeps: Vec::new(),
            idempotency_keys: HashMap::new(),
            workflows: BTreeMap::new(),
            conditions: Vec::new(),
            workers: HashMap::new(),
        }
    }

    fn id(&self) -> TenantId {
        self.tenant.id.clone()
    }

    /// Returns the row if `task` is its current, active attempt.
    fn current_row(&mut self, task: &TaskRef) -> Option<&mut TaskRow> {
        self.tasks.get_mut(&task.id).filter(|row| {
            row.status.is_active() && row.task.task_ref.retry_count == task.retry_count
        })
    }

    fn ensure_capacity(&self, additional: usize, limit: Option<usize>) -> Result<()> {
        match limit {
            Some(max) if self.tasks.len() + additional > max => Err(Error::ResourceExhausted {
                tenant_id: self.id(),
                resource: format!("task limit of {max}"),
            }),
            _ => Ok(()),
        }
    }

    fn create_run(
        &mut self,
        next_id: &mut i64,
        workflow: &WorkflowDefinition,
        run_id: RunExternalId,
        now: DateTime<Utc>,
    ) -> (Vec<Task>, Option<Dag>, RunRef) {
        let dag_id = (workflow.actions.len() > 1).then(|| take_id(next_id));
        let tenant_id = self.id();

        let mut tasks = Vec::with_capacity(workflow.actions.len());
        for action in &workflow.actions {
            let task = Task {
                tenant_id: tenant_id.clone(),
                task_ref: TaskRef::new(take_id(next_id), now, 0, TaskExternalId::generate()),
                queue: workflow.queue.clone(),
                action_id: action.clone(),
                initial_state: workflow.initial_state,
                initial_state_reason: workflow.initial_state_reason.clone(),
                concurrency_keys: workflow.concurrency_keys.clone(),
                worker_id: None,
                step_timeout_secs: workflow.step_timeout_secs,
                retry_policy: workflow.retry_policy,
                max_retries: workflow.max_retries,
                app_retry_count: 0,
                workflow_run_id: Some(run_id),
                dag_id,
            };
            self.tasks.insert(
                task.task_ref.id,
                TaskRow {
                    task: task.clone(),
                    status: TaskStatus::from_initial(workflow.initial_state),
                    started_at: None,
                    heartbeat_at: None,
                    schedule_deadline: None,
                    reassign_count: 0,
                    output: None,
                },
            );
            tasks.push(task);
        }

        let dag = dag_id.map(|id| Dag {
            tenant_id,
            id,
            inserted_at: now,
            external_id: run_id,
            workflow_name: workflow.name.clone(),
            task_count: tasks.len(),
        });
        if let Some(dag) = &dag {
            self.dags.push(dag.clone());
        }

        let run = RunRef {
            external_id: run_id,
            inserted_at: now,
        };
        (tasks, dag, run)
    }

    fn fail_one(
        &mut self,
        opts: &FailTaskOpts,
        now: DateTime<Utc>,
        response: &mut FailTasksResponse,
    ) -> bool {
        let tenant_id = self.id();
        let Some(row) = self.current_row(&opts.task) else {
            return false;
        };

        let failed_ref = row.task.task_ref.clone();
        response.finalized.released_tasks.push(row.released());
        response.finalized.internal_events.push(InternalTaskEvent::for_task(
            tenant_id,
            &failed_ref,
            InternalEventType::Failed,
            TerminalOutput::Failed {
                error_message: opts.error_message.clone(),
            }
            .to_value(),
        ));

        let retryable = opts.is_app_error
            && !opts.should_not_retry
            && row.task.app_retry_count < row.task.max_retries;

        if !retryable {
            row.status = TaskStatus::Failed;
            row.clear_assignment();
            return true;
        }

        row.task.app_retry_count += 1;
        row.start_attempt();
        row.status = TaskStatus::Backoff;

        let policy = row.task.retry_policy;
        let app_retry_count = row.task.app_retry_count;
        let backoff = policy.backoff(app_retry_count).unwrap_or(Duration::ZERO);
        let next_attempt = row.task.task_ref.clone();

        response.retried_tasks.push(RetriedTask {
            task: failed_ref,
            app_retry_count,
            retry_policy: policy,
        });
        self.retry_queue.push(RetryEntry {
            task: next_attempt,
            retry_after: now + to_chrono(backoff),
        });
        true
    }

    fn replay_one(&mut self, task_id: i64) -> Option<Task> {
        let row = self.tasks.get_mut(&task_id)?;
        row.start_attempt();
        row.task.app_retry_count = 0;
        row.task.initial_state = InitialState::Queued;
        row.task.initial_state_reason = None;
        row.status = TaskStatus::Queued;
        row.reassign_count = 0;
        row.output = None;
        let task = row.task.clone();
        self.retry_queue.retain(|entry| entry.task.id != task_id);
        Some(task)
    }

    fn match_candidates(
        &mut self,
        next_id: &mut i64,
        candidates: &[CandidateEventMatch],
        now: DateTime<Utc>,
    ) -> EventMatchResults {
        let mut results = EventMatchResults::default();

        for candidate in candidates {
            let mut fired = Vec::new();
            let mut remaining = Vec::with_capacity(self.conditions.len());
            for condition in self.conditions.drain(..) {
                let hint_ok = condition
                    .resource_hint
                    .as_ref()
                    .map_or(true, |hint| candidate.resource_hint.as_ref() == Some(hint));
                if condition.key == candidate.key && hint_ok {
                    fired.push(condition);
                } else {
                    remaining.push(condition);
                }
            }
            self.conditions = remaining;

            for condition in fired {
                match condition.action {
                    MatchAction::CreateRun { workflow_name } => {
                        let Some(workflow) = self.workflows.get(&workflow_name).cloned() else {
                            tracing::warn!(workflow = %workflow_name, "matched condition references unknown workflow");
                            continue;
                        };
                        let (tasks, _, _) =
                            self.create_run(next_id, &workflow, RunExternalId::generate(), now);
                        results.created_tasks.extend(tasks);
                    }
                    MatchAction::ReplayTask { task_id } => {
                        if let Some(task) = self.replay_one(task_id) {
                            results.replayed_tasks.push(task);
                        }
                    }
                    MatchAction::SatisfyCallback {
                        task_external_id,
                        node_id,
                        worker_id,
                    } => results.satisfied_callbacks.push(SatisfiedCallback {
                        task_external_id,
                        node_id,
                        worker_id,
                        data: candidate.data.clone(),
                    }),
                }
            }
        }

        results
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    tenants: HashMap<TenantId, TenantState>,
    next_id: i64,
}

fn take_id(next_id: &mut i64) -> i64 {
    *next_id += 1;
    *next_id
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

fn poison_err<T>(err: PoisonError<T>) -> Error {
    Error::repository_with_source(
        "repository lock poisoned",
        std::io::Error::other(err.to_string()),
    )
}

fn not_found(tenant: &TenantId) -> Error {
    Error::TenantNotFound {
        tenant_id: tenant.clone(),
    }
}

/// In-memory [`TaskRepository`].
///
/// ## Example
///
/// ```rust
/// use weft_core::TenantId;
/// use weft_tasks::repository::Tenant;
/// use weft_tasks::repository::memory::{InMemoryRepository, WorkflowDefinition};
///
/// let repo = InMemoryRepository::new();
/// let tenant = TenantId::new("acme").unwrap();
/// repo.add_tenant(Tenant::new(tenant.clone()));
/// repo.register_workflow(&tenant, WorkflowDefinition::new("etl", ["extract"]).on_event("file.uploaded"))
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    options: RepositoryOptions,
    state: RwLock<RepositoryState>,
}

impl InMemoryRepository {
    /// Creates an empty repository with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty repository with custom options.
    #[must_use]
    pub fn with_options(options: RepositoryOptions) -> Self {
        Self {
            options,
            state: RwLock::new(RepositoryState::default()),
        }
    }

    fn with_tenant<R>(
        &self,
        tenant: &TenantId,
        f: impl FnOnce(&mut TenantState, &mut i64) -> Result<R>,
    ) -> Result<R> {
        let mut guard = self.state.write().map_err(poison_err)?;
        let RepositoryState { tenants, next_id } = &mut *guard;
        let state = tenants.get_mut(tenant).ok_or_else(|| not_found(tenant))?;
        f(state, next_id)
    }

    fn read_tenant<R>(&self, tenant: &TenantId, f: impl FnOnce(&TenantState) -> R) -> Option<R> {
        let guard = self.state.read().ok()?;
        guard.tenants.get(tenant).map(f)
    }

    /// Registers a tenant, replacing any previous registration's metadata.
    pub fn add_tenant(&self, tenant: Tenant) {
        if let Ok(mut guard) = self.state.write() {
            match guard.tenants.get_mut(&tenant.id) {
                Some(existing) => existing.tenant = tenant,
                None => {
                    guard
                        .tenants
                        .insert(tenant.id.clone(), TenantState::new(tenant));
                }
            }
        }
    }

    /// Removes a tenant and all its state.
    pub fn remove_tenant(&self, tenant: &TenantId) {
        if let Ok(mut guard) = self.state.write() {
            guard.tenants.remove(tenant);
        }
    }

    /// Registers a workflow definition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn register_workflow(&self, tenant: &TenantId, workflow: WorkflowDefinition) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state.workflows.insert(workflow.name.clone(), workflow);
            Ok(())
        })
    }

    /// Records which dispatcher a worker is connected to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn register_worker(
        &self,
        tenant: &TenantId,
        worker_id: impl Into<String>,
        dispatcher_id: impl Into<String>,
    ) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state.workers.insert(worker_id.into(), dispatcher_id.into());
            Ok(())
        })
    }

    /// Registers a one-shot match condition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn add_condition(&self, tenant: &TenantId, condition: MatchCondition) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state.conditions.push(condition);
            Ok(())
        })
    }

    /// Registers a durable sleep.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn add_durable_sleep(&self, tenant: &TenantId, sleep: DurableSleep) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state.sleeps.push(sleep);
            Ok(())
        })
    }

    /// Stores an idempotency key that expires at `expires_at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn insert_idempotency_key(
        &self,
        tenant: &TenantId,
        key: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state.idempotency_keys.insert(key.into(), expires_at);
            Ok(())
        })
    }

    /// Starts a task's current attempt on `worker_id` at `at`.
    ///
    /// # Errors
    ///
    /// Returns a repository error if the task is not queued.
    pub fn assign_task(
        &self,
        tenant: &TenantId,
        task_id: i64,
        worker_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<TaskRef> {
        self.with_tenant(tenant, |state, _| {
            let row = state
                .tasks
                .get_mut(&task_id)
                .filter(|row| row.status == TaskStatus::Queued)
                .ok_or_else(|| Error::repository(format!("task {task_id} is not queued")))?;
            row.status = TaskStatus::Running;
            row.task.worker_id = Some(worker_id.into());
            row.started_at = Some(at);
            row.heartbeat_at = Some(at);
            Ok(row.task.task_ref.clone())
        })
    }

    /// Records a heartbeat for every attempt running on `worker_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TenantNotFound`] for unknown tenants.
    pub fn heartbeat(&self, tenant: &TenantId, worker_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            state
                .tasks
                .values_mut()
                .filter(|row| {
                    row.status == TaskStatus::Running && row.task.worker_id.as_deref() == Some(worker_id)
                })
                .for_each(|row| row.heartbeat_at = Some(at));
            Ok(())
        })
    }

    /// Sets the scheduling deadline of a queued task.
    ///
    /// # Errors
    ///
    /// Returns a repository error for unknown tasks.
    pub fn set_schedule_deadline(
        &self,
        tenant: &TenantId,
        task_id: i64,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        self.with_tenant(tenant, |state, _| {
            let row = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::repository(format!("task {task_id} not found")))?;
            row.schedule_deadline = Some(deadline);
            Ok(())
        })
    }

    /// Returns a stored task.
    #[must_use]
    pub fn task(&self, tenant: &TenantId, task_id: i64) -> Option<Task> {
        self.read_tenant(tenant, |state| state.tasks.get(&task_id).map(|row| row.task.clone()))
            .flatten()
    }

    /// Returns a stored task's status.
    #[must_use]
    pub fn task_status(&self, tenant: &TenantId, task_id: i64) -> Option<TaskStatus> {
        self.read_tenant(tenant, |state| state.tasks.get(&task_id).map(|row| row.status))
            .flatten()
    }

    /// Returns the output recorded for a completed task.
    #[must_use]
    pub fn task_output(&self, tenant: &TenantId, task_id: i64) -> Option<Value> {
        self.read_tenant(tenant, |state| {
            state.tasks.get(&task_id).and_then(|row| row.output.clone())
        })
        .flatten()
    }

    /// Number of retries waiting for their backoff to elapse.
    #[must_use]
    pub fn retry_queue_len(&self, tenant: &TenantId) -> usize {
        self.read_tenant(tenant, |state| state.retry_queue.len())
            .unwrap_or_default()
    }

    /// Number of stored idempotency keys.
    #[must_use]
    pub fn idempotency_key_count(&self, tenant: &TenantId) -> usize {
        self.read_tenant(tenant, |state| state.idempotency_keys.len())
            .unwrap_or_default()
    }

    /// DAGs created for a tenant.
    #[must_use]
    pub fn dags(&self, tenant: &TenantId) -> Vec<Dag> {
        self.read_tenant(tenant, |state| state.dags.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TaskRepository for InMemoryRepository {
    async fn complete_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CompleteTaskOpts],
    ) -> Result<FinalizedTaskResponse> {
        self.with_tenant(tenant, |state, _| {
            let tenant_id = state.id();
            let mut response = FinalizedTaskResponse::default();
            for opts in tasks {
                let Some(row) = state.current_row(&opts.task) else {
                    continue;
                };
                response.released_tasks.push(row.released());
                row.status = TaskStatus::Completed;
                row.output = Some(opts.output.clone());
                row.clear_assignment();
                response.internal_events.push(InternalTaskEvent::for_task(
                    tenant_id.clone(),
                    &opts.task,
                    InternalEventType::Completed,
                    TerminalOutput::Completed {
                        output: opts.output.clone(),
                    }
                    .to_value(),
                ));
            }
            Ok(response)
        })
    }

    async fn fail_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[FailTaskOpts],
    ) -> Result<FailTasksResponse> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, _| {
            let mut response = FailTasksResponse::default();
            for opts in tasks {
                state.fail_one(opts, now, &mut response);
            }
            Ok(response)
        })
    }

    async fn cancel_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CancelTaskOpts],
    ) -> Result<FinalizedTaskResponse> {
        self.with_tenant(tenant, |state, _| {
            let tenant_id = state.id();
            let mut response = FinalizedTaskResponse::default();
            for opts in tasks {
                let Some(row) = state.current_row(&opts.task) else {
                    continue;
                };
                response.released_tasks.push(row.released());
                row.status = TaskStatus::Cancelled;
                row.clear_assignment();
                response.internal_events.push(InternalTaskEvent::for_task(
                    tenant_id.clone(),
                    &opts.task,
                    InternalEventType::Cancelled,
                    TerminalOutput::Cancelled {
                        reason: opts.reason.description().to_string(),
                    }
                    .to_value(),
                ));
                state.retry_queue.retain(|entry| entry.task.id != opts.task.id);
            }
            Ok(response)
        })
    }

    async fn replay_tasks(&self, tenant: &TenantId, tasks: &[TaskRef]) -> Result<Vec<Task>> {
        self.with_tenant(tenant, |state, _| {
            Ok(tasks
                .iter()
                .filter_map(|task| state.replay_one(task.id))
                .collect())
        })
    }

    async fn filter_valid_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[TaskRef],
    ) -> Result<Vec<TaskRef>> {
        self.with_tenant(tenant, |state, _| {
            Ok(tasks
                .iter()
                .filter_map(|task| state.tasks.get(&task.id))
                .map(|row| row.task.task_ref.clone())
                .collect())
        })
    }

    async fn process_task_timeouts(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<TimeoutResponse> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, _| {
            let expired: Vec<(TaskRef, Option<String>, u64)> = state
                .tasks
                .values()
                .filter(|row| row.status == TaskStatus::Running)
                .filter_map(|row| {
                    let timeout = row.task.step_timeout_secs?;
                    let started = row.started_at?;
                    let deadline = started + to_chrono(Duration::from_secs(timeout));
                    (deadline <= now).then(|| {
                        (row.task.task_ref.clone(), row.task.worker_id.clone(), timeout)
                    })
                })
                .collect();

            let should_continue = expired.len() > limit;
            let mut response = TimeoutResponse {
                should_continue,
                ..TimeoutResponse::default()
            };

            for (task, worker_id, timeout_secs) in expired.into_iter().take(limit) {
                let opts = FailTaskOpts {
                    task: task.clone(),
                    error_message: format!("task exceeded timeout of {timeout_secs}s"),
                    is_app_error: true,
                    should_not_retry: false,
                };
                if state.fail_one(&opts, now, &mut response.fail) {
                    response.timed_out.push(TimedOutTask {
                        task,
                        worker_id,
                        timeout_secs,
                    });
                }
            }
            Ok(response)
        })
    }

    async fn process_task_reassignments(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<ReassignResponse> {
        let now = Utc::now();
        let stale_before = now - to_chrono(self.options.heartbeat_timeout);
        let max_reassignments = self.options.max_reassignments;

        self.with_tenant(tenant, |state, _| {
            let stale: Vec<i64> = state
                .tasks
                .values()
                .filter(|row| row.status == TaskStatus::Running)
                .filter(|row| row.heartbeat_at.is_some_and(|at| at < stale_before))
                .map(|row| row.task.task_ref.id)
                .collect();

            let should_continue = stale.len() > limit;
            let mut response = ReassignResponse {
                should_continue,
                ..ReassignResponse::default()
            };

            for task_id in stale.into_iter().take(limit) {
                let Some(row) = state.tasks.get_mut(&task_id) else {
                    continue;
                };
                let task = row.task.task_ref.clone();
                let worker_id = row.task.worker_id.clone().unwrap_or_default();

                if row.reassign_count < max_reassignments {
                    response.fail.finalized.released_tasks.push(row.released());
                    row.reassign_count += 1;
                    row.start_attempt();
                    row.status = TaskStatus::Queued;
                    response.reassigned.push(ReassignedTask { task, worker_id });
                } else {
                    let opts = FailTaskOpts {
                        task: task.clone(),
                        error_message: "max reassignment count reached".to_string(),
                        is_app_error: false,
                        should_not_retry: true,
                    };
                    if state.fail_one(&opts, now, &mut response.fail) {
                        response
                            .failed_exhausted
                            .push(ReassignedTask { task, worker_id });
                    }
                }
            }
            Ok(response)
        })
    }

    async fn process_task_retry_queue_items(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<RetryQueueResponse> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, _| {
            state.retry_queue.sort_by_key(|entry| entry.retry_after);
            let due = state
                .retry_queue
                .iter()
                .take_while(|entry| entry.retry_after <= now)
                .count();
            let take = due.min(limit);

            let mut response = RetryQueueResponse {
                items: Vec::with_capacity(take),
                should_continue: due > limit,
            };
            for entry in state.retry_queue.drain(..take).collect::<Vec<_>>() {
                let Some(row) = state.tasks.get_mut(&entry.task.id) else {
                    continue;
                };
                if row.status != TaskStatus::Backoff
                    || row.task.task_ref.retry_count != entry.task.retry_count
                {
                    continue;
                }
                row.status = TaskStatus::Queued;
                response.items.push(RetryQueueItem {
                    task: entry.task,
                    queue: row.task.queue.clone(),
                });
            }
            Ok(response)
        })
    }

    async fn process_durable_sleeps(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<DurableSleepResponse> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, next_id| {
            state.sleeps.sort_by_key(|sleep| sleep.wake_at);
            let due = state
                .sleeps
                .iter()
                .take_while(|sleep| sleep.wake_at <= now)
                .count();
            let take = due.min(limit);
            let woken: Vec<DurableSleep> = state.sleeps.drain(..take).collect();

            let mut matches = EventMatchResults::default();
            let mut candidates = Vec::with_capacity(woken.len());
            for sleep in woken {
                let data = json!({ "sleptUntil": sleep.wake_at });
                candidates.push(CandidateEventMatch {
                    id: weft_core::MessageId::generate(),
                    event_timestamp: now,
                    key: sleep.match_key(),
                    data: data.clone(),
                    resource_hint: Some(sleep.task_external_id.to_string()),
                });
                matches.satisfied_callbacks.push(SatisfiedCallback {
                    task_external_id: sleep.task_external_id,
                    node_id: sleep.node_id,
                    worker_id: sleep.worker_id,
                    data,
                });
            }
            matches.extend(state.match_candidates(next_id, &candidates, now));

            Ok(DurableSleepResponse {
                matches,
                should_continue: due > limit,
            })
        })
    }

    async fn process_batched_queue_item_timeouts(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<FailTasksResponse> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, _| {
            let expired: Vec<TaskRef> = state
                .tasks
                .values()
                .filter(|row| row.status == TaskStatus::Queued)
                .filter(|row| row.schedule_deadline.is_some_and(|at| at <= now))
                .take(limit)
                .map(|row| row.task.task_ref.clone())
                .collect();

            let mut response = FailTasksResponse::default();
            for task in expired {
                let opts = FailTaskOpts {
                    task,
                    error_message: CancelReason::ScheduleTimeout.description().to_string(),
                    is_app_error: false,
                    should_not_retry: true,
                };
                state.fail_one(&opts, now, &mut response);
            }
            Ok(response)
        })
    }

    async fn process_user_event_matches(
        &self,
        tenant: &TenantId,
        candidates: &[CandidateEventMatch],
    ) -> Result<EventMatchResults> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, next_id| {
            Ok(state.match_candidates(next_id, candidates, now))
        })
    }

    async fn process_internal_event_matches(
        &self,
        tenant: &TenantId,
        events: &[InternalTaskEvent],
    ) -> Result<EventMatchResults> {
        let now = Utc::now();
        let candidates: Vec<CandidateEventMatch> =
            events.iter().map(InternalTaskEvent::to_candidate).collect();
        self.with_tenant(tenant, |state, next_id| {
            Ok(state.match_candidates(next_id, &candidates, now))
        })
    }

    async fn trigger_from_events(
        &self,
        tenant: &TenantId,
        events: &[EventRecord],
    ) -> Result<TriggerFromEventsResult> {
        let now = Utc::now();
        let limit = self.options.max_tasks_per_tenant;

        self.with_tenant(tenant, |state, next_id| {
            let matched: Vec<(usize, WorkflowDefinition)> = events
                .iter()
                .enumerate()
                .flat_map(|(index, event)| {
                    state
                        .workflows
                        .values()
                        .filter(|wf| wf.event_keys.iter().any(|k| *k == event.key))
                        .map(move |wf| (index, wf.clone()))
                        .collect::<Vec<_>>()
                })
                .collect();

            let needed = matched
                .iter()
                .filter(|(_, wf)| wf.filter_error.is_none())
                .map(|(_, wf)| wf.actions.len())
                .sum();
            state.ensure_capacity(needed, limit)?;

            let mut result = TriggerFromEventsResult {
                events: events.to_vec(),
                ..TriggerFromEventsResult::default()
            };
            for event in events {
                result.event_runs.insert(event.external_id, Vec::new());
            }

            for (index, workflow) in matched {
                let event = &events[index];
                if let Some(message) = &workflow.filter_error {
                    result.cel_evaluation_failures.push(CelEvaluationFailure {
                        source: CelSource::EventFilter,
                        error_message: format!("{}: {message}", workflow.name),
                    });
                    continue;
                }

                let (tasks, dag, run) =
                    state.create_run(next_id, &workflow, RunExternalId::generate(), now);
                result.tasks.extend(tasks);
                result.dags.extend(dag);
                result
                    .event_runs
                    .entry(event.external_id)
                    .or_default()
                    .push(run);
            }
            Ok(result)
        })
    }

    async fn trigger_from_workflow_names(
        &self,
        tenant: &TenantId,
        triggers: &[WorkflowNameTrigger],
    ) -> Result<TriggerResult> {
        let now = Utc::now();
        let limit = self.options.max_tasks_per_tenant;
        let ttl = to_chrono(self.options.idempotency_ttl);

        self.with_tenant(tenant, |state, next_id| {
            let needed = triggers
                .iter()
                .filter_map(|t| state.workflows.get(&t.workflow_name))
                .map(|wf| wf.actions.len())
                .sum();
            state.ensure_capacity(needed, limit)?;

            let mut result = TriggerResult::default();
            for trigger in triggers {
                if let Some(key) = &trigger.idempotency_key {
                    if state.idempotency_keys.get(key).is_some_and(|exp| *exp > now) {
                        tracing::debug!(key = %key, "skipping duplicate trigger");
                        continue;
                    }
                    state.idempotency_keys.insert(key.clone(), now + ttl);
                }

                let Some(workflow) = state.workflows.get(&trigger.workflow_name).cloned() else {
                    tracing::warn!(workflow = %trigger.workflow_name, "trigger references unknown workflow");
                    continue;
                };
                let (tasks, dag, _) = state.create_run(next_id, &workflow, trigger.external_id, now);
                result.tasks.extend(tasks);
                result.dags.extend(dag);
            }
            Ok(result)
        })
    }

    async fn evict_expired_idempotency_keys(&self, tenant: &TenantId) -> Result<usize> {
        let now = Utc::now();
        self.with_tenant(tenant, |state, _| {
            let before = state.idempotency_keys.len();
            state.idempotency_keys.retain(|_, expires_at| *expires_at > now);
            Ok(before - state.idempotency_keys.len())
        })
    }

    async fn get_dispatcher_ids_for_workers(
        &self,
        tenant: &TenantId,
        worker_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        self.with_tenant(tenant, |state, _| {
            Ok(worker_ids
                .iter()
                .filter_map(|worker| {
                    state
                        .workers
                        .get(worker)
                        .map(|dispatcher| (worker.clone(), dispatcher.clone()))
                })
                .collect())
        })
    }

    async fn get_tenant_by_id(&self, tenant: &TenantId) -> Result<Tenant> {
        self.with_tenant(tenant, |state, _| Ok(state.tenant.clone()))
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        let guard = self.state.read().map_err(poison_err)?;
        let mut tenants: Vec<Tenant> = guard.tenants.values().map(|s| s.tenant.clone()).collect();
        tenants.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new_unchecked("acme")
    }

    fn repo_with(workflow: WorkflowDefinition) -> InMemoryRepository {
        let repo = InMemoryRepository::new();
        repo.add_tenant(Tenant::new(tenant()));
        repo.register_workflow(&tenant(), workflow).unwrap();
        repo
    }

    async fn trigger_one(repo: &InMemoryRepository, name: &str) -> Task {
        let result = repo
            .trigger_from_workflow_names(&tenant(), &[WorkflowNameTrigger::new(name, json!({}))])
            .await
            .unwrap();
        result.tasks.into_iter().next().unwrap()
    }

    fn fail_opts(task: &TaskRef) -> FailTaskOpts {
        FailTaskOpts {
            task: task.clone(),
            error_message: "boom".into(),
            is_app_error: true,
            should_not_retry: false,
        }
    }

    #[tokio::test]
    async fn unknown_tenant_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.get_tenant_by_id(&tenant()).await.unwrap_err();
        assert!(matches!(&err, Error::TenantNotFound { tenant_id } if *tenant_id == tenant()));
        assert_eq!(err.to_string(), "tenant not found: acme");
        assert!(!err.is_retryable());

        let err = repo
            .register_workflow(&tenant(), WorkflowDefinition::new("job", ["run"]))
            .unwrap_err();
        assert!(matches!(err, Error::TenantNotFound { .. }));
    }

    #[test]
    fn poisoned_lock_is_a_retryable_error_with_its_cause() {
        let repo = std::sync::Arc::new(repo_with(WorkflowDefinition::new("job", ["run"])));
        let writer = std::sync::Arc::clone(&repo);
        let died = std::thread::spawn(move || {
            let _guard = writer.state.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();
        assert!(died.is_err());

        let err = repo
            .register_workflow(&tenant(), WorkflowDefinition::new("other", ["run"]))
            .unwrap_err();
        assert!(matches!(err, Error::Repository { .. }));
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn multi_action_workflow_creates_dag() {
        let repo = repo_with(WorkflowDefinition::new("etl", ["extract", "load"]));
        let result = repo
            .trigger_from_workflow_names(&tenant(), &[WorkflowNameTrigger::new("etl", json!({}))])
            .await
            .unwrap();

        assert_eq!(result.tasks.len(), 2);
        assert_eq!(result.dags.len(), 1);
        assert_eq!(result.dags[0].task_count, 2);
        assert!(result.tasks.iter().all(|t| t.dag_id == Some(result.dags[0].id)));
    }

    #[tokio::test]
    async fn failure_with_retries_left_is_retried() {
        let repo = repo_with(
            WorkflowDefinition::new("job", ["run"]).with_retries(2, RetryPolicy::default()),
        );
        let task = trigger_one(&repo, "job").await;
        let attempt = repo.assign_task(&tenant(), task.task_ref.id, "w1", Utc::now()).unwrap();

        let response = repo.fail_tasks(&tenant(), &[fail_opts(&attempt)]).await.unwrap();
        assert_eq!(response.retried_tasks.len(), 1);
        assert_eq!(response.retried_tasks[0].app_retry_count, 1);
        assert_eq!(response.finalized.released_tasks[0].worker_id.as_deref(), Some("w1"));
        assert_eq!(repo.task_status(&tenant(), task.task_ref.id), Some(TaskStatus::Backoff));
        assert_eq!(repo.retry_queue_len(&tenant()), 1);

        let retry = repo.process_task_retry_queue_items(&tenant(), 10).await.unwrap();
        assert_eq!(retry.items.len(), 1);
        assert_eq!(retry.items[0].task.retry_count, 1);
        assert_eq!(repo.task_status(&tenant(), task.task_ref.id), Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn stale_failure_is_ignored() {
        let repo = repo_with(WorkflowDefinition::new("job", ["run"]));
        let task = trigger_one(&repo, "job").await;

        let first = repo.fail_tasks(&tenant(), &[fail_opts(&task.task_ref)]).await.unwrap();
        let second = repo.fail_tasks(&tenant(), &[fail_opts(&task.task_ref)]).await.unwrap();

        assert_eq!(first.finalized.internal_events.len(), 1);
        assert_eq!(second, FailTasksResponse::default());
        assert_eq!(repo.task_status(&tenant(), task.task_ref.id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn timeouts_fail_running_tasks() {
        let repo = repo_with(WorkflowDefinition::new("job", ["run"]).with_timeout_secs(5));
        let task = trigger_one(&repo, "job").await;
        let started = Utc::now() - chrono::Duration::seconds(10);
        repo.assign_task(&tenant(), task.task_ref.id, "w1", started).unwrap();

        let response = repo.process_task_timeouts(&tenant(), 10).await.unwrap();
        assert_eq!(response.timed_out.len(), 1);
        assert_eq!(response.timed_out[0].timeout_secs, 5);
        assert_eq!(response.timed_out[0].worker_id.as_deref(), Some("w1"));
        assert!(!response.should_continue);
    }

    #[tokio::test]
    async fn reassignment_budget_is_enforced() {
        let repo = InMemoryRepository::with_options(RepositoryOptions {
            max_reassignments: 1,
            ..RepositoryOptions::default()
        });
        repo.add_tenant(Tenant::new(tenant()));
        repo.register_workflow(&tenant(), WorkflowDefinition::new("job", ["run"])).unwrap();
        let task = trigger_one(&repo, "job").await;
        let stale = Utc::now() - chrono::Duration::seconds(120);

        repo.assign_task(&tenant(), task.task_ref.id, "w1", stale).unwrap();
        let first = repo.process_task_reassignments(&tenant(), 10).await.unwrap();
        assert_eq!(first.reassigned.len(), 1);
        assert!(first.failed_exhausted.is_empty());

        repo.assign_task(&tenant(), task.task_ref.id, "w2", stale).unwrap();
        let second = repo.process_task_reassignments(&tenant(), 10).await.unwrap();
        assert!(second.reassigned.is_empty());
        assert_eq!(second.failed_exhausted.len(), 1);
        assert_eq!(repo.task_status(&tenant(), task.task_ref.id), Some(TaskStatus::Failed));
    }

    #[tokio::test]
    async fn conditions_fire_once() {
        let repo = repo_with(WorkflowDefinition::new("job", ["run"]));
        let external = TaskExternalId::generate();
        repo.add_condition(
            &tenant(),
            MatchCondition {
                key: "approval".into(),
                resource_hint: None,
                action: MatchAction::SatisfyCallback {
                    task_external_id: external,
                    node_id: 3,
                    worker_id: "w1".into(),
                },
            },
        )
        .unwrap();

        let candidate = EventRecord::new("approval", json!({"ok": true})).to_candidate();
        let first = repo
            .process_user_event_matches(&tenant(), std::slice::from_ref(&candidate))
            .await
            .unwrap();
        let second = repo
            .process_user_event_matches(&tenant(), &[candidate])
            .await
            .unwrap();

        assert_eq!(first.satisfied_callbacks.len(), 1);
        assert_eq!(first.satisfied_callbacks[0].data, json!({"ok": true}));
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn idempotency_keys_dedupe_and_expire() {
        let repo = repo_with(WorkflowDefinition::new("job", ["run"]));
        let mut trigger = WorkflowNameTrigger::new("job", json!({}));
        trigger.idempotency_key = Some("once".into());

        let first = repo
            .trigger_from_workflow_names(&tenant(), std::slice::from_ref(&trigger))
            .await
            .unwrap();
        let second = repo
            .trigger_from_workflow_names(&tenant(), &[trigger])
            .await
            .unwrap();
        assert_eq!(first.tasks.len(), 1);
        assert!(second.tasks.is_empty());

        repo.insert_idempotency_key(&tenant(), "old", Utc::now() - chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(repo.evict_expired_idempotency_keys(&tenant()).await.unwrap(), 1);
        assert_eq!(repo.idempotency_key_count(&tenant()), 1);
    }

    #[tokio::test]
    async fn task_limit_is_resource_exhausted() {
        let repo = InMemoryRepository::with_options(RepositoryOptions {
            max_tasks_per_tenant: Some(1),
            ..RepositoryOptions::default()
        });
        repo.add_tenant(Tenant::new(tenant()));
        repo.register_workflow(&tenant(), WorkflowDefinition::new("etl", ["a", "b"]))
            .unwrap();

        let err = repo
            .trigger_from_workflow_names(&tenant(), &[WorkflowNameTrigger::new("etl", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { .. }));
    }
}
