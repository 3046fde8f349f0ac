//! Shared fixtures for controller integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use weft_core::{LogConfig, TenantId};
use weft_tasks::config::ControllerConfig;
use weft_tasks::context::ServiceContext;
use weft_tasks::controller::TaskController;
use weft_tasks::events::{
    CandidateEventMatch, EventMatchResults, EventRecord, InternalTaskEvent,
    TriggerFromEventsResult, TriggerResult,
};
use weft_tasks::messages::{Message, WorkflowNameTrigger};
use weft_tasks::olap::{OlapRecord, OlapTaskEvent};
use weft_tasks::repository::memory::{InMemoryRepository, RepositoryOptions, WorkflowDefinition};
use weft_tasks::repository::{
    CancelTaskOpts, CompleteTaskOpts, DurableSleepResponse, FailTaskOpts, FailTasksResponse,
    FinalizedTaskResponse, ReassignResponse, RetryQueueResponse, TaskRepository, Tenant,
    TimeoutResponse,
};
use weft_tasks::task::{Task, TaskRef};
use weft_tasks::transport::memory::InMemoryTransport;
use weft_tasks::transport::{Queue, Transport};
use weft_tasks::Result;

pub const PARTITION: &str = "scheduler-0";

pub fn tenant() -> TenantId {
    TenantId::new_unchecked("acme")
}

/// A controller over in-memory collaborators.
pub struct Harness {
    pub repo: Arc<InMemoryRepository>,
    pub transport: Arc<InMemoryTransport>,
    pub ctx: Arc<ServiceContext>,
    pub controller: TaskController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(RepositoryOptions::default(), ControllerConfig::default())
    }

    pub fn with(options: RepositoryOptions, config: ControllerConfig) -> Self {
        Self::build(options, config, |transport| transport)
    }

    /// A controller whose monitoring sends never complete. Everything else
    /// still lands in `transport`; do not call [`Harness::olap_records`].
    pub fn with_stalled_olap(config: ControllerConfig) -> Self {
        Self::build(RepositoryOptions::default(), config, |transport| {
            Arc::new(StalledOlapTransport { inner: transport })
        })
    }

    fn build(
        options: RepositoryOptions,
        config: ControllerConfig,
        wrap: impl FnOnce(Arc<InMemoryTransport>) -> Arc<dyn Transport>,
    ) -> Self {
        weft_core::init_logging(&LogConfig::for_tests());
        let repo = Arc::new(InMemoryRepository::with_options(options));
        repo.add_tenant(Tenant::new(tenant()).with_scheduler_partition(PARTITION));
        let transport = Arc::new(InMemoryTransport::new());
        let ctx = ServiceContext::new(repo.clone(), wrap(transport.clone()), config);
        let controller = TaskController::new(Arc::clone(&ctx));
        Self {
            repo,
            transport,
            ctx,
            controller,
        }
    }

    pub fn register(&self, workflow: WorkflowDefinition) {
        self.repo
            .register_workflow(&tenant(), workflow)
            .expect("register workflow");
    }

    /// Triggers `workflow` directly through the repository, bypassing
    /// signaling, and returns its first task.
    pub async fn seed(&self, workflow: &str) -> Task {
        let result = self
            .repo
            .trigger_from_workflow_names(
                &tenant(),
                &[WorkflowNameTrigger::new(workflow, serde_json::json!({}))],
            )
            .await
            .expect("seed trigger");
        result.tasks.into_iter().next().expect("seeded task")
    }

    /// Seeds a task and starts it on `worker`.
    pub async fn seed_running(&self, workflow: &str, worker: &str) -> TaskRef {
        let task = self.seed(workflow).await;
        self.repo
            .assign_task(&tenant(), task.task_ref.id, worker, chrono::Utc::now())
            .expect("assign task")
    }

    /// Flushes the publish buffer and returns every monitoring record.
    pub async fn olap_records(&self) -> Vec<OlapRecord> {
        self.ctx.publisher.flush().await.expect("flush publisher");
        self.transport.payloads::<OlapRecord>(&Queue::Olap)
    }

    /// Flushes the publish buffer and returns every task event.
    pub async fn task_events(&self) -> Vec<OlapTaskEvent> {
        self.olap_records()
            .await
            .into_iter()
            .filter_map(|record| match record {
                OlapRecord::TaskEvent(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn scheduler_queue() -> Queue {
        Queue::SchedulerPartition(PARTITION.to_string())
    }
}

/// Transport that never completes a send to the monitoring queue.
struct StalledOlapTransport {
    inner: Arc<InMemoryTransport>,
}

#[async_trait]
impl Transport for StalledOlapTransport {
    async fn send(&self, queue: &Queue, messages: Vec<Message>) -> Result<()> {
        if *queue == Queue::Olap {
            std::future::pending::<()>().await;
        }
        self.inner.send(queue, messages).await
    }

    async fn receive(&self, queue: &Queue, max: usize) -> Result<Vec<Message>> {
        self.inner.receive(queue, max).await
    }
}

/// Repository whose name-based triggers block until the gate opens.
pub struct GatedRepository {
    inner: Arc<InMemoryRepository>,
    gate: Semaphore,
    entered: Semaphore,
}

impl GatedRepository {
    pub fn new(inner: Arc<InMemoryRepository>) -> Self {
        Self {
            inner,
            gate: Semaphore::new(0),
            entered: Semaphore::new(0),
        }
    }

    /// Waits until `n` triggers are blocked on the gate.
    pub async fn wait_entered(&self, n: u32) {
        self.entered
            .acquire_many(n)
            .await
            .expect("entered semaphore")
            .forget();
    }

    /// Lets `n` blocked triggers through.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl TaskRepository for GatedRepository {
    async fn complete_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CompleteTaskOpts],
    ) -> Result<FinalizedTaskResponse> {
        self.inner.complete_tasks(tenant, tasks).await
    }

    async fn fail_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[FailTaskOpts],
    ) -> Result<FailTasksResponse> {
        self.inner.fail_tasks(tenant, tasks).await
    }

    async fn cancel_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[CancelTaskOpts],
    ) -> Result<FinalizedTaskResponse> {
        self.inner.cancel_tasks(tenant, tasks).await
    }

    async fn replay_tasks(&self, tenant: &TenantId, tasks: &[TaskRef]) -> Result<Vec<Task>> {
        self.inner.replay_tasks(tenant, tasks).await
    }

    async fn filter_valid_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[TaskRef],
    ) -> Result<Vec<TaskRef>> {
        self.inner.filter_valid_tasks(tenant, tasks).await
    }

    async fn process_task_timeouts(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<TimeoutResponse> {
        self.inner.process_task_timeouts(tenant, limit).await
    }

    async fn process_task_reassignments(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<ReassignResponse> {
        self.inner.process_task_reassignments(tenant, limit).await
    }

    async fn process_task_retry_queue_items(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<RetryQueueResponse> {
        self.inner.process_task_retry_queue_items(tenant, limit).await
    }

    async fn process_durable_sleeps(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<DurableSleepResponse> {
        self.inner.process_durable_sleeps(tenant, limit).await
    }

    async fn process_batched_queue_item_timeouts(
        &self,
        tenant: &TenantId,
        limit: usize,
    ) -> Result<FailTasksResponse> {
        self.inner
            .process_batched_queue_item_timeouts(tenant, limit)
            .await
    }

    async fn process_user_event_matches(
        &self,
        tenant: &TenantId,
        candidates: &[CandidateEventMatch],
    ) -> Result<EventMatchResults> {
        self.inner.process_user_event_matches(tenant, candidates).await
    }

    async fn process_internal_event_matches(
        &self,
        tenant: &TenantId,
        events: &[InternalTaskEvent],
    ) -> Result<EventMatchResults> {
        self.inner.process_internal_event_matches(tenant, events).await
    }

    async fn trigger_from_events(
        &self,
        tenant: &TenantId,
        events: &[EventRecord],
    ) -> Result<TriggerFromEventsResult> {
        self.inner.trigger_from_events(tenant, events).await
    }

    async fn trigger_from_workflow_names(
        &self,
        tenant: &TenantId,
        triggers: &[WorkflowNameTrigger],
    ) -> Result<TriggerResult> {
        self.entered.add_permits(1);
        self.gate.acquire().await.expect("gate semaphore").forget();
        self.inner.trigger_from_workflow_names(tenant, triggers).await
    }

    async fn evict_expired_idempotency_keys(&self, tenant: &TenantId) -> Result<usize> {
        self.inner.evict_expired_idempotency_keys(tenant).await
    }

    async fn get_dispatcher_ids_for_workers(
        &self,
        tenant: &TenantId,
        worker_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        self.inner
            .get_dispatcher_ids_for_workers(tenant, worker_ids)
            .await
    }

    async fn get_tenant_by_id(&self, tenant: &TenantId) -> Result<Tenant> {
        self.inner.get_tenant_by_id(tenant).await
    }

    async fn list_active_tenants(&self) -> Result<Vec<Tenant>> {
        self.inner.list_active_tenants().await
    }
}
