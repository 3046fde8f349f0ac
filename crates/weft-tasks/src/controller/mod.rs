//! Task controller: message handlers and background lifecycle.
//!
//! [`TaskController`] consumes tenant-scoped batches from the
//! task-processing queue and dispatches them by kind:
//!
//! | Kind | Handler |
//! |------|---------|
//! | `task-completed` | [`TaskController::handle_task_completed`] |
//! | `task-failed` | [`TaskController::handle_task_failed`] |
//! | `task-cancelled` | [`TaskController::handle_task_cancelled`] |
//! | `cancel-tasks` | [`TaskController::handle_cancel_tasks`] |
//! | `replay-tasks` | [`TaskController::handle_replay_tasks`] |
//! | `user-event` | [`TaskController::handle_process_user_events`] |
//! | `internal-event` | [`TaskController::handle_process_internal_events`] |
//! | `task-trigger` | [`TaskController::handle_task_trigger`] |
//!
//! Repository failures are fatal to the batch and propagate. Signaling
//! failures are logged and never undo a committed transition.
//!
//! [`TaskController::start`] spawns the operation pools, the scheduled
//! maintenance jobs and the consumer loop under one cancellation token and
//! returns a [`ControllerHandle`] used to shut them down.

mod events;
mod maintenance;
mod tasks;

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use weft_core::TenantId;

use crate::context::ServiceContext;
use crate::error::Result;
use crate::messages::{Message, MessageKind};
use crate::pool::{OperationKind, OperationPool, TenantOperation};
use crate::signaler::OlapSignaler;
use crate::transport::Queue;
use crate::trigger::TriggerWriter;

pub use maintenance::ControllerOperation;
pub use tasks::{CANCEL_BATCH_SIZE, ReplayGroupKey, group_replay_tasks};

/// Maximum rows a single scan-and-mutate call may touch.
pub const SCAN_LIMIT: usize = 1000;

struct Inner {
    ctx: Arc<ServiceContext>,
    signaler: OlapSignaler,
    trigger: TriggerWriter,
}

/// Message-driven task lifecycle controller.
///
/// Cheap to clone; clones share the same context, signaler and trigger
/// writer.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskController")
            .field("trigger_slots", &self.inner.trigger.available_slots())
            .finish_non_exhaustive()
    }
}

impl TaskController {
    /// Creates a controller over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        let signaler = OlapSignaler::new(Arc::clone(&ctx));
        let trigger = TriggerWriter::new(Arc::clone(&ctx), signaler.clone());
        Self {
            inner: Arc::new(Inner {
                ctx,
                signaler,
                trigger,
            }),
        }
    }

    /// Shared context.
    #[must_use]
    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.inner.ctx
    }

    /// Signaler used by every handler.
    #[must_use]
    pub fn signaler(&self) -> &OlapSignaler {
        &self.inner.signaler
    }

    /// Trigger writer used by event and trigger handlers.
    #[must_use]
    pub fn trigger_writer(&self) -> &TriggerWriter {
        &self.inner.trigger
    }

    fn ctx(&self) -> &ServiceContext {
        &self.inner.ctx
    }

    /// Handles one inbound batch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownMessageKind`] for kinds the controller does not
    /// handle, [`crate::Error::Serialization`] for undecodable payloads, and any
    /// repository error raised by the handler.
    #[tracing::instrument(
        skip(self, message),
        fields(tenant_id = %message.tenant_id, kind = %message.kind, count = message.payloads.len())
    )]
    pub async fn handle_batch(&self, message: &Message) -> Result<()> {
        let kind = match message.inbound_kind() {
            Ok(kind) => kind,
            Err(e) => {
                self.ctx().metrics.record_message(&message.kind, "unknown");
                return Err(e);
            }
        };

        let tenant = &message.tenant_id;
        let result = match kind {
            MessageKind::TaskCompleted => {
                self.handle_task_completed(tenant, message.decode()?).await
            }
            MessageKind::TaskFailed => self.handle_task_failed(tenant, message.decode()?).await,
            MessageKind::TaskCancelled => {
                self.handle_task_cancelled(tenant, message.decode()?).await
            }
            MessageKind::CancelTasks => self.handle_cancel_tasks(tenant, message.decode()?).await,
            MessageKind::ReplayTasks => self.handle_replay_tasks(tenant, message.decode()?).await,
            MessageKind::UserEvent => {
                self.handle_process_user_events(tenant, message.decode()?)
                    .await
            }
            MessageKind::InternalEvent => {
                self.handle_process_internal_events(tenant, message.decode()?)
                    .await
            }
            MessageKind::TaskTrigger => self.handle_task_trigger(tenant, message.decode()?).await,
        };

        let outcome = if result.is_ok() { "ok" } else { "error" };
        self.ctx().metrics.record_message(kind.as_str(), outcome);
        result
    }

    /// Starts background work: the five operation pools, the scheduled
    /// maintenance jobs and the task-processing consumer.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the initial tenant listing fails.
    pub async fn start(&self) -> Result<ControllerHandle> {
        let token = CancellationToken::new();
        let config = &self.ctx().config;

        let pools: Vec<Arc<OperationPool<dyn TenantOperation>>> = OperationKind::ALL
            .into_iter()
            .map(|kind| {
                let operation: Arc<dyn TenantOperation> =
                    Arc::new(ControllerOperation::new(kind, self.clone()));
                Arc::new(OperationPool::new(
                    operation,
                    config.pool(kind),
                    self.ctx().metrics.clone(),
                    token.child_token(),
                ))
            })
            .collect();

        let tenants = self.active_tenant_ids().await?;
        for pool in &pools {
            pool.set_tenants(&tenants);
        }

        let mut tasks = Vec::new();
        {
            let controller = self.clone();
            let pools = pools.clone();
            tasks.push(spawn_scheduled(
                "tenant_refresh",
                config.maintenance_interval,
                token.child_token(),
                move || {
                    let controller = controller.clone();
                    let pools = pools.clone();
                    async move {
                        let tenants = controller.active_tenant_ids().await?;
                        for pool in &pools {
                            pool.set_tenants(&tenants);
                        }
                        Ok(())
                    }
                },
            ));
        }
        {
            let controller = self.clone();
            tasks.push(spawn_scheduled(
                "batched_queue_item_timeouts",
                config.maintenance_interval,
                token.child_token(),
                move || {
                    let controller = controller.clone();
                    async move { controller.run_batched_queue_item_timeouts().await }
                },
            ));
        }
        tasks.push(tokio::spawn(
            self.clone().run_consumer(token.child_token()),
        ));

        tracing::info!(tenants = tenants.len(), "task controller started");
        Ok(ControllerHandle {
            token,
            pools,
            tasks,
            ctx: Arc::clone(&self.inner.ctx),
        })
    }

    async fn active_tenant_ids(&self) -> Result<Vec<TenantId>> {
        Ok(self
            .ctx()
            .repository
            .list_active_tenants()
            .await?
            .into_iter()
            .map(|tenant| tenant.id)
            .collect())
    }

    async fn run_consumer(self, token: CancellationToken) {
        let queue = Queue::TaskProcessing;
        let batch_size = self.ctx().config.consumer_batch_size;
        let poll_interval = self.ctx().config.consumer_poll_interval;

        while !token.is_cancelled() {
            let backoff = match self.ctx().transport.receive(&queue, batch_size).await {
                Ok(messages) if messages.is_empty() => true,
                Ok(messages) => self.consume(&queue, messages).await,
                Err(e) => {
                    tracing::error!(error = %e, "failed to receive from task processing queue");
                    true
                }
            };

            if backoff {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
        tracing::debug!("task processing consumer stopped");
    }

    /// Handles received messages, requeueing retryable failures. Returns
    /// true when the consumer should pause before polling again.
    async fn consume(&self, queue: &Queue, messages: Vec<Message>) -> bool {
        let mut requeue = Vec::new();
        for message in messages {
            match self.handle_batch(&message).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(message_id = %message.id, error = %e, "requeueing failed batch");
                    requeue.push(message);
                }
                Err(e) if e.is_admission_rejection() => {
                    tracing::warn!(message_id = %message.id, error = %e, "dropping shed batch");
                }
                Err(e) => {
                    tracing::error!(message_id = %message.id, error = %e, "dropping failed batch");
                }
            }
        }

        if requeue.is_empty() {
            return false;
        }
        if let Err(e) = self.ctx().transport.send(queue, requeue).await {
            tracing::error!(error = %e, "failed to requeue batches");
        }
        true
    }
}

fn spawn_scheduled<F, Fut>(
    name: &'static str,
    interval: Duration,
    token: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        tracing::error!(job = name, error = %e, "scheduled job failed");
                    }
                }
            }
        }
    })
}

/// Handle to a started controller's background work.
pub struct ControllerHandle {
    token: CancellationToken,
    pools: Vec<Arc<OperationPool<dyn TenantOperation>>>,
    tasks: Vec<JoinHandle<()>>,
    ctx: Arc<ServiceContext>,
}

impl std::fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("cancelled", &self.token.is_cancelled())
            .field("pools", &self.pools.len())
            .finish_non_exhaustive()
    }
}

impl ControllerHandle {
    /// Token shared by all background work.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tenants the given pool currently runs for.
    #[must_use]
    pub fn pool_tenants(&self, kind: OperationKind) -> Vec<TenantId> {
        self.pools
            .iter()
            .find(|pool| pool.kind() == kind)
            .map(|pool| pool.tenants())
            .unwrap_or_default()
    }

    /// Stops background work, waits for in-flight runs and the current
    /// batch, then drains the monitoring buffer.
    ///
    /// # Errors
    ///
    /// Returns the publisher's error if the final drain fails.
    pub async fn shutdown(self) -> Result<()> {
        self.token.cancel();

        for pool in &self.pools {
            pool.shutdown().await;
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "controller task panicked");
            }
        }

        let drained = self.ctx.publisher.shutdown().await;
        tracing::info!("task controller stopped");
        drained.map_err(|e| {
            tracing::warn!(error = %e, "monitoring records lost during shutdown");
            e
        })
    }
}

/// Logs a best-effort signaling failure.
fn log_signal_error(ctx: &ServiceContext, signal: &'static str, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!(signal, error = %e, "signaling failed");
        ctx.metrics.record_signal_error(signal);
    }
}

/// Groups items by key, preserving first-seen order of keys and items.
fn group_ordered<K, V>(items: impl IntoIterator<Item = (K, V)>) -> Vec<(K, Vec<V>)>
where
    K: Eq + Hash + Clone,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, Vec<V>)> = Vec::new();
    for (key, value) in items {
        match index.get(&key) {
            Some(&i) => groups[i].1.push(value),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![value]));
            }
        }
    }
    groups
}
