//! Per-tenant scan-and-mutate operations run by the operation pools, plus
//! the scheduled batched queue-item timeout sweep.

use async_trait::async_trait;

use weft_core::TenantId;

use super::{SCAN_LIMIT, TaskController, log_signal_error};
use crate::error::Result;
use crate::messages::{TaskCancellationSignal, WakeReason};
use crate::olap::{OlapEventType, OlapTaskEvent};
use crate::pool::{OperationKind, TenantOperation};
use crate::task::CancelReason;

/// Binds an [`OperationKind`] to the controller that implements it.
#[derive(Debug, Clone)]
pub struct ControllerOperation {
    kind: OperationKind,
    controller: TaskController,
}

impl ControllerOperation {
    /// Creates the operation of `kind` backed by `controller`.
    #[must_use]
    pub fn new(kind: OperationKind, controller: TaskController) -> Self {
        Self { kind, controller }
    }
}

#[async_trait]
impl TenantOperation for ControllerOperation {
    fn kind(&self) -> OperationKind {
        self.kind
    }

    async fn run(&self, tenant: &TenantId) -> Result<bool> {
        match self.kind {
            OperationKind::Timeout => self.controller.process_task_timeouts(tenant).await,
            OperationKind::Reassignment => {
                self.controller.process_task_reassignments(tenant).await
            }
            OperationKind::Retry => self.controller.process_retry_queue_items(tenant).await,
            OperationKind::DurableSleep => self.controller.process_durable_sleeps(tenant).await,
            OperationKind::IdempotencyEviction => {
                self.controller.evict_idempotency_keys(tenant).await
            }
        }
    }
}

impl TaskController {
    /// Fails attempts past their execution timeout and tells their workers
    /// to stop.
    ///
    /// Returns `true` when more timed-out attempts remain.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the scan fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_task_timeouts(&self, tenant: &TenantId) -> Result<bool> {
        let response = self
            .ctx()
            .repository
            .process_task_timeouts(tenant, SCAN_LIMIT)
            .await?;
        if response.timed_out.is_empty() {
            return Ok(response.should_continue);
        }

        let signals: Vec<(String, TaskCancellationSignal)> = response
            .timed_out
            .iter()
            .filter_map(|timed_out| {
                let worker_id = timed_out.worker_id.clone()?;
                Some((
                    worker_id.clone(),
                    TaskCancellationSignal {
                        task: timed_out.task.clone(),
                        worker_id,
                        reason: CancelReason::Timeout,
                    },
                ))
            })
            .collect();
        self.send_cancellation_signals(tenant, signals).await;

        let events: Vec<OlapTaskEvent> = response
            .timed_out
            .iter()
            .map(|timed_out| {
                OlapTaskEvent::new(timed_out.task.clone(), OlapEventType::TimedOut)
                    .with_message(format!("exceeded timeout of {}s", timed_out.timeout_secs))
                    .with_worker(timed_out.worker_id.clone())
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_timed_out",
            self.signaler().publish_task_events(tenant, events),
        );
        self.ctx()
            .metrics
            .record_timeouts(tenant.as_str(), response.timed_out.len());

        self.process_fail_tasks_response(tenant, response.fail).await;
        Ok(response.should_continue)
    }

    /// Takes attempts away from workers that stopped heartbeating.
    ///
    /// Under-budget attempts are requeued; exhausted ones fail for good.
    /// Returns `true` when more stale attempts remain.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the scan fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_task_reassignments(&self, tenant: &TenantId) -> Result<bool> {
        let response = self
            .ctx()
            .repository
            .process_task_reassignments(tenant, SCAN_LIMIT)
            .await?;

        let reassigned = response.reassigned.iter().map(|task| {
            OlapTaskEvent::new(task.task.clone(), OlapEventType::Reassigned)
                .with_message("reassigned, no heartbeat received")
                .with_worker(Some(task.worker_id.clone()))
        });
        let exhausted = response.failed_exhausted.iter().map(|task| {
            OlapTaskEvent::new(task.task.clone(), OlapEventType::Failed)
                .with_message("max reassignment count reached")
                .with_worker(Some(task.worker_id.clone()))
        });
        let events: Vec<OlapTaskEvent> = reassigned.chain(exhausted).collect();
        log_signal_error(
            self.ctx(),
            "task_reassigned",
            self.signaler().publish_task_events(tenant, events),
        );

        let metrics = &self.ctx().metrics;
        if !response.reassigned.is_empty() {
            metrics.record_reassignments(tenant.as_str(), "reassigned", response.reassigned.len());
        }
        if !response.failed_exhausted.is_empty() {
            metrics.record_reassignments(
                tenant.as_str(),
                "exhausted",
                response.failed_exhausted.len(),
            );
        }

        self.process_fail_tasks_response(tenant, response.fail).await;
        Ok(response.should_continue)
    }

    /// Requeues retries whose backoff elapsed and wakes the scheduler.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the scan fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_retry_queue_items(&self, tenant: &TenantId) -> Result<bool> {
        let response = self
            .ctx()
            .repository
            .process_task_retry_queue_items(tenant, SCAN_LIMIT)
            .await?;
        if response.items.is_empty() {
            return Ok(response.should_continue);
        }

        let events: Vec<OlapTaskEvent> = response
            .items
            .iter()
            .map(|item| {
                OlapTaskEvent::new(item.task.clone(), OlapEventType::Queued)
                    .with_message("re-queued for retry")
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_requeued",
            self.signaler().publish_task_events(tenant, events),
        );

        let mut queues: Vec<String> = response.items.iter().map(|i| i.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        log_signal_error(
            self.ctx(),
            "tasks_requeued",
            self.signaler()
                .notify_scheduler(tenant, WakeReason::TasksCreated, queues, response.items.len())
                .await,
        );
        Ok(response.should_continue)
    }

    /// Wakes elapsed durable sleeps and signals what they unblocked.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the scan fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn process_durable_sleeps(&self, tenant: &TenantId) -> Result<bool> {
        let response = self
            .ctx()
            .repository
            .process_durable_sleeps(tenant, SCAN_LIMIT)
            .await?;
        self.process_match_results(tenant, response.matches).await;
        Ok(response.should_continue)
    }

    /// Removes expired idempotency keys in one sweep. Never asks to run
    /// again immediately.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the sweep fails.
    #[tracing::instrument(skip(self), fields(tenant_id = %tenant))]
    pub async fn evict_idempotency_keys(&self, tenant: &TenantId) -> Result<bool> {
        let evicted = self
            .ctx()
            .repository
            .evict_expired_idempotency_keys(tenant)
            .await?;
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired idempotency keys");
        }
        Ok(false)
    }

    /// Fails queued attempts past their scheduling deadline, for every
    /// active tenant.
    ///
    /// A tenant whose sweep fails is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the tenant listing fails.
    pub async fn run_batched_queue_item_timeouts(&self) -> Result<()> {
        for tenant in self.active_tenant_ids().await? {
            loop {
                let response = match self
                    .ctx()
                    .repository
                    .process_batched_queue_item_timeouts(&tenant, SCAN_LIMIT)
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::error!(tenant_id = %tenant, error = %e, "queue item timeout sweep failed");
                        break;
                    }
                };
                let swept = response.finalized.released_tasks.len();
                if swept == 0 {
                    break;
                }
                tracing::debug!(tenant_id = %tenant, swept, "failed queue items past deadline");
                self.process_fail_tasks_response(&tenant, response).await;
                if swept < SCAN_LIMIT {
                    break;
                }
            }
        }
        Ok(())
    }
}
