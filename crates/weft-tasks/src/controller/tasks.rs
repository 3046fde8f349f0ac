//! Worker outcome handlers: completion, failure, cancellation and replay.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use weft_core::{RunExternalId, TenantId};

use super::{TaskController, group_ordered, log_signal_error};
use crate::error::Result;
use crate::events::{InternalTaskEvent, TerminalOutput};
use crate::messages::{
    CancelTasksPayload, FinishedRunCandidate, Message, ReplayTask, ReplayTasksPayload,
    TaskCancellationSignal, TaskCancelledPayload, TaskCompletedPayload, TaskFailedPayload,
    WakeReason,
};
use crate::olap::{OlapEventType, OlapTaskEvent};
use crate::repository::{
    CancelTaskOpts, CompleteTaskOpts, FailTaskOpts, FailTasksResponse, ReleasedTask,
};
use crate::signaler::retry_payload;
use crate::task::TaskRef;
use crate::transport::Queue;

/// Task cancellations per outbound `task-cancelled` message.
pub const CANCEL_BATCH_SIZE: usize = 50;

/// Key under which replayed tasks are grouped.
///
/// Tasks of one workflow run replay together; tasks without a run each get
/// a one-off key of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplayGroupKey {
    /// Tasks of one workflow run.
    Run(RunExternalId),
    /// A single task without a run.
    OneOff(Uuid),
}

/// Groups replay requests by owning run, preserving request order.
#[must_use]
pub fn group_replay_tasks(tasks: &[ReplayTask]) -> Vec<(ReplayGroupKey, Vec<TaskRef>)> {
    group_ordered(tasks.iter().map(|t| {
        let key = t
            .workflow_run_id
            .map_or_else(|| ReplayGroupKey::OneOff(Uuid::new_v4()), ReplayGroupKey::Run);
        (key, t.task.clone())
    }))
}

impl TaskController {
    /// Marks attempts completed, frees their slots and forwards the
    /// resulting internal events.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the write fails.
    #[tracing::instrument(skip(self, payloads), fields(tenant_id = %tenant, count = payloads.len()))]
    pub async fn handle_task_completed(
        &self,
        tenant: &TenantId,
        payloads: Vec<TaskCompletedPayload>,
    ) -> Result<()> {
        let opts: Vec<CompleteTaskOpts> = payloads
            .into_iter()
            .map(|p| CompleteTaskOpts {
                task: p.task,
                output: p.output,
            })
            .collect();

        let response = self.ctx().repository.complete_tasks(tenant, &opts).await?;

        let completed: Vec<OlapTaskEvent> = opts
            .iter()
            .filter(|o| response.released_tasks.iter().any(|r| r.task == o.task))
            .map(|o| {
                OlapTaskEvent::new(o.task.clone(), OlapEventType::Completed).with_payload(
                    TerminalOutput::Completed {
                        output: o.output.clone(),
                    }
                    .to_value(),
                )
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_completed",
            self.signaler().publish_task_events(tenant, completed),
        );

        self.notify_released(tenant, &response.released_tasks).await;
        log_signal_error(
            self.ctx(),
            "internal_events",
            self.signaler()
                .send_internal_events(tenant, response.internal_events)
                .await,
        );
        Ok(())
    }

    /// Records worker-reported failures and routes the outcome through the
    /// shared fail path.
    ///
    /// One `FAILED` monitoring event is emitted per payload, independent of
    /// the repository write.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the write fails.
    #[tracing::instrument(skip(self, payloads), fields(tenant_id = %tenant, count = payloads.len()))]
    pub async fn handle_task_failed(
        &self,
        tenant: &TenantId,
        payloads: Vec<TaskFailedPayload>,
    ) -> Result<()> {
        let failed: Vec<OlapTaskEvent> = payloads
            .iter()
            .map(|p| {
                OlapTaskEvent::new(p.task.clone(), OlapEventType::Failed)
                    .with_message(p.error_message.clone())
                    .with_payload(
                        TerminalOutput::Failed {
                            error_message: p.error_message.clone(),
                        }
                        .to_value(),
                    )
                    .with_worker(p.worker_id.clone())
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_failed",
            self.signaler().publish_task_events(tenant, failed),
        );

        let opts: Vec<FailTaskOpts> = payloads
            .into_iter()
            .map(|p| FailTaskOpts {
                task: p.task,
                error_message: p.error_message,
                is_app_error: p.is_app_error,
                should_not_retry: p.should_not_retry,
            })
            .collect();
        let response = self.ctx().repository.fail_tasks(tenant, &opts).await?;
        self.process_fail_tasks_response(tenant, response).await;
        Ok(())
    }

    /// Shared tail of every failure path (worker failure, timeout,
    /// reassignment, queue timeout).
    ///
    /// Retried tasks get a `RETRYING` event instead of their generic failure
    /// internal event; the remaining internal events go to the match
    /// pipeline; released slots wake the scheduler.
    pub async fn process_fail_tasks_response(&self, tenant: &TenantId, response: FailTasksResponse) {
        let FailTasksResponse {
            finalized,
            retried_tasks,
        } = response;

        let retried_ids: HashSet<i64> = retried_tasks.iter().map(|r| r.task.id).collect();
        let (suppressed, forwarded): (Vec<InternalTaskEvent>, Vec<InternalTaskEvent>) = finalized
            .internal_events
            .into_iter()
            .partition(|event| retried_ids.contains(&event.task_id));

        if !retried_tasks.is_empty() {
            tracing::debug!(
                retried = retried_tasks.len(),
                suppressed = suppressed.len(),
                "re-armed failed tasks"
            );
            self.ctx()
                .metrics
                .record_retries(tenant.as_str(), retried_tasks.len());
        }

        let retrying: Vec<OlapTaskEvent> = retried_tasks
            .iter()
            .map(|retried| {
                let delay_ms = retried.retry_policy.backoff_millis(retried.app_retry_count);
                let message = match delay_ms {
                    Some(ms) => format!("retrying in {}s", format_secs(ms)),
                    None => "retrying immediately".to_string(),
                };
                OlapTaskEvent::new(retried.task.clone(), OlapEventType::Retrying)
                    .with_message(message)
                    .with_payload(retry_payload(retried.app_retry_count, delay_ms))
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_retrying",
            self.signaler().publish_task_events(tenant, retrying),
        );

        log_signal_error(
            self.ctx(),
            "internal_events",
            self.signaler().send_internal_events(tenant, forwarded).await,
        );
        self.notify_released(tenant, &finalized.released_tasks).await;
    }

    /// Cancels attempts, emits one `CANCELLED` event per task and tells the
    /// owning workers' dispatchers to stop them.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the write fails.
    #[tracing::instrument(skip(self, payloads), fields(tenant_id = %tenant, count = payloads.len()))]
    pub async fn handle_task_cancelled(
        &self,
        tenant: &TenantId,
        payloads: Vec<TaskCancelledPayload>,
    ) -> Result<()> {
        let opts: Vec<CancelTaskOpts> = payloads
            .iter()
            .map(|p| CancelTaskOpts {
                task: p.task.clone(),
                reason: p.reason,
            })
            .collect();
        let response = self.ctx().repository.cancel_tasks(tenant, &opts).await?;

        let cancelled: Vec<OlapTaskEvent> = payloads
            .iter()
            .map(|p| {
                OlapTaskEvent::new(p.task.clone(), OlapEventType::Cancelled)
                    .with_message(p.reason.description())
                    .with_payload(
                        TerminalOutput::Cancelled {
                            reason: p.reason.description().to_string(),
                        }
                        .to_value(),
                    )
            })
            .collect();
        log_signal_error(
            self.ctx(),
            "task_cancelled",
            self.signaler().publish_task_events(tenant, cancelled),
        );

        let reasons: HashMap<i64, _> = payloads
            .iter()
            .filter(|p| p.should_notify_worker)
            .map(|p| (p.task.id, p.reason))
            .collect();
        let signals: Vec<(String, TaskCancellationSignal)> = response
            .released_tasks
            .iter()
            .filter_map(|released| {
                let reason = *reasons.get(&released.task.id)?;
                let worker_id = released.worker_id.clone()?;
                Some((
                    worker_id.clone(),
                    TaskCancellationSignal {
                        task: released.task.clone(),
                        worker_id,
                        reason,
                    },
                ))
            })
            .collect();
        self.send_cancellation_signals(tenant, signals).await;

        self.notify_released(tenant, &response.released_tasks).await;
        log_signal_error(
            self.ctx(),
            "internal_events",
            self.signaler()
                .send_internal_events(tenant, response.internal_events)
                .await,
        );
        Ok(())
    }

    /// Fans bulk cancellation requests out as `task-cancelled` messages of at
    /// most [`CANCEL_BATCH_SIZE`] tasks on the task-processing queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the messages cannot be sent.
    #[tracing::instrument(skip(self, payloads), fields(tenant_id = %tenant))]
    pub async fn handle_cancel_tasks(
        &self,
        tenant: &TenantId,
        payloads: Vec<CancelTasksPayload>,
    ) -> Result<()> {
        let cancellations: Vec<TaskCancelledPayload> = payloads
            .into_iter()
            .flat_map(|p| {
                let reason = p.reason;
                p.tasks.into_iter().map(move |task| TaskCancelledPayload {
                    task,
                    reason,
                    should_notify_worker: true,
                })
            })
            .collect();
        if cancellations.is_empty() {
            return Ok(());
        }

        let messages = cancellations
            .chunks(CANCEL_BATCH_SIZE)
            .map(|chunk| Message::new(tenant.clone(), chunk))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            tasks = cancellations.len(),
            batches = messages.len(),
            "fanning out cancellations"
        );
        self.ctx()
            .transport
            .send(&Queue::TaskProcessing, messages)
            .await
    }

    /// Replays tasks, grouped so the tasks of one run replay together.
    ///
    /// Ignored unless replay is enabled.
    ///
    /// # Errors
    ///
    /// Returns the repository error if filtering or a replay write fails.
    #[tracing::instrument(skip(self, payloads), fields(tenant_id = %tenant))]
    pub async fn handle_replay_tasks(
        &self,
        tenant: &TenantId,
        payloads: Vec<ReplayTasksPayload>,
    ) -> Result<()> {
        if !self.ctx().config.replay_enabled {
            tracing::debug!("replay disabled, ignoring replay request");
            return Ok(());
        }

        let requested: Vec<ReplayTask> = payloads.into_iter().flat_map(|p| p.tasks).collect();
        if requested.is_empty() {
            return Ok(());
        }

        let refs: Vec<TaskRef> = requested.iter().map(|r| r.task.clone()).collect();
        let valid: HashMap<i64, TaskRef> = self
            .ctx()
            .repository
            .filter_valid_tasks(tenant, &refs)
            .await?
            .into_iter()
            .map(|task| (task.id, task))
            .collect();

        let replayable: Vec<ReplayTask> = requested
            .into_iter()
            .filter_map(|r| {
                valid.get(&r.task.id).map(|current| ReplayTask {
                    task: current.clone(),
                    workflow_run_id: r.workflow_run_id,
                })
            })
            .collect();
        if replayable.len() < refs.len() {
            tracing::warn!(
                dropped = refs.len() - replayable.len(),
                "skipping replay of unknown tasks"
            );
        }

        for (key, tasks) in group_replay_tasks(&replayable) {
            let replayed = self.ctx().repository.replay_tasks(tenant, &tasks).await?;
            tracing::debug!(group = ?key, count = replayed.len(), "replayed task group");
            log_signal_error(
                self.ctx(),
                "tasks_replayed",
                self.signaler().signal_tasks_updated(tenant, &replayed).await,
            );
        }
        Ok(())
    }

    /// Wakes the scheduler for freed slots and tells the tenant's event
    /// consumer which runs may have finished.
    pub(crate) async fn notify_released(&self, tenant: &TenantId, released: &[ReleasedTask]) {
        if released.is_empty() {
            return;
        }

        let mut queues: Vec<String> = Vec::new();
        for task in released {
            if !queues.contains(&task.queue) {
                queues.push(task.queue.clone());
            }
        }
        let candidates: Vec<FinishedRunCandidate> = released
            .iter()
            .map(|task| FinishedRunCandidate {
                task: task.task.clone(),
                workflow_run_id: task.workflow_run_id,
            })
            .collect();

        let (scheduler, consumer) = futures::join!(
            self.signaler()
                .notify_scheduler(tenant, WakeReason::SlotsReleased, queues, released.len()),
            self.signaler().notify_finished_runs(tenant, &candidates),
        );
        log_signal_error(self.ctx(), "slots_released", scheduler);
        log_signal_error(self.ctx(), "finished_runs", consumer);
    }

    /// Routes cancellation signals to the dispatchers of their workers.
    pub(crate) async fn send_cancellation_signals(
        &self,
        tenant: &TenantId,
        signals: Vec<(String, TaskCancellationSignal)>,
    ) {
        if signals.is_empty() {
            return;
        }

        let by_dispatcher = match self.group_by_dispatcher(tenant, signals).await {
            Ok(grouped) => grouped,
            Err(e) => {
                tracing::error!(error = %e, "failed to resolve dispatchers for cancellation");
                self.ctx().metrics.record_signal_error("task_cancellation");
                return;
            }
        };
        log_signal_error(
            self.ctx(),
            "task_cancellation",
            self.signaler()
                .notify_dispatchers(tenant, by_dispatcher)
                .await,
        );
    }

    /// Groups `(worker_id, payload)` pairs by the worker's dispatcher.
    /// Payloads for workers without a dispatcher are dropped with a warning.
    pub(crate) async fn group_by_dispatcher<P>(
        &self,
        tenant: &TenantId,
        items: Vec<(String, P)>,
    ) -> Result<HashMap<String, Vec<P>>> {
        let mut workers: Vec<String> = items.iter().map(|(w, _)| w.clone()).collect();
        workers.sort();
        workers.dedup();

        let dispatchers = self
            .ctx()
            .repository
            .get_dispatcher_ids_for_workers(tenant, &workers)
            .await?;

        let mut grouped: HashMap<String, Vec<P>> = HashMap::new();
        for (worker_id, payload) in items {
            match dispatchers.get(&worker_id) {
                Some(dispatcher) => grouped.entry(dispatcher.clone()).or_default().push(payload),
                None => tracing::warn!(worker_id = %worker_id, "worker has no dispatcher"),
            }
        }
        Ok(grouped)
    }
}

/// Formats milliseconds as seconds without trailing zeros.
fn format_secs(ms: u64) -> String {
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{}.{:03}", ms / 1000, ms % 1000)
            .trim_end_matches('0')
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use weft_core::TaskExternalId;

    fn replay(run: Option<RunExternalId>, id: i64) -> ReplayTask {
        ReplayTask {
            task: TaskRef::new(id, Utc::now(), 0, TaskExternalId::generate()),
            workflow_run_id: run,
        }
    }

    #[test]
    fn tasks_without_run_get_distinct_groups() {
        let run = RunExternalId::generate();
        let mut tasks: Vec<ReplayTask> = (1..=5).map(|id| replay(Some(run), id)).collect();
        tasks.push(replay(None, 6));
        tasks.push(replay(None, 7));

        let groups = group_replay_tasks(&tasks);
        let sizes: Vec<usize> = groups.iter().map(|(_, t)| t.len()).collect();
        assert_eq!(sizes, vec![5, 1, 1]);
        assert_eq!(groups[0].0, ReplayGroupKey::Run(run));
        assert_ne!(groups[1].0, groups[2].0);
    }

    #[test]
    fn seconds_formatting() {
        assert_eq!(format_secs(4000), "4");
        assert_eq!(format_secs(1500), "1.5");
        assert_eq!(format_secs(250), "0.25");
    }
}
