//! Monitoring and wake-up signaling.
//!
//! [`OlapSignaler`] is the single place where task state transitions turn
//! into (a) monitoring records on the OLAP queue, (b) scheduler wake-ups,
//! (c) internal events for the match pipeline and (d) dispatcher messages.
//!
//! Signaling never reverses a committed repository change. Callers decide
//! whether an error here is logged or returned; it is never retried.
//!
//! ## Bucketing
//!
//! Created, updated and replayed tasks are partitioned by initial state and
//! each non-empty bucket is signaled concurrently by one routine driven by
//! [`STATE_SIGNALS`]:
//!
//! | State | Scheduler wake | Internal event | Monitoring event |
//! |-------|----------------|----------------|------------------|
//! | QUEUED | yes | - | `QUEUED` |
//! | FAILED | - | `FAILED` | `FAILED` |
//! | CANCELLED | - | `CANCELLED` | `CANCELLED` |
//! | SKIPPED | - | `COMPLETED` (skipped) | `SKIPPED` |

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;

use weft_core::{EventExternalId, TenantId};

use crate::context::ServiceContext;
use crate::error::{Error, Result};
use crate::events::{
    CelEvaluationFailure, EventRecord, InternalEventType, InternalTaskEvent, RunRef,
    TerminalOutput,
};
use crate::messages::{
    CheckTenantQueues, FinishedRunCandidate, Message, Payload, WakeReason,
};
use crate::olap::{EventSeen, OlapEventType, OlapRecord, OlapTaskEvent};
use crate::task::{Dag, InitialState, Task};
use crate::transport::Queue;

/// Why a set of tasks is being signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalSource {
    /// Tasks were just created.
    Created,
    /// Existing tasks were updated (replayed).
    Updated,
    /// Tasks were replayed by the match engine.
    ReplayedFromMatch,
}

impl SignalSource {
    const fn queued_message(self) -> &'static str {
        match self {
            Self::Created => "task created",
            Self::Updated => "task replayed",
            Self::ReplayedFromMatch => "task replayed by event match",
        }
    }
}

/// How one initial state is signaled.
#[derive(Clone, Copy)]
pub struct StateSignal {
    /// State the row applies to.
    pub state: InitialState,
    /// Whether the tenant's scheduler partition is woken.
    pub wakes_scheduler: bool,
    /// Builds the monitoring event for one task.
    pub monitoring: fn(&Task, SignalSource) -> OlapTaskEvent,
    /// Builds the internal event for one task, if the state produces one.
    pub internal: Option<fn(&Task) -> InternalTaskEvent>,
}

impl std::fmt::Debug for StateSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSignal")
            .field("state", &self.state)
            .field("wakes_scheduler", &self.wakes_scheduler)
            .field("internal", &self.internal.is_some())
            .finish_non_exhaustive()
    }
}

/// Signal table keyed by initial state.
pub const STATE_SIGNALS: [StateSignal; 4] = [
    StateSignal {
        state: InitialState::Queued,
        wakes_scheduler: true,
        monitoring: queued_event,
        internal: None,
    },
    StateSignal {
        state: InitialState::Failed,
        wakes_scheduler: false,
        monitoring: failed_event,
        internal: Some(failed_internal),
    },
    StateSignal {
        state: InitialState::Cancelled,
        wakes_scheduler: false,
        monitoring: cancelled_event,
        internal: Some(cancelled_internal),
    },
    StateSignal {
        state: InitialState::Skipped,
        wakes_scheduler: false,
        monitoring: skipped_event,
        internal: Some(skipped_internal),
    },
];

fn queued_event(task: &Task, source: SignalSource) -> OlapTaskEvent {
    let message = if task.concurrency_keys.is_empty() {
        source.queued_message().to_string()
    } else {
        format!(
            "{}; concurrency keys: {}",
            source.queued_message(),
            task.concurrency_keys.join(", ")
        )
    };
    OlapTaskEvent::new(task.task_ref.clone(), OlapEventType::Queued).with_message(message)
}

fn failure_reason(task: &Task) -> String {
    task.initial_state_reason
        .clone()
        .unwrap_or_else(|| "task failed".to_string())
}

fn failed_event(task: &Task, _: SignalSource) -> OlapTaskEvent {
    let error_message = failure_reason(task);
    OlapTaskEvent::new(task.task_ref.clone(), OlapEventType::Failed)
        .with_message(error_message.clone())
        .with_payload(TerminalOutput::Failed { error_message }.to_value())
}

fn failed_internal(task: &Task) -> InternalTaskEvent {
    InternalTaskEvent::for_task(
        task.tenant_id.clone(),
        &task.task_ref,
        InternalEventType::Failed,
        TerminalOutput::Failed {
            error_message: failure_reason(task),
        }
        .to_value(),
    )
}

fn cancel_reason(task: &Task) -> String {
    task.initial_state_reason
        .clone()
        .unwrap_or_else(|| "task cancelled".to_string())
}

fn cancelled_event(task: &Task, _: SignalSource) -> OlapTaskEvent {
    let reason = cancel_reason(task);
    OlapTaskEvent::new(task.task_ref.clone(), OlapEventType::Cancelled)
        .with_message(reason.clone())
        .with_payload(TerminalOutput::Cancelled { reason }.to_value())
}

fn cancelled_internal(task: &Task) -> InternalTaskEvent {
    InternalTaskEvent::for_task(
        task.tenant_id.clone(),
        &task.task_ref,
        InternalEventType::Cancelled,
        TerminalOutput::Cancelled {
            reason: cancel_reason(task),
        }
        .to_value(),
    )
}

fn skipped_event(task: &Task, _: SignalSource) -> OlapTaskEvent {
    OlapTaskEvent::new(task.task_ref.clone(), OlapEventType::Skipped)
        .with_message("task skipped")
        .with_payload(TerminalOutput::Skipped { skipped: true }.to_value())
}

fn skipped_internal(task: &Task) -> InternalTaskEvent {
    InternalTaskEvent::for_task(
        task.tenant_id.clone(),
        &task.task_ref,
        InternalEventType::Completed,
        TerminalOutput::Skipped { skipped: true }.to_value(),
    )
}

/// Tasks partitioned by initial state.
#[derive(Debug, Default)]
pub struct StateBuckets<'a> {
    buckets: [Vec<&'a Task>; 4],
}

impl<'a> StateBuckets<'a> {
    /// Puts every task into the bucket of its initial state.
    #[must_use]
    pub fn partition(tasks: &'a [Task]) -> Self {
        let mut buckets = Self::default();
        for task in tasks {
            buckets.buckets[Self::index(task.initial_state)].push(task);
        }
        buckets
    }

    const fn index(state: InitialState) -> usize {
        match state {
            InitialState::Queued => 0,
            InitialState::Failed => 1,
            InitialState::Cancelled => 2,
            InitialState::Skipped => 3,
        }
    }

    /// Returns the bucket for `state`.
    #[must_use]
    pub fn get(&self, state: InitialState) -> &[&'a Task] {
        &self.buckets[Self::index(state)]
    }

    /// Total number of tasks across buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Returns true when every bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts state transitions into monitoring records and notifications.
#[derive(Debug, Clone)]
pub struct OlapSignaler {
    ctx: Arc<ServiceContext>,
}

impl OlapSignaler {
    /// Creates a signaler over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// Signals newly created tasks.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of the per-state routines.
    #[tracing::instrument(skip(self, tasks), fields(tenant_id = %tenant, count = tasks.len()))]
    pub async fn signal_tasks_created(&self, tenant: &TenantId, tasks: &[Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let created: Vec<OlapRecord> = tasks
            .iter()
            .map(|task| OlapRecord::TaskCreated {
                task: Box::new(task.clone()),
            })
            .collect();
        let created = self.publish_olap(tenant, &created);
        let signaled = self.signal_tasks(tenant, tasks, SignalSource::Created).await;
        Error::join(created.err().into_iter().chain(signaled.err()))
    }

    /// Signals tasks whose state was reset, such as replays.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of the per-state routines.
    #[tracing::instrument(skip(self, tasks), fields(tenant_id = %tenant, count = tasks.len()))]
    pub async fn signal_tasks_updated(&self, tenant: &TenantId, tasks: &[Task]) -> Result<()> {
        self.signal_tasks(tenant, tasks, SignalSource::Updated).await
    }

    /// Signals tasks the match engine replayed.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of the per-state routines.
    #[tracing::instrument(skip(self, tasks), fields(tenant_id = %tenant, count = tasks.len()))]
    pub async fn signal_tasks_replayed_from_match(
        &self,
        tenant: &TenantId,
        tasks: &[Task],
    ) -> Result<()> {
        self.signal_tasks(tenant, tasks, SignalSource::ReplayedFromMatch)
            .await
    }

    async fn signal_tasks(
        &self,
        tenant: &TenantId,
        tasks: &[Task],
        source: SignalSource,
    ) -> Result<()> {
        let buckets = StateBuckets::partition(tasks);
        let routines = STATE_SIGNALS.iter().filter_map(|signal| {
            let bucket = buckets.get(signal.state);
            (!bucket.is_empty()).then(|| self.signal_bucket(tenant, signal, bucket, source))
        });

        let errors = join_all(routines).await.into_iter().filter_map(Result::err);
        Error::join(errors)
    }

    async fn signal_bucket(
        &self,
        tenant: &TenantId,
        signal: &StateSignal,
        tasks: &[&Task],
        source: SignalSource,
    ) -> Result<()> {
        let mut errors = Vec::new();

        if signal.wakes_scheduler {
            let queues = unique_queues(tasks.iter().map(|t| t.queue.as_str()));
            if let Err(e) = self
                .notify_scheduler(tenant, WakeReason::TasksCreated, queues, tasks.len())
                .await
            {
                errors.push(e);
            }
        }

        if let Some(build) = signal.internal {
            let events = tasks.iter().map(|task| build(task)).collect();
            if let Err(e) = self.send_internal_events(tenant, events).await {
                errors.push(e);
            }
        }

        let records: Vec<OlapRecord> = tasks
            .iter()
            .map(|task| {
                let event = (signal.monitoring)(task, source).with_worker(task.worker_id.clone());
                OlapRecord::TaskEvent(event)
            })
            .collect();
        if let Err(e) = self.publish_olap(tenant, &records) {
            errors.push(e);
        }

        self.ctx
            .metrics
            .record_signaled(tenant.as_str(), signal.state.as_str(), tasks.len());
        Error::join(errors)
    }

    /// Publishes one monitoring record per DAG.
    ///
    /// A DAG whose record cannot be published is logged and skipped.
    #[tracing::instrument(skip(self, dags), fields(tenant_id = %tenant, count = dags.len()))]
    pub fn signal_dags_created(&self, tenant: &TenantId, dags: &[Dag]) -> Result<()> {
        for dag in dags {
            let record = OlapRecord::DagCreated { dag: dag.clone() };
            if let Err(e) = self.publish_olap(tenant, &[record]) {
                tracing::warn!(dag_id = dag.id, error = %e, "failed to signal created dag");
                self.ctx.metrics.record_signal_error("dag_created");
            }
        }
        Ok(())
    }

    /// Publishes one record per produced run, or one "seen, no runs" record
    /// for an event that triggered nothing.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the records cannot be buffered.
    #[tracing::instrument(skip(self, events, event_runs), fields(tenant_id = %tenant, count = events.len()))]
    pub fn signal_events_created(
        &self,
        tenant: &TenantId,
        events: &[EventRecord],
        event_runs: &HashMap<EventExternalId, Vec<RunRef>>,
    ) -> Result<()> {
        let records = event_seen_records(events, event_runs);
        self.publish_olap(tenant, &records)
    }

    /// Publishes one record per CEL evaluation failure.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the records cannot be buffered.
    pub fn signal_cel_evaluation_failures(
        &self,
        tenant: &TenantId,
        failures: &[CelEvaluationFailure],
    ) -> Result<()> {
        let records: Vec<OlapRecord> = failures
            .iter()
            .cloned()
            .map(OlapRecord::CelEvaluationFailure)
            .collect();
        self.publish_olap(tenant, &records)
    }

    /// Forwards internal task events to match resolution.
    ///
    /// The only way internal events enter the match pipeline. No-op on
    /// empty input.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the events cannot be sent.
    pub async fn send_internal_events(
        &self,
        tenant: &TenantId,
        events: Vec<InternalTaskEvent>,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let message = Message::new(tenant.clone(), &events)?;
        self.ctx
            .transport
            .send(&Queue::TaskProcessing, vec![message])
            .await
    }

    /// Publishes task lifecycle events to the OLAP queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the events cannot be buffered.
    pub fn publish_task_events(
        &self,
        tenant: &TenantId,
        events: Vec<OlapTaskEvent>,
    ) -> Result<()> {
        let records: Vec<OlapRecord> = events.into_iter().map(OlapRecord::TaskEvent).collect();
        self.publish_olap(tenant, &records)
    }

    fn publish_olap(&self, tenant: &TenantId, records: &[OlapRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let message = Message::new(tenant.clone(), records)?;
        self.ctx.publisher.publish(Queue::Olap, message)
    }

    /// Wakes the tenant's scheduler partition.
    ///
    /// Tenants without a scheduler partition are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant cannot be loaded or the wake-up
    /// cannot be sent.
    pub async fn notify_scheduler(
        &self,
        tenant: &TenantId,
        reason: WakeReason,
        queue_names: Vec<String>,
        task_count: usize,
    ) -> Result<()> {
        let tenant_meta = self.ctx.repository.get_tenant_by_id(tenant).await?;
        let Some(partition) = tenant_meta.scheduler_partition_id else {
            tracing::debug!(tenant_id = %tenant, "tenant has no scheduler partition");
            return Ok(());
        };

        let message = Message::single(
            tenant.clone(),
            &CheckTenantQueues {
                reason,
                queue_names,
                task_count,
            },
        )?;
        self.ctx
            .transport
            .send(&Queue::SchedulerPartition(partition), vec![message])
            .await
    }

    /// Tells the tenant's event consumer that runs may have finished.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message cannot be sent.
    pub async fn notify_finished_runs(
        &self,
        tenant: &TenantId,
        candidates: &[FinishedRunCandidate],
    ) -> Result<()> {
        if candidates.is_empty() {
            return Ok(());
        }
        let message = Message::new(tenant.clone(), candidates)?;
        self.ctx
            .transport
            .send(&Queue::TenantEventConsumer(tenant.clone()), vec![message])
            .await
    }

    /// Sends one batched message per dispatcher.
    ///
    /// # Errors
    ///
    /// Returns the combined errors of the dispatchers that could not be
    /// reached; the others are still delivered.
    pub async fn notify_dispatchers<P: Payload + Send + Sync>(
        &self,
        tenant: &TenantId,
        by_dispatcher: HashMap<String, Vec<P>>,
    ) -> Result<()> {
        let sends = by_dispatcher.into_iter().map(|(dispatcher, payloads)| async move {
            let message = Message::new(tenant.clone(), &payloads)?;
            self.ctx
                .transport
                .send(&Queue::Dispatcher(dispatcher), vec![message])
                .await
        });
        let errors = join_all(sends).await.into_iter().filter_map(Result::err);
        Error::join(errors)
    }
}

fn unique_queues<'a>(queues: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for queue in queues {
        if !unique.iter().any(|q| q == queue) {
            unique.push(queue.to_string());
        }
    }
    unique
}

/// Builds the "event seen" records for a batch of ingested events.
#[must_use]
pub fn event_seen_records(
    events: &[EventRecord],
    event_runs: &HashMap<EventExternalId, Vec<RunRef>>,
) -> Vec<OlapRecord> {
    let mut records = Vec::with_capacity(events.len());
    for event in events {
        let seen = |run: Option<RunRef>| {
            OlapRecord::EventSeen(EventSeen {
                event_external_id: event.external_id,
                key: event.key.clone(),
                seen_at: event.seen_at,
                run,
            })
        };

        match event_runs.get(&event.external_id) {
            Some(runs) if !runs.is_empty() => {
                records.extend(runs.iter().cloned().map(|run| seen(Some(run))));
            }
            _ => records.push(seen(None)),
        }
    }
    records
}

/// Monitoring payload attached to `RETRYING` events.
#[must_use]
pub fn retry_payload(app_retry_count: i32, delay_ms: Option<u64>) -> serde_json::Value {
    json!({
        "appRetryCount": app_retry_count,
        "retryDelayMs": delay_ms,
    })
}
