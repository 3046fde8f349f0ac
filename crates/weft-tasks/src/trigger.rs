//! Trigger writer with admission control.
//!
//! Event- and name-based triggers are turned into tasks and DAGs through the
//! repository, then fanned out to the signaler. An optional fixed pool of
//! slots bounds how many trigger writes run at once. Acquisition never
//! waits: when every slot is taken the call fails with
//! [`Error::NoTriggerSlots`] and the caller decides when to retry.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use weft_core::TenantId;

use crate::context::ServiceContext;
use crate::error::{Error, Result};
use crate::events::{EventRecord, TriggerFromEventsResult, TriggerResult};
use crate::messages::WorkflowNameTrigger;
use crate::signaler::OlapSignaler;

/// Writes triggers under bounded admission.
#[derive(Debug, Clone)]
pub struct TriggerWriter {
    ctx: Arc<ServiceContext>,
    signaler: OlapSignaler,
    slots: Option<Arc<Semaphore>>,
    capacity: usize,
}

impl TriggerWriter {
    /// Creates a writer with `ctx.config.trigger_slots` slots (0 = unlimited).
    #[must_use]
    pub fn new(ctx: Arc<ServiceContext>, signaler: OlapSignaler) -> Self {
        let capacity = ctx.config.trigger_slots;
        let slots = (capacity > 0).then(|| Arc::new(Semaphore::new(capacity)));
        Self {
            ctx,
            signaler,
            slots,
            capacity,
        }
    }

    /// Remaining slots, or `None` when admission is unlimited.
    #[must_use]
    pub fn available_slots(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.available_permits())
    }

    fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(slots) = &self.slots else {
            return Ok(None);
        };

        match Arc::clone(slots).try_acquire_owned() {
            Ok(permit) => {
                self.ctx
                    .metrics
                    .set_trigger_slots_available(slots.available_permits());
                Ok(Some(permit))
            }
            Err(_) => {
                self.ctx.metrics.record_trigger_rejection("no_slots");
                Err(Error::NoTriggerSlots {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Creates runs for workflows listening to `events`.
    ///
    /// A tenant over its resource limits is a logged no-op returning an
    /// empty result. Signaling failures are logged and never fail the
    /// trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoTriggerSlots`] when admission is exhausted, or the
    /// repository error if the write fails.
    #[tracing::instrument(skip(self, events), fields(tenant_id = %tenant, count = events.len()))]
    pub async fn trigger_from_events(
        &self,
        tenant: &TenantId,
        events: &[EventRecord],
    ) -> Result<TriggerFromEventsResult> {
        let _slot = self.acquire()?;

        let result = match self.ctx.repository.trigger_from_events(tenant, events).await {
            Ok(result) => result,
            Err(e @ Error::ResourceExhausted { .. }) => {
                tracing::warn!(error = %e, "dropping event trigger");
                self.ctx.metrics.record_trigger_rejection("resource_exhausted");
                return Ok(TriggerFromEventsResult::default());
            }
            Err(e) => return Err(e),
        };

        self.log_signal(
            "events_created",
            self.signaler
                .signal_events_created(tenant, &result.events, &result.event_runs),
        );
        self.log_signal(
            "cel_evaluation_failures",
            self.signaler
                .signal_cel_evaluation_failures(tenant, &result.cel_evaluation_failures),
        );
        self.log_signal(
            "dags_created",
            self.signaler.signal_dags_created(tenant, &result.dags),
        );
        let tasks_created = self.signaler.signal_tasks_created(tenant, &result.tasks).await;
        self.log_signal("tasks_created", tasks_created);

        tracing::debug!(
            tasks = result.tasks.len(),
            dags = result.dags.len(),
            "triggered runs from events"
        );
        Ok(result)
    }

    /// Creates runs for workflows by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoTriggerSlots`] when admission is exhausted, or the
    /// repository error if the write fails.
    #[tracing::instrument(skip(self, triggers), fields(tenant_id = %tenant, count = triggers.len()))]
    pub async fn trigger_from_workflow_names(
        &self,
        tenant: &TenantId,
        triggers: &[WorkflowNameTrigger],
    ) -> Result<TriggerResult> {
        let _slot = self.acquire()?;

        let result = match self
            .ctx
            .repository
            .trigger_from_workflow_names(tenant, triggers)
            .await
        {
            Ok(result) => result,
            Err(e @ Error::ResourceExhausted { .. }) => {
                tracing::warn!(error = %e, "dropping workflow trigger");
                self.ctx.metrics.record_trigger_rejection("resource_exhausted");
                return Ok(TriggerResult::default());
            }
            Err(e) => return Err(e),
        };

        self.log_signal(
            "dags_created",
            self.signaler.signal_dags_created(tenant, &result.dags),
        );
        let tasks_created = self.signaler.signal_tasks_created(tenant, &result.tasks).await;
        self.log_signal("tasks_created", tasks_created);

        Ok(result)
    }

    fn log_signal(&self, signal: &str, result: Result<()>) {
        if let Err(e) = result {
            tracing::error!(signal, error = %e, "failed to signal trigger results");
            self.ctx.metrics.record_signal_error(signal);
        }
    }
}
