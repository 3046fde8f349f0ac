//! Event ingestion: trigger resolution and match resolution.

use weft_core::TenantId;

use super::{TaskController, log_signal_error};
use crate::error::{Error, Result};
use crate::events::{
    CandidateEventMatch, EventMatchResults, EventRecord, InternalTaskEvent, SatisfiedCallback,
};
use crate::messages::{DurableCallbackCompleted, WorkflowNameTrigger};

impl TaskController {
    /// Resolves a batch of user events.
    ///
    /// Trigger resolution and match resolution run concurrently; neither
    /// waits for the other and both errors are reported.
    ///
    /// # Errors
    ///
    /// Returns the failure of either sub-flow, or both combined.
    #[tracing::instrument(skip(self, events), fields(tenant_id = %tenant, count = events.len()))]
    pub async fn handle_process_user_events(
        &self,
        tenant: &TenantId,
        events: Vec<EventRecord>,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let candidates: Vec<CandidateEventMatch> =
            events.iter().map(EventRecord::to_candidate).collect();

        let (triggered, matched) = futures::join!(
            self.trigger_writer().trigger_from_events(tenant, &events),
            self.resolve_user_matches(tenant, &candidates),
        );
        Error::join(triggered.err().into_iter().chain(matched.err()))
    }

    /// Resolves a batch of internal task events.
    ///
    /// Every event goes to match resolution. Events that carry a user-facing
    /// key are also offered to trigger resolution.
    ///
    /// # Errors
    ///
    /// Returns the failure of either sub-flow, or both combined.
    #[tracing::instrument(skip(self, events), fields(tenant_id = %tenant, count = events.len()))]
    pub async fn handle_process_internal_events(
        &self,
        tenant: &TenantId,
        events: Vec<InternalTaskEvent>,
    ) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let keyed: Vec<EventRecord> = events
            .iter()
            .filter_map(|event| {
                let key = event.event_key.as_ref()?;
                let mut record = EventRecord::new(key.clone(), event.data.clone());
                record.seen_at = event.event_timestamp;
                Some(record)
            })
            .collect();

        let trigger = async {
            if keyed.is_empty() {
                return Ok(());
            }
            self.trigger_writer()
                .trigger_from_events(tenant, &keyed)
                .await
                .map(|_| ())
        };
        let (triggered, matched) =
            futures::join!(trigger, self.resolve_internal_matches(tenant, &events));
        Error::join(triggered.err().into_iter().chain(matched.err()))
    }

    /// Creates runs from `task-trigger` messages.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NoTriggerSlots`] when admission is exhausted,
    /// or the repository error if the write fails.
    pub async fn handle_task_trigger(
        &self,
        tenant: &TenantId,
        triggers: Vec<WorkflowNameTrigger>,
    ) -> Result<()> {
        if triggers.is_empty() {
            return Ok(());
        }
        let result = self
            .trigger_writer()
            .trigger_from_workflow_names(tenant, &triggers)
            .await?;
        tracing::debug!(
            tenant_id = %tenant,
            tasks = result.tasks.len(),
            dags = result.dags.len(),
            "triggered workflows by name"
        );
        Ok(())
    }

    async fn resolve_user_matches(
        &self,
        tenant: &TenantId,
        candidates: &[CandidateEventMatch],
    ) -> Result<()> {
        let results = self
            .ctx()
            .repository
            .process_user_event_matches(tenant, candidates)
            .await?;
        self.process_match_results(tenant, results).await;
        Ok(())
    }

    async fn resolve_internal_matches(
        &self,
        tenant: &TenantId,
        events: &[InternalTaskEvent],
    ) -> Result<()> {
        let results = self
            .ctx()
            .repository
            .process_internal_event_matches(tenant, events)
            .await?;
        self.process_match_results(tenant, results).await;
        Ok(())
    }

    /// Signals what a match resolution produced.
    pub(crate) async fn process_match_results(
        &self,
        tenant: &TenantId,
        results: EventMatchResults,
    ) {
        if results.is_empty() {
            return;
        }
        let (created, replayed) = futures::join!(
            self.signaler()
                .signal_tasks_created(tenant, &results.created_tasks),
            self.signaler()
                .signal_tasks_replayed_from_match(tenant, &results.replayed_tasks),
        );
        log_signal_error(self.ctx(), "tasks_created", created);
        log_signal_error(self.ctx(), "tasks_replayed", replayed);

        self.process_satisfied_callbacks(tenant, results.satisfied_callbacks)
            .await;
    }

    /// Delivers one "durable callback completed" message per satisfied
    /// callback, batched per dispatcher.
    ///
    /// Best-effort: resolution is idempotent downstream, so failures are
    /// only logged.
    pub async fn process_satisfied_callbacks(
        &self,
        tenant: &TenantId,
        callbacks: Vec<SatisfiedCallback>,
    ) {
        if callbacks.is_empty() {
            return;
        }

        let completions: Vec<(String, DurableCallbackCompleted)> = callbacks
            .into_iter()
            .map(|callback| {
                (
                    callback.worker_id.clone(),
                    DurableCallbackCompleted {
                        task_external_id: callback.task_external_id,
                        node_id: callback.node_id,
                        worker_id: callback.worker_id,
                        payload: callback.data,
                    },
                )
            })
            .collect();

        let by_dispatcher = match self.group_by_dispatcher(tenant, completions).await {
            Ok(grouped) => grouped,
            Err(e) => {
                tracing::error!(tenant_id = %tenant, error = %e, "failed to resolve dispatchers for callbacks");
                self.ctx().metrics.record_signal_error("durable_callbacks");
                return;
            }
        };
        log_signal_error(
            self.ctx(),
            "durable_callbacks",
            self.signaler()
                .notify_dispatchers(tenant, by_dispatcher)
                .await,
        );
    }
}
