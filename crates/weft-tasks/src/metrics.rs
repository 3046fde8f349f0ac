//! Metrics for the task controller.
//!
//! Counters are updated synchronously at the point a state change is
//! observed; there are no background counter tasks.
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `weft_tasks_signaled_total` | Counter | `tenant`, `state` | Tasks signaled by initial state |
//! | `weft_task_retries_total` | Counter | `tenant` | Failed tasks re-armed for retry |
//! | `weft_task_timeouts_total` | Counter | `tenant` | Tasks failed by timeout |
//! | `weft_task_reassignments_total` | Counter | `tenant`, `result` | Reassigned or exhausted tasks |
//! | `weft_trigger_rejections_total` | Counter | `reason` | Shed or no-op triggers |
//! | `weft_trigger_slots_available` | Gauge | - | Free trigger admission slots |
//! | `weft_controller_messages_total` | Counter | `kind`, `result` | Handled inbound batches |
//! | `weft_operation_runs_total` | Counter | `operation`, `result` | Operation pool runs by outcome |
//! | `weft_operation_duration_seconds` | Histogram | `operation` | Operation pool run duration |
//! | `weft_signal_errors_total` | Counter | `signal` | Best-effort signaling failures |
//! | `weft_publisher_dropped_total` | Counter | `queue` | Messages dropped on a full publish buffer |
//!
//! ## Usage
//!
//! ```rust,no_run
//! use weft_tasks::metrics::TaskMetrics;
//!
//! let metrics = TaskMetrics::new();
//! metrics.record_signaled("acme", "QUEUED", 3);
//! metrics.record_trigger_rejection("no_slots");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Tasks signaled by initial state.
    pub const TASKS_SIGNALED_TOTAL: &str = "weft_tasks_signaled_total";
    /// Counter: Failed tasks re-armed for retry.
    pub const TASK_RETRIES_TOTAL: &str = "weft_task_retries_total";
    /// Counter: Tasks failed by execution timeout.
    pub const TASK_TIMEOUTS_TOTAL: &str = "weft_task_timeouts_total";
    /// Counter: Reassignment outcomes.
    pub const TASK_REASSIGNMENTS_TOTAL: &str = "weft_task_reassignments_total";
    /// Counter: Trigger requests shed or turned into no-ops.
    pub const TRIGGER_REJECTIONS_TOTAL: &str = "weft_trigger_rejections_total";
    /// Gauge: Free trigger admission slots.
    pub const TRIGGER_SLOTS_AVAILABLE: &str = "weft_trigger_slots_available";
    /// Counter: Inbound batches handled by the controller.
    pub const CONTROLLER_MESSAGES_TOTAL: &str = "weft_controller_messages_total";
    /// Counter: Operation pool runs by outcome.
    pub const OPERATION_RUNS_TOTAL: &str = "weft_operation_runs_total";
    /// Histogram: Operation pool run duration in seconds.
    pub const OPERATION_DURATION_SECONDS: &str = "weft_operation_duration_seconds";
    /// Counter: Best-effort signaling failures.
    pub const SIGNAL_ERRORS_TOTAL: &str = "weft_signal_errors_total";
    /// Counter: Messages dropped because the publish buffer was full.
    pub const PUBLISHER_DROPPED_TOTAL: &str = "weft_publisher_dropped_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Tenant id.
    pub const TENANT: &str = "tenant";
    /// Task initial state.
    pub const STATE: &str = "state";
    /// Outcome (success, error, reassigned, exhausted).
    pub const RESULT: &str = "result";
    /// Rejection reason (`no_slots`, `resource_exhausted`).
    pub const REASON: &str = "reason";
    /// Inbound message kind.
    pub const KIND: &str = "kind";
    /// Operation pool name.
    pub const OPERATION: &str = "operation";
    /// Signal name.
    pub const SIGNAL: &str = "signal";
    /// Transport queue name.
    pub const QUEUE: &str = "queue";
}

/// Cheap, clonable recorder for task controller metrics.
#[derive(Debug, Clone, Default)]
pub struct TaskMetrics {
    _private: (),
}

impl TaskMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records tasks signaled in a given initial state.
    pub fn record_signaled(&self, tenant: &str, state: &str, count: usize) {
        counter!(
            names::TASKS_SIGNALED_TOTAL,
            labels::TENANT => tenant.to_string(),
            labels::STATE => state.to_string(),
        )
        .increment(count as u64);
    }

    /// Records tasks re-armed for retry.
    pub fn record_retries(&self, tenant: &str, count: usize) {
        counter!(names::TASK_RETRIES_TOTAL, labels::TENANT => tenant.to_string())
            .increment(count as u64);
    }

    /// Records tasks failed by timeout.
    pub fn record_timeouts(&self, tenant: &str, count: usize) {
        counter!(names::TASK_TIMEOUTS_TOTAL, labels::TENANT => tenant.to_string())
            .increment(count as u64);
    }

    /// Records reassignment outcomes (`reassigned` or `exhausted`).
    pub fn record_reassignments(&self, tenant: &str, result: &str, count: usize) {
        counter!(
            names::TASK_REASSIGNMENTS_TOTAL,
            labels::TENANT => tenant.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(count as u64);
    }

    /// Records a trigger that was shed or turned into a no-op.
    pub fn record_trigger_rejection(&self, reason: &str) {
        counter!(names::TRIGGER_REJECTIONS_TOTAL, labels::REASON => reason.to_string())
            .increment(1);
    }

    /// Sets the number of free trigger slots.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_trigger_slots_available(&self, available: usize) {
        gauge!(names::TRIGGER_SLOTS_AVAILABLE).set(available as f64);
    }

    /// Records a handled inbound batch.
    pub fn record_message(&self, kind: &str, result: &str) {
        counter!(
            names::CONTROLLER_MESSAGES_TOTAL,
            labels::KIND => kind.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records the outcome of an operation pool run (`ok`, `error`, `timeout`).
    pub fn record_operation_run(&self, operation: &str, result: &str) {
        counter!(
            names::OPERATION_RUNS_TOTAL,
            labels::OPERATION => operation.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Records how long an operation pool run took.
    pub fn observe_operation_duration(&self, operation: &str, duration: Duration) {
        histogram!(
            names::OPERATION_DURATION_SECONDS,
            labels::OPERATION => operation.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a best-effort signaling failure.
    pub fn record_signal_error(&self, signal: &str) {
        counter!(names::SIGNAL_ERRORS_TOTAL, labels::SIGNAL => signal.to_string()).increment(1);
    }

    /// Records a message dropped by a full publish buffer.
    pub fn record_publisher_drop(&self, queue: &str) {
        counter!(names::PUBLISHER_DROPPED_TOTAL, labels::QUEUE => queue.to_string()).increment(1);
    }
}

/// Calls back with the elapsed time when dropped.
///
/// Operation pools hold one across each tenant run, so the run's duration
/// reaches `weft_operation_duration_seconds` even when the run timeout
/// abandons it.
///
/// ```rust
/// use weft_tasks::metrics::{TaskMetrics, TimingGuard};
///
/// let metrics = TaskMetrics::new();
/// {
///     let _timing = TimingGuard::new(|elapsed| {
///         metrics.observe_operation_duration("timeout", elapsed);
///     });
///     // sweep one tenant
/// }
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a guard that calls `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn recording_without_recorder_is_noop() {
        let metrics = TaskMetrics::new();
        metrics.record_signaled("acme", "QUEUED", 2);
        metrics.record_retries("acme", 1);
        metrics.record_timeouts("acme", 1);
        metrics.record_reassignments("acme", "exhausted", 1);
        metrics.record_trigger_rejection("no_slots");
        metrics.set_trigger_slots_available(4);
        metrics.record_message("task-failed", "ok");
        metrics.record_operation_run("timeout", "ok");
        metrics.observe_operation_duration("timeout", Duration::from_millis(5));
        metrics.record_signal_error("dags_created");
        metrics.record_publisher_drop("olap");
    }

    #[test]
    fn timing_guard_fires_once_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = Arc::clone(&fired);
            let _guard = TimingGuard::new(move |_| fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
