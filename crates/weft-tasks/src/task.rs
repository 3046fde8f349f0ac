//! Task and DAG model.
//!
//! A task attempt is identified by `(id, inserted_at, retry_count)`; the
//! external id stays stable across attempts. At most one attempt of a task
//! owns a worker at any time, which the repository enforces.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::{RunExternalId, TaskExternalId, TenantId};

/// Backoff ceiling used when a retry policy sets a factor but no maximum.
pub const DEFAULT_MAX_BACKOFF_SECS: u32 = 24 * 60 * 60;

/// Identity of one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    /// Repository-assigned task id.
    pub id: i64,
    /// Insertion time, part of the partition key.
    pub inserted_at: DateTime<Utc>,
    /// Attempt number, starting at 0.
    pub retry_count: i32,
    /// Stable external id.
    pub external_id: TaskExternalId,
}

impl TaskRef {
    /// Creates a task reference.
    #[must_use]
    pub fn new(
        id: i64,
        inserted_at: DateTime<Utc>,
        retry_count: i32,
        external_id: TaskExternalId,
    ) -> Self {
        Self {
            id,
            inserted_at,
            retry_count,
            external_id,
        }
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.external_id, self.retry_count)
    }
}

/// State a task is created (or re-created) in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialState {
    /// Ready to be scheduled onto a worker.
    Queued,
    /// Failed before it could run (e.g. invalid input).
    Failed,
    /// Cancelled before it could run.
    Cancelled,
    /// Skipped by a parent condition.
    Skipped,
}

impl InitialState {
    /// Every initial state, in bucket order.
    pub const ALL: [Self; 4] = [Self::Queued, Self::Failed, Self::Cancelled, Self::Skipped];

    /// Returns the wire name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
        }
    }

    /// Returns true for states that end the task without running it.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued)
    }
}

impl fmt::Display for InitialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry backoff configuration of a task.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Exponential backoff base; `None` retries immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_factor: Option<f64>,
    /// Upper bound on the backoff, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<u32>,
}

impl RetryPolicy {
    /// Creates an exponential policy.
    #[must_use]
    pub const fn exponential(backoff_factor: f64, max_backoff_secs: u32) -> Self {
        Self {
            backoff_factor: Some(backoff_factor),
            max_backoff_secs: Some(max_backoff_secs),
        }
    }

    /// Returns the delay before application retry `app_retry_count` becomes
    /// runnable: `min(max_backoff, factor^app_retry_count)` seconds.
    ///
    /// Returns `None` for policies without a backoff factor. Factors below 1
    /// (and NaN) are treated as 1 so the delay never shrinks as retries grow.
    #[must_use]
    pub fn backoff(&self, app_retry_count: i32) -> Option<Duration> {
        let factor = self.backoff_factor?;
        let factor = if factor.is_nan() { 1.0 } else { factor.max(1.0) };
        let max_secs = f64::from(self.max_backoff_secs.unwrap_or(DEFAULT_MAX_BACKOFF_SECS));
        let secs = factor.powi(app_retry_count.max(0)).min(max_secs);
        Some(Duration::from_secs_f64(secs))
    }

    /// Backoff in whole milliseconds, `1000 × min(max_backoff, factor^n)`.
    #[must_use]
    pub fn backoff_millis(&self, app_retry_count: i32) -> Option<u64> {
        self.backoff(app_retry_count)
            .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A task as created or updated by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Attempt identity.
    #[serde(flatten)]
    pub task_ref: TaskRef,
    /// Queue the task is scheduled on.
    pub queue: String,
    /// Action the worker runs.
    pub action_id: String,
    /// State the task was created in.
    pub initial_state: InitialState,
    /// Why the task was created in a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state_reason: Option<String>,
    /// Evaluated concurrency keys.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub concurrency_keys: Vec<String>,
    /// Worker currently running this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Execution timeout of one attempt, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
    /// Retry backoff configuration.
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Maximum number of application retries.
    #[serde(default)]
    pub max_retries: i32,
    /// Application-level retries consumed so far.
    #[serde(default)]
    pub app_retry_count: i32,
    /// Owning workflow run, if the task belongs to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<RunExternalId>,
    /// Owning DAG, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag_id: Option<i64>,
}

impl Task {
    /// Returns the attempt identity.
    #[must_use]
    pub fn task_ref(&self) -> &TaskRef {
        &self.task_ref
    }

    /// Returns the stable external id.
    #[must_use]
    pub fn external_id(&self) -> TaskExternalId {
        self.task_ref.external_id
    }
}

/// A DAG created by one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Repository-assigned id.
    pub id: i64,
    /// Insertion time.
    pub inserted_at: DateTime<Utc>,
    /// External id of the workflow run the DAG represents.
    pub external_id: RunExternalId,
    /// Name of the workflow that produced the DAG.
    pub workflow_name: String,
    /// Number of tasks in the DAG.
    pub task_count: usize,
}

/// Why a task attempt was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    /// A user or API call requested the cancellation.
    CancelledByUser,
    /// A concurrency strategy evicted the task.
    CancelledByConcurrencyLimit,
    /// The task exceeded its scheduling timeout.
    ScheduleTimeout,
    /// The task exceeded its execution timeout.
    Timeout,
}

impl CancelReason {
    /// Human-readable description used in monitoring events.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::CancelledByUser => "cancelled by user",
            Self::CancelledByConcurrencyLimit => "cancelled by concurrency limit",
            Self::ScheduleTimeout => "exceeded schedule timeout",
            Self::Timeout => "exceeded execution timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_wire_names() {
        let json = serde_json::to_string(&InitialState::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
        assert_eq!(InitialState::Skipped.as_str(), "SKIPPED");
        assert!(!InitialState::Queued.is_terminal());
        assert!(InitialState::Failed.is_terminal());
    }

    #[test]
    fn backoff_saturates_at_max() {
        let policy = RetryPolicy::exponential(2.0, 60);
        assert_eq!(policy.backoff(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.backoff(6), Some(Duration::from_secs(60)));
        assert_eq!(policy.backoff(40), Some(Duration::from_secs(60)));
        assert_eq!(policy.backoff_millis(3), Some(8_000));
    }

    #[test]
    fn backoff_without_factor_is_immediate() {
        assert_eq!(RetryPolicy::default().backoff(5), None);
    }

    #[test]
    fn backoff_without_max_uses_default_ceiling() {
        let policy = RetryPolicy {
            backoff_factor: Some(10.0),
            max_backoff_secs: None,
        };
        assert_eq!(
            policy.backoff(9),
            Some(Duration::from_secs(u64::from(DEFAULT_MAX_BACKOFF_SECS)))
        );
    }

    #[test]
    fn fractional_factor_never_shrinks() {
        let policy = RetryPolicy::exponential(0.5, 60);
        assert_eq!(policy.backoff(4), Some(Duration::from_secs(1)));
    }

    #[test]
    fn task_ref_display() {
        let external_id = TaskExternalId::generate();
        let task_ref = TaskRef::new(7, Utc::now(), 2, external_id);
        assert_eq!(task_ref.to_string(), format!("{external_id}#2"));
    }
}
