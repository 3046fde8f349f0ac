//! Controller configuration.
//!
//! Defaults are suitable for a single controller process. Every value can be
//! overridden through `WEFT_*` environment variables; malformed values are
//! rejected instead of falling back to defaults.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::pool::OperationKind;

const ENV_TRIGGER_SLOTS: &str = "WEFT_TRIGGER_SLOTS";
const ENV_REPLAY_ENABLED: &str = "WEFT_REPLAY_ENABLED";
const ENV_POOL_JITTER_MS: &str = "WEFT_POOL_JITTER_MS";
const ENV_POOL_RUN_TIMEOUT_SECS: &str = "WEFT_POOL_RUN_TIMEOUT_SECS";
const ENV_OLAP_MAX_BATCH: &str = "WEFT_OLAP_MAX_BATCH";
const ENV_OLAP_FLUSH_INTERVAL_MS: &str = "WEFT_OLAP_FLUSH_INTERVAL_MS";
const ENV_MAINTENANCE_INTERVAL_SECS: &str = "WEFT_MAINTENANCE_INTERVAL_SECS";
const ENV_CONSUMER_BATCH_SIZE: &str = "WEFT_CONSUMER_BATCH_SIZE";
const ENV_CONSUMER_POLL_INTERVAL_MS: &str = "WEFT_CONSUMER_POLL_INTERVAL_MS";

const DEFAULT_POOL_JITTER_MS: u64 = 500;
const DEFAULT_POOL_RUN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OLAP_MAX_BATCH: u64 = 100;
const DEFAULT_OLAP_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 10;
const DEFAULT_CONSUMER_BATCH_SIZE: u64 = 100;
const DEFAULT_CONSUMER_POLL_INTERVAL_MS: u64 = 50;

/// Scheduling parameters of one operation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Base interval between runs for one tenant.
    pub interval: Duration,
    /// Maximum random deviation applied to each interval.
    pub jitter: Duration,
    /// Upper bound on a single run.
    pub run_timeout: Duration,
}

impl PoolConfig {
    /// Creates a pool config with default jitter and run timeout.
    #[must_use]
    pub const fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            jitter: Duration::from_millis(DEFAULT_POOL_JITTER_MS),
            run_timeout: Duration::from_secs(DEFAULT_POOL_RUN_TIMEOUT_SECS),
        }
    }
}

/// Configuration for the task controller and its background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Trigger admission slots; 0 means unlimited.
    pub trigger_slots: usize,
    /// Whether `ReplayTasks` messages are processed.
    pub replay_enabled: bool,
    /// Timeout detection pool.
    pub timeout_pool: PoolConfig,
    /// Reassignment pool.
    pub reassignment_pool: PoolConfig,
    /// Retry queue pool.
    pub retry_pool: PoolConfig,
    /// Durable sleep pool.
    pub durable_sleep_pool: PoolConfig,
    /// Idempotency key eviction pool.
    pub idempotency_pool: PoolConfig,
    /// Flush the monitoring buffer once this many messages are pending.
    pub olap_max_batch: usize,
    /// Flush the monitoring buffer at least this often.
    pub olap_flush_interval: Duration,
    /// Interval of the scheduled maintenance jobs.
    pub maintenance_interval: Duration,
    /// Maximum messages taken from the task-processing queue per poll.
    pub consumer_batch_size: usize,
    /// Wait between polls when the task-processing queue is empty.
    pub consumer_poll_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            trigger_slots: 0,
            replay_enabled: true,
            timeout_pool: PoolConfig::with_interval(OperationKind::Timeout.default_interval()),
            reassignment_pool: PoolConfig::with_interval(
                OperationKind::Reassignment.default_interval(),
            ),
            retry_pool: PoolConfig::with_interval(OperationKind::Retry.default_interval()),
            durable_sleep_pool: PoolConfig::with_interval(
                OperationKind::DurableSleep.default_interval(),
            ),
            idempotency_pool: PoolConfig::with_interval(
                OperationKind::IdempotencyEviction.default_interval(),
            ),
            olap_max_batch: usize_from(DEFAULT_OLAP_MAX_BATCH),
            olap_flush_interval: Duration::from_millis(DEFAULT_OLAP_FLUSH_INTERVAL_MS),
            maintenance_interval: Duration::from_secs(DEFAULT_MAINTENANCE_INTERVAL_SECS),
            consumer_batch_size: usize_from(DEFAULT_CONSUMER_BATCH_SIZE),
            consumer_poll_interval: Duration::from_millis(DEFAULT_CONSUMER_POLL_INTERVAL_MS),
        }
    }
}

impl ControllerConfig {
    /// Loads config from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is malformed.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads config with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is not a valid integer or
    /// boolean, or when a value that must be positive is zero.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let trigger_slots = usize_from(parse_u64_env(
            &get_env,
            ENV_TRIGGER_SLOTS,
            defaults.trigger_slots as u64,
        )?);
        let replay_enabled = parse_bool_env(&get_env, ENV_REPLAY_ENABLED, defaults.replay_enabled)?;

        let jitter = Duration::from_millis(parse_u64_env(
            &get_env,
            ENV_POOL_JITTER_MS,
            DEFAULT_POOL_JITTER_MS,
        )?);
        let run_timeout = Duration::from_secs(parse_positive_u64_env(
            &get_env,
            ENV_POOL_RUN_TIMEOUT_SECS,
            DEFAULT_POOL_RUN_TIMEOUT_SECS,
        )?);

        let pool = |kind: OperationKind| -> Result<PoolConfig> {
            let key = format!("WEFT_{}_INTERVAL_MS", kind.env_name());
            let default_ms = u64::try_from(kind.default_interval().as_millis()).unwrap_or(u64::MAX);
            let interval_ms = parse_positive_u64_env(&get_env, &key, default_ms)?;
            Ok(PoolConfig {
                interval: Duration::from_millis(interval_ms),
                jitter,
                run_timeout,
            })
        };

        Ok(Self {
            trigger_slots,
            replay_enabled,
            timeout_pool: pool(OperationKind::Timeout)?,
            reassignment_pool: pool(OperationKind::Reassignment)?,
            retry_pool: pool(OperationKind::Retry)?,
            durable_sleep_pool: pool(OperationKind::DurableSleep)?,
            idempotency_pool: pool(OperationKind::IdempotencyEviction)?,
            olap_max_batch: usize_from(parse_positive_u64_env(
                &get_env,
                ENV_OLAP_MAX_BATCH,
                DEFAULT_OLAP_MAX_BATCH,
            )?),
            olap_flush_interval: Duration::from_millis(parse_positive_u64_env(
                &get_env,
                ENV_OLAP_FLUSH_INTERVAL_MS,
                DEFAULT_OLAP_FLUSH_INTERVAL_MS,
            )?),
            maintenance_interval: Duration::from_secs(parse_positive_u64_env(
                &get_env,
                ENV_MAINTENANCE_INTERVAL_SECS,
                DEFAULT_MAINTENANCE_INTERVAL_SECS,
            )?),
            consumer_batch_size: usize_from(parse_positive_u64_env(
                &get_env,
                ENV_CONSUMER_BATCH_SIZE,
                DEFAULT_CONSUMER_BATCH_SIZE,
            )?),
            consumer_poll_interval: Duration::from_millis(parse_positive_u64_env(
                &get_env,
                ENV_CONSUMER_POLL_INTERVAL_MS,
                DEFAULT_CONSUMER_POLL_INTERVAL_MS,
            )?),
        })
    }

    /// Returns the pool config for `kind`.
    #[must_use]
    pub const fn pool(&self, kind: OperationKind) -> PoolConfig {
        match kind {
            OperationKind::Timeout => self.timeout_pool,
            OperationKind::Reassignment => self.reassignment_pool,
            OperationKind::Retry => self.retry_pool,
            OperationKind::DurableSleep => self.durable_sleep_pool,
            OperationKind::IdempotencyEviction => self.idempotency_pool,
        }
    }
}

fn usize_from(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    raw.trim()
        .parse::<u64>()
        .map_err(|_| Error::configuration(format!("{key} must be an integer, got '{raw}'")))
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = parse_u64_env(get_env, key, default)?;
    if parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_bool_env<F>(get_env: &F, key: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{key} must be a boolean, got '{raw}'"
        ))),
    }
}
