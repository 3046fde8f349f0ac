//! Per-tenant periodic operation pools.
//!
//! An [`OperationPool`] runs one [`TenantOperation`] for every tenant it is
//! given, each tenant on its own loop:
//!
//! ```text
//! ┌─ run (bounded by run_timeout) ─┐
//! │  more work? ── yes ──► run again immediately
//! │      │ no / error / timeout
//! │      ▼
//! └─ sleep interval ± jitter ──────┘
//! ```
//!
//! At most one run per tenant is in flight. Cancelling the pool stops loops
//! between runs; an in-flight run is allowed to finish.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use weft_core::{TenantId, controller_span};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::metrics::{TaskMetrics, TimingGuard};

/// The five maintenance operations run per tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Fail attempts past their execution timeout.
    Timeout,
    /// Requeue or fail attempts on unresponsive workers.
    Reassignment,
    /// Requeue retries whose backoff elapsed.
    Retry,
    /// Wake elapsed durable sleeps.
    DurableSleep,
    /// Evict expired idempotency keys.
    IdempotencyEviction,
}

impl OperationKind {
    /// Every operation kind.
    pub const ALL: [Self; 5] = [
        Self::Timeout,
        Self::Reassignment,
        Self::Retry,
        Self::DurableSleep,
        Self::IdempotencyEviction,
    ];

    /// Name used in logs and metrics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Reassignment => "reassignment",
            Self::Retry => "retry",
            Self::DurableSleep => "durable_sleep",
            Self::IdempotencyEviction => "idempotency_eviction",
        }
    }

    /// Infix of the operation's environment variables.
    #[must_use]
    pub const fn env_name(self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Reassignment => "REASSIGNMENT",
            Self::Retry => "RETRY",
            Self::DurableSleep => "DURABLE_SLEEP",
            Self::IdempotencyEviction => "IDEMPOTENCY",
        }
    }

    /// Default interval between runs.
    #[must_use]
    pub const fn default_interval(self) -> Duration {
        match self {
            Self::Timeout | Self::Reassignment | Self::Retry | Self::DurableSleep => {
                Duration::from_secs(1)
            }
            Self::IdempotencyEviction => Duration::from_secs(60),
        }
    }
}

/// A scan-and-mutate operation run periodically for each tenant.
#[async_trait]
pub trait TenantOperation: Send + Sync + 'static {
    /// Which operation this is.
    fn kind(&self) -> OperationKind;

    /// Runs one pass for `tenant`.
    ///
    /// Returns `true` when the pass hit its limit and should run again
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns any error from the pass; the pool logs it and waits a full
    /// interval.
    async fn run(&self, tenant: &TenantId) -> Result<bool>;
}

struct TenantLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs a [`TenantOperation`] on a jittered interval for a set of tenants.
pub struct OperationPool<O: TenantOperation + ?Sized> {
    operation: Arc<O>,
    config: PoolConfig,
    metrics: TaskMetrics,
    token: CancellationToken,
    loops: Mutex<HashMap<TenantId, TenantLoop>>,
}

impl<O: TenantOperation + ?Sized> std::fmt::Debug for OperationPool<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationPool")
            .field("operation", &self.operation.kind())
            .field("config", &self.config)
            .field("tenants", &self.tenants().len())
            .finish_non_exhaustive()
    }
}

impl<O: TenantOperation + ?Sized> OperationPool<O> {
    /// Creates a pool whose loops stop when `token` is cancelled.
    #[must_use]
    pub fn new(
        operation: Arc<O>,
        config: PoolConfig,
        metrics: TaskMetrics,
        token: CancellationToken,
    ) -> Self {
        Self {
            operation,
            config,
            metrics,
            token,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Operation this pool runs.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Tenants that currently have a loop, sorted.
    #[must_use]
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self
            .loops
            .lock()
            .map(|loops| loops.keys().cloned().collect())
            .unwrap_or_default();
        tenants.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        tenants
    }

    /// Reconciles the tenant set: starts loops for new tenants and stops
    /// loops for tenants no longer present.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_tenants(&self, tenants: &[TenantId]) {
        if self.token.is_cancelled() {
            return;
        }
        let Ok(mut loops) = self.loops.lock() else {
            tracing::error!(operation = self.kind().name(), "operation pool lock poisoned");
            return;
        };

        loops.retain(|tenant, tenant_loop| {
            let keep = tenants.contains(tenant);
            if !keep {
                tracing::debug!(operation = self.kind().name(), tenant_id = %tenant, "stopping tenant loop");
                tenant_loop.token.cancel();
            }
            keep
        });

        for tenant in tenants {
            if loops.contains_key(tenant) {
                continue;
            }
            let token = self.token.child_token();
            let span = controller_span(self.kind().name(), tenant.as_str());
            let handle = tokio::spawn(
                run_tenant_loop(
                    Arc::clone(&self.operation),
                    tenant.clone(),
                    self.config,
                    self.metrics.clone(),
                    token.clone(),
                )
                .instrument(span),
            );
            loops.insert(tenant.clone(), TenantLoop { token, handle });
        }
    }

    /// Stops every loop and waits for in-flight runs to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .loops
            .lock()
            .map(|mut loops| loops.drain().map(|(_, l)| l.handle).collect())
            .unwrap_or_default();

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(operation = self.kind().name(), error = %e, "tenant loop panicked");
            }
        }
    }
}

/// Returns `interval ± jitter`, never less than one millisecond.
#[must_use]
pub fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
    if jitter_ms == 0 {
        return interval.max(Duration::from_millis(1));
    }

    let offset = rand::thread_rng().gen_range(0..=jitter_ms.saturating_mul(2));
    let base = interval + Duration::from_millis(offset);
    base.saturating_sub(jitter)
        .max(Duration::from_millis(1))
}

async fn run_tenant_loop<O: TenantOperation + ?Sized>(
    operation: Arc<O>,
    tenant: TenantId,
    config: PoolConfig,
    metrics: TaskMetrics,
    token: CancellationToken,
) {
    let kind = operation.kind();

    // Stagger the first run.
    let initial = jittered(Duration::ZERO, config.jitter);
    tokio::select! {
        () = token.cancelled() => return,
        () = tokio::time::sleep(initial) => {}
    }

    loop {
        while !token.is_cancelled() {
            let more = {
                let _timing = TimingGuard::new(|elapsed| {
                    metrics.observe_operation_duration(kind.name(), elapsed);
                });
                match tokio::time::timeout(config.run_timeout, operation.run(&tenant)).await {
                    Ok(Ok(more)) => {
                        metrics.record_operation_run(kind.name(), "ok");
                        more
                    }
                    Ok(Err(e)) => {
                        metrics.record_operation_run(kind.name(), "error");
                        tracing::error!(error = %e, "tenant operation failed");
                        false
                    }
                    Err(_) => {
                        metrics.record_operation_run(kind.name(), "timeout");
                        let e = Error::Timeout {
                            operation: kind.name().to_string(),
                            seconds: config.run_timeout.as_secs(),
                        };
                        tracing::error!(error = %e, "tenant operation abandoned");
                        false
                    }
                }
            };
            if !more {
                break;
            }
        }

        tokio::select! {
            () = token.cancelled() => return,
            () = tokio::time::sleep(jittered(config.interval, config.jitter)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Countdown {
        remaining: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait]
    impl TenantOperation for Countdown {
        fn kind(&self) -> OperationKind {
            OperationKind::Retry
        }

        async fn run(&self, _tenant: &TenantId) -> Result<bool> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let left = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            Ok(left > 1)
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            interval: Duration::from_secs(3600),
            jitter: Duration::ZERO,
            run_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn jitter_stays_in_range() {
        let interval = Duration::from_millis(1000);
        let jitter = Duration::from_millis(200);
        for _ in 0..200 {
            let d = jittered(interval, jitter);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
        assert_eq!(jittered(Duration::ZERO, Duration::ZERO), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn drains_until_no_more_work() {
        let op = Arc::new(Countdown {
            remaining: AtomicUsize::new(3),
            runs: AtomicUsize::new(0),
        });
        let pool = OperationPool::new(
            Arc::clone(&op),
            config(),
            TaskMetrics::new(),
            CancellationToken::new(),
        );
        pool.set_tenants(&[TenantId::new_unchecked("acme")]);

        for _ in 0..100 {
            if op.runs.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;
        assert_eq!(op.runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn set_tenants_reconciles() {
        let op = Arc::new(Countdown {
            remaining: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        });
        let pool = OperationPool::new(op, config(), TaskMetrics::new(), CancellationToken::new());
        let a = TenantId::new_unchecked("alpha");
        let b = TenantId::new_unchecked("bravo");

        pool.set_tenants(&[a.clone(), b.clone()]);
        assert_eq!(pool.tenants(), vec![a.clone(), b.clone()]);

        pool.set_tenants(&[b.clone()]);
        assert_eq!(pool.tenants(), vec![b]);

        pool.shutdown().await;
        assert!(pool.tenants().is_empty());
        pool.set_tenants(&[a]);
        assert!(pool.tenants().is_empty());
    }
}
