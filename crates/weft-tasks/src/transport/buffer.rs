//! Buffered, batching publisher.
//!
//! Producers hand messages to a bounded channel and return immediately.
//! When the channel is full the message is dropped and counted, so a slow
//! monitoring sink never holds up a state transition. A background flusher groups pending messages by queue and sends them when
//! the buffer reaches `max_batch` or `flush_interval` elapses. Explicit
//! [`BufferedPublisher::flush`] and [`BufferedPublisher::shutdown`] drain
//! everything accepted before the call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Queue, Transport};
use crate::error::{Error, Result};
use crate::messages::Message;
use crate::metrics::TaskMetrics;

/// Buffer sizing and flush cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Flush once this many messages are pending.
    pub max_batch: usize,
    /// Flush at least this often.
    pub flush_interval: Duration,
    /// Channel capacity; messages published while it is full are dropped.
    pub capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_batch: 100,
            flush_interval: Duration::from_millis(100),
            capacity: 1024,
        }
    }
}

enum Command {
    Publish(Queue, Message),
    Flush(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<Result<()>>),
}

/// Batching publisher over a [`Transport`].
pub struct BufferedPublisher {
    tx: mpsc::Sender<Command>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
    metrics: TaskMetrics,
}

impl std::fmt::Debug for BufferedPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedPublisher")
            .field("closed", &self.tx.is_closed())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl BufferedPublisher {
    /// Spawns the background flusher on the current tokio runtime.
    #[must_use]
    pub fn spawn(transport: Arc<dyn Transport>, config: PublisherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let flusher = tokio::spawn(run_flusher(transport, config, rx));
        Self {
            tx,
            flusher: Mutex::new(Some(flusher)),
            dropped: AtomicU64::new(0),
            metrics: TaskMetrics::new(),
        }
    }

    /// Buffers a message for `queue` without waiting.
    ///
    /// A full buffer drops the message, logs it and counts it in
    /// [`BufferedPublisher::dropped`].
    ///
    /// # Errors
    ///
    /// Returns a transport error after shutdown.
    pub fn publish(&self, queue: Queue, message: Message) -> Result<()> {
        match self.tx.try_send(Command::Publish(queue, message)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(Command::Publish(queue, _))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_publisher_drop(&queue.name());
                tracing::warn!(queue = %queue, "publisher buffer full, dropping message");
                Ok(())
            }
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                Err(Error::transport("publisher is shut down"))
            }
        }
    }

    /// Messages dropped because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sends everything buffered so far and waits for the result.
    ///
    /// # Errors
    ///
    /// Returns the combined send errors of the drained batch.
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| Error::transport("publisher is shut down"))?;
        done.await
            .map_err(|_| Error::transport("publisher flusher stopped"))?
    }

    /// Drains the buffer and stops the flusher.
    ///
    /// Calling `shutdown` more than once is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the combined send errors of the final drain.
    pub async fn shutdown(&self) -> Result<()> {
        let handle = self.flusher.lock().ok().and_then(|mut h| h.take());
        let Some(handle) = handle else {
            return Ok(());
        };

        let (reply, done) = oneshot::channel();
        let result = if self.tx.send(Command::Close(reply)).await.is_ok() {
            done.await
                .unwrap_or_else(|_| Err(Error::transport("publisher flusher stopped")))
        } else {
            Ok(())
        };

        if let Err(e) = handle.await {
            tracing::error!(error = %e, "publisher flusher panicked");
        }
        result
    }
}

async fn run_flusher(
    transport: Arc<dyn Transport>,
    config: PublisherConfig,
    mut rx: mpsc::Receiver<Command>,
) {
    let mut pending: Vec<(Queue, Message)> = Vec::new();
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Publish(queue, message)) => {
                    pending.push((queue, message));
                    if pending.len() >= config.max_batch {
                        let _ = send_pending(transport.as_ref(), &mut pending).await;
                    }
                }
                Some(Command::Flush(reply)) => {
                    let _ = reply.send(send_pending(transport.as_ref(), &mut pending).await);
                }
                Some(Command::Close(reply)) => {
                    rx.close();
                    let mut waiters = Vec::new();
                    while let Some(cmd) = rx.recv().await {
                        match cmd {
                            Command::Publish(queue, message) => pending.push((queue, message)),
                            Command::Flush(w) | Command::Close(w) => waiters.push(w),
                        }
                    }
                    let result = send_pending(transport.as_ref(), &mut pending).await;
                    for waiter in waiters {
                        let _ = waiter.send(copy_result(&result));
                    }
                    let _ = reply.send(result);
                    break;
                }
                None => {
                    let _ = send_pending(transport.as_ref(), &mut pending).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    let _ = send_pending(transport.as_ref(), &mut pending).await;
                }
            }
        }
    }
}

fn copy_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(Error::transport(e.to_string())),
    }
}

/// Sends pending messages grouped by queue, preserving per-queue order.
///
/// Failed groups are dropped after logging; monitoring delivery is
/// best-effort.
async fn send_pending(transport: &dyn Transport, pending: &mut Vec<(Queue, Message)>) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }

    let mut groups: Vec<(Queue, Vec<Message>)> = Vec::new();
    for (queue, message) in pending.drain(..) {
        match groups.iter_mut().find(|(q, _)| *q == queue) {
            Some((_, batch)) => batch.push(message),
            None => groups.push((queue, vec![message])),
        }
    }

    let mut errors = Vec::new();
    for (queue, batch) in groups {
        let count = batch.len();
        if let Err(e) = transport.send(&queue, batch).await {
            tracing::warn!(queue = %queue, count, error = %e, "dropping buffered messages");
            errors.push(e);
        } else {
            tracing::trace!(queue = %queue, count, "flushed buffered messages");
        }
    }
    Error::join(errors)
}
