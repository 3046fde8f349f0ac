//! In-memory transport for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no persistence, no redelivery
//! - **Single-process only**: queues are not visible across processes
//! - **Inspection is non-consuming**: [`InMemoryTransport::messages`] leaves
//!   queued messages in place for a later `receive`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{Queue, Transport};
use crate::error::{Error, Result};
use crate::messages::{Message, Payload};

#[derive(Debug, Default)]
struct TransportState {
    queues: HashMap<Queue, VecDeque<Message>>,
    failing: HashSet<Queue>,
    sent_total: usize,
}

/// In-memory transport for tests and local development.
///
/// ## Example
///
/// ```rust
/// use weft_tasks::transport::memory::InMemoryTransport;
/// use weft_tasks::transport::Queue;
///
/// let transport = InMemoryTransport::new();
/// assert!(transport.messages(&Queue::Olap).is_empty());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    state: RwLock<TransportState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::transport("transport lock poisoned")
}

impl InMemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send to `queue` fail.
    pub fn fail_sends_to(&self, queue: Queue) {
        if let Ok(mut state) = self.state.write() {
            state.failing.insert(queue);
        }
    }

    /// Clears injected send failures.
    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state.write() {
            state.failing.clear();
        }
    }

    /// Returns a snapshot of the messages waiting on `queue`.
    #[must_use]
    pub fn messages(&self, queue: &Queue) -> Vec<Message> {
        self.state
            .read()
            .map(|state| {
                state
                    .queues
                    .get(queue)
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Decodes every waiting message of payload type `P` on `queue`.
    ///
    /// Messages of other kinds are skipped.
    #[must_use]
    pub fn payloads<P: Payload>(&self, queue: &Queue) -> Vec<P> {
        self.messages(queue)
            .iter()
            .filter(|m| m.kind == P::KIND)
            .filter_map(|m| m.decode::<P>().ok())
            .flatten()
            .collect()
    }

    /// Returns every queue that has received at least one message.
    #[must_use]
    pub fn queues(&self) -> Vec<Queue> {
        self.state
            .read()
            .map(|state| state.queues.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of messages accepted since creation.
    #[must_use]
    pub fn sent_total(&self) -> usize {
        self.state.read().map(|s| s.sent_total).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, queue: &Queue, messages: Vec<Message>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if state.failing.contains(queue) {
            return Err(Error::transport(format!("send to {queue} rejected")));
        }

        state.sent_total += messages.len();
        state
            .queues
            .entry(queue.clone())
            .or_default()
            .extend(messages);
        Ok(())
    }

    async fn receive(&self, queue: &Queue, max: usize) -> Result<Vec<Message>> {
        let mut state = self.state.write().map_err(poison_err)?;
        let Some(pending) = state.queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let take = max.min(pending.len());
        Ok(pending.drain(..take).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{CheckTenantQueues, WakeReason};
    use weft_core::TenantId;

    fn wake(count: usize) -> Message {
        Message::single(
            TenantId::new_unchecked("acme"),
            &CheckTenantQueues {
                reason: WakeReason::TasksCreated,
                queue_names: vec!["default".into()],
                task_count: count,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn send_then_receive_in_order() {
        let transport = InMemoryTransport::new();
        let queue = Queue::SchedulerPartition("p1".into());
        transport
            .send(&queue, vec![wake(1), wake(2), wake(3)])
            .await
            .unwrap();

        let first = transport.receive(&queue, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let counts: Vec<usize> = first
            .iter()
            .map(|m| m.decode::<CheckTenantQueues>().unwrap()[0].task_count)
            .collect();
        assert_eq!(counts, vec![1, 2]);

        assert_eq!(transport.receive(&queue, 10).await.unwrap().len(), 1);
        assert!(transport.receive(&queue, 10).await.unwrap().is_empty());
        assert_eq!(transport.sent_total(), 3);
    }

    #[tokio::test]
    async fn injected_failure_rejects_send() {
        let transport = InMemoryTransport::new();
        transport.fail_sends_to(Queue::Olap);
        assert!(transport.send(&Queue::Olap, vec![wake(1)]).await.is_err());
        assert!(transport.messages(&Queue::Olap).is_empty());

        transport.clear_failures();
        transport.send(&Queue::Olap, vec![wake(1)]).await.unwrap();
        assert_eq!(transport.payloads::<CheckTenantQueues>(&Queue::Olap).len(), 1);
    }
}
