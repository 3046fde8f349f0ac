//! Message transport abstraction.
//!
//! The controller consumes the task-processing queue and publishes to four
//! kinds of outbound queue. The substrate is at-least-once pub/sub; the
//! [`Transport`] trait is all the controller needs from it.
//!
//! ## Queues
//!
//! | Queue | Contents |
//! |-------|----------|
//! | `task_processing` | inbound worker outcomes, triggers, fan-out |
//! | `olap` | monitoring records (buffered) |
//! | `scheduler.<partition>` | queue wake-ups |
//! | `dispatcher.<id>` | cancellation signals, callback completions |
//! | `event_consumer.<tenant>` | finished-run candidates |

pub mod memory;

mod buffer;

use std::fmt;

use async_trait::async_trait;

use weft_core::TenantId;

use crate::error::Result;
use crate::messages::Message;

pub use buffer::{BufferedPublisher, PublisherConfig};

/// A transport queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Inbound queue consumed by task controllers.
    TaskProcessing,
    /// Analytics/monitoring queue.
    Olap,
    /// Scheduler partition wake-up queue.
    SchedulerPartition(String),
    /// Dispatcher queue.
    Dispatcher(String),
    /// Per-tenant event consumer queue.
    TenantEventConsumer(TenantId),
}

impl Queue {
    /// Returns the substrate-level queue name.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::TaskProcessing => "task_processing".to_string(),
            Self::Olap => "olap".to_string(),
            Self::SchedulerPartition(id) => format!("scheduler.{id}"),
            Self::Dispatcher(id) => format!("dispatcher.{id}"),
            Self::TenantEventConsumer(tenant) => tenant.scoped_queue("event_consumer"),
        }
    }
}

impl fmt::Display for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// At-least-once message transport.
///
/// Implementations must be thread-safe. `send` succeeds once the substrate
/// has accepted every message; `receive` returns up to `max` messages and
/// an empty vector when the queue is idle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends messages to a queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the substrate rejects the messages.
    async fn send(&self, queue: &Queue, messages: Vec<Message>) -> Result<()>;

    /// Receives up to `max` messages from a queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the substrate is unavailable.
    async fn receive(&self, queue: &Queue, max: usize) -> Result<Vec<Message>>;
}
