//! # weft-tasks
//!
//! Task-lifecycle orchestration core for the weft workflow platform.
//!
//! This crate decides what happens to a task after it is triggered,
//! dispatched to a worker and reported back:
//!
//! - **Task Controller**: message-driven state machine over completed,
//!   failed, cancelled, replayed and triggered tasks
//! - **Trigger Writer**: admission-controlled run creation from events and
//!   workflow names
//! - **OLAP Signaler**: the single path for monitoring events and scheduler
//!   wake-ups
//! - **Operation Pools**: per-tenant jittered maintenance loops (timeouts,
//!   reassignment, retries, durable sleeps, idempotency eviction)
//!
//! ## Guarantees
//!
//! - **Authoritative writes**: the repository is the only source of truth;
//!   its failures are fatal to a batch and trigger redelivery
//! - **Best-effort signals**: monitoring, wake-ups and worker notifications
//!   never block or reverse a committed transition
//! - **Load shedding**: triggers fail fast when admission slots run out
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use weft_core::TenantId;
//! use weft_tasks::config::ControllerConfig;
//! use weft_tasks::context::ServiceContext;
//! use weft_tasks::controller::TaskController;
//! use weft_tasks::messages::{Message, WorkflowNameTrigger};
//! use weft_tasks::repository::Tenant;
//! use weft_tasks::repository::memory::{InMemoryRepository, WorkflowDefinition};
//! use weft_tasks::transport::memory::InMemoryTransport;
//!
//! # async fn example() -> weft_tasks::Result<()> {
//! weft_core::init_logging(&weft_core::LogConfig::from_env());
//!
//! let tenant = TenantId::new("acme")?;
//! let repository = Arc::new(InMemoryRepository::new());
//! repository.add_tenant(Tenant::new(tenant.clone()).with_scheduler_partition("p-0"));
//! repository.register_workflow(&tenant, WorkflowDefinition::new("ingest", ["load"]))?;
//!
//! let ctx = ServiceContext::new(
//!     repository,
//!     Arc::new(InMemoryTransport::new()),
//!     ControllerConfig::from_env()?,
//! );
//! let controller = TaskController::new(ctx);
//! let handle = controller.start().await?;
//!
//! let trigger = WorkflowNameTrigger::new("ingest", serde_json::json!({}));
//! controller
//!     .handle_batch(&Message::single(tenant, &trigger)?)
//!     .await?;
//!
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod events;
pub mod messages;
pub mod metrics;
pub mod olap;
pub mod pool;
pub mod repository;
pub mod signaler;
pub mod task;
pub mod transport;
pub mod trigger;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{ControllerConfig, PoolConfig};
    pub use crate::context::ServiceContext;
    pub use crate::controller::{ControllerHandle, TaskController};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventRecord, InternalTaskEvent};
    pub use crate::messages::{Message, MessageKind, Payload};
    pub use crate::metrics::TaskMetrics;
    pub use crate::olap::{OlapEventType, OlapRecord, OlapTaskEvent};
    pub use crate::pool::{OperationKind, OperationPool, TenantOperation};
    pub use crate::repository::{TaskRepository, Tenant};
    pub use crate::signaler::OlapSignaler;
    pub use crate::task::{CancelReason, InitialState, RetryPolicy, Task, TaskRef};
    pub use crate::transport::{BufferedPublisher, Queue, Transport};
    pub use crate::trigger::TriggerWriter;
}

pub use error::{Error, Result};
