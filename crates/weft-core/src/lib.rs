//! # weft-core
//!
//! Shared primitives for the weft task orchestration platform.
//!
//! - **Tenant Context**: multi-tenant isolation primitives
//! - **Identifiers**: strongly-typed IDs for tasks, runs, events and messages
//! - **Error Types**: shared error definitions and result types
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use weft_core::prelude::*;
//!
//! let tenant = TenantId::new("acme-corp").unwrap();
//! let message_id = MessageId::generate();
//! assert_eq!(tenant.as_str(), "acme-corp");
//! assert!(!message_id.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;
pub mod tenant;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventExternalId, MessageId, RunExternalId, TaskExternalId};
    pub use crate::tenant::TenantId;
}

pub use error::{Error, Result};
pub use id::{EventExternalId, MessageId, RunExternalId, TaskExternalId};
pub use observability::{LogConfig, LogFormat, controller_span, init_logging};
pub use tenant::TenantId;
