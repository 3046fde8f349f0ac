//! Strongly-typed identifiers for weft entities.
//!
//! Entities that are visible outside the controller (tasks, workflow runs,
//! ingested events) carry UUID external ids assigned by the repository.
//! Messages the controller emits carry ULIDs so they sort by creation time.
//!
//! # Example
//!
//! ```rust
//! use weft_core::id::{MessageId, TaskExternalId};
//!
//! let task = TaskExternalId::generate();
//! let message = MessageId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: TaskExternalId = message;
//! # let _ = (task, message);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! external_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random external ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!(concat!("invalid ", $label, " '{}': {}"), s, e),
                })
            }
        }
    };
}

external_id!(
    /// External identifier of a task, stable across retry attempts.
    TaskExternalId,
    "task external ID"
);

external_id!(
    /// External identifier of a workflow run (a DAG or a standalone task).
    RunExternalId,
    "run external ID"
);

external_id!(
    /// External identifier of an ingested user event.
    EventExternalId,
    "event external ID"
);

/// A unique identifier for a message emitted by the controller.
///
/// Message IDs are ULIDs: lexicographically sortable by creation time,
/// which keeps monitoring records ordered when the analytics side sorts
/// by ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Ulid);

impl MessageId {
    /// Generates a new unique message ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid message ID '{s}': {e}"),
            })
    }
}
