//! Multi-tenant isolation primitives.
//!
//! Every controller operation is tenant-scoped: repository calls, outbound
//! queues and background pools are all keyed by [`TenantId`].
//!
//! # Example
//!
//! ```rust
//! use weft_core::tenant::TenantId;
//!
//! let tenant = TenantId::new("acme-corp").unwrap();
//! assert_eq!(tenant.scoped_queue("events"), "events.acme-corp");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A unique identifier for a tenant.
///
/// 3 to 63 lowercase letters, digits or inner hyphens, so a UUID
/// qualifies. The ID doubles as a queue-name suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a new tenant ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Creates a tenant ID without validation.
    ///
    /// Intended for IDs that were already validated (e.g. read back from
    /// the repository).
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the name of a tenant-scoped queue, `{name}.{tenant_id}`.
    #[must_use]
    pub fn scoped_queue(&self, name: &str) -> String {
        format!("{name}.{}", self.0)
    }

    /// Returns the tenant ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<()> {
        match rejection(id) {
            None => Ok(()),
            Some(reason) => Err(Error::InvalidId {
                message: format!("invalid tenant ID '{id}': {reason}"),
            }),
        }
    }
}

const MIN_LEN: usize = 3;
const MAX_LEN: usize = 63;

fn rejection(id: &str) -> Option<&'static str> {
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    if !(MIN_LEN..=MAX_LEN).contains(&id.len()) {
        Some("must be 3 to 63 characters")
    } else if !id.chars().all(allowed) {
        Some("only lowercase letters, digits and hyphens are allowed")
    } else if id.starts_with('-') || id.ends_with('-') {
        Some("must not start or end with a hyphen")
    } else {
        None
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
