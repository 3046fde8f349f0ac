//! Error types for the task orchestration core.
//!
//! Errors fall into four classes which decide what the transport does with
//! the batch that produced them:
//!
//! | Class | Variants | Effect |
//! |-------|----------|--------|
//! | Fatal write | `Repository`, `Transport`, `Serialization` | propagate, batch is redelivered |
//! | Admission | `ResourceExhausted`, `NoTriggerSlots` | dropped deliberately, logged at warn |
//! | Best-effort | `Multiple` from signaling | logged, never reverses a committed change |
//! | Contract | `UnknownMessageKind` | hard error, never retried |

use weft_core::TenantId;

/// The result type used throughout weft-tasks.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in task controller operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A repository operation failed.
    #[error("repository error: {message}")]
    Repository {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The repository refused the write because a tenant resource limit was hit.
    #[error("resource exhausted for tenant {tenant_id}: {resource}")]
    ResourceExhausted {
        /// Tenant whose limit was hit.
        tenant_id: TenantId,
        /// The exhausted resource (e.g. "task runs").
        resource: String,
    },

    /// All trigger admission slots are in use.
    #[error("no trigger slots available ({capacity} in use)")]
    NoTriggerSlots {
        /// Configured slot capacity.
        capacity: usize,
    },

    /// A transport send or receive failed.
    #[error("transport error: {message}")]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// A message payload could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A message arrived with a kind this controller does not handle.
    #[error("unknown message kind: {kind}")]
    UnknownMessageKind {
        /// The unrecognized kind.
        kind: String,
    },

    /// The tenant does not exist in the repository.
    #[error("tenant not found: {tenant_id}")]
    TenantNotFound {
        /// The missing tenant.
        tenant_id: TenantId,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A bounded operation did not finish in time.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The bound that was exceeded.
        seconds: u64,
    },

    /// Several independent sub-operations failed.
    #[error("{} operations failed: {}", errors.len(), join_messages(errors))]
    Multiple {
        /// The individual failures.
        errors: Vec<Error>,
    },

    /// An error from weft-core.
    #[error("core error: {0}")]
    Core(#[from] weft_core::Error),
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Creates a new repository error.
    #[must_use]
    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new repository error wrapping its cause.
    #[must_use]
    pub fn repository_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Repository {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Combines the errors of independent sub-operations.
    ///
    /// Returns `Ok(())` when nothing failed and the single error unchanged
    /// when exactly one failed.
    ///
    /// # Errors
    ///
    /// Returns the combined error when at least one sub-operation failed.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Result<()> {
        let mut errors: Vec<Error> = errors.into_iter().collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple { errors }),
        }
    }

    /// Returns true if redelivering the batch could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Repository { .. } | Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Multiple { errors } => errors.iter().any(Self::is_retryable),
            Self::ResourceExhausted { .. }
            | Self::NoTriggerSlots { .. }
            | Self::Serialization { .. }
            | Self::UnknownMessageKind { .. }
            | Self::TenantNotFound { .. }
            | Self::Configuration { .. }
            | Self::Core(_) => false,
        }
    }

    /// Returns true for load-shedding rejections that drop work on purpose.
    #[must_use]
    pub fn is_admission_rejection(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } | Self::NoTriggerSlots { .. } => true,
            Self::Multiple { errors } => errors.iter().all(Self::is_admission_rejection),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn join_of_nothing_is_ok() {
        assert!(Error::join(Vec::new()).is_ok());
    }

    #[test]
    fn join_of_one_is_unchanged() {
        let err = Error::join(vec![Error::transport("olap queue closed")]).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn join_of_many_lists_every_message() {
        let err = Error::join(vec![
            Error::transport("olap queue closed"),
            Error::repository("connection reset"),
        ])
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("2 operations failed"));
        assert!(msg.contains("olap queue closed"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn admission_errors_are_not_retryable() {
        assert!(!Error::NoTriggerSlots { capacity: 2 }.is_retryable());
        assert!(!Error::ResourceExhausted {
            tenant_id: TenantId::new_unchecked("acme"),
            resource: "task runs".into(),
        }
        .is_retryable());
        assert!(!Error::UnknownMessageKind { kind: "bogus".into() }.is_retryable());
        assert!(Error::repository("deadlock detected").is_retryable());
    }

    #[test]
    fn repository_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timeout");
        let err = Error::repository_with_source("fail tasks", source);
        assert!(err.to_string().contains("repository error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn admission_rejections_are_told_apart() {
        let no_slots = Error::NoTriggerSlots { capacity: 2 };
        let exhausted = Error::ResourceExhausted {
            tenant_id: TenantId::new_unchecked("acme"),
            resource: "task limit of 0".into(),
        };
        assert!(no_slots.is_admission_rejection());
        assert!(exhausted.is_admission_rejection());
        assert!(!Error::repository("deadlock detected").is_admission_rejection());
        assert!(!Error::transport("broker down").is_admission_rejection());

        let mixed = Error::join(vec![
            Error::NoTriggerSlots { capacity: 1 },
            Error::serialization("bad payload"),
        ])
        .unwrap_err();
        assert!(!mixed.is_admission_rejection());
    }
}
