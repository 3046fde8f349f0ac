//! Error types and result aliases shared by weft crates.

/// The result type used throughout weft-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building shared primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_display() {
        let err = Error::InvalidId {
            message: "tenant ID cannot be empty".into(),
        };
        assert!(err.to_string().contains("invalid identifier"));
    }

    #[test]
    fn configuration_display() {
        let err = Error::configuration("missing WEFT_TRIGGER_SLOTS");
        assert_eq!(
            err.to_string(),
            "configuration error: missing WEFT_TRIGGER_SLOTS"
        );
    }
}
