//! Error handling for the embers-common crate.

use thiserror::Error;

/// Error type shared by the cache engine and the master directory.
///
/// Variants carry a human-readable message plus an optional source error so
/// failures keep their causal chain across module boundaries.
#[derive(Error, Debug)]
pub enum EmbersError {
    /// A caller violated an API contract, e.g. reading a serialized entry
    /// through the deserialized view or re-putting an existing block.
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// Memory could not be reserved even after eviction ran.
    #[error("Memory exhausted: {message}")]
    MemoryExhausted { message: String },

    /// An outbound ask did not complete within the configured timeout.
    #[error("RPC timed out: {message}")]
    Timeout { message: String },

    /// A worker endpoint answered with a failure or an unexpected reply.
    #[error("Endpoint error: {message}")]
    Endpoint {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Reading or parsing a profile file failed.
    #[error("Profile error: {message}")]
    Profile {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Serialization or deserialization of block data failed.
    #[error("Serialization failed: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for embers operations.
pub type Result<T> = std::result::Result<T, EmbersError>;

impl EmbersError {
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn memory_exhausted<S: Into<String>>(message: S) -> Self {
        Self::MemoryExhausted {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn endpoint<S: Into<String>>(message: S) -> Self {
        Self::Endpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn endpoint_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Endpoint {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn profile<S: Into<String>>(message: S) -> Self {
        Self::Profile {
            message: message.into(),
            source: None,
        }
    }

    pub fn profile_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Profile {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn serialization_with_source<S: Into<String>, E: Into<anyhow::Error>>(
        message: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbersError::Timeout { .. } => true,
            EmbersError::Endpoint { .. } => true,
            EmbersError::Protocol { .. } => false,
            EmbersError::MemoryExhausted { .. } => false,
            EmbersError::Profile { .. } => false,
            EmbersError::Serialization { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::error::Error;

    #[test]
    fn test_error_creation() {
        let err = EmbersError::protocol("duplicate put");
        assert!(matches!(err, EmbersError::Protocol { .. }));

        let err = EmbersError::endpoint_with_source("ask failed", anyhow!("connection reset"));
        assert!(matches!(err, EmbersError::Endpoint { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_retryability() {
        assert!(EmbersError::timeout("ask").is_retryable());
        assert!(EmbersError::endpoint("worker gone").is_retryable());
        assert!(!EmbersError::protocol("bad view").is_retryable());
        assert!(!EmbersError::memory_exhausted("full").is_retryable());
    }

    #[test]
    fn test_display_includes_message() {
        let err = EmbersError::profile("missing app profile");
        assert!(format!("{}", err).contains("missing app profile"));
    }
}
