//! Error types and classification.
//!
//! Every layer (backend client, partition store, union store, router) reports
//! failures through [`StorageError`]. Callers above the router classify errors
//! with the predicates on the enum rather than matching on message text.

use thiserror::Error;

/// Stable message of the "partition read path is still warming up" error.
///
/// Backends and caches report this while their initial list is in flight; the
/// instrumented wrapper counts it per tenant, resource and verb.
pub const REINITIALIZING_MESSAGE: &str = "storage is (re)initializing";

/// Common storage error conditions.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Key does not exist.
    #[error("key not found: {key}")]
    NotFound { key: String },

    /// Key already exists (create on an occupied key).
    #[error("key exists: {key}")]
    KeyExists { key: String },

    /// Compare-and-swap or precondition failure.
    #[error("conflict on {key}: {message}")]
    Conflict { key: String, message: String },

    /// Requested revision has been compacted away.
    #[error("revision {revision} has been compacted; compaction floor is {compaction_floor}")]
    Compacted {
        revision: u64,
        compaction_floor: u64,
    },

    /// Operation or stream was cancelled.
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// Partition read path is still warming up.
    #[error("{}: {message}", REINITIALIZING_MESSAGE)]
    Reinitializing { message: String },

    /// Transient backend failure (connection reset, leader change, timeout).
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    /// Object could not be encoded or decoded.
    #[error("codec error for {key}: {message}")]
    Codec { key: String, message: String },

    /// Object failed a validation callback or invariant check.
    #[error("invalid object: {message}")]
    InvalidObject { message: String },

    /// Child store could not be built (bad config, unreachable backend).
    #[error("storage construction failed: {message}")]
    Construction { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Create a NotFound error.
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a KeyExists error.
    pub fn key_exists(key: impl Into<String>) -> Self {
        Self::KeyExists { key: key.into() }
    }

    /// Create a Conflict error.
    pub fn conflict(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a Compacted error.
    pub fn compacted(revision: u64, compaction_floor: u64) -> Self {
        Self::Compacted {
            revision,
            compaction_floor,
        }
    }

    /// Create a Cancelled error.
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a Reinitializing error.
    pub fn reinitializing(message: impl Into<String>) -> Self {
        Self::Reinitializing {
            message: message.into(),
        }
    }

    /// Create an Unavailable error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a Codec error.
    pub fn codec(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidObject error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidObject {
            message: message.into(),
        }
    }

    /// Create a Construction error.
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is the "storage is (re)initializing" class.
    ///
    /// Errors that crossed a text-only boundary (e.g. a gRPC status message)
    /// are recognised by their stable message.
    pub fn is_reinitializing(&self) -> bool {
        match self {
            Self::Reinitializing { .. } => true,
            Self::Unavailable { message } | Self::Internal { message } => {
                message.contains(REINITIALIZING_MESSAGE)
            }
            _ => false,
        }
    }

    /// Check if this error invalidates a watch stream.
    ///
    /// The stream must close and the consumer must re-list.
    pub fn is_stream_invalidating(&self) -> bool {
        matches!(self, Self::Compacted { .. } | Self::Cancelled { .. })
    }

    /// Check if this error is transient and the same request may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Reinitializing { .. })
    }

    /// Check if this is a NotFound error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a Conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Result type using StorageError.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reinitializing_message_is_stable() {
        let err = StorageError::reinitializing("cache warming");
        assert!(err.to_string().starts_with(REINITIALIZING_MESSAGE));
        assert!(err.is_reinitializing());
        assert!(err.is_transient());
    }

    #[test]
    fn test_reinitializing_detected_through_text() {
        let err = StorageError::unavailable("rpc error: storage is (re)initializing");
        assert!(err.is_reinitializing());
        assert!(!StorageError::unavailable("connection reset").is_reinitializing());
    }

    #[test]
    fn test_stream_invalidating_classes() {
        assert!(StorageError::compacted(3, 10).is_stream_invalidating());
        assert!(StorageError::cancelled("ctx done").is_stream_invalidating());
        assert!(!StorageError::unavailable("leader changed").is_stream_invalidating());
        assert!(!StorageError::not_found("a/b").is_stream_invalidating());
    }
}
