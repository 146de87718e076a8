//! Store error types.

use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for every store, repository and projection operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A stream was not found.
    #[error("stream not found: {0}")]
    StreamNotFound(Uuid),

    /// An event was not found.
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Optimistic concurrency conflict.
    #[error(
        "concurrency conflict on stream {stream_id}: expected version {expected}, found {observed}"
    )]
    ConcurrencyConflict {
        /// The stream that had the conflict.
        stream_id: Uuid,
        /// The version the writer expected the stream to be at.
        expected: i64,
        /// The version the stream was actually at.
        observed: i64,
    },

    /// A payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A projection handler failed while folding an event.
    #[error(
        "projection {projection_id} failed on event {event_id} at position {position}: {message}"
    )]
    HandlerFailure {
        /// The failing projection.
        projection_id: Uuid,
        /// The event being folded when the handler failed.
        event_id: Uuid,
        /// Number of events folded successfully before the failure.
        position: u64,
        /// The handler's error message.
        message: String,
    },

    /// The caller supplied an invalid request.
    #[error("validation error: {0}")]
    Validation(String),
}

impl StoreError {
    /// Returns `true` for errors caused by a stale expected version.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    /// Returns `true` for missing streams or events.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_) | Self::EventNotFound(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_message_names_both_versions() {
        let stream_id = Uuid::new_v4();
        let err = StoreError::ConcurrencyConflict {
            stream_id,
            expected: 0,
            observed: 1,
        };

        let message = err.to_string();

        assert!(message.contains(&stream_id.to_string()));
        assert!(message.contains("expected version 0"));
        assert!(message.contains("found 1"));
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(StoreError::StreamNotFound(Uuid::new_v4()).is_not_found());
        assert!(StoreError::EventNotFound(Uuid::new_v4()).is_not_found());
        assert!(!StoreError::Storage("disk full".into()).is_not_found());
    }
}
