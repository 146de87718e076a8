//! Tally CLI error types.

use serde_json::{Value, json};
use tally_core::error::StoreError;
use tally_event_store::ConfigError;
use thiserror::Error;

/// Errors surfaced by the `tally` binary.
#[derive(Debug, Error)]
pub enum CliError {
    /// The environment holds an unusable store configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The arguments do not form a valid command.
    #[error("usage error: {0}")]
    Usage(String),

    /// A JSON argument could not be parsed or output could not be rendered.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CliError {
    /// Machine-readable error code for the JSON error body.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "configuration_error",
            Self::Usage(_) => "usage_error",
            Self::Json(_) => "json_error",
            Self::Store(err) => match err {
                StoreError::StreamNotFound(_) => "stream_not_found",
                StoreError::EventNotFound(_) => "event_not_found",
                StoreError::ConcurrencyConflict { .. } => "concurrency_conflict",
                StoreError::Serialization(_) => "serialization_error",
                StoreError::Storage(_) => "storage_error",
                StoreError::HandlerFailure { .. } => "handler_failure",
                StoreError::Validation(_) => "validation_error",
            },
        }
    }

    /// The JSON body printed when a command fails.
    #[must_use]
    pub fn to_json(&self) -> Value {
        json!({ "error": self.code(), "message": self.to_string() })
    }
}
