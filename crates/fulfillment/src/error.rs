//! Side-effect error types.

use thiserror::Error;

/// Errors raised by a message publisher.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected the message or could not be reached.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by a metrics sink.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// The sample was refused by the backend.
    #[error("Failed to record metric {name}: {reason}")]
    Rejected { name: String, reason: String },
}
