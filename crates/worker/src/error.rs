//! Worker bootstrap error types.

use fulfillment::PublishError;
use store::StoreError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors that stop the worker from starting or running.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Publisher error: {0}")]
    Publish(#[from] PublishError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
