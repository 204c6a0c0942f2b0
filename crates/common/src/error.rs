//! Common error types for StyleFlow
//!
//! This module defines all error types used across the StyleFlow system.
//! Per-batch processing failures never travel through these as control flow
//! back into the dispatch loop; they are reported by workers and recorded,
//! while configuration and bootstrap failures are fatal before the loop
//! starts.

use thiserror::Error;

/// Main error type for StyleFlow
#[derive(Error, Debug)]
pub enum StyleFlowError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection errors between scheduler and workers
    #[error("Connection error: {0}")]
    Connection(String),

    /// Wire protocol violations
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Model artifact loading/validation errors
    #[error("Model error: {0}")]
    Model(String),

    /// Image decode/encode errors
    #[error("Image error: {0}")]
    Image(String),

    /// Tensor shape/stacking errors
    #[error("Tensor error: {0}")]
    Tensor(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No worker available to take a submission
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StyleFlowError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        StyleFlowError::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        StyleFlowError::Connection(msg.into())
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        StyleFlowError::Protocol(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        StyleFlowError::Model(msg.into())
    }

    /// Create an image error
    pub fn image(msg: impl Into<String>) -> Self {
        StyleFlowError::Image(msg.into())
    }

    /// Create a tensor error
    pub fn tensor(msg: impl Into<String>) -> Self {
        StyleFlowError::Tensor(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        StyleFlowError::Timeout(msg.into())
    }

    /// Create a worker unavailable error
    pub fn worker_unavailable(msg: impl Into<String>) -> Self {
        StyleFlowError::WorkerUnavailable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        StyleFlowError::Internal(msg.into())
    }
}

/// Result type alias for StyleFlow operations
pub type Result<T> = std::result::Result<T, StyleFlowError>;
