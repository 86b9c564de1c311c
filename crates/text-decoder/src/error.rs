//! Error type returned by every fallible text-decoder operation.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Construction-time configuration problem. Never raised by a forward pass.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Tensors handed to a forward pass do not line up.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// An input tensor lives on a different device than the forward context.
    #[error("device mismatch: {0}")]
    Device(String),
    /// Cache slice lookup or append failed.
    #[error("kv-cache error: {0}")]
    Cache(#[from] AttentionError),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

/// Maps kernel errors onto the shape category; cache errors stay as they are.
pub(crate) fn from_attention(err: AttentionError) -> ModelError {
    match err {
        AttentionError::InvalidShape { context } => ModelError::Shape(context),
        other => ModelError::Cache(other),
    }
}
