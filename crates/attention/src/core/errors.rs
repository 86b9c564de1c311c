//! Error types emitted by attention kernels and caches.

/// Attention-specific error category.
#[derive(Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// A cache slice was requested for a layer the cache does not hold.
    LayerOutOfRange { layer: usize, layers: usize },
    /// An append would grow a layer past its configured capacity.
    CapacityExceeded {
        layer: usize,
        requested: usize,
        capacity: usize,
    },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            AttentionError::LayerOutOfRange { layer, layers } => {
                write!(f, "cache layer {layer} out of range for {layers} layers")
            }
            AttentionError::CapacityExceeded {
                layer,
                requested,
                capacity,
            } => write!(
                f,
                "cache layer {layer} cannot hold {requested} positions (capacity {capacity})"
            ),
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

pub(crate) fn invalid_shape(context: impl Into<String>) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}
