//! Public traits describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Cache slice owned by a single decoder layer.
///
/// Keys and values are laid out as `[batch, n_kv_heads, seq, head_dim]` and
/// accumulate along the sequence axis.
pub trait KeyValueCache {
    /// Append `keys`/`values` for the current positions and return the full
    /// accumulated tensors (prior positions followed by the new ones).
    fn put(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor), AttentionError>;

    /// Number of positions stored so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every stored position.
    fn reset(&mut self);
}

/// Per-layer cache partitioning.
pub trait CacheProvider {
    /// Returns the slice owned by `layer`.
    ///
    /// Fails with [`AttentionError::LayerOutOfRange`] when `layer` is not
    /// below [`num_layers`](CacheProvider::num_layers).
    fn sub(&mut self, layer: usize) -> Result<&mut dyn KeyValueCache, AttentionError>;

    fn num_layers(&self) -> usize;

    /// Clear all layers so the provider can serve a new sequence.
    fn reset(&mut self);
}

/// Counters describing cache occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Positions stored, summed over layers.
    pub tokens: usize,
    /// Pages allocated, summed over layers.
    pub pages_allocated: usize,
}
