//! Core traits and types shared across attention implementations.
//!
//! * `q` is shaped `[batch, n_heads, q_len, head_dim]`.
//! * `k` and `v` are shaped `[batch, n_kv_heads, k_len, head_dim]` with
//!   `n_heads % n_kv_heads == 0`.
//! * The returned tensor mirrors the layout and dtype of `q`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
pub trait Attention {
    /// Computes `softmax(q · kᵀ * scale + mask) · v`.
    ///
    /// The mask, when present, is additive and must broadcast to
    /// `[batch, n_heads, q_len, k_len]`; `[q_len, k_len]` and
    /// `[batch, 1, q_len, k_len]` are the common shapes.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
