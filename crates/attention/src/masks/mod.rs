//! Mask utilities shared by attention implementations.
//!
//! Masks are additive `f32` tensors shaped `[q_len, k_len]` so they broadcast
//! over `[batch, num_heads, q_len, k_len]` scores. Values are either `0.0`
//! (keep) or `f32::NEG_INFINITY` (discard).

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::build_causal_mask;
