//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

use super::MASK_DTYPE;

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, so query `i` may read keys `0..=i + (k_len - q_len)`. This
/// matches a decode step that appends to a populated key/value cache.
pub fn build_causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| if k > q + offset { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)?.to_dtype(MASK_DTYPE)
}
