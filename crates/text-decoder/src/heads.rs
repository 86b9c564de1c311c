//! Reshapes between the hidden layout and the per-head layout.

use candle_core::{Result, Tensor};

/// `(batch, seq, heads * head_dim)` to `(batch, heads, seq, head_dim)`.
pub(crate) fn split_heads(tensor: &Tensor, heads: usize, head_dim: usize) -> Result<Tensor> {
    let (batch, seq, _) = tensor.dims3()?;
    tensor
        .reshape((batch, seq, heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()
}

/// Inverse of [`split_heads`].
pub(crate) fn merge_heads(tensor: &Tensor) -> Result<Tensor> {
    let (batch, heads, seq, head_dim) = tensor.dims4()?;
    tensor
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq, heads * head_dim))
}
