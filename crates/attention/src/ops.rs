//! Tensor helpers shared by the attention kernels.

use candle_core::{Result, Tensor};

/// Repeats key/value heads so grouped-query attention can reuse the dense
/// kernel.
///
/// `[batch, n_kv_heads, seq, head_dim]` becomes
/// `[batch, n_kv_heads * n_rep, seq, head_dim]`, where output head `h` is a
/// copy of input head `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, n_kv_heads, seq, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, n_kv_heads, n_rep, seq, head_dim))?
        .reshape((batch, n_kv_heads * n_rep, seq, head_dim))
}
