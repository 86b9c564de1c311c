//! Reference attention kernel.
//!
//! The exact path mirrors the semantics described by the
//! [`Attention`](crate::core::Attention) trait: grouped-query broadcasting of
//! key/value heads, an optional additive mask, and a softmax over the key axis.

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::errors::invalid_shape;
use crate::core::{Attention, AttentionError, Config};
use crate::ops::repeat_kv;

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAttention;

struct Geometry {
    batch: usize,
    heads: usize,
    q_len: usize,
    head_dim: usize,
    n_rep: usize,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self
    }

    /// Returns the post-softmax attention weights shaped
    /// `[batch, n_heads, q_len, k_len]`.
    pub fn attention_weights(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let geometry = validate(q, k, None)?;
        self.probabilities(q, k, mask, config, &geometry)
    }

    fn probabilities(
        &self,
        q: &Tensor,
        k: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
        geometry: &Geometry,
    ) -> Result<Tensor, AttentionError> {
        let work_dtype = working_dtype(q.dtype(), config);
        let q = q.to_dtype(work_dtype)?.contiguous()?;
        let k = repeat_kv(&k.to_dtype(work_dtype)?, geometry.n_rep)?;
        let k_t = k.transpose(2, 3)?.contiguous()?;

        let scale = config.scale_for(geometry.head_dim);
        let mut scores = (q.matmul(&k_t)? * scale)?;

        if let Some(mask) = mask {
            let mask = mask.to_dtype(work_dtype)?;
            scores = scores.broadcast_add(&mask).map_err(|err| {
                invalid_shape(format!(
                    "mask {:?} does not broadcast to scores {:?}: {err}",
                    mask.dims(),
                    scores.dims()
                ))
            })?;
        }

        Ok(softmax_last_dim(&scores)?)
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        let geometry = validate(q, k, Some(v))?;
        if geometry.q_len == 0 {
            return Ok(Tensor::zeros(
                (geometry.batch, geometry.heads, 0, geometry.head_dim),
                q.dtype(),
                q.device(),
            )?);
        }

        let probs = self.probabilities(q, k, mask, config, &geometry)?;
        let v = repeat_kv(&v.to_dtype(probs.dtype())?, geometry.n_rep)?.contiguous()?;
        let output = probs.matmul(&v)?;
        Ok(output.to_dtype(q.dtype())?)
    }
}

/// Scaled dot-product attention with the default [`ExactAttention`] kernel.
pub fn scaled_dot_product(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    config: &Config,
) -> Result<Tensor, AttentionError> {
    ExactAttention.attend(q, k, v, mask, config)
}

fn working_dtype(dtype: DType, config: &Config) -> DType {
    match dtype {
        DType::F16 | DType::BF16 if config.upcast => DType::F32,
        other => other,
    }
}

fn validate(q: &Tensor, k: &Tensor, v: Option<&Tensor>) -> Result<Geometry, AttentionError> {
    let device = q.device();
    if !device.same_device(k.device()) || v.map_or(false, |v| !device.same_device(v.device())) {
        return Err(invalid_shape("q, k, v must reside on the same device"));
    }
    if !matches!(q.dtype(), DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
        return Err(invalid_shape(format!(
            "unsupported attention dtype {:?}",
            q.dtype()
        )));
    }

    let (batch, heads, q_len, head_dim) = q
        .dims4()
        .map_err(|_| invalid_shape(format!("q must be 4-D, got {:?}", q.dims())))?;
    let (kb, kv_heads, k_len, kd) = k
        .dims4()
        .map_err(|_| invalid_shape(format!("k must be 4-D, got {:?}", k.dims())))?;

    if kb != batch || kd != head_dim {
        return Err(invalid_shape(format!(
            "k shape mismatch: expected [{batch}, ?, ?, {head_dim}] got [{kb}, {kv_heads}, {k_len}, {kd}]"
        )));
    }
    if kv_heads == 0 || heads % kv_heads != 0 {
        return Err(invalid_shape(format!(
            "query heads {heads} are not a multiple of key/value heads {kv_heads}"
        )));
    }
    if let Some(v) = v {
        if v.dims() != k.dims() {
            return Err(invalid_shape(format!(
                "v shape {:?} must match k shape {:?}",
                v.dims(),
                k.dims()
            )));
        }
    }

    Ok(Geometry {
        batch,
        heads,
        q_len,
        head_dim,
        n_rep: heads / kv_heads.max(1),
    })
}
