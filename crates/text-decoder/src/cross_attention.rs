//! Text-to-vision attention.
//!
//! Queries come from the text hidden state, keys and values from the
//! cross-modal state. There is no rotary embedding and no mask, and queries
//! and keys are RMS-normalised per head before scoring. Key/value projections
//! are recomputed on every call.

use attention::{Attention, Config as AttentionConfig, ExactAttention};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use layers::{checks, Linear, LinearConfig, RmsNorm};

use crate::config::AttentionGeometry;
use crate::context::ForwardContext;
use crate::error::{from_attention, ModelError, Result};
use crate::heads::{merge_heads, split_heads};

/// Weights: `cross_attn_{q,k,v,o}_proj`, `cross_attn_{q,k}_norm`.
#[derive(Debug, Clone)]
pub struct CrossAttention {
    geometry: AttentionGeometry,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    kernel: ExactAttention,
    attention_config: AttentionConfig,
}

impl CrossAttention {
    pub fn load(geometry: AttentionGeometry, epsilon: f64, vb: VarBuilder) -> Result<Self> {
        let hidden = geometry.hidden_size;
        let head_dim = geometry.head_dim;
        Ok(Self {
            geometry,
            q_proj: Linear::load(
                LinearConfig::new(hidden, geometry.q_width()),
                vb.pp("cross_attn_q_proj"),
            )?,
            k_proj: Linear::load(
                LinearConfig::new(hidden, geometry.kv_width()),
                vb.pp("cross_attn_k_proj"),
            )?,
            v_proj: Linear::load(
                LinearConfig::new(hidden, geometry.kv_width()),
                vb.pp("cross_attn_v_proj"),
            )?,
            o_proj: Linear::load(
                LinearConfig::new(geometry.q_width(), hidden),
                vb.pp("cross_attn_o_proj"),
            )?,
            q_norm: RmsNorm::load(head_dim, epsilon, vb.pp("cross_attn_q_norm"))?,
            k_norm: RmsNorm::load(head_dim, epsilon, vb.pp("cross_attn_k_norm"))?,
            kernel: ExactAttention::new(),
            attention_config: AttentionConfig::default(),
        })
    }

    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        cross_state: &Tensor,
    ) -> Result<Tensor> {
        checks::expect_rank("cross_attention.input", hidden, 3)?;
        checks::expect_last_dim("cross_attention.input", hidden, self.geometry.hidden_size)?;
        let (batch, seq, _) = hidden.dims3()?;
        if seq == 0 {
            return Ok(Tensor::zeros(
                (batch, 0, self.geometry.hidden_size),
                hidden.dtype(),
                hidden.device(),
            )?);
        }
        let policy = ctx.policy();
        let AttentionGeometry {
            num_heads,
            num_kv_heads,
            head_dim,
            ..
        } = self.geometry;
        let cross = flatten_cross_state(cross_state, batch, self.geometry.hidden_size)?;

        let q = split_heads(&self.q_proj.forward(hidden, policy)?, num_heads, head_dim)?;
        let q = self.q_norm.forward(&q, policy)?;
        let k = split_heads(&self.k_proj.forward(&cross, policy)?, num_kv_heads, head_dim)?;
        let k = self.k_norm.forward(&k, policy)?;
        let v = split_heads(&self.v_proj.forward(&cross, policy)?, num_kv_heads, head_dim)?;

        let attn = self
            .kernel
            .attend(&q, &k, &v, None, &self.attention_config)
            .map_err(from_attention)?;
        Ok(self.o_proj.forward(&merge_heads(&attn)?, policy)?)
    }
}

/// Collapses tiles and vision tokens into one key axis.
///
/// Accepts `(tiles, vision_tokens, hidden)` for a single sequence or
/// `(batch, tiles, vision_tokens, hidden)`; a batch of one is broadcast over
/// `batch` text sequences. Returns `(batch, tiles * vision_tokens, hidden)`.
pub fn flatten_cross_state(cross_state: &Tensor, batch: usize, hidden: usize) -> Result<Tensor> {
    let (state_batch, tiles, tokens, width) = match *cross_state.dims() {
        [tiles, tokens, width] => (1, tiles, tokens, width),
        [state_batch, tiles, tokens, width] => (state_batch, tiles, tokens, width),
        _ => {
            return Err(ModelError::Shape(format!(
                "cross-modal state must be [tiles, tokens, hidden] or [batch, tiles, tokens, hidden], got {:?}",
                cross_state.dims()
            )))
        }
    };
    if width != hidden {
        return Err(ModelError::Shape(format!(
            "cross-modal state width {width} does not match hidden size {hidden}"
        )));
    }
    if tiles * tokens == 0 {
        return Err(ModelError::Shape(
            "cross-modal state holds no vision tokens".to_string(),
        ));
    }
    let flat = cross_state.reshape((state_batch, tiles * tokens, hidden))?;
    match state_batch {
        b if b == batch => Ok(flat),
        1 => Ok(flat.broadcast_as((batch, tiles * tokens, hidden))?.contiguous()?),
        other => Err(ModelError::Shape(format!(
            "cross-modal batch {other} does not match text batch {batch}"
        ))),
    }
}
