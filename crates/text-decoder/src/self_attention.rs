//! Token-to-token attention with grouped-query heads and rotary positions.

use attention::{Attention, Config as AttentionConfig, ExactAttention, KeyValueCache};
use candle_core::Tensor;
use candle_nn::VarBuilder;
use embedding::RotaryEmbedding;
use layers::{checks, Linear, LinearConfig};

use crate::config::AttentionGeometry;
use crate::context::ForwardContext;
use crate::error::{from_attention, Result};
use crate::heads::{merge_heads, split_heads};

/// Self-attention unit of one decoder layer.
///
/// Weights: `attn_q`, `attn_k`, `attn_v`, `attn_output`.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    geometry: AttentionGeometry,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rope: RotaryEmbedding,
    kernel: ExactAttention,
    attention_config: AttentionConfig,
}

impl SelfAttention {
    pub fn load(geometry: AttentionGeometry, rope: RotaryEmbedding, vb: VarBuilder) -> Result<Self> {
        let hidden = geometry.hidden_size;
        let q_proj = Linear::load(LinearConfig::new(hidden, geometry.q_width()), vb.pp("attn_q"))?;
        let k_proj = Linear::load(LinearConfig::new(hidden, geometry.kv_width()), vb.pp("attn_k"))?;
        let v_proj = Linear::load(LinearConfig::new(hidden, geometry.kv_width()), vb.pp("attn_v"))?;
        let o_proj = Linear::load(
            LinearConfig::new(geometry.q_width(), hidden),
            vb.pp("attn_output"),
        )?;
        Ok(Self {
            geometry,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rope,
            kernel: ExactAttention::new(),
            attention_config: AttentionConfig::default(),
        })
    }

    pub fn geometry(&self) -> &AttentionGeometry {
        &self.geometry
    }

    /// Attends `hidden` `(batch, seq, hidden)` over the cached history plus the
    /// current positions.
    ///
    /// `positions` holds one id per token in `seq`; `mask`, when present, is
    /// added to the `(.., seq, history + seq)` scores before the softmax. The
    /// new keys and values are appended to `cache`. An empty sequence returns
    /// an empty tensor and leaves the cache untouched.
    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        positions: &Tensor,
        mask: Option<&Tensor>,
        cache: &mut dyn KeyValueCache,
    ) -> Result<Tensor> {
        checks::expect_rank("self_attention.input", hidden, 3)?;
        checks::expect_last_dim("self_attention.input", hidden, self.geometry.hidden_size)?;
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

        let q = split_heads(&self.q_proj.forward(hidden, policy)?, num_heads, head_dim)?;
        let k = split_heads(&self.k_proj.forward(hidden, policy)?, num_kv_heads, head_dim)?;
        let v = split_heads(&self.v_proj.forward(hidden, policy)?, num_kv_heads, head_dim)?;

        let (q, k) = self.rope.apply_to_qk(&q, &k, positions)?;
        let (k, v) = cache.put(&k, &v)?;

        let attn = self
            .kernel
            .attend(&q, &k, &v, mask, &self.attention_config)
            .map_err(from_attention)?;
        Ok(self.o_proj.forward(&merge_heads(&attn)?, policy)?)
    }
}
