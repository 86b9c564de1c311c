//! The two decoder layer variants and the tagged dispatch over them.

use attention::KeyValueCache;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use embedding::RotaryEmbedding;
use layers::{residual_add, FeedForwardConfig, GatedFeedForward, RmsNorm, TanhGate};

use crate::config::{AttentionGeometry, TextModelConfig};
use crate::context::ForwardContext;
use crate::cross_attention::CrossAttention;
use crate::error::Result;
use crate::self_attention::SelfAttention;

/// Which variant a decoder index was built as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    SelfAttention,
    CrossAttention,
}

/// Pre-norm block: `h += attn(norm(h)); h += ffn(norm(h))`.
#[derive(Debug, Clone)]
pub struct SelfAttentionDecoderLayer {
    attn_norm: RmsNorm,
    attention: SelfAttention,
    ffn_norm: RmsNorm,
    mlp: GatedFeedForward,
}

impl SelfAttentionDecoderLayer {
    pub fn load(
        config: &TextModelConfig,
        geometry: AttentionGeometry,
        rope: RotaryEmbedding,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attn_norm: RmsNorm::load(config.hidden_size, config.epsilon, vb.pp("attn_norm"))?,
            attention: SelfAttention::load(geometry, rope, vb.clone())?,
            ffn_norm: RmsNorm::load(config.hidden_size, config.epsilon, vb.pp("ffn_norm"))?,
            mlp: GatedFeedForward::load(
                FeedForwardConfig::new(config.hidden_size, config.intermediate_size),
                vb,
            )?,
        })
    }

    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        positions: &Tensor,
        mask: Option<&Tensor>,
        cache: &mut dyn KeyValueCache,
    ) -> Result<Tensor> {
        let policy = ctx.policy();
        let attn = self.attention.forward(
            ctx,
            &self.attn_norm.forward(hidden, policy)?,
            positions,
            mask,
            cache,
        )?;
        let hidden = residual_add(&attn, hidden, policy)?;
        let ffn = self.mlp.forward(&self.ffn_norm.forward(&hidden, policy)?, policy)?;
        Ok(residual_add(&ffn, &hidden, policy)?)
    }
}

/// Gated pre-norm block: `h += tanh(g_attn) * xattn(norm(h), cross)`, then
/// the same for the feed-forward branch with `g_mlp`.
#[derive(Debug, Clone)]
pub struct CrossAttentionDecoderLayer {
    attn_norm: RmsNorm,
    attention: CrossAttention,
    attn_gate: TanhGate,
    ffn_norm: RmsNorm,
    mlp: GatedFeedForward,
    mlp_gate: TanhGate,
}

impl CrossAttentionDecoderLayer {
    pub fn load(
        config: &TextModelConfig,
        geometry: AttentionGeometry,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attn_norm: RmsNorm::load(config.hidden_size, config.epsilon, vb.pp("attn_norm"))?,
            attention: CrossAttention::load(geometry, config.epsilon, vb.clone())?,
            attn_gate: TanhGate::load(&vb, "cross_attn_attn_gate")?,
            ffn_norm: RmsNorm::load(config.hidden_size, config.epsilon, vb.pp("ffn_norm"))?,
            mlp: GatedFeedForward::load(
                FeedForwardConfig::new(config.hidden_size, config.intermediate_size),
                vb.clone(),
            )?,
            mlp_gate: TanhGate::load(&vb, "cross_attn_mlp_gate")?,
        })
    }

    /// Bounded gate values `(tanh(g_attn), tanh(g_mlp))`.
    pub fn gates(&self) -> Result<(f32, f32)> {
        Ok((self.attn_gate.value()?, self.mlp_gate.value()?))
    }

    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        cross_state: &Tensor,
    ) -> Result<Tensor> {
        let policy = ctx.policy();
        let attn = self
            .attention
            .forward(ctx, &self.attn_norm.forward(hidden, policy)?, cross_state)?;
        let hidden = residual_add(&self.attn_gate.forward(&attn, policy)?, hidden, policy)?;
        let ffn = self.mlp.forward(&self.ffn_norm.forward(&hidden, policy)?, policy)?;
        Ok(residual_add(&self.mlp_gate.forward(&ffn, policy)?, &hidden, policy)?)
    }
}

/// Decoder layer chosen at construction from the cross-attention index set.
#[derive(Debug, Clone)]
pub enum DecoderLayer {
    SelfAttention(SelfAttentionDecoderLayer),
    CrossAttention(CrossAttentionDecoderLayer),
}

impl DecoderLayer {
    pub fn kind(&self) -> LayerKind {
        match self {
            DecoderLayer::SelfAttention(_) => LayerKind::SelfAttention,
            DecoderLayer::CrossAttention(_) => LayerKind::CrossAttention,
        }
    }

    pub fn is_cross_attention(&self) -> bool {
        matches!(self, DecoderLayer::CrossAttention(_))
    }

    /// Runs the layer. Self-attention layers read `positions`, `mask` and
    /// `cache`; cross-attention layers read only `cross_state`, which must be
    /// present (the decoder skips them otherwise).
    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        positions: &Tensor,
        mask: Option<&Tensor>,
        cross_state: Option<&Tensor>,
        cache: &mut dyn KeyValueCache,
    ) -> Result<Tensor> {
        match (self, cross_state) {
            (DecoderLayer::SelfAttention(layer), _) => {
                layer.forward(ctx, hidden, positions, mask, cache)
            }
            (DecoderLayer::CrossAttention(layer), Some(cross_state)) => {
                layer.forward(ctx, hidden, cross_state)
            }
            (DecoderLayer::CrossAttention(_), None) => Ok(hidden.clone()),
        }
    }
}
