//! Embedding, decoder stack, final norm and read-out.

use attention::CacheProvider;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use embedding::{RotaryEmbedding, TokenEmbedding, TokenEmbeddingConfig};
use layers::{Linear, LinearConfig, RmsNorm};

use crate::config::TextModelConfig;
use crate::context::ForwardContext;
use crate::decoder::TextDecoder;
use crate::error::{ModelError, Result};
use crate::layer::{
    CrossAttentionDecoderLayer, DecoderLayer, LayerKind, SelfAttentionDecoderLayer,
};

/// Inputs of one forward pass besides the cache.
///
/// `token_ids` is `(batch, seq)`, `positions` holds `seq` ids shared across
/// the batch, `mask` is an additive mask broadcastable to
/// `(batch, heads, seq, history + seq)`, and `cross_state` is the vision
/// conditioning tensor.
#[derive(Debug, Clone, Copy)]
pub struct TextModelInput<'a> {
    pub token_ids: &'a Tensor,
    pub positions: &'a Tensor,
    pub mask: Option<&'a Tensor>,
    pub cross_state: Option<&'a Tensor>,
    pub cross_mask: Option<&'a Tensor>,
}

impl<'a> TextModelInput<'a> {
    pub fn new(token_ids: &'a Tensor, positions: &'a Tensor) -> Self {
        Self {
            token_ids,
            positions,
            mask: None,
            cross_state: None,
            cross_mask: None,
        }
    }

    pub fn with_mask(mut self, mask: &'a Tensor) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_cross_state(mut self, cross_state: &'a Tensor) -> Self {
        self.cross_state = Some(cross_state);
        self
    }

    pub fn with_cross_mask(mut self, cross_mask: &'a Tensor) -> Self {
        self.cross_mask = Some(cross_mask);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TextModel {
    config: TextModelConfig,
    embedding: TokenEmbedding,
    decoder: TextDecoder,
    output_norm: RmsNorm,
    output: Linear,
}

impl TextModel {
    /// Builds the model from `vb` (rooted at the GGUF tensor namespace).
    ///
    /// Layer `i` becomes a cross-attention layer when `i` is listed in
    /// `config.cross_attention_layers`, a self-attention layer otherwise.
    pub fn new(config: TextModelConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let geometry = config.geometry();

        let embedding = TokenEmbedding::load(
            TokenEmbeddingConfig {
                vocab_size: config.vocab_size,
                hidden_dim: config.hidden_size,
            },
            vb.pp("token_embd"),
        )?;
        let rope = RotaryEmbedding::load(config.rope().to_rope_config(geometry.head_dim), &vb)?;

        let blocks = vb.pp("blk");
        let mut layers = Vec::with_capacity(config.block_count);
        for index in 0..config.block_count {
            let block_vb = blocks.pp(index.to_string());
            let layer = if config.is_cross_attention_layer(index) {
                DecoderLayer::CrossAttention(CrossAttentionDecoderLayer::load(
                    &config, geometry, block_vb,
                )?)
            } else {
                DecoderLayer::SelfAttention(SelfAttentionDecoderLayer::load(
                    &config,
                    geometry,
                    rope.clone(),
                    block_vb,
                )?)
            };
            layers.push(layer);
        }

        let output_norm = RmsNorm::load(config.hidden_size, config.epsilon, vb.pp("output_norm"))?;
        let output = if config.tie_word_embeddings && !vb.contains_tensor("output.weight") {
            Linear::tied(embedding.weight())?
        } else {
            Linear::load(
                LinearConfig::new(config.hidden_size, config.vocab_size),
                vb.pp("output"),
            )?
        };

        log::info!(
            "text model: layers={} cross={:?} hidden={} heads={}/{} head_dim={} vocab={} rope=[{}] tied_output={}",
            config.block_count,
            config.cross_attention_layers,
            geometry.hidden_size,
            geometry.num_heads,
            geometry.num_kv_heads,
            geometry.head_dim,
            config.vocab_size,
            rope.fingerprint(),
            config.tie_word_embeddings
        );

        Ok(Self {
            config,
            embedding,
            decoder: TextDecoder::new(layers),
            output_norm,
            output,
        })
    }

    pub fn config(&self) -> &TextModelConfig {
        &self.config
    }

    pub fn decoder(&self) -> &TextDecoder {
        &self.decoder
    }

    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        self.decoder.layer_kinds()
    }

    /// Final normalised hidden state `(batch, seq, hidden)`.
    pub fn forward_hidden(
        &self,
        ctx: &ForwardContext,
        input: TextModelInput<'_>,
        cache: &mut dyn CacheProvider,
    ) -> Result<Tensor> {
        let (batch, seq) = input.token_ids.dims2().map_err(|_| {
            ModelError::Shape(format!(
                "token ids must be [batch, seq], got {:?}",
                input.token_ids.dims()
            ))
        })?;
        let positions = input.positions.dims1().map_err(|_| {
            ModelError::Shape(format!(
                "position ids must be 1-D, got {:?}",
                input.positions.dims()
            ))
        })?;
        if positions != seq {
            return Err(ModelError::Shape(format!(
                "{positions} position ids for {seq} tokens"
            )));
        }

        let inputs = [
            ("token ids", Some(input.token_ids)),
            ("position ids", Some(input.positions)),
            ("mask", input.mask),
            ("cross state", input.cross_state),
            ("cross mask", input.cross_mask),
        ];
        for (label, tensor) in inputs {
            if let Some(tensor) = tensor {
                ensure_on_device(label, tensor, ctx.device())?;
            }
        }

        let policy = ctx.policy();
        let hidden = policy.cast_to_storage(&self.embedding.forward(input.token_ids)?)?;
        if seq == 0 {
            return Ok(hidden);
        }

        let hidden = self.decoder.forward(
            ctx,
            &hidden,
            input.positions,
            input.mask,
            input.cross_state,
            input.cross_mask,
            cache,
        )?;
        log::debug!(
            "forward: batch={batch} seq={seq} cross_state={}",
            input.cross_state.is_some()
        );
        Ok(self.output_norm.forward(&hidden, policy)?)
    }

    /// Next-token logits `(batch, seq, vocab_size)`.
    pub fn forward(
        &self,
        ctx: &ForwardContext,
        input: TextModelInput<'_>,
        cache: &mut dyn CacheProvider,
    ) -> Result<Tensor> {
        let hidden = self.forward_hidden(ctx, input, cache)?;
        let (batch, seq, _) = hidden.dims3()?;
        if seq == 0 {
            return Ok(Tensor::zeros(
                (batch, 0, self.config.vocab_size),
                hidden.dtype(),
                hidden.device(),
            )?);
        }
        Ok(self.output.forward(&hidden, ctx.policy())?)
    }
}

fn ensure_on_device(label: &str, tensor: &Tensor, device: &Device) -> Result<()> {
    if tensor.device().same_device(device) {
        return Ok(());
    }
    Err(ModelError::Device(format!(
        "{label} live on {:?}, forward context runs on {:?}",
        tensor.device().location(),
        device.location()
    )))
}
