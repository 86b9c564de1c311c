//! Model configuration and the immutable structures derived from it.
//!
//! Field aliases accept the GGUF metadata keys (`embedding_length`,
//! `attention.head_count`, ...) so a metadata dump deserialises directly.

use std::collections::BTreeSet;

use embedding::RopeConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

fn default_epsilon() -> f64 {
    1e-5
}

fn default_rope_base() -> f32 {
    10_000.0
}

fn default_rope_scale() -> f32 {
    1.0
}

/// High-level configuration for assembling the text decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextModelConfig {
    pub vocab_size: usize,
    #[serde(alias = "embedding_length")]
    pub hidden_size: usize,
    #[serde(alias = "feed_forward_length")]
    pub intermediate_size: usize,
    #[serde(alias = "attention.head_count")]
    pub num_heads: usize,
    /// Key/value heads. `None` means plain multi-head attention.
    #[serde(default, alias = "attention.head_count_kv")]
    pub num_kv_heads: Option<usize>,
    pub block_count: usize,
    #[serde(default = "default_epsilon", alias = "attention.layer_norm_rms_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_rope_base", alias = "rope.freq_base")]
    pub rope_base: f32,
    #[serde(default = "default_rope_scale", alias = "rope.freq_scale")]
    pub rope_scale: f32,
    /// Rotated features per head. `None` rotates the whole head.
    #[serde(default, alias = "rope.dimension_count")]
    pub rope_dim: Option<usize>,
    #[serde(default, alias = "attention.cross_attention_layers")]
    pub cross_attention_layers: Vec<usize>,
    /// Reuse `token_embd` for the read-out when `output` is absent.
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

impl TextModelConfig {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        intermediate_size: usize,
        num_heads: usize,
        block_count: usize,
    ) -> Self {
        Self {
            vocab_size,
            hidden_size,
            intermediate_size,
            num_heads,
            num_kv_heads: None,
            block_count,
            epsilon: default_epsilon(),
            rope_base: default_rope_base(),
            rope_scale: default_rope_scale(),
            rope_dim: None,
            cross_attention_layers: Vec::new(),
            tie_word_embeddings: false,
        }
    }

    pub fn with_kv_heads(mut self, num_kv_heads: usize) -> Self {
        self.num_kv_heads = Some(num_kv_heads);
        self
    }

    pub fn with_cross_attention_layers(mut self, layers: impl IntoIterator<Item = usize>) -> Self {
        self.cross_attention_layers = layers.into_iter().collect();
        self
    }

    pub fn with_rope_dim(mut self, rope_dim: usize) -> Self {
        self.rope_dim = Some(rope_dim);
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    /// Per-head width. Only meaningful once [`validate`](Self::validate) passed.
    pub fn head_dim(&self) -> usize {
        self.hidden_size.checked_div(self.num_heads).unwrap_or(0)
    }

    pub fn is_cross_attention_layer(&self, layer: usize) -> bool {
        self.cross_attention_layers.contains(&layer)
    }

    /// Rejects every structural inconsistency the decoder cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.kv_heads()),
            ("block_count", self.block_count),
        ] {
            if value == 0 {
                return Err(config_error(format!("{name} must be greater than zero")));
            }
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(config_error(format!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                self.hidden_size, self.num_heads
            )));
        }
        if self.num_heads % self.kv_heads() != 0 {
            return Err(config_error(format!(
                "num_heads ({}) must be a multiple of num_kv_heads ({})",
                self.num_heads,
                self.kv_heads()
            )));
        }

        let head_dim = self.head_dim();
        let rope_dim = self.rope_dim.unwrap_or(head_dim);
        if rope_dim == 0 || rope_dim > head_dim || rope_dim % 2 != 0 {
            return Err(config_error(format!(
                "rope_dim ({rope_dim}) must be even and within (0, {head_dim}]"
            )));
        }
        if !(self.rope_base > 0.0) {
            return Err(config_error(format!("rope_base must be positive, got {}", self.rope_base)));
        }
        if !(self.rope_scale > 0.0) {
            return Err(config_error(format!(
                "rope_scale must be positive, got {}",
                self.rope_scale
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(config_error(format!("epsilon must be positive, got {}", self.epsilon)));
        }

        let mut seen = BTreeSet::new();
        for &layer in &self.cross_attention_layers {
            if layer >= self.block_count {
                return Err(config_error(format!(
                    "cross-attention layer {layer} out of range for {} blocks",
                    self.block_count
                )));
            }
            if !seen.insert(layer) {
                return Err(config_error(format!("cross-attention layer {layer} listed twice")));
            }
        }
        Ok(())
    }

    pub fn geometry(&self) -> AttentionGeometry {
        AttentionGeometry {
            hidden_size: self.hidden_size,
            num_heads: self.num_heads,
            num_kv_heads: self.kv_heads(),
            head_dim: self.head_dim(),
        }
    }

    pub fn rope(&self) -> RopeParameters {
        RopeParameters {
            rope_dim: self.rope_dim.unwrap_or(self.head_dim()),
            base: self.rope_base,
            scale: self.rope_scale,
        }
    }
}

fn config_error(message: String) -> ModelError {
    ModelError::Config(message)
}

/// Head layout shared by both attention units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionGeometry {
    pub hidden_size: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
}

impl AttentionGeometry {
    /// Query heads per key/value head.
    pub fn group_size(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }

    pub fn q_width(&self) -> usize {
        self.num_heads * self.head_dim
    }

    pub fn kv_width(&self) -> usize {
        self.num_kv_heads * self.head_dim
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RopeParameters {
    pub rope_dim: usize,
    pub base: f32,
    pub scale: f32,
}

impl RopeParameters {
    pub fn to_rope_config(&self, head_dim: usize) -> RopeConfig {
        RopeConfig {
            head_dim,
            rotate_dim: Some(self.rope_dim),
            rope_theta: self.base,
            freq_scale: self.scale,
        }
    }
}
