//! Gated (SwiGLU-style) feed-forward unit.
//!
//! `output = down(act(gate(x)) * up(x))`. The unit applies no normalisation;
//! decoder layers pre-normalise its input. The hidden layout is preserved: an
//! input shaped `(batch, seq, hidden)` returns `(batch, seq, hidden)`.

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied to the gate branch.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation: ActivationKind::Silu,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatedFeedForward {
    config: FeedForwardConfig,
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl GatedFeedForward {
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size);
        for (label, layer, expected) in [
            ("ffn_gate", &gate, expand),
            ("ffn_up", &up, expand),
            ("ffn_down", &down, contract),
        ] {
            let actual = layer.config();
            if (actual.input_dim, actual.output_dim) != (expected.input_dim, expected.output_dim) {
                candle_core::bail!(
                    "{label}: expected {}x{} projection, got {}x{}",
                    expected.input_dim,
                    expected.output_dim,
                    actual.input_dim,
                    actual.output_dim
                );
            }
        }
        Ok(Self {
            config,
            gate,
            up,
            down,
        })
    }

    /// Loads `ffn_gate`, `ffn_up` and `ffn_down` from `vb`.
    pub fn load(config: FeedForwardConfig, vb: VarBuilder) -> Result<Self> {
        let expand = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let contract = LinearConfig::new(config.intermediate_size, config.hidden_size);
        let gate = Linear::load(expand, vb.pp("ffn_gate"))?;
        let up = Linear::load(expand, vb.pp("ffn_up"))?;
        let down = Linear::load(contract, vb.pp("ffn_down"))?;
        Self::new(config, gate, up, down)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let gated = self
            .config
            .activation
            .forward(&self.gate.forward(hidden, policy)?, policy)?;
        let up = self.up.forward(hidden, policy)?;
        let mixed = policy
            .cast_for_matmul(&gated)?
            .mul(&policy.cast_for_matmul(&up)?)?;
        self.down.forward(&policy.cast_to_storage(&mixed)?, policy)
    }
}
