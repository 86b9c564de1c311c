//! Dense projections.
//!
//! Inputs may have any number of leading axes; only the trailing axis is
//! projected, so `(batch, seq, in_dim)` becomes `(batch, seq, out_dim)` and
//! `(batch, tiles, tokens, in_dim)` keeps its three leading axes. Weights are
//! stored `(out_dim, in_dim)` as in GGUF/safetensors checkpoints. Matmuls run in
//! [`PrecisionPolicy::compute`] and results are cast back to storage.

use candle_core::{Error, Result, Tensor};
use candle_nn::{init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector is applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Projection without bias, the layout used by every decoder projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Affine projection `x · Wᵀ (+ b)`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Wraps pre-existing parameters after validating their geometry.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            &weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", &weight, checks::PARAMETER_DTYPES)?;
        match (config.bias, &bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
            }
            (false, Some(_)) => {
                return Err(Error::Msg("bias provided but config disables bias".into()))
            }
            (true, None) => return Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => {}
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Loads `weight` (and `bias` when configured) from `vb`.
    pub fn load(config: LinearConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.output_dim, config.input_dim),
            "weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bias = if config.bias {
            Some(vb.get_with_hints(config.output_dim, "bias", init::ZERO)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Builds a bias-free projection sharing `weight` (used for tied read-out heads).
    pub fn tied(weight: &Tensor) -> Result<Self> {
        let (output_dim, input_dim) = weight.dims2()?;
        Self::new(LinearConfig::new(input_dim, output_dim), weight.clone(), None)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Projects the trailing axis of `hidden`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;
        let dims = hidden.dims();
        if dims.len() < 2 {
            return Err(Error::Msg(format!(
                "linear expects at least two axes, got {dims:?}"
            )));
        }

        let rows: usize = dims[..dims.len() - 1].iter().product();
        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.config.output_dim);

        let input = policy
            .cast_for_matmul(hidden)?
            .reshape((rows, self.config.input_dim))?;
        let weight_t = policy.cast_for_matmul(&self.weight)?.t()?;
        let mut output = input.matmul(&weight_t)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(&policy.cast_for_matmul(bias)?)?;
        }

        policy.cast_to_storage(&output.reshape(out_dims)?)
    }
}
