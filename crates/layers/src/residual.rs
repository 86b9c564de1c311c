//! Residual composition helpers.
//!
//! Plain pre-norm blocks add the sublayer output to the un-normalised input.
//! Gated blocks first scale the sublayer output by `tanh(gate)`, a learned
//! scalar bounded to `(-1, 1)`; a gate at zero turns the block into the
//! identity on its residual.

use candle_core::{Result, Tensor};
use candle_nn::{init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// Adds `branch` to `residual` after checking both share a shape.
pub fn residual_add(branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    checks::expect_shape("residual.branch", branch, residual.dims())?;
    let sum = policy
        .cast_for_matmul(branch)?
        .add(&policy.cast_for_matmul(residual)?)?;
    policy.cast_to_storage(&sum)
}

/// Learned scalar gate applied as `x * tanh(gate)`.
#[derive(Debug, Clone)]
pub struct TanhGate {
    gate: Tensor,
}

impl TanhGate {
    pub fn new(gate: Tensor) -> Result<Self> {
        checks::expect_shape("gate", &gate, &[1])?;
        Ok(Self { gate })
    }

    /// Loads the one-element gate tensor `name`; fresh variables start at zero.
    pub fn load(vb: &VarBuilder, name: &str) -> Result<Self> {
        Self::new(vb.get_with_hints(1, name, init::ZERO)?)
    }

    /// Current bounded gate value `tanh(gate)`.
    pub fn value(&self) -> Result<f32> {
        self.gate
            .to_dtype(candle_core::DType::F32)?
            .tanh()?
            .squeeze(0)?
            .to_vec0::<f32>()
    }

    pub fn forward(&self, branch: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let bounded = policy.cast_for_matmul(&self.gate)?.tanh()?;
        let gated = policy.cast_for_matmul(branch)?.broadcast_mul(&bounded)?;
        policy.cast_to_storage(&gated)
    }
}
