//! Activation catalogue for the feed-forward stack.
//!
//! Activations keep the input layout. Each one evaluates in the compute dtype
//! of the supplied [`PrecisionPolicy`] and casts back to storage so reduced
//! precision weights never run the non-linearity in `f16`/`bf16`.
//!
//! * **SiLU / Swish** computes `x * sigmoid(x)`; it drives the gate branch of
//!   the gated feed-forward unit.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    /// Pass-through, useful when debugging composite stacks.
    Identity,
    /// Sigmoid-weighted linear unit.
    #[default]
    Silu,
    Gelu,
}

impl ActivationKind {
    pub fn forward(self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self {
            ActivationKind::Identity => compute,
            ActivationKind::Silu => compute.silu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
        };
        policy.cast_to_storage(&activated)
    }
}
