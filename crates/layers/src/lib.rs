//! Building blocks for the decoder layers.
//!
//! Every component here consumes hidden states laid out as `(.., in_dim)` and
//! is loaded through a [`candle_nn::VarBuilder`] using GGUF tensor names. Forward
//! passes receive a [`PrecisionPolicy`] from the caller rather than storing one,
//! so a single set of weights can serve independent forward passes.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig};
pub use mlp::{FeedForwardConfig, GatedFeedForward};
pub use norm::RmsNorm;
pub use residual::{residual_add, TanhGate};
