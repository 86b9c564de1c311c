//! Portable, exact attention kernels.
//!
//! These paths favour clarity over absolute performance and serve as the
//! baseline the decoder runs on every device candle supports.

pub mod exact;

pub use exact::{scaled_dot_product, ExactAttention};
