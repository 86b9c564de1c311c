//! Embedding crate
//!
//! Token lookup tables and rotary positional embeddings.

pub mod positional;
pub mod token;

pub use positional::rope::{RopeConfig, RotaryEmbedding};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
