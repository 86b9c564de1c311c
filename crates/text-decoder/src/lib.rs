//! Text decoder of a vision-language model.
//!
//! Token ids are embedded, run through a configuration-defined stack of
//! self-attention and gated cross-attention layers, normalised and projected
//! to vocabulary logits. Cross-attention layers only execute when a
//! cross-modal (vision) state is supplied, so one model serves both image
//! prompts and plain text continuation.
//!
//! Every forward call borrows a [`ForwardContext`] and a
//! [`CacheProvider`](attention::CacheProvider); neither is retained by the
//! model.

pub mod config;
pub mod context;
pub mod cross_attention;
pub mod decoder;
pub mod error;
mod heads;
pub mod layer;
pub mod model;
pub mod self_attention;

pub use config::{AttentionGeometry, RopeParameters, TextModelConfig};
pub use context::ForwardContext;
pub use cross_attention::CrossAttention;
pub use decoder::TextDecoder;
pub use error::{ModelError, Result};
pub use layer::{CrossAttentionDecoderLayer, DecoderLayer, LayerKind, SelfAttentionDecoderLayer};
pub use model::{TextModel, TextModelInput};
pub use self_attention::SelfAttention;
