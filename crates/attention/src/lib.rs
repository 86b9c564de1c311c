//! Attention primitives for the text decoder.
//!
//! The crate computes scaled dot-product attention over tensors laid out as
//! `[batch, n_heads, seq_len, head_dim]`. Keys and values may carry fewer
//! heads than queries (grouped-query attention): query head `h` reads key/value
//! head `h / (n_heads / n_kv_heads)`. Reductions run in `f32` and the output
//! matches the query dtype.
//!
//! Masks are additive and optional. The kernel never builds a causal mask on
//! its own; callers supply one from [`masks::build_causal_mask`] when future
//! positions must be hidden, and cross-modal attention runs unmasked.
//!
//! The [`kv_cache`] module defines the per-layer cache contract the decoder
//! relies on and a paged implementation of it.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod ops;
pub mod reference;

pub use crate::core::{Attention, AttentionError, Config};
pub use kv_cache::{CacheConfig, CacheProvider, CacheStats, KeyValueCache, PagedKeyValueCache};
pub use reference::{scaled_dot_product, ExactAttention};
