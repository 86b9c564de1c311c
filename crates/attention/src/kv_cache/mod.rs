//! Interfaces and helpers for key/value cache management.
//!
//! A cache is partitioned per decoder layer. [`CacheProvider::sub`] hands out
//! the slice owned by one layer and [`KeyValueCache::put`] appends the current
//! step's projections, returning everything accumulated so far.

pub mod api;
pub mod paged;

pub use api::{CacheProvider, CacheStats, KeyValueCache};
pub use paged::{CacheConfig, PagedKeyValueCache};
