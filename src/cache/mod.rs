//! # Stale-While-Revalidate Cache
//!
//! This module wraps any [`Source`](crate::Source) with a cache held in an
//! external key/value store. Cached data is served immediately; expired data
//! is served too, while a background task fetches a replacement.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CachedSource`] | The decorator; implements [`Source`](crate::Source) itself |
//! | [`CacheConfig`] | Namespace, `ttl` and `stale` window |
//! | [`CacheStore`] | Trait for the external store (`get`, `set`, `error`) |
//! | [`MemoryStore`] | In-process store with TTL eviction |
//! | [`NullStore`] | Store that never holds anything |
//! | [`codec`] | Byte layout of stored values |
//!
//! ## Example
//!
//! ```rust,no_run
//! use stale_cache::cache::{CacheConfig, CachedSource, MemoryStore};
//! use stale_cache::{FetchResult, Fetched, Metadata, Source};
//! use std::sync::Arc;
//!
//! struct Tiles;
//!
//! #[async_trait::async_trait]
//! impl Source for Tiles {
//!     async fn get(&self, id: &str) -> FetchResult {
//!         Ok(Fetched::new(format!("tile {}", id), Metadata::new()))
//!     }
//! }
//!
//! # async fn run() -> stale_cache::Result<()> {
//! let cached = CachedSource::builder(Tiles, CacheConfig::new("TL4"))
//!     .store(Arc::new(MemoryStore::default()))
//!     .build()?;
//! let tile = cached.get("/0/0/0.png").await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Reserved headers
//!
//! `x-tl-cache`, `x-tl-expires` and `x-tl-json` belong to the cache layer and
//! are overwritten on every write and read. Sources must not use them.

mod cached;
pub mod codec;
mod config;
pub mod freshness;
mod key;
mod stats;
mod store;

pub use cached::{CachedSource, CachedSourceBuilder, RefreshContext, WriteOutcome};
pub use codec::{CacheEntry, Encoded, ErrorClass, HEADER_SIZE};
pub use config::{CacheConfig, DEFAULT_STALE, DEFAULT_TTL};
pub use key::CacheKey;
pub use stats::CacheStats;
pub use store::{CacheStore, MemoryStore, NullStore};
