//! # stale-cache
//!
//! Stale-while-revalidate caching for async data sources.
//!
//! ## Overview
//!
//! Any component exposing `get(id)` can be wrapped in a
//! [`cache::CachedSource`], which stores responses in an external key/value
//! store and answers from it on later lookups. The wrapper is itself a
//! [`Source`], so it drops in wherever the wrapped source was used.
//!
//! - **Fresh hits** are answered from the store without touching the source
//! - **Stale hits** are answered from the store at once, and refreshed in a
//!   background task
//! - **Misses** go to the source; the result is stored and returned
//! - **404 / 403** responses are cached as 3-byte sentinels and replayed
//! - **Other errors** are never cached
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`source`] | The wrapped capability and its response types |
//! | [`cache`] | Codec, freshness rules, stores and the decorator |
//! | [`error`] | Error type for cache-layer failures |

pub mod cache;
pub mod error;
pub mod source;

pub use cache::{CacheConfig, CacheStore, CachedSource};
pub use error::{Error, ErrorContext};
pub use source::{ContentLength, FetchError, FetchResult, Fetched, Metadata, Payload, Source};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
