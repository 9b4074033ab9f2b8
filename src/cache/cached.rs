//! Stale-while-revalidate orchestration around a [`Source`].

use super::codec::{self, ErrorClass, Encoded, EXPIRES_FIELD};
use super::config::CacheConfig;
use super::freshness::{self, Expiry};
use super::key::CacheKey;
use super::stats::{AtomicStats, CacheStats};
use super::store::CacheStore;
use crate::source::{FetchError, FetchResult, Source};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What happened to a result on its way to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { ttl: Duration },
    /// Already expired when computed; never store provably stale data.
    Expired,
    /// A non-cacheable upstream error.
    Uncacheable,
}

/// State carried into one background revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshContext {
    pub key: CacheKey,
    pub id: String,
    pub ttl: Duration,
    pub stale: Duration,
}

impl RefreshContext {
    /// Fetch `id` again and write the result under `key`.
    ///
    /// Non-cacheable upstream errors come back as [`Error::Upstream`] and leave
    /// the stored entry untouched.
    pub async fn run<S: Source + ?Sized>(
        self,
        source: &S,
        store: &dyn CacheStore,
    ) -> Result<WriteOutcome> {
        let mut result = source.get(&self.id).await;
        if let Err(err) = &result {
            if ErrorClass::from_error(err).is_none() {
                return Err(Error::Upstream(err.clone()));
            }
        }
        write_result(store, &self.key, &mut result, self.ttl, self.stale).await
    }
}

/// Stamp `x-tl-expires` on a successful result, encode it and store it.
async fn write_result(
    store: &dyn CacheStore,
    key: &CacheKey,
    result: &mut FetchResult,
    ttl: Duration,
    stale: Duration,
) -> Result<WriteOutcome> {
    if let Err(err) = result {
        if ErrorClass::from_error(err).is_none() {
            return Ok(WriteOutcome::Uncacheable);
        }
    }

    let expiry = Expiry::compute(result.as_ref().ok().map(|f| &f.headers), Utc::now(), ttl, stale);
    if let Ok(fetched) = result {
        fetched.headers.insert(EXPIRES_FIELD, expiry.header_value());
    }
    let store_ttl = match expiry.store_ttl_duration() {
        Some(t) => t,
        None => return Ok(WriteOutcome::Expired),
    };

    match codec::encode(result)? {
        Encoded::Value(value) => {
            store.set(key, store_ttl, value).await?;
            Ok(WriteOutcome::Written { ttl: store_ttl })
        }
        Encoded::Uncacheable => Ok(WriteOutcome::Uncacheable),
    }
}

struct Shared<S> {
    source: S,
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    stats: AtomicStats,
}

impl<S> Shared<S> {
    fn record(&self, key: &CacheKey, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written { ttl } => {
                AtomicStats::incr(&self.stats.writes);
                debug!(key = %key, ttl_secs = ttl.as_secs(), "cache write");
            }
            WriteOutcome::Expired | WriteOutcome::Uncacheable => {
                AtomicStats::incr(&self.stats.skipped_writes);
                debug!(key = %key, ?outcome, "cache write skipped");
            }
        }
    }

    fn report(&self, key: &CacheKey, err: Error) {
        match &err {
            Error::Store { .. } => AtomicStats::incr(&self.stats.store_errors),
            e if e.is_decode_error() => AtomicStats::incr(&self.stats.decode_errors),
            _ => {}
        }
        self.store.error(&err.with_key(key.as_str()));
    }
}

/// A [`Source`] that answers from the store when it can.
///
/// Fresh entries are returned as-is. Stale entries are returned immediately
/// while a detached task fetches a replacement. Misses are fetched, stored,
/// then returned. 404 and 403 responses are cached like any other result;
/// other upstream errors pass straight through.
pub struct CachedSource<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for CachedSource<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Source + 'static> CachedSource<S> {
    pub fn builder(source: S, config: CacheConfig) -> CachedSourceBuilder<S> {
        CachedSourceBuilder::new(source, config)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.to_stats()
    }

    pub fn key_for(&self, id: &str) -> CacheKey {
        CacheKey::for_id(&self.shared.config.namespace, id)
    }

    fn refresh_context(&self, key: CacheKey, id: &str) -> RefreshContext {
        RefreshContext {
            key,
            id: id.to_string(),
            ttl: self.shared.config.ttl,
            stale: self.shared.config.stale,
        }
    }

    fn spawn_refresh(&self, ctx: RefreshContext) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %ctx.key, "no tokio runtime; skipping background refresh");
                return;
            }
        };
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            AtomicStats::incr(&shared.stats.refreshes);
            let key = ctx.key.clone();
            debug!(key = %key, "background refresh started");
            match ctx.run(&shared.source, shared.store.as_ref()).await {
                Ok(outcome) => shared.record(&key, outcome),
                Err(err) => shared.report(&key, err),
            }
        });
    }

    async fn fetch_and_store(&self, key: &CacheKey, id: &str) -> FetchResult {
        let shared = &self.shared;
        let mut result = shared.source.get(id).await;
        match write_result(
            shared.store.as_ref(),
            key,
            &mut result,
            shared.config.ttl,
            shared.config.stale,
        )
        .await
        {
            Ok(outcome) => shared.record(key, outcome),
            Err(err @ Error::HeaderTooLarge { .. }) => {
                let message = err.to_string();
                shared.report(key, err);
                return Err(FetchError::new(message));
            }
            Err(err) => shared.report(key, err),
        }
        result
    }
}

#[async_trait]
impl<S: Source + 'static> Source for CachedSource<S> {
    async fn get(&self, id: &str) -> FetchResult {
        let shared = &self.shared;
        let key = self.key_for(id);

        let cached = match shared.store.get(&key).await {
            Ok(value) => value,
            Err(err) => {
                shared.report(&key, err);
                return shared.source.get(id).await;
            }
        };

        if let Some(value) = cached {
            match codec::decode(value) {
                Ok(entry) => {
                    if freshness::is_fresh(entry.headers(), Utc::now()) {
                        AtomicStats::incr(&shared.stats.fresh_hits);
                        debug!(key = %key, "cache hit");
                    } else {
                        AtomicStats::incr(&shared.stats.stale_hits);
                        debug!(key = %key, "stale cache hit; revalidating");
                        self.spawn_refresh(self.refresh_context(key, id));
                    }
                    return entry.into_result();
                }
                Err(err) => shared.report(&key, err),
            }
        }

        AtomicStats::incr(&shared.stats.misses);
        debug!(key = %key, "cache miss");
        self.fetch_and_store(&key, id).await
    }
}

/// Builds a [`CachedSource`]; a store is required.
pub struct CachedSourceBuilder<S> {
    source: S,
    config: CacheConfig,
    store: Option<Arc<dyn CacheStore>>,
}

impl<S: Source + 'static> CachedSourceBuilder<S> {
    pub fn new(source: S, config: CacheConfig) -> Self {
        Self {
            source,
            config,
            store: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<CachedSource<S>> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| Error::configuration("a cache store is required"))?;
        debug!(
            namespace = %self.config.namespace,
            store = store.name(),
            ttl_secs = self.config.ttl.as_secs(),
            stale_secs = self.config.stale.as_secs(),
            "cached source ready"
        );
        Ok(CachedSource {
            shared: Arc::new(Shared {
                source: self.source,
                store,
                config: self.config,
                stats: AtomicStats::default(),
            }),
        })
    }
}
