//! End-to-end behaviour of `CachedSource` against an in-memory store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use stale_cache::cache::codec::{self, CacheEntry, Encoded, CACHE_FIELD, EXPIRES_FIELD};
use stale_cache::cache::freshness::format_http_date;
use stale_cache::cache::{CacheConfig, CacheKey, CacheStore, CachedSource, MemoryStore};
use stale_cache::{Error, FetchError, FetchResult, Fetched, Metadata, Payload, Source};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Source answering from a script; the last result repeats once the script
/// runs out. An optional gate holds every call until a permit is released.
struct Scripted {
    results: Mutex<VecDeque<FetchResult>>,
    calls: AtomicUsize,
    ids: Mutex<Vec<String>>,
    gate: Option<Arc<Semaphore>>,
}

impl Scripted {
    fn new(results: Vec<FetchResult>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
            ids: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn gated(results: Vec<FetchResult>, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(results)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for Scripted {
    async fn get(&self, id: &str) -> FetchResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ids.lock().unwrap().push(id.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut results = self.results.lock().unwrap();
        if results.len() > 1 {
            results.pop_front().unwrap()
        } else {
            results.front().cloned().unwrap()
        }
    }
}

/// Store whose reads always fail.
#[derive(Default)]
struct BrokenStore {
    sets: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl CacheStore for BrokenStore {
    async fn get(&self, key: &CacheKey) -> stale_cache::Result<Option<Bytes>> {
        Err(Error::store_with_context(
            "connection refused",
            stale_cache::ErrorContext::new().with_key(key.as_str()),
        ))
    }
    async fn set(&self, _: &CacheKey, _: Duration, _: Bytes) -> stale_cache::Result<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn error(&self, err: &Error) {
        self.errors.lock().unwrap().push(err.to_string());
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

/// Store that reads from memory but refuses every write.
#[derive(Default)]
struct WriteFails {
    inner: MemoryStore,
    errors: Mutex<Vec<String>>,
}

#[async_trait]
impl CacheStore for WriteFails {
    async fn get(&self, key: &CacheKey) -> stale_cache::Result<Option<Bytes>> {
        self.inner.get(key).await
    }
    async fn set(&self, _: &CacheKey, _: Duration, _: Bytes) -> stale_cache::Result<()> {
        Err(Error::store_with_context(
            "write refused",
            stale_cache::ErrorContext::new(),
        ))
    }
    fn error(&self, err: &Error) {
        self.errors.lock().unwrap().push(err.to_string());
    }
    fn name(&self) -> &'static str {
        "write-fails"
    }
}

fn cached<S: Source + 'static>(source: S, store: Arc<MemoryStore>) -> CachedSource<S> {
    CachedSource::builder(source, CacheConfig::new("TL4"))
        .store(store)
        .build()
        .unwrap()
}

fn stored_value(fetched: Fetched) -> Bytes {
    match codec::encode(&Ok(fetched)).unwrap() {
        Encoded::Value(b) => b,
        Encoded::Uncacheable => unreachable!(),
    }
}

fn entry_expiring_in(text: &str, secs: i64) -> Bytes {
    let expires = format_http_date(Utc::now() + ChronoDuration::seconds(secs));
    stored_value(Fetched::new(text, Metadata::new().with(EXPIRES_FIELD, expires)))
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn body(result: &FetchResult) -> &[u8] {
    result.as_ref().unwrap().data.as_bytes().unwrap()
}

#[tokio::test]
async fn test_miss_fetches_stores_and_returns() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let source = Scripted::new(vec![Ok(Fetched::new("hello", Metadata::new()))]);
    let cache = cached(source, store.clone());

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"hello");
    let headers = &result.as_ref().unwrap().headers;
    assert!(headers.get_str(EXPIRES_FIELD).is_some());
    assert!(headers.get_str(CACHE_FIELD).is_none());
    assert_eq!(cache.source().calls(), 1);
    assert_eq!(*cache.source().ids.lock().unwrap(), vec!["/x".to_string()]);

    let stored = store.peek("TL4-/x").expect("entry written");
    let entry = codec::decode(stored).unwrap().into_result().unwrap();
    assert_eq!(entry.data.as_bytes(), Some(&b"hello"[..]));
    assert!(store.remaining_ttl("TL4-/x").unwrap() > Duration::from_secs(590));

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.writes, 1);
}

#[tokio::test]
async fn test_fresh_hit_skips_source() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    store.insert_raw("TL4-/x", Duration::from_secs(600), entry_expiring_in("cached", 60));
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new("upstream", Metadata::new()))]),
        store.clone(),
    );

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"cached");
    assert_eq!(result.unwrap().headers.get_str(CACHE_FIELD), Some("hit"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.source().calls(), 0);
    assert_eq!(cache.stats().fresh_hits, 1);
}

#[tokio::test]
async fn test_stale_hit_returns_immediately_and_refreshes() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    store.insert_raw("TL4-/x", Duration::from_secs(600), entry_expiring_in("old", -10));
    let gate = Arc::new(Semaphore::new(0));
    let cache = cached(
        Scripted::gated(vec![Ok(Fetched::new("new", Metadata::new()))], gate.clone()),
        store.clone(),
    );

    // The refresh is blocked on the gate, so this only returns if it does not
    // wait for the source.
    let result = tokio::time::timeout(Duration::from_secs(1), cache.get("/x"))
        .await
        .expect("stale value delivered without waiting for refresh");
    assert_eq!(body(&result), b"old");
    assert!(eventually(|| cache.source().calls() == 1).await);

    let still_old = codec::decode(store.peek("TL4-/x").unwrap()).unwrap();
    assert_eq!(still_old.into_result().unwrap().data.as_bytes(), Some(&b"old"[..]));

    gate.add_permits(1);
    assert!(
        eventually(|| {
            store
                .peek("TL4-/x")
                .map(|v| v.ends_with(b"new"))
                .unwrap_or(false)
        })
        .await
    );

    let next = cache.get("/x").await;
    assert_eq!(body(&next), b"new");
    let stats = cache.stats();
    assert_eq!(stats.stale_hits, 1);
    assert_eq!(stats.fresh_hits, 1);
    assert_eq!(stats.refreshes, 1);
    assert_eq!(cache.source().calls(), 1);
}

#[tokio::test]
async fn test_not_found_cached_as_sentinel_and_replayed() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let cache = cached(Scripted::new(vec![Err(FetchError::not_found())]), store.clone());

    let first = cache.get("/missing").await.unwrap_err();
    assert_eq!(first.status, Some(404));
    assert!(!first.from_cache);
    assert_eq!(store.peek("TL4-/missing").as_deref(), Some(&b"404"[..]));
    assert_eq!(cache.source().calls(), 1);

    let second = cache.get("/missing").await.unwrap_err();
    assert_eq!(second.status, Some(404));
    assert!(second.from_cache, "answer must come from the stored sentinel");
    assert_eq!(cache.stats().stale_hits, 1);
}

#[tokio::test]
async fn test_forbidden_is_cached() {
    let store = Arc::new(MemoryStore::default());
    let cache = cached(Scripted::new(vec![Err(FetchError::forbidden())]), store.clone());
    assert_eq!(cache.get("/secret").await.unwrap_err().status, Some(403));
    assert_eq!(store.peek("TL4-/secret").as_deref(), Some(&b"403"[..]));
}

#[tokio::test]
async fn test_uncacheable_error_propagates_without_write() {
    let store = Arc::new(MemoryStore::default());
    let cache = cached(
        Scripted::new(vec![Err(FetchError::with_status(500, "upstream exploded"))]),
        store.clone(),
    );

    let err = cache.get("/x").await.unwrap_err();
    assert_eq!(err.status, Some(500));
    assert_eq!(err.message, "upstream exploded");
    assert!(store.is_empty());

    cache.get("/x").await.unwrap_err();
    assert_eq!(cache.source().calls(), 2);
    assert_eq!(cache.stats().skipped_writes, 2);
}

#[tokio::test]
async fn test_store_read_failure_falls_back_to_source() {
    init_tracing();
    let store = Arc::new(BrokenStore::default());
    let cache = CachedSource::builder(
        Scripted::new(vec![Ok(Fetched::new("direct", Metadata::new()))]),
        CacheConfig::new("TL4"),
    )
    .store(store.clone())
    .build()
    .unwrap();

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"direct");
    assert!(result.unwrap().headers.get_str(EXPIRES_FIELD).is_none());
    assert_eq!(store.sets.load(Ordering::SeqCst), 0);

    let errors = store.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("TL4-/x"));
    assert_eq!(cache.stats().store_errors, 1);
}

#[tokio::test]
async fn test_store_write_failure_still_returns_result() {
    init_tracing();
    let store = Arc::new(WriteFails::default());
    let cache = CachedSource::builder(
        Scripted::new(vec![Ok(Fetched::new("hello", Metadata::new()))]),
        CacheConfig::new("TL4"),
    )
    .store(store.clone())
    .build()
    .unwrap();

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"hello");
    assert_eq!(
        *store.errors.lock().unwrap(),
        vec!["Cache store error: write refused (key: TL4-/x)".to_string()]
    );
    let stats = cache.stats();
    assert_eq!(stats.store_errors, 1);
    assert_eq!(stats.writes, 0);
}

#[tokio::test]
async fn test_refresh_write_failure_reported_and_stale_entry_kept() {
    init_tracing();
    let store = Arc::new(WriteFails::default());
    let stale = entry_expiring_in("old", -10);
    store
        .inner
        .insert_raw("TL4-/x", Duration::from_secs(600), stale.clone());
    let cache = CachedSource::builder(
        Scripted::new(vec![Ok(Fetched::new("new", Metadata::new()))]),
        CacheConfig::new("TL4"),
    )
    .store(store.clone())
    .build()
    .unwrap();

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"old");
    assert!(eventually(|| !store.errors.lock().unwrap().is_empty()).await);

    let errors = store.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("write refused"));
    assert!(errors[0].contains("TL4-/x"));
    assert_eq!(store.inner.peek("TL4-/x"), Some(stale));
    assert_eq!(cache.source().calls(), 1);
    assert_eq!(cache.stats().store_errors, 1);
}

#[tokio::test]
async fn test_corrupt_entry_reported_and_treated_as_miss() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let mut corrupt = entry_expiring_in("hello", 60).to_vec();
    corrupt[0] = b'#';
    store.insert_raw("TL4-/x", Duration::from_secs(600), corrupt);
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new("refetched", Metadata::new()))]),
        store.clone(),
    );

    let result = cache.get("/x").await;
    assert_eq!(body(&result), b"refetched");
    assert_eq!(cache.source().calls(), 1);

    let errors = store.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("Cache format error"));
    assert!(errors[0].contains("TL4-/x"));
    assert!(store.peek("TL4-/x").unwrap().ends_with(b"refetched"));
    assert_eq!(cache.stats().decode_errors, 1);
}

#[tokio::test]
async fn test_content_length_mismatch_treated_as_miss() {
    let store = Arc::new(MemoryStore::default());
    let mut value = stored_value(Fetched::new(
        "hello",
        Metadata::new().with("content-length", "5"),
    ))
    .to_vec();
    value.truncate(value.len() - 2);
    store.insert_raw("TL4-/x", Duration::from_secs(600), value);
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new(
            "hello",
            Metadata::new().with("content-length", "5"),
        ))]),
        store.clone(),
    );

    assert_eq!(body(&cache.get("/x").await), b"hello");
    assert!(store.errors()[0].contains("Content-Length mismatch"));
}

#[tokio::test]
async fn test_refresh_failure_keeps_stale_entry_and_reports() {
    init_tracing();
    let store = Arc::new(MemoryStore::default());
    let stale = entry_expiring_in("old", -10);
    store.insert_raw("TL4-/x", Duration::from_secs(600), stale.clone());
    let cache = cached(
        Scripted::new(vec![Err(FetchError::with_status(503, "unavailable"))]),
        store.clone(),
    );

    assert_eq!(body(&cache.get("/x").await), b"old");
    assert!(eventually(|| !store.errors().is_empty()).await);
    assert!(store.errors()[0].contains("unavailable"));
    assert_eq!(store.peek("TL4-/x"), Some(stale));
}

#[tokio::test]
async fn test_upstream_expires_is_honoured() {
    let store = Arc::new(MemoryStore::default());
    let expires = format_http_date(Utc::now() + ChronoDuration::seconds(30));
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new(
            "tile",
            Metadata::new().with("Expires", expires.clone()),
        ))]),
        store.clone(),
    );

    let result = cache.get("/x").await.unwrap();
    assert_eq!(result.headers.get_str(EXPIRES_FIELD), Some(expires.as_str()));
    assert!(store.remaining_ttl("TL4-/x").unwrap() <= Duration::from_secs(30));
}

#[tokio::test]
async fn test_already_expired_response_is_returned_but_not_stored() {
    let store = Arc::new(MemoryStore::default());
    let expires = format_http_date(Utc::now() - ChronoDuration::seconds(30));
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new(
            "tile",
            Metadata::new().with("expires", expires),
        ))]),
        store.clone(),
    );

    assert_eq!(body(&cache.get("/x").await), b"tile");
    assert!(store.is_empty());
    assert_eq!(cache.stats().skipped_writes, 1);
}

#[tokio::test]
async fn test_json_payload_survives_the_store() {
    let store = Arc::new(MemoryStore::default());
    let doc = json!({"tilejson": "2.2.0", "tiles": ["https://example.com/{z}/{x}/{y}.png"]});
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new(doc.clone(), Metadata::new()))]),
        store.clone(),
    );

    cache.get("/tilejson").await.unwrap();
    let again = cache.get("/tilejson").await.unwrap();
    assert_eq!(again.data, Payload::Json(doc));
    assert_eq!(again.headers.get_str(CACHE_FIELD), Some("hit"));
    assert_eq!(cache.source().calls(), 1);
}

#[tokio::test]
async fn test_oversized_metadata_fails_the_miss() {
    let store = Arc::new(MemoryStore::default());
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new(
            "x",
            Metadata::new().with("x-huge", "a".repeat(2048)),
        ))]),
        store.clone(),
    );

    let err = cache.get("/x").await.unwrap_err();
    assert!(err.message.contains("Metadata too large"));
    assert!(store.is_empty());
    assert_eq!(store.errors().len(), 1);
}

#[tokio::test]
async fn test_namespaces_do_not_collide() {
    let store = Arc::new(MemoryStore::default());
    let a = CachedSource::builder(
        Scripted::new(vec![Ok(Fetched::new("a", Metadata::new()))]),
        CacheConfig::new("A"),
    )
    .store(store.clone())
    .build()
    .unwrap();
    let b = CachedSource::builder(
        Scripted::new(vec![Ok(Fetched::new("b", Metadata::new()))]),
        CacheConfig::new("B"),
    )
    .store(store.clone())
    .build()
    .unwrap();

    assert_eq!(body(&a.get("/x").await), b"a");
    assert_eq!(body(&b.get("/x").await), b"b");
    assert_eq!(body(&a.get("/x").await), b"a");
    assert_eq!(store.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_stale_lookups_each_get_the_stale_value() {
    let store = Arc::new(MemoryStore::default());
    store.insert_raw("TL4-/x", Duration::from_secs(600), entry_expiring_in("old", -10));
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new("new", Metadata::new()))]),
        store.clone(),
    );

    let lookups = (0..8).map(|_| {
        let cache = cache.clone();
        async move { cache.get("/x").await }
    });
    let results = futures::future::join_all(lookups).await;
    for result in &results {
        assert!(result.is_ok());
    }
    assert!(
        eventually(|| {
            store
                .peek("TL4-/x")
                .map(|v| v.ends_with(b"new"))
                .unwrap_or(false)
        })
        .await
    );
    let entry = codec::decode(store.peek("TL4-/x").unwrap()).unwrap();
    assert!(matches!(entry, CacheEntry::Hit(_)));
}

#[tokio::test]
async fn test_cached_source_is_a_source() {
    async fn fetch_twice(source: &dyn Source, id: &str) -> (FetchResult, FetchResult) {
        (source.get(id).await, source.get(id).await)
    }

    let store = Arc::new(MemoryStore::default());
    let cache = cached(
        Scripted::new(vec![Ok(Fetched::new("v", Metadata::new()))]),
        store,
    );
    let (first, second) = fetch_twice(&cache, "/x").await;
    assert_eq!(body(&first), b"v");
    assert_eq!(body(&second), b"v");
    assert_eq!(cache.source().calls(), 1);
}
