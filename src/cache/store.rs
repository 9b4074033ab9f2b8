//! Key/value store capability and in-process implementations.

use super::key::CacheKey;
use crate::error::ErrorContext;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// External store holding encoded entries.
///
/// Implementations must tolerate concurrent calls for the same key. Eviction
/// is the store's business: a value set with `ttl` may disappear after it.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` is a miss; `Err` is a store failure.
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>>;

    async fn set(&self, key: &CacheKey, ttl: Duration, value: Bytes) -> Result<()>;

    /// Error sink. Must not fail or block.
    fn error(&self, err: &Error) {
        tracing::warn!(store = self.name(), error = %err, "cache error");
    }

    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: CacheStore + ?Sized> CacheStore for Arc<T> {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        (**self).get(key).await
    }
    async fn set(&self, key: &CacheKey, ttl: Duration, value: Bytes) -> Result<()> {
        (**self).set(key, ttl, value).await
    }
    fn error(&self, err: &Error) {
        (**self).error(err)
    }
    fn name(&self) -> &'static str {
        (**self).name()
    }
}

#[derive(Clone)]
struct StoredValue {
    data: Bytes,
    created_at: Instant,
    ttl: Duration,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.ttl
    }
}

/// Process-local store with TTL eviction.
///
/// Reported errors are kept (as display strings) so callers can inspect what
/// the cache layer surfaced.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    errors: Mutex<Vec<String>>,
    max_entries: usize,
}

impl MemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            errors: Mutex::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Value currently stored under `key`, bypassing the async interface.
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.data.clone())
    }

    /// Seed a raw value, e.g. one written by another process.
    pub fn insert_raw(&self, key: &str, ttl: Duration, value: impl Into<Bytes>) {
        if let Ok(mut entries) = self.entries.write() {
            self.evict_if_needed(&mut entries);
            entries.insert(
                key.to_string(),
                StoredValue {
                    data: value.into(),
                    created_at: Instant::now(),
                    ttl,
                },
            );
        }
    }

    /// Remaining lifetime of the value under `key`.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .and_then(|e| e.ttl.checked_sub(e.created_at.elapsed()))
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().filter(|v| !v.is_expired()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_if_needed(&self, entries: &mut HashMap<String, StoredValue>) {
        entries.retain(|_, e| !e.is_expired());
        while entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

fn poisoned(key: &CacheKey) -> Error {
    Error::store_with_context(
        "memory store lock poisoned",
        ErrorContext::new()
            .with_key(key.as_str())
            .with_source("memory"),
    )
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let mut entries = self.entries.write().map_err(|_| poisoned(key))?;
        if let Some(entry) = entries.get(key.as_str()) {
            if entry.is_expired() {
                entries.remove(key.as_str());
                return Ok(None);
            }
            return Ok(Some(entry.data.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &CacheKey, ttl: Duration, value: Bytes) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned(key))?;
        if !entries.contains_key(key.as_str()) {
            self.evict_if_needed(&mut entries);
        }
        entries.insert(
            key.as_str().to_string(),
            StoredValue {
                data: value,
                created_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    fn error(&self, err: &Error) {
        tracing::warn!(store = "memory", error = %err, "cache error");
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(err.to_string());
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Store that never holds anything; every lookup misses.
pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for NullStore {
    async fn get(&self, _: &CacheKey) -> Result<Option<Bytes>> {
        Ok(None)
    }
    async fn set(&self, _: &CacheKey, _: Duration, _: Bytes) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
