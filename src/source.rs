//! The data-retrieval capability wrapped by the cache.
//!
//! Anything that can answer `get(identifier)` with a payload and response
//! metadata implements [`Source`]. [`CachedSource`](crate::cache::CachedSource)
//! implements it too, so a cached source can stand in for the one it wraps.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Outcome of a single fetch.
pub type FetchResult = std::result::Result<Fetched, FetchError>;

#[async_trait]
pub trait Source: Send + Sync {
    async fn get(&self, id: &str) -> FetchResult;
}

#[async_trait]
impl<T: Source + ?Sized> Source for std::sync::Arc<T> {
    async fn get(&self, id: &str) -> FetchResult {
        (**self).get(id).await
    }
}

/// A successful response: body plus headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub data: Payload,
    pub headers: Metadata,
}

impl Fetched {
    pub fn new(data: impl Into<Payload>, headers: Metadata) -> Self {
        Self {
            data: data.into(),
            headers,
        }
    }
}

/// Response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
    /// Structured value; serialized as JSON and re-parsed when read back.
    Json(Value),
}

impl Payload {
    /// Raw bytes for plain payloads. `None` for structured values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            Payload::Text(s) => Some(s.as_bytes()),
            Payload::Json(_) => None,
        }
    }

}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Bytes(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(b: &'static [u8]) -> Self {
        Payload::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<Value> for Payload {
    fn from(v: Value) -> Self {
        Payload::Json(v)
    }
}

/// Response headers, serialized as a flat JSON object.
///
/// Values are normally strings; the cache's own `x-tl-json` flag is a JSON
/// boolean. Keys keep insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(Map<String, Value>);

impl Metadata {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Header lookup ignoring ASCII case, as HTTP header names are.
    pub fn get_ignore_case(&self, name: &str) -> Option<&Value> {
        self.0
            .get(name)
            .or_else(|| {
                self.0
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
    }

    /// String value of a header, ignoring case of the name.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get_ignore_case(name).and_then(Value::as_str)
    }

    /// Remove a header, keeping the order of the others.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let removed = self.0.get(name)?.clone();
        self.0 = std::mem::take(&mut self.0)
            .into_iter()
            .filter(|(k, _)| k != name)
            .collect();
        Some(removed)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Declared `content-length`, accepting string or numeric values.
    pub fn content_length(&self) -> ContentLength {
        let value = match self.get_ignore_case("content-length") {
            Some(value) => value,
            None => return ContentLength::Absent,
        };
        let parsed = match value {
            Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                s.parse().ok()
            }
            Value::Number(n) => n.as_u64(),
            _ => None,
        };
        match parsed {
            Some(len) => ContentLength::Declared(len),
            None => ContentLength::Malformed(value.to_string()),
        }
    }
}

/// The `content-length` header as found in a metadata map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentLength {
    Absent,
    Declared(u64),
    /// Present but not an unsigned integer; holds the raw JSON value.
    Malformed(String),
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Metadata {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Upstream failure, delivered to callers as data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    /// HTTP-like status code, if the source reported one.
    pub status: Option<u16>,
    pub message: String,
    /// Set when the error was replayed from a cached sentinel.
    pub from_cache: bool,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            from_cache: false,
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(404, "Not found")
    }

    pub fn forbidden() -> Self {
        Self::with_status(403, "Forbidden")
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for FetchError {}
