//! Wire format of stored values.
//!
//! A stored value is either a 3-byte ASCII status sentinel (`"404"`, `"403"`)
//! for a cacheable upstream error, or a [`HEADER_SIZE`]-byte block holding the
//! JSON-encoded metadata right-padded with spaces, followed by the raw payload.

use crate::error::ErrorContext;
use crate::source::{ContentLength, FetchError, FetchResult, Fetched, Metadata, Payload};
use crate::{Error, Result};
use bytes::Bytes;
use serde_json::Value;

/// Size of the padded metadata block.
pub const HEADER_SIZE: usize = 1024;

/// Reserved: set to `"hit"` on every decoded entry.
pub const CACHE_FIELD: &str = "x-tl-cache";
/// Reserved: HTTP-date after which the entry is stale.
pub const EXPIRES_FIELD: &str = "x-tl-expires";
/// Reserved: `true` when the payload was a structured value. Readers accept
/// the JSON boolean `true` or the string `"true"`; any other value, `1`
/// included, leaves the payload as raw bytes.
pub const JSON_FIELD: &str = "x-tl-json";

const PADDING: u8 = b' ';

/// Upstream failures worth storing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    NotFound,
    Forbidden,
}

impl ErrorClass {
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            404 => Some(Self::NotFound),
            403 => Some(Self::Forbidden),
            _ => None,
        }
    }

    pub fn from_error(err: &FetchError) -> Option<Self> {
        err.status.and_then(Self::from_status)
    }

    pub fn from_sentinel(value: &[u8]) -> Option<Self> {
        match value {
            b"404" => Some(Self::NotFound),
            b"403" => Some(Self::Forbidden),
            _ => None,
        }
    }

    pub fn sentinel(&self) -> &'static [u8] {
        match self {
            Self::NotFound => b"404",
            Self::Forbidden => b"403",
        }
    }

    /// The error replayed to callers for a cached sentinel.
    pub fn to_fetch_error(&self) -> FetchError {
        let mut err = match self {
            Self::NotFound => FetchError::not_found(),
            Self::Forbidden => FetchError::forbidden(),
        };
        err.from_cache = true;
        err
    }
}

/// Result of [`encode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Value(Bytes),
    /// The result must not be written to the store.
    Uncacheable,
}

/// A decoded stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Error(ErrorClass),
    Hit(Fetched),
}

impl CacheEntry {
    pub fn headers(&self) -> Option<&Metadata> {
        match self {
            CacheEntry::Hit(fetched) => Some(&fetched.headers),
            CacheEntry::Error(_) => None,
        }
    }

    pub fn into_result(self) -> FetchResult {
        match self {
            CacheEntry::Hit(fetched) => Ok(fetched),
            CacheEntry::Error(class) => Err(class.to_fetch_error()),
        }
    }
}

/// Serialize a fetch result into its stored form.
///
/// Fails with [`Error::HeaderTooLarge`] when the metadata does not fit the
/// header block; the metadata is never truncated.
pub fn encode(result: &FetchResult) -> Result<Encoded> {
    let fetched = match result {
        Ok(fetched) => fetched,
        Err(err) => {
            return Ok(match ErrorClass::from_error(err) {
                Some(class) => Encoded::Value(Bytes::from_static(class.sentinel())),
                None => Encoded::Uncacheable,
            })
        }
    };

    let mut headers = fetched.headers.clone();
    headers.remove(CACHE_FIELD);
    headers.remove(JSON_FIELD);
    let body = match &fetched.data {
        Payload::Bytes(b) => b.clone(),
        Payload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
        Payload::Json(v) => {
            headers.insert(JSON_FIELD, true);
            Bytes::from(serde_json::to_vec(v)?)
        }
    };

    let header = serde_json::to_vec(&headers)?;
    if header.len() > HEADER_SIZE {
        return Err(Error::HeaderTooLarge {
            size: header.len(),
            limit: HEADER_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&header);
    buf.resize(HEADER_SIZE, PADDING);
    buf.extend_from_slice(&body);
    Ok(Encoded::Value(Bytes::from(buf)))
}

/// Parse a stored value.
///
/// Fails with a format error for values that are neither a sentinel nor a
/// well-formed header block, and with [`Error::ContentLength`] when the
/// payload length disagrees with the stored `content-length`.
pub fn decode(value: Bytes) -> Result<CacheEntry> {
    if value.len() == 3 {
        if let Some(class) = ErrorClass::from_sentinel(&value) {
            return Ok(CacheEntry::Error(class));
        }
    }
    if value.len() < HEADER_SIZE {
        return Err(Error::format_with_context(
            "stored value shorter than header",
            ErrorContext::new()
                .with_source("codec")
                .with_details(format!("{} bytes", value.len())),
        ));
    }

    let header = trim_padding(&value[..HEADER_SIZE]);
    let mut headers: Metadata = serde_json::from_slice(header).map_err(|e| {
        Error::format_with_context(
            "invalid metadata header",
            ErrorContext::new()
                .with_source("codec")
                .with_details(e.to_string()),
        )
    })?;
    headers.insert(CACHE_FIELD, "hit");

    let body = value.slice(HEADER_SIZE..);
    match headers.content_length() {
        ContentLength::Absent => {}
        ContentLength::Declared(expected) if expected == body.len() as u64 => {}
        ContentLength::Declared(expected) => {
            return Err(Error::ContentLength {
                expected,
                actual: body.len() as u64,
                context: ErrorContext::new().with_source("codec"),
            });
        }
        ContentLength::Malformed(raw) => {
            return Err(Error::format_with_context(
                "invalid content-length",
                ErrorContext::new()
                    .with_source("codec")
                    .with_details(raw),
            ));
        }
    }

    let data = if is_json_flagged(&headers) {
        let parsed: Value = serde_json::from_slice(&body).map_err(|e| {
            Error::format_with_context(
                "invalid JSON payload",
                ErrorContext::new()
                    .with_source("codec")
                    .with_details(e.to_string()),
            )
        })?;
        Payload::Json(parsed)
    } else {
        Payload::Bytes(body)
    };

    Ok(CacheEntry::Hit(Fetched { data, headers }))
}

fn trim_padding(header: &[u8]) -> &[u8] {
    let end = header
        .iter()
        .rposition(|b| *b != PADDING)
        .map_or(0, |i| i + 1);
    &header[..end]
}

fn is_json_flagged(headers: &Metadata) -> bool {
    match headers.get(JSON_FIELD) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}
