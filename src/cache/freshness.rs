//! Expiration bookkeeping: when an entry goes stale and how long the store
//! should keep it.

use super::codec::EXPIRES_FIELD;
use crate::source::Metadata;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Upstream header carrying an explicit expiration.
pub const UPSTREAM_EXPIRES: &str = "expires";

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

// Upper bound for configured durations (100 years), inside chrono's range.
const MAX_SECS: i64 = 100 * 365 * 24 * 3600;

pub fn format_http_date(at: DateTime<Utc>) -> String {
    at.format(HTTP_DATE).to_string()
}

/// Parse an HTTP-date (`Tue, 15 Nov 1994 08:12:31 GMT`), tolerating RFC 3339.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Stored expiration of a decoded entry, if it has a readable one.
pub fn expires_at(headers: &Metadata) -> Option<DateTime<Utc>> {
    headers.get_str(EXPIRES_FIELD).and_then(parse_http_date)
}

/// An entry is fresh only when it carries an expiration strictly after `now`.
/// Entries without one (including cached error sentinels) are stale.
pub fn is_fresh(headers: Option<&Metadata>, now: DateTime<Utc>) -> bool {
    headers
        .and_then(expires_at)
        .map_or(false, |expires| expires > now)
}

/// Expiration to stamp on a new entry and the TTL to hand the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    pub expires: DateTime<Utc>,
    /// Whole seconds the store should retain the value.
    pub store_ttl: i64,
}

impl Expiry {
    /// An upstream `expires` header is honoured exactly, with no stale
    /// padding. Otherwise the entry expires after `ttl` and the store keeps it
    /// for a further `stale`.
    pub fn compute(
        headers: Option<&Metadata>,
        now: DateTime<Utc>,
        ttl: Duration,
        stale: Duration,
    ) -> Self {
        let upstream = headers
            .and_then(|h| h.get_str(UPSTREAM_EXPIRES))
            .and_then(parse_http_date);
        match upstream {
            Some(expires) => Self {
                expires,
                store_ttl: (expires - now).num_seconds(),
            },
            None => Self {
                expires: now + ChronoDuration::seconds(secs(ttl)),
                store_ttl: secs(ttl).saturating_add(secs(stale)),
            },
        }
    }

    /// Writes with a non-positive TTL are skipped.
    pub fn is_storable(&self) -> bool {
        self.store_ttl > 0
    }

    /// Store TTL, or `None` when the write should be skipped.
    pub fn store_ttl_duration(&self) -> Option<Duration> {
        if !self.is_storable() {
            return None;
        }
        u64::try_from(self.store_ttl).ok().map(Duration::from_secs)
    }

    pub fn header_value(&self) -> String {
        format_http_date(self.expires)
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(MAX_SECS).min(MAX_SECS)
}
