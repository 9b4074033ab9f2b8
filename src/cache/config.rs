//! Cache configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_STALE: Duration = Duration::from_secs(300);

/// Settings for a [`CachedSource`](super::CachedSource).
///
/// Loadable from YAML or JSON; `ttl` and `stale` are whole seconds there:
///
/// ```yaml
/// namespace: TL4
/// ttl: 600
/// stale: 3600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Key prefix isolating this cache's entries in a shared store.
    pub namespace: String,
    /// Lifetime of entries whose upstream response has no `expires` header.
    #[serde(with = "seconds")]
    pub ttl: Duration,
    /// How long the store keeps an entry after it expires, so it can be served
    /// stale while a refresh runs.
    #[serde(with = "seconds")]
    pub stale: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            ttl: DEFAULT_TTL,
            stale: DEFAULT_STALE,
        }
    }
}

impl CacheConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale(mut self, stale: Duration) -> Self {
        self.stale = stale;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::configuration("namespace must not be empty"));
        }
        if self.ttl.as_secs() == 0 {
            return Err(Error::configuration("ttl must be at least one second"));
        }
        if self.stale.as_secs() == 0 {
            return Err(Error::configuration("stale must be at least one second"));
        }
        Ok(())
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
