use thiserror::Error;

/// Structured error context attached to cache-layer failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Store key the failure relates to (e.g., "TL4-/tiles/0/0/0.png")
    pub key: Option<String>,
    /// Additional context about the error (e.g., expected length, parser message)
    pub details: Option<String>,
    /// Component that raised the error (e.g., "codec", "store", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            key: None,
            details: None,
            source: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures of the cache layer itself.
///
/// Upstream failures travel to the caller as
/// [`FetchError`](crate::source::FetchError) values; `Upstream` only wraps one
/// for the store's error sink when a background refresh fails.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Cache store error: {message}{}", format_context(.context))]
    Store {
        message: String,
        context: ErrorContext,
    },

    #[error("Cache format error: {message}{}", format_context(.context))]
    Format {
        message: String,
        context: ErrorContext,
    },

    #[error("Content-Length mismatch: header says {expected} bytes, payload has {actual}{}", format_context(.context))]
    ContentLength {
        expected: u64,
        actual: u64,
        context: ErrorContext,
    },

    #[error("Metadata too large: {size} bytes exceeds the {limit} byte header")]
    HeaderTooLarge { size: usize, limit: usize },

    #[error("Upstream error: {0}")]
    Upstream(#[from] crate::source::FetchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref key) = ctx.key {
        parts.push(format!("key: {}", key));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration {
            message: msg.into(),
            context: ErrorContext::new().with_source("config"),
        }
    }

    /// Create a store error with structured context
    pub fn store_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Store {
            message: msg.into(),
            context,
        }
    }

    /// Create a format error with structured context
    pub fn format_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Format {
            message: msg.into(),
            context,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Store { context, .. }
            | Error::Format { context, .. }
            | Error::ContentLength { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Attach the store key to errors that carry a context.
    pub fn with_key(mut self, key: &str) -> Self {
        match &mut self {
            Error::Configuration { context, .. }
            | Error::Store { context, .. }
            | Error::Format { context, .. }
            | Error::ContentLength { context, .. } => {
                context.key = Some(key.to_string());
            }
            _ => {}
        }
        self
    }

    /// True for errors describing a corrupt or truncated stored value.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Error::Format { .. } | Error::ContentLength { .. } | Error::Serialization(_)
        )
    }
}
