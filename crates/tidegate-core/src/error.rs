use std::fmt::{Display, Formatter};

use thiserror::Error;

/// Access-layer error classification.
///
/// The distinction between `BreakerOpen` and `Dependency` is deliberate:
/// the former means no upstream attempt was made, the latter means the
/// attempt itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessErrorKind {
    RateLimited,
    BreakerOpen,
    Dependency,
    Cache,
    Cancelled,
    Internal,
}

/// Structured error for gateway and queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessError {
    kind: AccessErrorKind,
    message: String,
    retryable: bool,
}

impl AccessError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::RateLimited,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn breaker_open(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::BreakerOpen,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::Dependency,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::Cache,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::Cancelled,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: AccessErrorKind::Internal,
            message: message.into(),
            retryable: false,
        }
    }

    pub const fn kind(&self) -> AccessErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            AccessErrorKind::RateLimited => "access.rate_limited",
            AccessErrorKind::BreakerOpen => "access.breaker_open",
            AccessErrorKind::Dependency => "access.dependency",
            AccessErrorKind::Cache => "access.cache",
            AccessErrorKind::Cancelled => "access.cancelled",
            AccessErrorKind::Internal => "access.internal",
        }
    }
}

impl Display for AccessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for AccessError {}

/// Serialization and payload failures inside the cache.
///
/// Cache failures are soft at the gateway level: callers fall through to a
/// live fetch rather than seeing these directly.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("payload decompression failed: {0}")]
    Decompression(String),

    #[error("value at key '{key}' is not an integer")]
    NotAnInteger { key: String },
}

impl From<CacheError> for AccessError {
    fn from(err: CacheError) -> Self {
        Self::cache(err.to_string())
    }
}
