//! The contract every cache store implements.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::entry::Ttl;

/// Failures a store can report.
///
/// None of these ever reach an HTTP caller; the facade logs them and
/// degrades to a miss or a zero count.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
    #[error("cache value could not be encoded or decoded: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid cache pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn invalid_pattern(pattern: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Unavailable(_) => "unavailable",
            StoreError::Serialization(_) => "serialization",
            StoreError::InvalidPattern { .. } => "invalid_pattern",
            StoreError::InvalidKey(_) => "invalid_key",
            StoreError::Backend(_) => "backend",
        }
    }
}

/// String-keyed, TTL-aware byte store.
///
/// Lookups of absent keys are not errors: `get` returns `None`, `delete`,
/// `exists` and `expire` return `false`.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn set(&self, key: &str, value: Bytes, ttl: Ttl) -> Result<(), StoreError> {
        self.set_tagged(key, value, ttl, &[]).await
    }

    /// Insert a value and index it under each tag.
    async fn set_tagged(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        tags: &[String],
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of an existing key. `Ttl::NONE` removes it.
    async fn expire(&self, key: &str, ttl: Ttl) -> Result<bool, StoreError>;

    /// Remove every key matching a glob; returns how many were removed.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Remove every key carrying `tag`; returns how many were removed.
    async fn delete_by_tag(&self, tag: &str) -> Result<u64, StoreError>;

    async fn flush(&self) -> Result<(), StoreError>;
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }
    if key.chars().any(char::is_control) {
        return Err(StoreError::InvalidKey(format!(
            "key `{}` contains control characters",
            key.escape_debug()
        )));
    }
    Ok(())
}
