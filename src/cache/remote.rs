//! The narrow protocol the distributed store must speak.
//!
//! Only the commands the cache needs are modelled, so the adapter can be
//! exercised against an in-process fake as easily as against Redis.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The link to the store is down or could not be established.
    #[error("connection error: {0}")]
    Connection(String),
    /// The store answered, but the command failed.
    #[error("command error: {0}")]
    Command(String),
}

impl RemoteError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::Command(message.into())
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection(_))
    }
}

/// An established connection to the remote key-value store.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    async fn ping(&self) -> Result<(), RemoteError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    /// Store a value, optionally expiring after `expire_seconds`.
    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expire_seconds: Option<u64>,
    ) -> Result<(), RemoteError>;

    /// Delete keys in bulk; returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, RemoteError>;

    async fn exists(&self, key: &str) -> Result<bool, RemoteError>;

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool, RemoteError>;

    /// Remaining lifetime in seconds; `None` when the key never expires,
    /// `Some(0)` when it is missing.
    async fn time_to_live(&self, key: &str) -> Result<Option<u64>, RemoteError>;

    /// Remove any expiry from a key.
    async fn persist(&self, key: &str) -> Result<bool, RemoteError>;

    /// Enumerate keys matching a glob.
    async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, RemoteError>;

    async fn add_to_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError>;

    async fn remove_from_set(&self, set_key: &str, member: &str) -> Result<(), RemoteError>;

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, RemoteError>;

    async fn flush_db(&self) -> Result<(), RemoteError>;
}

/// Factory for remote connections, driven by the connection manager.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Human-readable target for logs; must not leak credentials.
    fn describe(&self) -> String;

    async fn connect(&self) -> Result<Arc<dyn RemoteConnection>, RemoteError>;
}
