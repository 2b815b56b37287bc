//! Cache facade used by handlers and middleware.
//!
//! Reads and writes go to the distributed store while it is ready and to the
//! in-process store otherwise. Nothing here returns a cache error to the
//! caller: failures are logged, counted and turned into a miss or a zero.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::connection::ConnectionState;
use super::distributed::DistributedStoreAdapter;
use super::entry::Ttl;
use super::keys;
use super::memory::InMemoryStore;
use super::store::{CacheStore, StoreError};

const METRIC_CACHE_HIT: &str = "gazette_cache_hit_total";
const METRIC_CACHE_MISS: &str = "gazette_cache_miss_total";
const METRIC_CACHE_FALLBACK: &str = "gazette_cache_fallback_total";
const METRIC_CACHE_INVALIDATED: &str = "gazette_cache_invalidated_total";
const METRIC_CACHE_WRITE_FAILED: &str = "gazette_cache_write_failed_total";

const NULL_JSON: &[u8] = b"null";

/// Snapshot served by the cache health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    /// Tier currently receiving reads and writes.
    pub backend: &'static str,
    pub remote_configured: bool,
    pub remote_ready: bool,
    pub remote_state: Option<ConnectionState>,
    pub remote_attempts: Option<u32>,
    pub memory_entries: usize,
    pub memory_max_entries: Option<usize>,
}

pub struct CacheService {
    config: CacheConfig,
    memory: Arc<InMemoryStore>,
    remote: Option<Arc<DistributedStoreAdapter>>,
}

impl CacheService {
    pub fn new(config: CacheConfig, remote: Option<Arc<DistributedStoreAdapter>>) -> Self {
        let memory = Arc::new(InMemoryStore::new(config.memory_limit()));
        Self {
            config,
            memory,
            remote,
        }
    }

    pub fn memory_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn memory(&self) -> &Arc<InMemoryStore> {
        &self.memory
    }

    pub fn remote(&self) -> Option<&Arc<DistributedStoreAdapter>> {
        self.remote.as_ref()
    }

    fn ready_remote(&self) -> Option<&DistributedStoreAdapter> {
        self.remote.as_deref().filter(|remote| remote.is_ready())
    }

    /// See [`keys::generate_key`].
    pub fn generate_key<T>(&self, prefix: &str, identifier: &T) -> Result<String, StoreError>
    where
        T: Serialize + ?Sized,
    {
        keys::generate_key(prefix, identifier)
    }

    pub async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if !self.config.enabled {
            return None;
        }

        let mut tier = "memory";
        let mut found = None;

        if let Some(remote) = self.ready_remote() {
            match remote.get(key).await {
                Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(value) => {
                        tier = "remote";
                        found = Some(value);
                    }
                    Err(err) => {
                        warn!(
                            target = "gazette::cache::service",
                            key,
                            error = %err,
                            "remote cache value undecodable; trying memory"
                        );
                        found = self.memory_get(key);
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    fallback("get", key, &err);
                    found = self.memory_get(key);
                }
            }
        } else {
            found = self.memory_get(key);
        }

        match found {
            Some(value) => {
                counter!(METRIC_CACHE_HIT, "tier" => tier).increment(1);
                debug!(target = "gazette::cache::service", key, tier, "cache hit");
                Some(value)
            }
            None => {
                counter!(METRIC_CACHE_MISS).increment(1);
                debug!(target = "gazette::cache::service", key, "cache miss");
                None
            }
        }
    }

    fn memory_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.memory.get_value(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = "gazette::cache::service",
                    key,
                    error = %err,
                    "memory cache value undecodable; dropping"
                );
                self.memory.remove(key);
                None
            }
        }
    }

    pub async fn set<T>(&self, key: &str, value: &T, ttl: Ttl)
    where
        T: Serialize + ?Sized,
    {
        self.set_tagged(key, value, ttl, &[]).await;
    }

    /// Store `value` and index it under `tags`. `null` values are not stored.
    pub async fn set_tagged<T>(&self, key: &str, value: &T, ttl: Ttl, tags: &[String])
    where
        T: Serialize + ?Sized,
    {
        if !self.config.enabled {
            return;
        }

        let encoded = match serde_json::to_vec(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                counter!(METRIC_CACHE_WRITE_FAILED).increment(1);
                warn!(
                    target = "gazette::cache::service",
                    key,
                    error = %err,
                    "cache value could not be encoded"
                );
                return;
            }
        };
        if encoded == NULL_JSON {
            return;
        }

        self.store_bytes(key, Bytes::from(encoded), ttl, tags).await;
    }

    async fn store_bytes(&self, key: &str, value: Bytes, ttl: Ttl, tags: &[String]) {
        if let Some(remote) = self.ready_remote() {
            match remote.set_tagged(key, value.clone(), ttl, tags).await {
                Ok(()) => return,
                Err(err) => fallback("set", key, &err),
            }
        }

        if let Err(err) = self.memory.set_tagged(key, value, ttl, tags).await {
            counter!(METRIC_CACHE_WRITE_FAILED).increment(1);
            warn!(
                target = "gazette::cache::service",
                key,
                error = %err,
                "cache write dropped"
            );
        }
    }

    /// Delete from both tiers so entries written while degraded cannot
    /// resurface.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.memory.remove(key);
        if let Some(remote) = self.ready_remote() {
            match remote.delete(key).await {
                Ok(found) => removed |= found,
                Err(err) => fallback("delete", key, &err),
            }
        }
        removed
    }

    /// Delete every key matching a glob in both tiers; returns the total.
    pub async fn delete_by_pattern(&self, pattern: &str) -> u64 {
        let mut removed = match self.memory.delete_by_pattern(pattern).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "gazette::cache::service",
                    pattern,
                    error = %err,
                    "pattern invalidation skipped"
                );
                return 0;
            }
        };

        if let Some(remote) = self.ready_remote() {
            match remote.delete_by_pattern(pattern).await {
                Ok(count) => removed += count,
                Err(err) => fallback("delete_by_pattern", pattern, &err),
            }
        }

        counter!(METRIC_CACHE_INVALIDATED, "kind" => "pattern").increment(removed);
        debug!(
            target = "gazette::cache::service",
            pattern, removed, "invalidated by pattern"
        );
        removed
    }

    pub async fn delete_by_tag(&self, tag: &str) -> u64 {
        let mut removed = self.memory.remove_tagged(tag) as u64;
        if let Some(remote) = self.ready_remote() {
            match remote.delete_by_tag(tag).await {
                Ok(count) => removed += count,
                Err(err) => fallback("delete_by_tag", tag, &err),
            }
        }

        counter!(METRIC_CACHE_INVALIDATED, "kind" => "tag").increment(removed);
        debug!(target = "gazette::cache::service", tag, removed, "invalidated by tag");
        removed
    }

    pub async fn exists(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        if let Some(remote) = self.ready_remote() {
            match remote.exists(key).await {
                Ok(found) => return found,
                Err(err) => fallback("exists", key, &err),
            }
        }
        self.memory.contains(key)
    }

    /// Reset the lifetime of an existing key. `Ttl::NONE` removes the expiry.
    pub async fn expire(&self, key: &str, ttl: Ttl) -> bool {
        if let Some(remote) = self.ready_remote() {
            match remote.expire(key, ttl).await {
                Ok(found) => return found,
                Err(err) => fallback("expire", key, &err),
            }
        }
        self.memory.set_expiry(key, ttl)
    }

    pub async fn flush(&self) {
        self.memory.clear();
        if let Some(remote) = self.ready_remote()
            && let Err(err) = remote.flush().await
        {
            fallback("flush", "*", &err);
        }
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Values that serialize to `null` are returned but not stored. There is
    /// no single-flight: concurrent misses each run `compute`.
    pub async fn wrap<T, E, F, Fut>(&self, key: &str, ttl: Ttl, compute: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    /// Reset both tiers.
    pub async fn clear(&self) {
        self.flush().await;
    }

    pub fn status(&self) -> CacheStatus {
        let remote_ready = self.ready_remote().is_some();
        let manager = self.remote.as_ref().map(|remote| remote.manager());
        CacheStatus {
            enabled: self.config.enabled,
            backend: if remote_ready { "remote" } else { "memory" },
            remote_configured: self.remote.is_some(),
            remote_ready,
            remote_state: manager.map(|manager| manager.state()),
            remote_attempts: manager.map(|manager| manager.attempts()),
            memory_entries: self.memory.len(),
            memory_max_entries: self.memory.max_entries().map(|limit| limit.get()),
        }
    }

    /// Periodically purge expired in-memory entries.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let period = self.config.sweep_interval()?;
        let memory = Arc::clone(&self.memory);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = memory.purge_expired();
                if purged > 0 {
                    debug!(
                        target = "gazette::cache::service",
                        purged, "swept expired entries"
                    );
                }
            }
        }))
    }
}

fn fallback(op: &'static str, key: &str, err: &StoreError) {
    counter!(METRIC_CACHE_FALLBACK, "op" => op).increment(1);
    warn!(
        target = "gazette::cache::service",
        op,
        key,
        error = %err,
        kind = err.kind(),
        "distributed cache failed; using memory"
    );
}
