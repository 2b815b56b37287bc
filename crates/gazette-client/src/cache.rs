//! Client-resident response cache.
//!
//! Lives in one execution context and is driven through `&mut self`, so it
//! needs no locks. Eviction is FIFO on insertion; reads never reorder
//! entries.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::keys::cache_key;

const DEFAULT_TTL_MILLIS: u64 = 5 * 60 * 1000;
const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientCacheConfig {
    pub enabled: bool,
    /// Default lifetime of an entry.
    pub ttl_millis: u64,
    /// Capacity; 0 means unbounded.
    pub max_entries: usize,
}

impl Default for ClientCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_millis: DEFAULT_TTL_MILLIS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl ClientCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_millis)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the configured lifetime.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn tagged(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            ttl: None,
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WrapOptions {
    /// Run the fetch even on a hit and replace the stored value.
    pub force_refresh: bool,
    pub set: SetOptions,
}

#[derive(Debug, Clone)]
struct ClientEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
    tags: BTreeSet<String>,
}

impl ClientEntry {
    fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default)]
pub struct ClientCache {
    config: ClientCacheConfig,
    entries: IndexMap<String, ClientEntry>,
}

impl ClientCache {
    pub fn new(config: ClientCacheConfig) -> Self {
        Self {
            config,
            entries: IndexMap::new(),
        }
    }

    pub fn config(&self) -> &ClientCacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Look up the entry for `path` and `params`.
    pub fn get<T: DeserializeOwned>(&mut self, path: &str, params: &[(&str, &str)]) -> Option<T> {
        self.get_key(&cache_key(path, params))
    }

    /// Look up a pre-built key. Expired entries are evicted on the way.
    pub fn get_key<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }

        let entry = self.entries.get(key)?;
        if entry.is_expired_at(Instant::now()) {
            self.entries.shift_remove(key);
            debug!(target = "gazette_client::cache", key, "expired");
            return None;
        }

        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(
                    target = "gazette_client::cache",
                    key,
                    error = %err,
                    "cached value has an unexpected shape; dropping it"
                );
                self.entries.shift_remove(key);
                None
            }
        }
    }

    /// Store `value` under `key`, usually built with [`cache_key`].
    ///
    /// Null values are not stored. Overwriting a key moves it to the back of
    /// the eviction queue.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T, options: SetOptions) {
        if !self.config.enabled {
            return;
        }

        let value = match serde_json::to_value(value) {
            Ok(Value::Null) => return,
            Ok(value) => value,
            Err(err) => {
                warn!(
                    target = "gazette_client::cache",
                    key,
                    error = %err,
                    "value could not be encoded; not cached"
                );
                return;
            }
        };

        let entry = ClientEntry {
            value,
            created_at: Instant::now(),
            ttl: options.ttl.unwrap_or_else(|| self.config.ttl()),
            tags: options.tags.into_iter().collect(),
        };
        self.entries.shift_remove(key);
        self.entries.insert(key.to_string(), entry);
        self.evict_over_capacity();
    }

    fn evict_over_capacity(&mut self) {
        let max = self.config.max_entries;
        if max == 0 {
            return;
        }
        while self.entries.len() > max {
            if let Some((key, _)) = self.entries.shift_remove_index(0) {
                debug!(target = "gazette_client::cache", key = %key, "evicted");
            }
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.shift_remove(key).is_some()
    }

    /// Remove every entry carrying `tag`.
    pub fn delete_by_tag(&mut self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tags.contains(tag));
        before - self.entries.len()
    }

    /// Remove every key matching the regular expression `pattern`.
    ///
    /// An invalid expression removes nothing.
    pub fn delete_by_pattern(&mut self, pattern: &str) -> usize {
        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => {
                warn!(
                    target = "gazette_client::cache",
                    pattern,
                    error = %err,
                    "invalid invalidation pattern"
                );
                return 0;
            }
        };

        let before = self.entries.len();
        self.entries.retain(|key, _| !regex.is_match(key));
        before - self.entries.len()
    }

    /// Return the cached value for `key`, or run `fetch` and store its
    /// result. Disabled caches and forced refreshes always fetch.
    pub async fn wrap<T, E, F, Fut>(
        &mut self,
        key: &str,
        fetch: F,
        options: WrapOptions,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !options.force_refresh
            && let Some(hit) = self.get_key(key)
        {
            return Ok(hit);
        }

        let value = fetch().await?;
        self.set(key, &value, options.set);
        Ok(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
