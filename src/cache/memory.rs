//! In-process cache store.
//!
//! Serves as the fallback whenever the remote store is unavailable. Entries,
//! expiry bookkeeping and the tag index live behind a single mutex so they are
//! always updated together.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use metrics::counter;
use regex::Regex;
use tokio::time::Instant;
use tracing::debug;

use super::entry::{CacheEntry, Ttl};
use super::lock::mutex_lock;
use super::pattern::glob_to_regex;
use super::store::{CacheStore, StoreError, validate_key};

const SOURCE: &str = "cache::memory";
const METRIC_CACHE_EVICT: &str = "gazette_cache_evict_total";

#[derive(Default)]
struct MemoryState {
    /// Insertion ordered; the front is the next eviction candidate.
    entries: IndexMap<String, CacheEntry>,
    tags: HashMap<String, HashSet<String>>,
}

impl MemoryState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.shift_remove(key)?;
        self.unindex(key, &entry.tags);
        Some(entry)
    }

    fn unindex(&mut self, key: &str, tags: &BTreeSet<String>) {
        for tag in tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        // Overwrites count as a fresh insertion for eviction order.
        self.remove(&key);
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    fn evict_overflow(&mut self, max_entries: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > max_entries {
            let Some((key, entry)) = self.entries.shift_remove_index(0) else {
                break;
            };
            self.unindex(&key, &entry.tags);
            debug!(key = %key, "evicted oldest cache entry");
            evicted += 1;
        }
        evicted
    }

    /// Look up a live entry, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&mut CacheEntry> {
        let expired = self.entries.get(key)?.is_expired_at(now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    /// Remove every key matching `predicate`; only live entries count.
    fn remove_where(&mut self, now: Instant, mut predicate: impl FnMut(&str) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        self.remove_live(&doomed, now)
    }

    fn remove_live<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a String>,
        now: Instant,
    ) -> usize {
        keys.into_iter()
            .filter_map(|key| self.remove(key))
            .filter(|entry| !entry.is_expired_at(now))
            .count()
    }
}

/// Mutex-guarded map of entries with optional FIFO capacity bound.
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    max_entries: Option<NonZeroUsize>,
}

impl InMemoryStore {
    pub fn new(max_entries: Option<NonZeroUsize>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            max_entries,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn max_entries(&self) -> Option<NonZeroUsize> {
        self.max_entries
    }

    pub fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "get")
            .live(key, now)
            .map(|entry| entry.clone())
    }

    pub fn get_value(&self, key: &str) -> Option<Bytes> {
        self.get_entry(key).map(|entry| entry.value)
    }

    pub fn insert(&self, key: &str, value: Bytes, ttl: Ttl, tags: &[String]) {
        let tags: BTreeSet<String> = tags.iter().cloned().collect();
        let entry = CacheEntry::new(value, ttl, tags);

        let evicted = {
            let mut state = mutex_lock(&self.state, SOURCE, "insert");
            state.insert(key.to_string(), entry);
            match self.max_entries {
                Some(limit) => state.evict_overflow(limit.get()),
                None => 0,
            }
        };

        if evicted > 0 {
            counter!(METRIC_CACHE_EVICT, "tier" => "memory").increment(evicted as u64);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        mutex_lock(&self.state, SOURCE, "remove")
            .remove(key)
            .is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "contains")
            .live(key, now)
            .is_some()
    }

    pub fn set_expiry(&self, key: &str, ttl: Ttl) -> bool {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "set_expiry");
        match state.live(key, now) {
            Some(entry) => {
                entry.reset_expiry(ttl, now);
                true
            }
            None => false,
        }
    }

    pub fn remove_matching(&self, pattern: &Regex) -> usize {
        let now = Instant::now();
        mutex_lock(&self.state, SOURCE, "remove_matching")
            .remove_where(now, |key| pattern.is_match(key))
    }

    pub fn remove_tagged(&self, tag: &str) -> usize {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "remove_tagged");
        let Some(keys) = state.tags.get(tag).cloned() else {
            return 0;
        };
        state.remove_live(&keys, now)
    }

    /// Drop every expired entry. Reads already enforce expiry; this only
    /// bounds memory held by entries nobody asks for again.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = mutex_lock(&self.state, SOURCE, "purge_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Keys currently tagged with `tag`, for diagnostics and tests.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        mutex_lock(&self.state, SOURCE, "keys_for_tag")
            .tags
            .get(tag)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.tags.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        validate_key(key)?;
        Ok(self.get_value(key))
    }

    async fn set_tagged(
        &self,
        key: &str,
        value: Bytes,
        ttl: Ttl,
        tags: &[String],
    ) -> Result<(), StoreError> {
        validate_key(key)?;
        self.insert(key, value, ttl, tags);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.remove(key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.contains(key))
    }

    async fn expire(&self, key: &str, ttl: Ttl) -> Result<bool, StoreError> {
        validate_key(key)?;
        Ok(self.set_expiry(key, ttl))
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64, StoreError> {
        let regex = glob_to_regex(pattern)?;
        Ok(self.remove_matching(&regex) as u64)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<u64, StoreError> {
        Ok(self.remove_tagged(tag) as u64)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::time::Duration;

    use super::*;

    fn bytes(value: &'static str) -> Bytes {
        Bytes::from_static(value.as_bytes())
    }

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn set_then_get_round_trips() {
        let store = InMemoryStore::unbounded();
        store.insert("k", bytes("v"), Ttl::seconds(60), &[]);
        assert_eq!(store.get_value("k"), Some(bytes("v")));
        assert!(store.contains("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_removed_on_read() {
        let store = InMemoryStore::unbounded();
        store.insert("k", bytes("v"), Ttl::seconds(1), &tags(&["news"]));

        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(store.get_value("k").is_none());
        assert_eq!(store.len(), 0);
        assert!(store.keys_for_tag("news").is_empty());
    }

    #[test]
    fn fifo_eviction_ignores_reads() {
        let store = InMemoryStore::new(NonZeroUsize::new(2));
        store.insert("a", bytes("1"), Ttl::NONE, &[]);
        store.insert("b", bytes("2"), Ttl::NONE, &[]);

        // Reading `a` must not protect it.
        assert!(store.get_value("a").is_some());

        store.insert("c", bytes("3"), Ttl::NONE, &[]);
        assert!(store.get_value("a").is_none());
        assert!(store.get_value("b").is_some());
        assert!(store.get_value("c").is_some());
    }

    #[test]
    fn capacity_of_one_keeps_only_latest() {
        let store = InMemoryStore::new(NonZeroUsize::new(1));
        store.insert("a", bytes("1"), Ttl::NONE, &tags(&["t"]));
        store.insert("b", bytes("2"), Ttl::NONE, &tags(&["t"]));
        assert!(store.get_value("a").is_none());
        assert!(store.get_value("b").is_some());
        assert_eq!(store.keys_for_tag("t").len(), 1);
    }

    #[test]
    fn overwrite_moves_key_to_back_of_queue() {
        let store = InMemoryStore::new(NonZeroUsize::new(2));
        store.insert("a", bytes("1"), Ttl::NONE, &[]);
        store.insert("b", bytes("2"), Ttl::NONE, &[]);
        store.insert("a", bytes("1b"), Ttl::NONE, &[]);
        store.insert("c", bytes("3"), Ttl::NONE, &[]);

        assert!(store.get_value("b").is_none());
        assert_eq!(store.get_value("a"), Some(bytes("1b")));
    }

    #[test]
    fn tag_index_tracks_overwrites() {
        let store = InMemoryStore::unbounded();
        store.insert("k", bytes("v"), Ttl::NONE, &tags(&["old"]));
        store.insert("k", bytes("v2"), Ttl::NONE, &tags(&["new"]));

        assert!(store.keys_for_tag("old").is_empty());
        assert!(store.keys_for_tag("new").contains("k"));
    }

    #[test]
    fn delete_by_tag_leaves_other_tags_alone() {
        let store = InMemoryStore::unbounded();
        store.insert("n1", bytes("1"), Ttl::NONE, &tags(&["news"]));
        store.insert("n2", bytes("2"), Ttl::NONE, &tags(&["news", "front"]));
        store.insert("r1", bytes("3"), Ttl::NONE, &tags(&["resources"]));

        assert_eq!(store.remove_tagged("news"), 2);
        assert!(store.get_value("r1").is_some());
        assert!(store.keys_for_tag("front").is_empty());
        assert_eq!(store.remove_tagged("missing"), 0);
    }

    #[tokio::test]
    async fn pattern_deletion_isolated_to_matches() {
        let store = InMemoryStore::unbounded();
        store.insert("/resources/1", bytes("1"), Ttl::NONE, &[]);
        store.insert("/resources/2", bytes("2"), Ttl::NONE, &[]);
        store.insert("/other/1", bytes("3"), Ttl::NONE, &[]);

        let removed = store.delete_by_pattern("/resources*").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_value("/other/1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expire_resets_and_clears_ttl() {
        let store = InMemoryStore::unbounded();
        store.insert("k", bytes("v"), Ttl::NONE, &[]);
        assert!(store.set_expiry("k", Ttl::seconds(1)));
        assert!(!store.set_expiry("missing", Ttl::seconds(1)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!store.contains("k"));

        store.insert("p", bytes("v"), Ttl::seconds(1), &[]);
        assert!(store.set_expiry("p", Ttl::NONE));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.contains("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired_entries() {
        let store = InMemoryStore::unbounded();
        store.insert("short", bytes("1"), Ttl::seconds(1), &[]);
        store.insert("long", bytes("2"), Ttl::seconds(60), &[]);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bulk_removal_counts_only_live_entries() {
        let store = InMemoryStore::unbounded();
        store.insert("/news/stale", bytes("1"), Ttl::seconds(1), &tags(&["news"]));
        store.insert("/news/fresh", bytes("2"), Ttl::seconds(60), &tags(&["news"]));
        store.insert("/events/stale", bytes("3"), Ttl::seconds(1), &tags(&["events"]));
        store.insert("/events/fresh", bytes("4"), Ttl::NONE, &tags(&["events"]));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(store.remove_tagged("news"), 1);
        let removed = store.delete_by_pattern("/events/*").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn malformed_keys_are_rejected() {
        let store = InMemoryStore::unbounded();
        assert!(matches!(
            store.get("").await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let store = InMemoryStore::unbounded();
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.state.lock().expect("state lock");
            panic!("poison memory store");
        }));

        store.insert("k", bytes("v"), Ttl::NONE, &[]);
        assert!(store.get_value("k").is_some());
    }
}
