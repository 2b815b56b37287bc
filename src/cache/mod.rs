//! Gazette cache system.
//!
//! Two server-side tiers behind one facade:
//!
//! - **Distributed**: the remote key-value store, used while its connection
//!   is ready. Shared by every process.
//! - **Memory**: a bounded in-process store, used whenever the remote tier is
//!   absent, still connecting or has failed. Private to each process.
//!
//! [`CacheService`] picks the tier per call; [`response_cache_layer`] and
//! [`clear_cache_layer`] put it in front of HTTP handlers.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! namespace = "gazette"
//! memory_max_entries = 10000
//! sweep_interval_seconds = 60
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! environment = "production"
//! ```

mod config;
mod connection;
mod distributed;
mod entry;
mod keys;
mod lock;
mod memory;
mod middleware;
mod pattern;
mod remote;
mod service;
mod store;

pub use config::{CacheConfig, TtlPreset};
pub use connection::{
    ConnectionManager, ConnectionSettings, ConnectionState, RetryPolicy, RuntimeEnvironment,
};
pub use distributed::DistributedStoreAdapter;
pub use entry::{CacheEntry, Ttl};
pub use keys::{CacheKey, CallerIdentity, canonical_query, generate_key};
pub use memory::InMemoryStore;
pub use middleware::{
    CacheCondition, CachedResponse, ClearCacheState, ClearTarget, KeyStrategy,
    ResponseCacheState, X_CACHE, X_CACHE_CLEARED, X_CACHE_CLEARED_COUNT, X_CACHE_KEY,
    clear_cache, clear_cache_layer, collection_patterns, default_condition, resource_cache,
    response_cache_layer, route_cache, should_store_response,
};
pub use pattern::{escape_glob, glob_to_regex};
pub use remote::{RemoteConnection, RemoteConnector, RemoteError};
pub use service::{CacheService, CacheStatus};
pub use store::{CacheStore, StoreError};
