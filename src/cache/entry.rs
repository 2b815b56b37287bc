//! Cache entry and time-to-live representation shared by every store.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

/// Time-to-live for a cache entry.
///
/// A zero or negative number of seconds means "no expiry".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ttl(Option<Duration>);

impl Ttl {
    /// Entry never expires on its own; it must be invalidated explicitly.
    pub const NONE: Ttl = Ttl(None);

    pub fn seconds(seconds: i64) -> Self {
        if seconds <= 0 {
            Self::NONE
        } else {
            Self(Some(Duration::from_secs(seconds.unsigned_abs())))
        }
    }

    pub fn from_duration(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::NONE
        } else {
            Self(Some(duration))
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        self.0
    }

    /// Whole seconds for stores that only accept second granularity.
    ///
    /// Sub-second remainders round up so an entry never outlives its TTL by
    /// being truncated to zero (which remote stores treat as "no expiry").
    pub fn as_whole_seconds(&self) -> Option<u64> {
        self.0.map(|duration| {
            let secs = duration.as_secs();
            if duration.subsec_nanos() > 0 {
                secs + 1
            } else {
                secs
            }
        })
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }
}

/// A stored value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Bytes,
    pub created_at: Instant,
    /// `None` means the entry only leaves the cache through invalidation or eviction.
    pub expires_at: Option<Instant>,
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    pub fn new(value: Bytes, ttl: Ttl, tags: BTreeSet<String>) -> Self {
        let created_at = Instant::now();
        Self {
            value,
            created_at,
            expires_at: ttl.as_duration().map(|ttl| created_at + ttl),
            tags,
        }
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Reset the expiry relative to `now`.
    pub fn reset_expiry(&mut self, ttl: Ttl, now: Instant) {
        self.expires_at = ttl.as_duration().map(|ttl| now + ttl);
    }
}
