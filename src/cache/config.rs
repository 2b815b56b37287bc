//! Cache configuration.
//!
//! Controls the server-side cache facade and the response cache middleware.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::entry::Ttl;

const DEFAULT_NAMESPACE: &str = "gazette";
const DEFAULT_MEMORY_MAX_ENTRIES: usize = 10_000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_RESPONSE_BODY_LIMIT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup misses and every write is dropped.
    pub enabled: bool,
    /// Prefix of every key this process writes.
    pub namespace: String,
    /// Capacity of the in-process fallback; 0 means unbounded.
    pub memory_max_entries: usize,
    /// Period of the expired-entry sweeper; 0 disables it.
    pub sweep_interval_seconds: u64,
    /// Responses larger than this are served but never stored.
    pub response_body_limit_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: DEFAULT_NAMESPACE.to_string(),
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            sweep_interval_seconds: DEFAULT_SWEEP_INTERVAL_SECS,
            response_body_limit_bytes: DEFAULT_RESPONSE_BODY_LIMIT_BYTES,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            namespace: settings.namespace.clone(),
            memory_max_entries: settings.memory_max_entries,
            sweep_interval_seconds: settings.sweep_interval_seconds,
            response_body_limit_bytes: settings.response_body_limit_bytes,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn memory_limit(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.memory_max_entries)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_seconds > 0).then(|| Duration::from_secs(self.sweep_interval_seconds))
    }
}

/// Named lifetimes for cached responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlPreset {
    /// One minute.
    Short,
    /// Five minutes.
    Medium,
    /// Thirty minutes.
    Long,
    /// One hour.
    VeryLong,
    /// One day.
    Day,
}

impl TtlPreset {
    pub fn seconds(&self) -> i64 {
        match self {
            TtlPreset::Short => 60,
            TtlPreset::Medium => 300,
            TtlPreset::Long => 1800,
            TtlPreset::VeryLong => 3600,
            TtlPreset::Day => 86_400,
        }
    }
}

impl From<TtlPreset> for Ttl {
    fn from(preset: TtlPreset) -> Self {
        Ttl::seconds(preset.seconds())
    }
}
