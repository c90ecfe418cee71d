//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! Space::initialize
//!     → TtlCache::new(expiration, cleanup) + start() (sweeper task)
//!     → CacheHandle::set (published to connections and cron)
//!
//! Resolver:
//!     get(route) → HIT
//!     add(route) / replace_if_exists(route) after a render
//!
//! SIGUSR1 → flush()     Space::reset → flush() or rebuild
//! ```
//!
//! # Design Decisions
//! - Keyed by route name only; requests matching one regex route share a slot
//! - `DashMap` sharded locking, no global mutex on the hot path
//! - The handle can be empty: no `memory` section means no cache

pub mod ttl;

use std::sync::Arc;

use arc_swap::ArcSwapOption;

pub use ttl::{CachedPayload, Expiration, TtlCache};

/// Shared, swappable accessor to the current cache.
///
/// Connections keep the handle, not the cache, so a rebuilt cache is picked
/// up by the next request.
#[derive(Debug, Clone, Default)]
pub struct CacheHandle {
    inner: Arc<ArcSwapOption<TtlCache>>,
}

impl CacheHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<TtlCache>> {
        self.inner.load_full()
    }

    pub fn set(&self, cache: Option<Arc<TtlCache>>) {
        self.inner.store(cache);
    }

    /// Whether lookups and writes should happen at all.
    pub fn is_enabled(&self) -> bool {
        self.get().is_some_and(|c| c.is_enabled())
    }
}

/// Outcome of the cache step for one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Hit,
    Miss,
    Replace,
    NoCache,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Replace => "REPLACE",
            Self::NoCache => "NOCACHE",
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
