//! In-memory TTL cache for rendered route payloads.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A rendered response as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    pub data: Bytes,
    pub code: u16,
}

/// Lifetime of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    Never,
    After(Duration),
}

impl Expiration {
    /// Map configured seconds to an expiration.
    ///
    /// Zero never expires; negative means the entry must not be stored.
    pub fn from_secs(secs: i64) -> Option<Self> {
        match secs {
            s if s < 0 => None,
            0 => Some(Self::Never),
            s => Some(Self::After(Duration::from_secs(s as u64))),
        }
    }

    fn deadline(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Never => None,
            Self::After(ttl) => Some(now + *ttl),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    payload: CachedPayload,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(payload: CachedPayload, expiration: Expiration) -> Self {
        Self {
            payload,
            expires_at: expiration.deadline(Instant::now()),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A thread-safe TTL cache keyed by route name.
///
/// A cache built with a zero or negative default expiration is disabled:
/// reads miss and writes are dropped.
pub struct TtlCache {
    inner: DashMap<String, Slot>,
    enabled: bool,
    cleanup: Duration,
    shutdown_tx: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TtlCache {
    /// Create a cache. `expiration` is the space-wide default in seconds,
    /// `cleanup` the sweep interval (zero disables sweeping).
    pub fn new(expiration: i64, cleanup: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: DashMap::new(),
            enabled: expiration > 0,
            cleanup,
            shutdown_tx,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_disabled(&self) -> bool {
        !self.enabled
    }

    /// Get an unexpired entry.
    pub fn get(&self, key: &str) -> Option<CachedPayload> {
        if !self.enabled {
            return None;
        }
        let entry = self.inner.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.payload.clone())
    }

    /// Insert unless an unexpired entry exists. Returns whether it was written.
    pub fn add(&self, key: &str, payload: CachedPayload, expiration: Expiration) -> bool {
        if !self.enabled {
            return false;
        }
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_expired(Instant::now()) {
                    return false;
                }
                occupied.insert(Slot::new(payload, expiration));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(payload, expiration));
                true
            }
        }
    }

    /// Insert or overwrite.
    pub fn replace(&self, key: &str, payload: CachedPayload, expiration: Expiration) {
        if !self.enabled {
            return;
        }
        self.inner.insert(key.to_string(), Slot::new(payload, expiration));
    }

    /// Overwrite an existing entry, or add a new one.
    ///
    /// Returns `true` when an entry was replaced.
    pub fn replace_if_exists(&self, key: &str, payload: CachedPayload, expiration: Expiration) -> bool {
        if !self.enabled {
            return false;
        }
        self.inner
            .insert(key.to_string(), Slot::new(payload, expiration))
            .is_some_and(|old| !old.is_expired(Instant::now()))
    }

    pub fn delete(&self, key: &str) {
        self.inner.remove(key);
    }

    pub fn flush(&self) {
        self.inner.clear();
        tracing::info!("Cache flushed");
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Remove expired entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.len();
        self.inner.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.inner.len())
    }

    /// Spawn the background sweeper. Holds only a weak reference so a
    /// dropped cache stops it.
    pub fn start(self: &Arc<Self>) {
        if self.cleanup.is_zero() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.cleanup;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, remaining = cache.len(), "Cache sweep");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            *sweeper = Some(handle);
        }
    }

    /// Stop the sweeper and drop every entry.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        self.inner.clear();
    }
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("enabled", &self.enabled)
            .field("entries", &self.inner.len())
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(s: &'static str) -> CachedPayload {
        CachedPayload {
            data: Bytes::from_static(s.as_bytes()),
            code: 200,
        }
    }

    #[test]
    fn expiration_from_secs() {
        assert_eq!(Expiration::from_secs(-1), None);
        assert_eq!(Expiration::from_secs(0), Some(Expiration::Never));
        assert_eq!(
            Expiration::from_secs(5),
            Some(Expiration::After(Duration::from_secs(5)))
        );
    }

    #[test]
    fn add_is_first_writer_wins() {
        let cache = TtlCache::new(300, Duration::ZERO);
        let ttl = Expiration::After(Duration::from_secs(60));

        assert!(cache.add("index", payload("first"), ttl));
        assert!(!cache.add("index", payload("second"), ttl));
        assert_eq!(cache.get("index"), Some(payload("first")));
    }

    #[test]
    fn replace_if_exists_overwrites() {
        let cache = TtlCache::new(300, Duration::ZERO);

        assert!(!cache.replace_if_exists("stats", payload("a"), Expiration::Never));
        assert!(cache.replace_if_exists("stats", payload("b"), Expiration::Never));
        assert_eq!(cache.get("stats"), Some(payload("b")));

        cache.replace("stats", payload("c"), Expiration::Never);
        assert_eq!(cache.get("stats"), Some(payload("c")));
    }

    #[test]
    fn expired_entries_miss_and_get_swept() {
        let cache = TtlCache::new(300, Duration::ZERO);
        cache.add("old", payload("old"), Expiration::After(Duration::ZERO));
        cache.add("forever", payload("forever"), Expiration::Never);

        assert!(cache.get("old").is_none());
        assert!(cache.add("old", payload("new"), Expiration::Never));
        assert_eq!(cache.get("old"), Some(payload("new")));

        cache.replace("gone", payload("gone"), Expiration::After(Duration::ZERO));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = TtlCache::new(0, Duration::ZERO);

        assert!(cache.is_disabled());
        assert!(!cache.add("index", payload("x"), Expiration::Never));
        cache.replace("index", payload("x"), Expiration::Never);
        assert!(cache.get("index").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn negative_expiration_disables_cache() {
        let cache = TtlCache::new(-1, Duration::ZERO);

        assert!(!cache.is_enabled());
        assert!(!cache.add("index", payload("x"), Expiration::Never));
        assert!(cache.get("index").is_none());
    }

    #[test]
    fn delete_and_flush() {
        let cache = TtlCache::new(300, Duration::ZERO);
        cache.add("a", payload("a"), Expiration::Never);
        cache.add("b", payload("b"), Expiration::Never);

        cache.delete("a");
        assert!(cache.get("a").is_none());
        cache.flush();
        assert!(cache.is_empty());
    }

    #[test]
    fn concurrent_adds_keep_one_value() {
        let cache = Arc::new(TtlCache::new(300, Duration::ZERO));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache.add(
                        "race",
                        CachedPayload {
                            data: Bytes::from(format!("writer-{i}")),
                            code: 200,
                        },
                        Expiration::Never,
                    )
                })
            })
            .collect();

        let written = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|w| *w)
            .count();
        assert_eq!(written, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let cache = Arc::new(TtlCache::new(300, Duration::from_millis(20)));
        cache.start();
        cache.add("short", payload("x"), Expiration::After(Duration::from_millis(5)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.len(), 0);

        cache.shutdown();
    }
}
