//! Best-effort shared cache.
//!
//! Holds the fast-path mirror of each document's latest version and the
//! short-lived save lock. Every value read here is a hint; the step table
//! stays the ground truth.

use crate::types::{DocumentId, Version};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Cache key of the latest-version mirror for a document.
pub fn version_key(document: DocumentId) -> String {
    format!("document-version-{}", document)
}

/// Cache key of the advisory save lock for a document.
pub fn save_lock_key(document: DocumentId) -> String {
    format!("document-save-lock-{}", document)
}

/// Process-external key/value cache shared by all engine instances.
pub trait DistributedCache: Send + Sync {
    fn get(&self, key: &str) -> Option<u64>;

    fn set(&self, key: &str, value: u64, ttl: Option<Duration>);

    /// Store only if the key is absent. Returns whether the value was stored.
    fn add(&self, key: &str, value: u64, ttl: Option<Duration>) -> bool;

    fn remove(&self, key: &str);
}

/// Typed view over the version mirror entries of a cache.
pub struct VersionCache<'a> {
    cache: &'a dyn DistributedCache,
    ttl: Option<Duration>,
}

impl<'a> VersionCache<'a> {
    pub fn new(cache: &'a dyn DistributedCache, ttl: Option<Duration>) -> Self {
        Self { cache, ttl }
    }

    pub fn get(&self, document: DocumentId) -> Option<Version> {
        self.cache.get(&version_key(document)).map(Version)
    }

    pub fn publish(&self, document: DocumentId, version: Version) {
        self.cache.set(&version_key(document), version.0, self.ttl);
    }

    pub fn forget(&self, document: DocumentId) {
        self.cache.remove(&version_key(document));
    }
}

#[derive(Clone, Copy)]
struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process cache with LRU eviction and per-entry expiry.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl DistributedCache for MemoryCache {
    fn get(&self, key: &str) -> Option<u64> {
        let mut entries = self.entries.lock();
        match entries.get(key).copied() {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.value),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, value: u64, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().put(key.to_string(), Entry { value, expires_at });
    }

    fn add(&self, key: &str, value: u64, ttl: Option<Duration>) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                return false;
            }
        }
        entries.put(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        true
    }

    fn remove(&self, key: &str) {
        self.entries.lock().pop(key);
    }
}

/// Cache that stores nothing, for deployments without a shared cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullCache;

impl DistributedCache for NullCache {
    fn get(&self, _key: &str) -> Option<u64> {
        None
    }

    fn set(&self, _key: &str, _value: u64, _ttl: Option<Duration>) {}

    fn add(&self, _key: &str, _value: u64, _ttl: Option<Duration>) -> bool {
        true
    }

    fn remove(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_get_remove() {
        let cache = MemoryCache::new(10);
        cache.set("a", 5, None);
        assert_eq!(cache.get("a"), Some(5));
        cache.remove("a");
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_expiry() {
        let cache = MemoryCache::new(10);
        cache.set("a", 1, Some(Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_add_respects_live_entries() {
        let cache = MemoryCache::new(10);
        assert!(cache.add("lock", 1, Some(Duration::from_millis(20))));
        assert!(!cache.add("lock", 1, Some(Duration::from_millis(20))));
        thread::sleep(Duration::from_millis(40));
        assert!(cache.add("lock", 1, None));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemoryCache::new(2);
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("c", 3, None);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_version_view() {
        let cache = MemoryCache::new(10);
        let versions = VersionCache::new(&cache, None);
        versions.publish(DocumentId(3), Version(42));
        assert_eq!(cache.get("document-version-3"), Some(42));
        assert_eq!(versions.get(DocumentId(3)), Some(Version(42)));
        versions.forget(DocumentId(3));
        assert_eq!(versions.get(DocumentId(3)), None);
    }
}
