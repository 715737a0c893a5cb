//! Read-through cache for image record snapshots.
//!
//! Entries are serialized [`ImageRecord`](crate::records::ImageRecord)
//! snapshots keyed by `image:{id}`, each with its own time-to-live. The
//! cache is bounded both by entry count and by total bytes; least-recently
//! used entries are evicted first.
//!
//! # Consistency
//!
//! The cache is not kept in step with the record store. A worker running in
//! the same process invalidates `image:{id}` after appending a variant; a
//! worker in another process cannot, so a reader there may see a snapshot
//! up to one TTL old.

use std::num::NonZeroUsize;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default time-to-live for cached snapshots: one hour.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Default total size bound: 64MB.
pub const DEFAULT_CACHE_CAPACITY_BYTES: usize = 64 * 1024 * 1024;

/// Default entry bound.
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

/// Cache key for an image record snapshot.
pub fn image_key(image_id: &str) -> String {
    format!("image:{}", image_id)
}

struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    current_size: usize,
}

impl Inner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.current_size = self.current_size.saturating_sub(entry.value.len());
        Some(entry)
    }
}

/// TTL-bounded LRU cache of serialized snapshots.
///
/// Thread-safe; share it across tasks via `Arc`.
pub struct RecordCache {
    inner: RwLock<Inner>,
    max_size: usize,
    default_ttl: Duration,
}

impl RecordCache {
    /// A cache with default bounds and TTL.
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_CACHE_CAPACITY_BYTES,
            DEFAULT_CACHE_MAX_ENTRIES,
            DEFAULT_CACHE_TTL,
        )
    }

    /// A cache holding at most `max_size` bytes in at most `max_entries` entries.
    pub fn with_limits(max_size: usize, max_entries: usize, default_ttl: Duration) -> Self {
        let max_entries = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(Inner {
                entries: LruCache::new(max_entries),
                current_size: 0,
            }),
            max_size,
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up `key`. Expired entries are dropped and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.write().await;
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
        }
        None
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    ///
    /// A value larger than the whole cache is not stored.
    pub async fn set(&self, key: impl Into<String>, value: Bytes, ttl: Duration) {
        let key = key.into();
        let size = value.len();
        let mut inner = self.inner.write().await;

        inner.remove(&key);
        if size > self.max_size {
            return;
        }

        let entry = CacheEntry {
            value,
            expires_at: Instant::now() + ttl,
        };
        if let Some((_, evicted)) = inner.entries.push(key, entry) {
            inner.current_size = inner.current_size.saturating_sub(evicted.value.len());
        }
        inner.current_size += size;

        while inner.current_size > self.max_size {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_size = inner.current_size.saturating_sub(evicted.value.len());
                }
                None => break,
            }
        }
    }

    /// Store `value` with the default TTL.
    pub async fn set_default(&self, key: impl Into<String>, value: Bytes) {
        self.set(key, value, self.default_ttl).await
    }

    /// Drop `key`. Returns whether an entry was present.
    pub async fn invalidate(&self, key: &str) -> bool {
        self.inner.write().await.remove(key).is_some()
    }

    /// Number of entries, including expired ones not yet dropped.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total bytes held.
    pub async fn size(&self) -> usize {
        self.inner.read().await.current_size
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.current_size = 0;
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}
