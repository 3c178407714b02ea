// src/pipeline/cache.rs
//! Bounded in-memory store of decoded thumbnails, keyed by URL.
//!
//! Sizes are accounted in KiB. Eviction is least-recently-used until the
//! resident total fits the capacity again.

use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::types::Thumbnail;

const FALLBACK_MEMORY_BYTES: u64 = 512 * 1024 * 1024;
const MIN_CAPACITY_BYTES: usize = 8 * 1024 * 1024;

struct Entry {
    image: Arc<Thumbnail>,
    size_kib: usize,
}

struct Inner {
    entries: LruCache<String, Entry>,
    size_kib: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub size_kib: usize,
    pub capacity_kib: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe LRU cache of decoded thumbnails.
///
/// Shared between the polling thread and the planner via `Arc<ImageCache>`.
pub struct ImageCache {
    inner: Mutex<Inner>,
    capacity_kib: usize,
}

/// Size of a pixel buffer in cache units, rounded up so nothing is free.
fn entry_kib(bytes: usize) -> usize {
    bytes.div_ceil(1024).max(1)
}

/// One eighth of the memory currently available to the process.
pub fn default_capacity_bytes() -> usize {
    let mut sys = sysinfo::System::new();
    sys.refresh_memory();
    let available = match sys.available_memory() {
        0 => FALLBACK_MEMORY_BYTES,
        n => n,
    };
    let budget = usize::try_from(available / 8).unwrap_or(usize::MAX);
    budget.max(MIN_CAPACITY_BYTES)
}

impl ImageCache {
    pub fn with_capacity_bytes(capacity_bytes: usize) -> Self {
        let capacity_kib = capacity_bytes / 1024;
        debug!("image cache capacity {capacity_kib} KiB");
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size_kib: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity_kib,
        }
    }

    /// Cache sized from available memory (see [`default_capacity_bytes`]).
    pub fn from_available_memory() -> Self {
        Self::with_capacity_bytes(default_capacity_bytes())
    }

    /// Store `image` under `key` unless something is already cached there.
    ///
    /// First writer wins. Returns whether the image was stored.
    pub fn put(&self, key: &str, image: Arc<Thumbnail>) -> bool {
        if key.is_empty() {
            return false;
        }
        let size_kib = entry_kib(image.byte_size());

        let mut inner = self.inner.lock();
        if inner.entries.get(key).is_some() {
            trace!("cache put skipped, already present: {key}");
            return false;
        }
        if size_kib > self.capacity_kib {
            debug!(
                "cache put skipped, {size_kib} KiB exceeds capacity {} KiB: {key}",
                self.capacity_kib
            );
            return false;
        }

        while inner.size_kib + size_kib > self.capacity_kib {
            let Some((old_key, old)) = inner.entries.pop_lru() else {
                break;
            };
            inner.size_kib -= old.size_kib;
            inner.evictions += 1;
            trace!("cache evicted {old_key} ({} KiB)", old.size_kib);
        }

        inner.size_kib += size_kib;
        inner.entries.put(key.to_string(), Entry { image, size_kib });
        true
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<Thumbnail>> {
        let mut inner = self.inner.lock();
        let found = inner.entries.get(key).map(|e| Arc::clone(&e.image));
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    /// Presence check that leaves the LRU order and stats alone.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.size_kib = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn size_kib(&self) -> usize {
        self.inner.lock().size_kib
    }

    pub const fn capacity_kib(&self) -> usize {
        self.capacity_kib
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            size_kib: inner.size_kib,
            capacity_kib: self.capacity_kib,
        }
    }
}

impl Default for ImageCache {
    fn default() -> Self {
        Self::from_available_memory()
    }
}
