//! # Read Cache
//!
//! Byte-bounded LRU cache of path → file content.
//!
//! Entries live in `N` independently locked shards, so lookups on unrelated
//! paths never contend on one lock. Recency is stamped from a global logical
//! clock; eviction compares the least recent entry of every shard and removes
//! the globally oldest one, so the eviction order is the same as for a single
//! unsharded LRU.
//!
//! Invariant: the summed size of all entries never exceeds `max_bytes`.
//! Space is reserved before an entry becomes visible.
//!
//! Every invalidation bumps an epoch. A reader that captured the epoch
//! before going to disk fills the cache with [`ReadCache::put_if_current`],
//! which refuses the fill if a write invalidated anything in between.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub bytes: Bytes,
    /// Logical recency stamp, larger is more recent
    pub last_access: u64,
    pub touched_at: Instant,
}

impl CacheEntry {
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }
}

type Shard = Mutex<LruCache<PathBuf, CacheEntry>>;

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejected: AtomicU64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    /// Puts skipped because the item could not fit
    pub rejected: u64,
}

pub struct ReadCache {
    shards: Box<[Shard]>,
    hasher: RandomState,
    max_bytes: usize,
    size: AtomicUsize,
    clock: AtomicU64,
    epoch: AtomicU64,
    /// Idle time after which an entry is no longer served
    ttl: Option<Duration>,
    counters: CacheCounters,
}

impl ReadCache {
    pub fn new(max_bytes: usize) -> Self {
        Self::with_shards(max_bytes, 16)
    }

    pub fn with_shards(max_bytes: usize, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(LruCache::unbounded()))
            .collect();
        Self {
            shards,
            hasher: RandomState::new(),
            max_bytes,
            size: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            ttl: None,
            counters: CacheCounters::default(),
        }
    }

    /// Treat entries idle for longer than `ttl` as misses on lookup. The
    /// periodic `sweep` still reclaims the ones nobody asks for.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn shard(&self, path: &Path) -> &Shard {
        let idx = self.hasher.hash_one(path) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `path`, refreshing its recency on a hit.
    pub fn get(&self, path: &Path) -> Option<Bytes> {
        let mut shard = self.shard(path).lock();
        if let Some(ttl) = self.ttl {
            if shard.peek(path).is_some_and(|e| e.touched_at.elapsed() > ttl) {
                if let Some(entry) = shard.pop(path) {
                    self.size.fetch_sub(entry.size_bytes(), Ordering::AcqRel);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        match shard.get_mut(path) {
            Some(entry) => {
                entry.last_access = self.tick();
                entry.touched_at = Instant::now();
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.bytes.clone())
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Presence check that does not count as an access.
    pub fn contains(&self, path: &Path) -> bool {
        self.shard(path).lock().contains(path)
    }

    /// Current invalidation epoch
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Insert or replace `path`, evicting least recently used entries until it
    /// fits. Returns `false` if the item was not cached.
    pub fn put(&self, path: PathBuf, bytes: Bytes) -> bool {
        self.insert(path, bytes, None)
    }

    /// Like [`ReadCache::put`], but only if no invalidation happened since
    /// `epoch` was read.
    pub fn put_if_current(&self, path: PathBuf, bytes: Bytes, epoch: u64) -> bool {
        self.insert(path, bytes, Some(epoch))
    }

    fn insert(&self, path: PathBuf, bytes: Bytes, epoch: Option<u64>) -> bool {
        let len = bytes.len();
        if len > self.max_bytes {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        // the old version's space must not count against the new one
        self.remove(&path);

        if !self.reserve(len) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut shard = self.shard(&path).lock();
        if epoch.is_some_and(|e| e != self.epoch()) {
            drop(shard);
            self.size.fetch_sub(len, Ordering::AcqRel);
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let entry = CacheEntry {
            bytes,
            last_access: self.tick(),
            touched_at: Instant::now(),
        };
        if let Some(replaced) = shard.put(path, entry) {
            // a concurrent put for the same path won the race
            self.size.fetch_sub(replaced.size_bytes(), Ordering::AcqRel);
        }
        true
    }

    fn reserve(&self, len: usize) -> bool {
        loop {
            let current = self.size.load(Ordering::Acquire);
            if current + len <= self.max_bytes {
                if self
                    .size
                    .compare_exchange(current, current + len, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            if !self.evict_one() {
                return false;
            }
        }
    }

    /// Evict the globally least recently used entry. `false` once every
    /// shard is empty.
    fn evict_one(&self) -> bool {
        let mut victim: Option<(usize, u64)> = None;
        for (idx, shard) in self.shards.iter().enumerate() {
            if let Some((_, entry)) = shard.lock().peek_lru() {
                if victim.map_or(true, |(_, oldest)| entry.last_access < oldest) {
                    victim = Some((idx, entry.last_access));
                }
            }
        }

        let Some((idx, stamp)) = victim else {
            return false;
        };

        let mut shard = self.shards[idx].lock();
        let still_oldest = shard
            .peek_lru()
            .is_some_and(|(_, entry)| entry.last_access == stamp);
        if still_oldest {
            if let Some((path, entry)) = shard.pop_lru() {
                self.size.fetch_sub(entry.size_bytes(), Ordering::AcqRel);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(path = %path.display(), bytes = entry.size_bytes(), "Evicted cache entry");
            }
        }
        // either we evicted, or the shard changed underneath us; both warrant a retry
        true
    }

    /// Drop `path` from the cache. Returns whether it was present.
    pub fn invalidate(&self, path: &Path) -> bool {
        // bumped before the removal so an in-flight fill cannot slip in after it
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.remove(path)
    }

    fn remove(&self, path: &Path) -> bool {
        let removed = self.shard(path).lock().pop(path);
        match removed {
            Some(entry) => {
                self.size.fetch_sub(entry.size_bytes(), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    /// Remove entries untouched for longer than `ttl`. Returns the count.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut expired = 0;
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            // shard order is recency order, so stale entries sit at the tail
            while shard
                .peek_lru()
                .is_some_and(|(_, entry)| entry.touched_at.elapsed() > ttl)
            {
                if let Some((_, entry)) = shard.pop_lru() {
                    self.size.fetch_sub(entry.size_bytes(), Ordering::AcqRel);
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            self.counters
                .expirations
                .fetch_add(expired as u64, Ordering::Relaxed);
            debug!(expired, "Cache sweep removed stale entries");
        }
        expired
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let freed: usize = shard.iter().map(|(_, e)| e.size_bytes()).sum();
            shard.clear();
            self.size.fetch_sub(freed, Ordering::AcqRel);
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        CacheStats {
            entries: self.len(),
            size_bytes: self.size_bytes(),
            max_bytes: self.max_bytes,
            hits,
            misses,
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}
