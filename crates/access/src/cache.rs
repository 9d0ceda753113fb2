//! Process-wide query result cache keyed by descriptor fingerprint.

use quarry_store::{Fingerprint, ResultSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as FillLock, OwnedMutexGuard};

const DEFAULT_SHARDS: usize = 16;

/// One cached result.
#[derive(Debug)]
pub struct CacheEntry {
    result: ResultSet,
    touches: Vec<String>,
    created_at: Instant,
}

impl CacheEntry {
    pub fn result(&self) -> &ResultSet {
        &self.result
    }

    /// Entity types whose rows appear in the result.
    pub fn touches(&self) -> &[String] {
        &self.touches
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Cumulative counters since the cache was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    /// Entries removed by [`Cache::invalidate`].
    pub invalidations: u64,
    /// Entries found past their time-to-live.
    pub expirations: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    invalidations: AtomicU64,
    expirations: AtomicU64,
}

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<Fingerprint, Arc<CacheEntry>>>,
    fills: Mutex<HashMap<Fingerprint, Arc<FillLock<()>>>>,
}

/// Result cache shared by every scope of a process.
///
/// The map is split into independently locked shards, so lookups of
/// different fingerprints never wait on each other and there is no lock over
/// the whole cache. Readers get a clone of an immutable snapshot; an entry is
/// only ever replaced whole.
///
/// Filling a missing entry is serialized per fingerprint with
/// [`Cache::lock`]: the first caller executes the query while concurrent
/// callers for the same fingerprint wait and then find the stored result.
pub struct Cache {
    shards: Box<[Shard]>,
    ttl: Option<Duration>,
    // Bumped by every invalidation. A fill started before an invalidation
    // must not store its (possibly stale) result.
    epoch: AtomicU64,
    counters: Counters,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    /// A cache whose entries live until invalidated.
    pub fn new() -> Self {
        Self::with_options(DEFAULT_SHARDS, None)
    }

    /// A cache whose entries expire `ttl` after they were stored.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::with_options(DEFAULT_SHARDS, Some(ttl))
    }

    pub fn with_options(shards: usize, ttl: Option<Duration>) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Shard::default()).collect(),
            ttl,
            epoch: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn shard(&self, fingerprint: &Fingerprint) -> &Shard {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&fingerprint.as_bytes()[..8]);
        let index = u64::from_le_bytes(prefix) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl.is_some_and(|ttl| entry.age() >= ttl)
    }

    /// Cached result for `fingerprint`; expired entries count as misses and
    /// are removed.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<ResultSet> {
        let shard = self.shard(fingerprint);
        let entry = shard.entries.read().unwrap_or_else(PoisonError::into_inner).get(fingerprint).cloned();
        match entry {
            Some(entry) if !self.is_expired(&entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%fingerprint, "Cache hit");
                Some(entry.result.clone().with_round_trips(0))
            },
            Some(expired) => {
                let mut entries = shard.entries.write().unwrap_or_else(PoisonError::into_inner);
                // Another caller may have refreshed it in the meantime.
                if entries.get(fingerprint).is_some_and(|current| Arc::ptr_eq(current, &expired)) {
                    entries.remove(fingerprint);
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(%fingerprint, "Cache miss");
                None
            },
        }
    }

    /// Store a result, replacing any previous entry for the fingerprint.
    pub fn put(&self, fingerprint: Fingerprint, touches: Vec<String>, result: ResultSet) {
        self.store(fingerprint, touches, result, None);
    }

    /// Store a result computed after [`Cache::epoch`] returned `epoch`, unless
    /// an invalidation happened since. Returns whether it was stored.
    pub fn put_if_current(&self, fingerprint: Fingerprint, touches: Vec<String>, result: ResultSet, epoch: u64) -> bool {
        self.store(fingerprint, touches, result, Some(epoch))
    }

    fn store(&self, fingerprint: Fingerprint, touches: Vec<String>, result: ResultSet, epoch: Option<u64>) -> bool {
        let entry = Arc::new(CacheEntry { result, touches, created_at: Instant::now() });
        let mut entries = self.shard(&fingerprint).entries.write().unwrap_or_else(PoisonError::into_inner);
        // Checked under the shard lock: an invalidation either bumped the
        // epoch already, or will sweep this shard after the insert.
        if epoch.is_some_and(|e| e != self.epoch.load(Ordering::SeqCst)) {
            tracing::debug!(%fingerprint, "Not caching result computed across an invalidation");
            return false;
        }
        entries.insert(fingerprint, entry);
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Wait for exclusive right to fill `fingerprint`.
    ///
    /// Only callers of the same fingerprint wait on each other.
    pub async fn lock(&self, fingerprint: Fingerprint) -> FillGuard<'_> {
        let shard = self.shard(&fingerprint);
        let lock = {
            let mut fills = shard.fills.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(fills.entry(fingerprint).or_default())
        };
        FillGuard { shard, fingerprint, guard: Some(lock.lock_owned().await) }
    }

    /// Drop every entry whose result touches `entity_type`; entries of other
    /// types are kept. Returns the number of entries removed.
    pub fn invalidate(&self, entity_type: &str) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let mut removed = 0;
        for shard in &self.shards {
            let mut entries = shard.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|_, entry| !entry.touches.iter().any(|t| t == entity_type));
            removed += before - entries.len();
        }
        self.counters.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        tracing::debug!(entity_type, removed, "Invalidated cache entries");
        removed
    }

    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for shard in &self.shards {
            shard.entries.write().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.read().unwrap_or_else(PoisonError::into_inner).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            invalidations: c.invalidations.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive right to fill one fingerprint; released on drop.
pub struct FillGuard<'a> {
    shard: &'a Shard,
    fingerprint: Fingerprint,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        let mut fills = self.shard.fills.lock().unwrap_or_else(PoisonError::into_inner);
        // The map holds one reference and this guard another; anything more
        // is a caller waiting for the same fingerprint.
        if let Some(guard) = self.guard.take()
            && Arc::strong_count(OwnedMutexGuard::mutex(&guard)) == 2
        {
            fills.remove(&self.fingerprint);
        }
    }
}
