#![forbid(unsafe_code)]

//! Typed TTL cache service and the background sweeper that evicts expired
//! entries.
//!
//! A [`Cache`] is an explicit object injected into the components that need
//! it. Entries are spread over independently locked LRU shards so `get`/`put`
//! on one key never waits on an unrelated shard. Nothing here is linked to the
//! persistence backend: callers invalidate entries on rollback, schema change
//! or reverted edits.

use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::Result;
use crate::model::SequenceCategory;

/// Cache key made of an identifier family plus a formatted pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    /// Identifier family.
    pub category: SequenceCategory,
    /// Formatted pattern.
    pub pattern: String,
}

impl PoolKey {
    /// Builds a key.
    pub fn new(category: SequenceCategory, pattern: impl Into<String>) -> Self {
        Self {
            category,
            pattern: pattern.into(),
        }
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Entries dropped because their TTL elapsed.
    pub expired: u64,
    /// Entries dropped by explicit invalidation.
    pub invalidated: u64,
}

/// Sharded LRU map whose entries expire after a fixed TTL.
pub struct Cache<K, V> {
    name: &'static str,
    shards: Vec<Mutex<LruCache<K, Entry<V>>>>,
    ttl: Duration,
    metrics: CacheMetrics,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates an empty cache sized by `config`.
    pub fn new(name: &'static str, config: &CacheConfig) -> Self {
        Self::with_ttl(name, config.shards, config.capacity, config.ttl())
    }

    /// Creates an empty cache with explicit sizing.
    pub fn with_ttl(name: &'static str, shards: usize, capacity: usize, ttl: Duration) -> Self {
        let shard_count = shards.max(1);
        let per_shard = NonZeroUsize::new((capacity / shard_count).max(1))
            .unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count)
            .map(|_| Mutex::new(LruCache::new(per_shard)))
            .collect();
        Self {
            name,
            shards,
            ttl,
            metrics: CacheMetrics::default(),
        }
    }

    /// Name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the live value for `key`, dropping it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut shard = self.shard_for(key).lock();
        let lookup = shard
            .get(key)
            .map(|entry| (entry.expires_at > now).then(|| entry.value.clone()));
        match lookup {
            Some(Some(value)) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some(None) => {
                shard.pop(key);
                self.metrics.expired.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Stores `value` under `key`, restarting its TTL.
    pub fn put(&self, key: K, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.shard_for(&key).lock().put(key, entry);
    }

    /// Returns the cached value or computes, stores and returns it.
    ///
    /// The shard lock is not held while `load` runs, so two callers racing on
    /// the same missing key may both load; the later `put` wins.
    pub fn get_or_try_insert_with<F>(&self, key: &K, load: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load()?;
        self.put(key.clone(), value.clone());
        Ok(value)
    }

    /// Drops one entry. Returns whether it was present.
    pub fn invalidate_key(&self, key: &K) -> bool {
        let removed = self.shard_for(key).lock().pop(key).is_some();
        if removed {
            self.metrics.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drops every entry whose key matches `pred`. Returns the count dropped.
    pub fn invalidate_where<P>(&self, pred: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let doomed: Vec<K> = guard
                .iter()
                .filter(|(key, _)| pred(key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in doomed {
                guard.pop(&key);
                removed += 1;
            }
        }
        self.metrics
            .invalidated
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drops everything.
    pub fn clear(&self) {
        let mut removed = 0u64;
        for shard in &self.shards {
            let mut guard = shard.lock();
            removed += guard.len() as u64;
            guard.clear();
        }
        self.metrics.invalidated.fetch_add(removed, Ordering::Relaxed);
        debug!(cache = self.name, removed, "cache.clear");
    }

    /// Evicts expired entries. Returns the count evicted.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = 0;
        for shard in &self.shards {
            let mut guard = shard.lock();
            let expired: Vec<K> = guard
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in expired {
                guard.pop(&key);
                evicted += 1;
            }
        }
        self.metrics
            .expired
            .fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns true when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the hit/miss counters.
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            expired: self.metrics.expired.load(Ordering::Relaxed),
            invalidated: self.metrics.invalidated.load(Ordering::Relaxed),
        }
    }

    fn shard_for(&self, key: &K) -> &Mutex<LruCache<K, Entry<V>>> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

impl<V: Clone> Cache<PoolKey, V> {
    /// Drops entries of `category` whose pattern starts with `prefix`.
    pub fn invalidate(&self, category: SequenceCategory, prefix: &str) -> usize {
        self.invalidate_where(|key| key.category == category && key.pattern.starts_with(prefix))
    }
}

/// Anything the sweeper can evict expired entries from.
pub trait Sweep: Send + Sync {
    /// Name used in logs.
    fn sweep_name(&self) -> &'static str;
    /// Evicts expired entries, returning how many were dropped.
    fn sweep(&self) -> usize;
}

impl<K, V> Sweep for Cache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn sweep_name(&self) -> &'static str {
        self.name
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }
}

enum SweepMessage {
    Trigger,
    Shutdown,
}

/// Long-lived background thread that periodically sweeps registered caches.
///
/// Dropping the sweeper stops and joins the thread.
pub struct CacheSweeper {
    sender: Sender<SweepMessage>,
    handle: Option<JoinHandle<()>>,
    passes: Arc<AtomicU64>,
}

impl CacheSweeper {
    /// Spawns the sweeper thread.
    pub fn spawn(targets: Vec<Arc<dyn Sweep>>, interval: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let passes = Arc::new(AtomicU64::new(0));
        let thread_passes = Arc::clone(&passes);
        let handle = thread::Builder::new()
            .name("biotrack-cache-sweeper".into())
            .spawn(move || loop {
                match receiver.recv_timeout(interval) {
                    Ok(SweepMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                        sweep_all(&targets);
                        thread_passes.fetch_add(1, Ordering::Release);
                    }
                    Ok(SweepMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("cache.sweeper.exit");
                        break;
                    }
                }
            })?;
        Ok(Self {
            sender,
            handle: Some(handle),
            passes,
        })
    }

    /// Requests an immediate sweep.
    pub fn trigger(&self) {
        if self.sender.send(SweepMessage::Trigger).is_err() {
            warn!("cache.sweeper.gone");
        }
    }

    /// Number of completed sweep passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Acquire)
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        let _ = self.sender.send(SweepMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("cache.sweeper.panicked");
            }
        }
    }
}

fn sweep_all(targets: &[Arc<dyn Sweep>]) {
    for target in targets {
        let evicted = target.sweep();
        if evicted > 0 {
            trace!(cache = target.sweep_name(), evicted, "cache.sweep");
        }
    }
}
