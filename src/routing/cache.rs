//! Decision cache.
//!
//! When caching is enabled, a repeat of the same owner, mode and prompt
//! within the TTL replays the result of the tier that served it first, at
//! zero cost. The replay only happens when routing would pick that tier
//! again. In-memory only; entries live in a bounded `DashMap`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use super::router::EconomicMode;
use super::tier::TierId;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    tier: TierId,
    expires_at: Instant,
}

/// Bounded TTL cache from prompt fingerprint to the tier that served it.
#[derive(Debug)]
pub struct DecisionCache {
    store: DashMap<u64, CacheEntry>,
    max_entries: usize,
    ttl: Duration,
    lookups: AtomicU64,
    hits: AtomicU64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    /// Live entries (including not yet evicted expired ones).
    pub entries: usize,
    /// Lookups since start.
    pub lookups: u64,
    /// Hits since start.
    pub hits: u64,
    /// `hits / lookups`, `0.0` before the first lookup.
    pub hit_rate: f64,
}

impl DecisionCache {
    /// Create a cache holding at most `max_entries` for `ttl` each.
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            store: DashMap::new(),
            max_entries,
            ttl,
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    /// Return the cached tier for `key` if present and fresh.
    ///
    /// Counters are left alone; the caller reports the outcome through
    /// [`record_lookup`](Self::record_lookup) once it knows whether the
    /// entry was served.
    pub fn lookup(&self, key: u64) -> Option<TierId> {
        let found = self.store.get(&key).map(|e| *e.value());
        match found {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.tier),
            Some(_) => {
                self.store.remove(&key);
                debug!(key, "decision cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Count one lookup, and a hit if its entry was served.
    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_cache_lookup(hit);
    }

    /// Remember that `key` was served by `tier`.
    pub fn insert(&self, key: u64, tier: TierId) {
        if self.max_entries == 0 {
            return;
        }
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            // Collect the victim first so no shard guard is held across remove.
            let victim = self.store.iter().next().map(|e| *e.key());
            if let Some(victim) = victim {
                self.store.remove(&victim);
            }
        }
        self.store.insert(
            key,
            CacheEntry {
                tier,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.store.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let lookups = self.lookups.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        CacheStats {
            entries: self.store.len(),
            lookups,
            hits,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

/// Cache key for `prompt` submitted by `owner` under `mode`.
pub fn fingerprint(owner: &str, mode: EconomicMode, prompt: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    owner.hash(&mut hasher);
    mode.hash(&mut hasher);
    prompt.hash(&mut hasher);
    hasher.finish()
}
