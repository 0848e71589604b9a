// ai
//! 🗄️ The Bounded Cache: LRU on the outside, TTL on the inside, a mutex around the lot.
//!
//! 🎬 *[a freshman opens the app. 40 posts, 40 authors, 40 profile lookups.]*
//! *[a sophomore opens the app. same 40 authors. zero profile lookups.]*
//! *[the backing store bill goes down. nobody notices. that's the point.]* 🦆
//!
//! Capacity is a hard cap. Inserting a new key into a full cache evicts exactly one
//! entry, the least recently used one. `get` and `has` count as use. Expired entries are
//! removed lazily on lookup and in bulk by [`BoundedCache::cleanup`]. A miss is never an
//! error; callers always have the backing store to fall back on.
//!
//! Time comes from an injected [`Clock`], so TTL tests don't need to sleep.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use tracing::trace;

use crate::clock::Clock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    written_at: DateTime<Utc>,
    ttl: TimeDelta,
}

impl<V> CacheEntry<V> {
    /// Present strictly before `written_at + ttl`, gone from that instant on.
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.written_at >= self.ttl
    }
}

/// 🗄️ A capacity-bounded, TTL-aware, least-recently-used cache.
#[derive(Debug)]
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// 🚀 A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 🔍 Fresh value or `None`. An expired entry is dropped on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries();
        let expired = entries.peek(key)?.is_expired(now);
        if expired {
            trace!("🗑️ cache entry expired on read");
            entries.pop(key);
            return None;
        }
        // -- 🔝 `get` promotes to most recently used
        entries.get(key).map(|entry| entry.value.clone())
    }

    /// 📥 Insert or overwrite. Overwriting an existing key never evicts anything else.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            written_at: self.clock.now(),
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        };
        if self.entries().put(key, entry).is_none() {
            trace!("📥 cache insert");
        }
    }

    /// ❓ Same rules as [`get`](Self::get) (lazy expiry, recency refresh) without the clone.
    pub fn has(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries();
        match entries.peek(key).map(|entry| entry.is_expired(now)) {
            None => false,
            Some(true) => {
                entries.pop(key);
                false
            }
            Some(false) => {
                entries.promote(key);
                true
            }
        }
    }

    pub fn delete(&self, key: &K) -> bool {
        self.entries().pop(key).is_some()
    }

    /// 🧹 Purge every expired entry. Returns how many went in the bin.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// 📏 Entry count, expired-but-not-yet-purged entries included.
    pub fn size(&self) -> usize {
        self.entries().len()
    }

    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}
