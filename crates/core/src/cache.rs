//! Bounded in-memory cache with absolute TTL and LRU eviction.
//!
//! Expiry is measured from the moment a key was *set*; reading an entry
//! refreshes its recency for eviction purposes but never extends its
//! lifetime. Expired entries are purged lazily when touched, or in bulk
//! via [`BoundedCache::purge_expired`].
//!
//! All operations take the instance's single mutex, so one cache can be
//! shared across tasks behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::error::CoreError;
use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default entry lifetime (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default maximum number of entries.
pub const DEFAULT_MAX_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Construction-time tuning for a [`BoundedCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Lifetime applied by [`BoundedCache::set`].
    pub ttl: Duration,
    /// Entry count at which inserting a new key evicts the LRU entry.
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_size: DEFAULT_MAX_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.ttl.is_zero() {
            return Err(CoreError::Configuration(
                "cache ttl must be greater than zero".into(),
            ));
        }
        if self.max_size == 0 {
            return Err(CoreError::Configuration(
                "cache max_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    #[allow(dead_code)]
    inserted_at: Timestamp,
    expires_at: Timestamp,
    last_access_at: Timestamp,
    /// Tie-breaker for entries touched within the same clock reading.
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

impl<V> CacheState<V> {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.last_access_at, e.access_seq))
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }

    fn insert(&mut self, key: String, value: V, ttl: Duration, now: Timestamp, max_size: usize) {
        if !self.entries.contains_key(&key) && self.entries.len() >= max_size {
            // Expired entries go first so they never displace a live one.
            self.entries.retain(|_, e| !e.is_expired(now));
            if self.entries.len() >= max_size {
                if let Some(evicted) = self.evict_lru() {
                    tracing::debug!(key = %evicted, "Evicted least recently used cache entry");
                }
            }
        }
        let seq = self.bump();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                expires_at: expiry_after(now, ttl),
                last_access_at: now,
                access_seq: seq,
            },
        );
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expiry_after(now: Timestamp, ttl: Duration) -> Timestamp {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

// ---------------------------------------------------------------------------
// BoundedCache
// ---------------------------------------------------------------------------

/// String-keyed cache with a hard size cap and set-time expiry.
pub struct BoundedCache<V> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState<V>>,
}

impl<V> std::fmt::Debug for BoundedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V: Clone> BoundedCache<V> {
    /// Create a cache that reads the system clock.
    pub fn new(config: CacheConfig) -> Result<Self, CoreError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a cache driven by the supplied clock.
    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, CoreError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Look up `key`, refreshing its recency.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            state.entries.remove(key);
            return None;
        }
        let seq = state.bump();
        let entry = state.entries.get_mut(key)?;
        entry.last_access_at = now;
        entry.access_seq = seq;
        Some(entry.value.clone())
    }

    /// Whether a live entry exists for `key`. Does not affect recency.
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(e) if e.is_expired(now) => {
                state.entries.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Insert or replace `key` with the configured TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.config.ttl);
    }

    /// Insert or replace `key` with an explicit TTL.
    ///
    /// Replacing an existing key restarts its lifetime and never evicts.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now();
        let max_size = self.config.max_size;
        self.lock().insert(key.into(), value, ttl, now, max_size);
    }

    /// Insert `key` only when no live entry exists.
    ///
    /// Returns `true` if the value was stored. The check and the insert
    /// happen under one lock acquisition.
    pub fn set_if_absent(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        let key = key.into();
        let now = self.clock.now();
        let max_size = self.config.max_size;
        let mut state = self.lock();
        if state.entries.get(&key).is_some_and(|e| !e.is_expired(now)) {
            return false;
        }
        state.insert(key, value, ttl, now, max_size);
        true
    }

    /// Remove `key`. Returns `true` if a live entry was removed.
    pub fn delete(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .remove(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Drop every expired entry and return how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        before - state.entries.len()
    }

    // The guarded map holds no invariant that a panicking holder could
    // break half-way, so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
