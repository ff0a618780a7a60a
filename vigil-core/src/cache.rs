//! Bounded identity-keyed caches.
//!
//! `IdentityCache` is the fixed-capacity map underneath every lookup table in
//! the sensor: classification lists, the decision mailbox, and the ephemeral
//! process-attribution tables. It is deliberately not a general-purpose map:
//! the bucket array is sized once at construction, there is no rehashing, and
//! when an insert would exceed the configured capacity the whole cache is
//! cleared before the insert proceeds. That keeps the memory bound exact and
//! avoids per-entry recency bookkeeping, at the cost of evicting unrelated
//! entries under a burst of unique keys.
//!
//! A designated `empty` sentinel value doubles as the "absent" result:
//! writing the sentinel for a key deletes the entry, and `get` returns the
//! sentinel for keys that were never inserted. Key `0` is reserved and is
//! never a valid identity; operations on it are no-ops.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

/// Multiplier used to disperse small sequential identities across buckets.
///
/// This is the 64-bit Fibonacci hashing constant (the prime closest to
/// 2^64 / phi); multiplying by it spreads low-entropy keys such as ascending
/// file identities over the full hash range.
const HASH_MULTIPLIER: u64 = 11_400_714_819_323_198_549;

/// Nominal entries per bucket used to derive the bucket count from the
/// requested capacity.
const BUCKET_WIDTH: usize = 4;

/// Numeric key types usable as cache identities.
///
/// Identities are opaque unsigned integers; `0` is reserved as the null
/// identity on every key width.
pub trait CacheKey: Copy + Eq + Send {
    /// Widens the key for hashing.
    fn as_index(self) -> u64;

    /// Whether this is the reserved null identity.
    fn is_null(self) -> bool {
        self.as_index() == 0
    }
}

impl CacheKey for u64 {
    fn as_index(self) -> u64 {
        self
    }
}

impl CacheKey for u16 {
    fn as_index(self) -> u64 {
        u64::from(self)
    }
}

/// Interior table state guarded by the cache mutex.
struct Table<K, V> {
    /// Collision chains, append-ordered within each bucket.
    buckets: Vec<Vec<(K, V)>>,
    /// Live entry count across all buckets.
    len: usize,
}

/// Fixed-capacity, chained-hash map from a numeric identity to a small
/// fixed-width value.
///
/// A single mutex guards the whole table; `get`, `set`, and `clear` are
/// mutually exclusive and hold the lock only for the duration of one chain
/// walk. This caps write throughput, which is acceptable for the intended
/// population (a few thousand live identities with short critical sections).
///
/// # Eviction
///
/// There is no per-entry eviction. When an insert would push the occupancy
/// past `capacity`, every entry is dropped first and the insert lands in an
/// empty table. Callers that stash pending state in a cache (the decision
/// mailbox does) must tolerate entries vanishing at any time.
pub struct IdentityCache<K, V> {
    capacity: usize,
    bucket_count: usize,
    empty: V,
    table: Mutex<Table<K, V>>,
}

impl<K: CacheKey, V: Copy + Eq + Send> IdentityCache<K, V> {
    /// Creates a cache holding at most `capacity` entries, with `empty` as
    /// the sentinel value returned for absent keys.
    ///
    /// The bucket count is derived from the requested capacity, rounded to
    /// an even number, and never changes afterwards.
    pub fn new(capacity: usize, empty: V) -> Self {
        let capacity = capacity.max(1);
        let bucket_count = ((((capacity + BUCKET_WIDTH) / BUCKET_WIDTH) >> 1) << 1).max(2);
        let buckets = (0..bucket_count).map(|_| Vec::new()).collect();

        Self {
            capacity,
            bucket_count,
            empty,
            table: Mutex::new(Table { buckets, len: 0 }),
        }
    }

    /// Returns the value stored for `key`, or the sentinel if the key is
    /// absent or null.
    pub fn get(&self, key: K) -> V {
        if key.is_null() {
            return self.empty;
        }

        let idx = self.bucket_index(key);
        let table = self.lock();
        table.buckets[idx]
            .iter()
            .find(|&&(k, _)| k == key)
            .map_or(self.empty, |&(_, v)| v)
    }

    /// Stores `value` under `key`.
    ///
    /// Writing the sentinel deletes an existing entry. Returns `false` for
    /// the null key and for a sentinel write against an absent key; every
    /// other write succeeds. An insert that would exceed the capacity clears
    /// the entire cache first.
    pub fn set(&self, key: K, value: V) -> bool {
        if key.is_null() {
            return false;
        }

        let idx = self.bucket_index(key);
        let mut table = self.lock();
        let Table { buckets, len } = &mut *table;

        if let Some(pos) = buckets[idx].iter().position(|&(k, _)| k == key) {
            if value == self.empty {
                buckets[idx].remove(pos);
                *len -= 1;
            } else {
                buckets[idx][pos].1 = value;
            }
            return true;
        }

        if value == self.empty {
            return false;
        }

        if *len >= self.capacity {
            debug!(
                capacity = self.capacity,
                "identity cache at capacity, clearing all entries"
            );
            for bucket in buckets.iter_mut() {
                bucket.clear();
            }
            *len = 0;
        }

        buckets[idx].push((key, value));
        *len += 1;
        true
    }

    /// Removes every entry and resets the occupancy to zero.
    pub fn clear(&self) {
        let mut table = self.lock();
        for bucket in &mut table.buckets {
            bucket.clear();
        }
        table.len = 0;
    }

    /// Current number of live entries.
    pub fn len(&self) -> usize {
        self.lock().len
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries this cache will hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket_index(&self, key: K) -> usize {
        let hash = key.as_index().wrapping_mul(HASH_MULTIPLIER);
        (hash % self.bucket_count as u64) as usize
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table<K, V>> {
        // The cache never panics while holding the lock, but a poisoned
        // table is still structurally sound, so recover rather than unwind.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
