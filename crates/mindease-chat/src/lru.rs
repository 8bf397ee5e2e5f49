//! Bounded least-recently-used cache with insertion ages.
//!
//! Recency is tracked with a monotonically increasing tick per touch; the
//! `order` index maps ticks back to keys so the least recent entry is
//! always the first key of the `BTreeMap`.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    tick: u64,
    inserted_at: Instant,
}

/// Fixed-capacity recency cache.
///
/// `get` and `set` touch an entry (make it most recent); `has` does not.
pub struct LruCache<K, V> {
    capacity: usize,
    next_tick: u64,
    entries: HashMap<K, Entry<V>>,
    order: BTreeMap<u64, K>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn bump(&mut self) -> u64 {
        let tick = self.next_tick;
        self.next_tick += 1;
        tick
    }

    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Return the value for `key` and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.bump();
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(&entry.value)
    }

    /// Insert or replace `key`, evicting the least recently used entry when
    /// the cache is full. Replacing resets the entry's insertion age.
    pub fn set(&mut self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    /// Like [`LruCache::set`] with an explicit insertion instant.
    pub fn set_at(&mut self, key: K, value: V, inserted_at: Instant) {
        let tick = self.bump();
        if let Some(old) = self.entries.remove(&key) {
            self.order.remove(&old.tick);
        } else if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.order.insert(tick, key.clone());
        self.entries.insert(
            key,
            Entry {
                value,
                tick,
                inserted_at,
            },
        );
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remove every entry inserted more than `max_age` ago.
    /// Returns the number of entries removed.
    pub fn remove_older_than(&mut self, max_age: Duration) -> usize {
        match Instant::now().checked_sub(max_age) {
            Some(cutoff) => self.remove_inserted_before(cutoff),
            None => 0,
        }
    }

    /// Remove every entry inserted strictly before `cutoff`.
    pub fn remove_inserted_before(&mut self, cutoff: Instant) -> usize {
        let stale: Vec<(u64, K)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at < cutoff)
            .map(|(k, e)| (e.tick, k.clone()))
            .collect();

        for (tick, key) in &stale {
            self.order.remove(tick);
            self.entries.remove(key);
        }
        stale.len()
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut cache = LruCache::new(3);
        cache.set("a", 1);
        assert!(cache.has(&"a"));
        assert!(!cache.has(&"b"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_set() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        assert!(!cache.has(&"a"));
        assert!(cache.has(&"b"));
        assert!(cache.has(&"c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_get_touches_entry() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.set("c", 3);
        // "b" was least recently touched.
        assert!(cache.has(&"a"));
        assert!(!cache.has(&"b"));
    }

    #[test]
    fn test_has_does_not_touch() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.has(&"a"));
        cache.set("c", 3);
        assert!(!cache.has(&"a"));
    }

    #[test]
    fn test_replace_existing_key_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(&10));
        assert!(cache.has(&"b"));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = LruCache::new(4);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert_eq!(cache.remove(&"a"), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut cache = LruCache::new(0);
        cache.set("a", 1);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.has(&"a"));
    }

    #[test]
    fn test_remove_inserted_before() {
        let mut cache = LruCache::new(10);
        let base = Instant::now();
        cache.set_at("old", 1, base);
        cache.set_at("new", 2, base + Duration::from_secs(400));

        let removed = cache.remove_inserted_before(base + Duration::from_secs(100));
        assert_eq!(removed, 1);
        assert!(!cache.has(&"old"));
        assert!(cache.has(&"new"));
    }

    #[test]
    fn test_remove_older_than_keeps_fresh_entries() {
        let mut cache = LruCache::new(10);
        cache.set("fresh", 1);
        assert_eq!(cache.remove_older_than(Duration::from_secs(300)), 0);
        assert!(cache.has(&"fresh"));
    }

    #[test]
    fn test_eviction_after_age_sweep_stays_consistent() {
        let mut cache = LruCache::new(2);
        let base = Instant::now();
        cache.set_at("a", 1, base);
        cache.set_at("b", 2, base + Duration::from_secs(10));
        cache.remove_inserted_before(base + Duration::from_secs(5));
        cache.set("c", 3);
        cache.set("d", 4);
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"c"));
        assert!(cache.has(&"d"));
        assert_eq!(cache.len(), 2);
    }
}
