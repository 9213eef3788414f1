use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Small bounded LRU map.
///
/// Recency is a monotonically increasing tick per access, so both lookup and
/// eviction are logarithmic instead of scanning an access list.
pub struct LruCache<K, V> {
    capacity: usize,
    items: HashMap<K, (V, u64)>,
    access_order: BTreeMap<u64, K>,
    tick: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    /// Create a new LRU cache with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: HashMap::with_capacity(capacity),
            access_order: BTreeMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Get a value from the cache, updating access order
    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let (value, last) = self.items.get_mut(key)?;
        self.access_order.remove(&*last);
        *last = tick;
        self.access_order.insert(tick, key.clone());
        Some(value.clone())
    }

    /// Insert a value into the cache, evicting the least recently used entry when full
    pub fn insert(&mut self, key: K, value: V) {
        if let Some((_, last)) = self.items.remove(&key) {
            self.access_order.remove(&last);
        } else if self.items.len() >= self.capacity {
            if let Some((_, oldest)) = self.access_order.pop_first() {
                self.items.remove(&oldest);
            }
        }
        let tick = self.next_tick();
        self.access_order.insert(tick, key.clone());
        self.items.insert(key, (value, tick));
    }

    /// Remove a value from the cache
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, last) = self.items.remove(key)?;
        self.access_order.remove(&last);
        Some(value)
    }

    /// Check if a key exists in the cache
    pub fn contains_key(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    /// Get the current size of the cache
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.items.clear();
        self.access_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_cache() {
        let mut cache: LruCache<u64, String> = LruCache::new(3);

        cache.insert(1, "one".to_string());
        cache.insert(2, "two".to_string());
        cache.insert(3, "three".to_string());

        assert_eq!(cache.len(), 3);

        // Insert 4th item, should evict oldest (1)
        cache.insert(4, "four".to_string());
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains_key(&1));
        assert!(cache.contains_key(&4));

        // Access 2, making it most recent
        cache.get(&2);

        // Insert 5th item, should evict 3 (not 2)
        cache.insert(5, "five".to_string());
        assert!(!cache.contains_key(&3));
        assert!(cache.contains_key(&2));
    }

    #[test]
    fn test_reinsert_updates_without_evicting() {
        let mut cache: LruCache<&str, u32> = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.remove(&"b"), Some(2));
        assert!(cache.get(&"b").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }
}
