//! A small bounded LRU cache.
//!
//! Generalizes the teacher's `MemoryPageTable` (an unbounded `HashMap` of
//! cached rows) into an eviction-aware cache: every table's `read_cache`
//! needs a capacity bound so a long-running scan doesn't let the shared
//! cache grow without limit. Uses lazy invalidation on a recency queue
//! rather than an intrusive doubly-linked list, trading a little memory for
//! a much simpler `get`/`put`.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, (V, u64)>,
    order: VecDeque<(K, u64)>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), map: HashMap::new(), order: VecDeque::new(), tick: 0 }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let tick = self.next_tick();
        let entry = self.map.get_mut(key)?;
        entry.1 = tick;
        let value = entry.0.clone();
        self.order.push_back((key.clone(), tick));
        Some(value)
    }

    pub fn put(&mut self, key: K, value: V) {
        let tick = self.next_tick();
        self.map.insert(key.clone(), (value, tick));
        self.order.push_back((key, tick));
        self.evict_over_capacity();
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(v, _)| v)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_over_capacity(&mut self) {
        while self.map.len() > self.capacity {
            match self.order.pop_front() {
                Some((key, tick)) => {
                    // The front of the queue may be a stale entry for a key
                    // that was touched again since; only evict if it's still
                    // the most recent record for that key.
                    if self.map.get(&key).map(|(_, t)| *t) == Some(tick) {
                        self.map.remove(&key);
                    }
                }
                None => break,
            }
        }
    }
}
