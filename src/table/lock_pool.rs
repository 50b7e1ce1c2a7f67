//! Fixed-size pool of reentrant, per-record locks.
//!
//! A table never allocates one lock per key; instead every key hashes down
//! into a small, fixed pool shared across the whole table cache. Two
//! distinct keys can and will collide onto the same slot (that's the point
//! — the pool is sized for concurrency, not correctness-by-uniqueness); a
//! procedure that needs several keys locked is safe as long as it always
//! acquires lock indices in ascending order (see `crate::procedure`).
//!
//! Slots are materialized lazily: a fresh `LockPool` allocates only the
//! `Vec` of `OnceLock` slots, not the mutexes themselves, so a pool sized
//! for the configured maximum concurrency costs little until the table is
//! actually touched.

use std::cell::RefCell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

thread_local! {
    // Refcounted rather than a plain set: `ReentrantMutex` lets the same
    // thread acquire a slot more than once (a procedure's own nested calls,
    // e.g. `modify` calling `get_no_lock`), and the innermost guard's drop
    // must not make the slot look unheld while an outer guard still holds it.
    static HELD: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// A lock-pool slot guard. Tracks, per OS thread, which `lock_id`s are
/// currently held so [`LockPool::is_held_by_current_thread`] can answer
/// `Table`'s precondition checks without `parking_lot` exposing that
/// introspection itself.
pub struct LockGuard<'a> {
    lock_id: u64,
    _inner: ReentrantMutexGuard<'a, ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(count) = held.get_mut(&self.lock_id) {
                *count -= 1;
                if *count == 0 {
                    held.remove(&self.lock_id);
                }
            }
        });
    }
}

fn mark_held(lock_id: u64) {
    HELD.with(|held| *held.borrow_mut().entry(lock_id).or_insert(0) += 1);
}

pub struct LockPool {
    slots: Vec<OnceLock<ReentrantMutex<()>>>,
    mask: u64,
}

impl LockPool {
    /// `size` is rounded up to the next power of two so indexing can use a
    /// bitmask instead of a division.
    pub fn new(size: usize) -> Self {
        let size = size.next_power_of_two().max(1);
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, OnceLock::new);
        Self { slots, mask: (size - 1) as u64 }
    }

    /// Combine a table-level salt with a record key's hash. Two tables
    /// using the same salt (or the same key) may still collide onto the
    /// same pool slot; that's expected and harmless, just a bit more
    /// contention.
    pub fn lock_id(table_salt: u64, key_bytes: &[u8]) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key_bytes.hash(&mut hasher);
        table_salt ^ hasher.finish()
    }

    fn index(&self, lock_id: u64) -> usize {
        (lock_id & self.mask) as usize
    }

    fn slot(&self, lock_id: u64) -> &ReentrantMutex<()> {
        let idx = self.index(lock_id);
        self.slots[idx].get_or_init(|| ReentrantMutex::new(()))
    }

    pub fn lock(&self, lock_id: u64) -> LockGuard<'_> {
        let inner = self.slot(lock_id).lock();
        mark_held(lock_id);
        LockGuard { lock_id, _inner: inner }
    }

    pub fn try_lock(&self, lock_id: u64) -> Option<LockGuard<'_>> {
        let inner = self.slot(lock_id).try_lock()?;
        mark_held(lock_id);
        Some(LockGuard { lock_id, _inner: inner })
    }

    /// Whether the calling thread currently holds `lock_id`, per this
    /// pool's own `lock`/`try_lock` calls. Used to enforce the "caller
    /// holds the record lock" precondition on `Table::get/put/remove/modify`.
    pub fn is_held_by_current_thread(&self, lock_id: u64) -> bool {
        HELD.with(|held| held.borrow().contains_key(&lock_id))
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }
}
