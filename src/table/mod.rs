//! The table cache: the layer procedures actually read and write through.
//!
//! Every committed value lives in [`crate::storage::Storage`]; every
//! in-flight or recently-read value lives here, in one of two places:
//!
//! - `modified_map` (a `dashmap::DashMap`) holds records a procedure has
//!   written but the checkpoint pipeline hasn't yet flushed to storage —
//!   `SaveState::Dirty`.
//! - `read_cache` (a bounded [`lru::LruCache`]) holds records that mirror
//!   storage exactly — `SaveState::Shared`.
//!
//! A key absent from both is `SaveState::Unmanaged`: nothing has looked at
//! it yet. Every table method that touches a record documents whether the
//! caller must already hold that record's pool lock
//! (`lock_pool::LockPool::lock_id`).

pub mod lock_pool;
pub mod long;
pub mod lru;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::codec::record::{decode_record_value, encode_record_value, Bean};
use crate::codec::{decode_table_key, encode_table_key};
use crate::error::{Error, Result};
use crate::storage::{IterMode, ScanDirection, Storage, WriteOp};

use lock_pool::LockPool;
use lru::LruCache;

/// Where a cached record sits relative to the durable copy in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SaveState {
    /// Not present in either cache; nothing has looked at this key yet.
    Unmanaged = 0,
    /// Cached and known to match storage.
    Shared = 1,
    /// Written since the last checkpoint; storage is stale.
    Dirty = 2,
}

impl SaveState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SaveState::Unmanaged,
            1 => SaveState::Shared,
            _ => SaveState::Dirty,
        }
    }
}

struct Record<V> {
    value: Mutex<Option<V>>,
    state: AtomicU8,
}

impl<V: Clone> Record<V> {
    fn shared(value: Option<V>) -> Arc<Self> {
        Arc::new(Self { value: Mutex::new(value), state: AtomicU8::new(SaveState::Shared as u8) })
    }

    fn dirty(value: Option<V>) -> Arc<Self> {
        Arc::new(Self { value: Mutex::new(value), state: AtomicU8::new(SaveState::Dirty as u8) })
    }

    fn get(&self) -> Option<V> {
        self.value.lock().clone()
    }

    fn set_dirty(&self, value: Option<V>) {
        *self.value.lock() = value;
        self.state.store(SaveState::Dirty as u8, Ordering::Release);
    }

    fn state(&self) -> SaveState {
        SaveState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// A single cached, checkpointed, lock-sharded table. `V` is the record
/// value type; keys are caller-encoded bytes (typically the payload of one
/// tagged field, for a scalar key, or a small fixed concatenation for a
/// composite one — `Table` itself is key-shape-agnostic).
pub struct Table<V: Bean + Clone + Send + Sync + 'static> {
    id: u32,
    salt: u64,
    storage: Arc<dyn Storage>,
    locks: Arc<LockPool>,
    read_cache: Mutex<LruCache<Vec<u8>, Arc<Record<V>>>>,
    modified_map: DashMap<Vec<u8>, Arc<Record<V>>>,
}

impl<V: Bean + Clone + Send + Sync + 'static> Table<V> {
    pub fn open(id: u32, name: &str, storage: Arc<dyn Storage>, locks: Arc<LockPool>, cache_capacity: usize) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::hash::Hash::hash(&name, &mut hasher);
        let salt = std::hash::Hasher::finish(&hasher);
        Self {
            id,
            salt,
            storage,
            locks,
            read_cache: Mutex::new(LruCache::new(cache_capacity)),
            modified_map: DashMap::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The pool lock index a procedure must hold before calling [`Table::get`],
    /// [`Table::put`], [`Table::remove`], or [`Table::modify`] on `key_bytes`.
    pub fn lock_id(&self, key_bytes: &[u8]) -> u64 {
        LockPool::lock_id(self.salt, key_bytes)
    }

    pub fn locks(&self) -> &LockPool {
        &self.locks
    }

    fn storage_key(&self, key_bytes: &[u8]) -> Vec<u8> {
        encode_table_key(self.id, key_bytes)
    }

    /// Read straight from storage, bypassing both caches. Used by
    /// [`Table::get_no_lock`] on a cache miss, and available directly for
    /// callers that want a cache-pollution-free read (e.g. a one-off
    /// diagnostic scan).
    pub fn get_no_cache(&self, key_bytes: &[u8]) -> Result<Option<V>> {
        let storage_key = self.storage_key(key_bytes);
        match self.storage.get(&storage_key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_record_value(&bytes)?)),
        }
    }

    /// Read without regard for the per-record lock. Safe to call from the
    /// checkpoint or watchdog threads, which never race a single key's
    /// value (they only ever flush or interrupt); procedures should use
    /// [`Table::get`] instead so the precondition is documented at the call
    /// site.
    pub fn get_no_lock(&self, key_bytes: &[u8]) -> Result<Option<V>> {
        if let Some(rec) = self.modified_map.get(key_bytes) {
            return Ok(rec.get());
        }
        if let Some(rec) = self.read_cache.lock().get(&key_bytes.to_vec()) {
            return Ok(rec.get());
        }
        let loaded = self.get_no_cache(key_bytes)?;
        self.read_cache.lock().put(key_bytes.to_vec(), Record::shared(loaded.clone()));
        Ok(loaded)
    }

    /// `Err(Error::LockViolation)` if the calling thread does not hold
    /// `self.lock_id(key_bytes)`.
    fn require_lock_held(&self, key_bytes: &[u8]) -> Result<()> {
        if self.locks.is_held_by_current_thread(self.lock_id(key_bytes)) {
            Ok(())
        } else {
            Err(Error::LockViolation(format!("table {}: caller does not hold the lock for this key", self.id)))
        }
    }

    fn write_dirty(&self, key_bytes: &[u8], value: Option<V>) {
        match self.modified_map.get(key_bytes) {
            Some(rec) => rec.set_dirty(value),
            None => {
                self.modified_map.insert(key_bytes.to_vec(), Record::dirty(value));
            }
        }
    }

    /// Errors `LockViolation` if the caller holds no lock for `self.lock_id(key_bytes)`.
    pub fn get(&self, key_bytes: &[u8]) -> Result<Option<V>> {
        self.require_lock_held(key_bytes)?;
        self.get_no_lock(key_bytes)
    }

    /// Installs a fresh record. Errors `LockViolation` if the caller holds
    /// no lock for `self.lock_id(key_bytes)`, or `StateViolation` if the key
    /// is already managed (use [`Table::modify`] to update an existing
    /// record instead).
    pub fn put(&self, key_bytes: &[u8], value: V) -> Result<()> {
        self.require_lock_held(key_bytes)?;
        if self.save_state(key_bytes) != SaveState::Unmanaged {
            return Err(Error::StateViolation(format!(
                "table {}: put called on a key that is already managed; use modify",
                self.id
            )));
        }
        self.write_dirty(key_bytes, Some(value));
        Ok(())
    }

    /// Errors `LockViolation` if the caller holds no lock for
    /// `self.lock_id(key_bytes)`. Writes a tombstone, which
    /// [`Table::try_save_modified`]/[`Table::save_modified`] turn into a
    /// storage delete.
    pub fn remove(&self, key_bytes: &[u8]) -> Result<()> {
        self.require_lock_held(key_bytes)?;
        self.write_dirty(key_bytes, None);
        Ok(())
    }

    /// Errors `LockViolation` if the caller holds no lock for
    /// `self.lock_id(key_bytes)`. Read-modify-write: `f` receives the
    /// current value (`None` if absent, loading it into cache first if
    /// necessary) and returns the new one.
    pub fn modify(&self, key_bytes: &[u8], f: impl FnOnce(Option<V>) -> Option<V>) -> Result<()> {
        self.require_lock_held(key_bytes)?;
        let current = self.get_no_lock(key_bytes)?;
        self.write_dirty(key_bytes, f(current));
        Ok(())
    }

    /// The save-state of a key, for diagnostics and tests.
    pub fn save_state(&self, key_bytes: &[u8]) -> SaveState {
        if let Some(rec) = self.modified_map.get(key_bytes) {
            return rec.state();
        }
        if self.read_cache.lock().get(&key_bytes.to_vec()).is_some() {
            return SaveState::Shared;
        }
        SaveState::Unmanaged
    }

    pub fn modified_len(&self) -> usize {
        self.modified_map.len()
    }

    /// Scan from `mode`, walking forward or (if `reverse`) backward, stopping
    /// once `to` is reached (inclusive) if given, up to `limit` entries.
    /// Merges in-flight writes over the durable contents.
    pub fn walk(&self, mode: IterMode<'_>, to: Option<&[u8]>, reverse: bool, limit: Option<usize>) -> Result<Vec<(Vec<u8>, V)>> {
        // `Start` going forward anchors at this table's lowest possible key;
        // `Start` going in reverse anchors at the lowest key of the *next*
        // table, exclusive, so the scan covers this table's whole range from
        // the top down.
        let (anchor, anchor_is_after) = match (mode, reverse) {
            (IterMode::Start, false) => (self.storage_key(&[]), false),
            (IterMode::Start, true) => (encode_table_key(self.id + 1, &[]), true),
            (IterMode::From(k), _) => (self.storage_key(k), false),
            (IterMode::After(k), _) => (self.storage_key(k), true),
        };
        let scoped_mode = if anchor_is_after { IterMode::After(anchor.as_slice()) } else { IterMode::From(anchor.as_slice()) };
        let scoped_bound = to.map(|k| self.storage_key(k));
        let direction = if reverse { ScanDirection::Reverse } else { ScanDirection::Forward };

        let mut merged: BTreeMap<Vec<u8>, Option<V>> = BTreeMap::new();
        for (k, v) in self.storage.iter(scoped_mode, scoped_bound.as_deref(), direction, None)? {
            let (table_id, rest) = decode_table_key(&k)?;
            if table_id != self.id {
                break;
            }
            merged.insert(rest, Some(decode_record_value(&v)?));
        }

        let lower_bound: Option<Vec<u8>> = match mode {
            IterMode::Start => None,
            IterMode::From(k) | IterMode::After(k) => Some(k.to_vec()),
        };
        let strictly_after = matches!(mode, IterMode::After(_));
        for entry in self.modified_map.iter() {
            let key = entry.key();
            let in_lower = match &lower_bound {
                None => true,
                Some(b) if reverse => key <= b,
                Some(b) if strictly_after => key > b,
                Some(b) => key >= b,
            };
            let in_upper = match to {
                None => true,
                Some(b) if reverse => key.as_slice() >= b,
                Some(b) => key.as_slice() <= b,
            };
            if in_lower && in_upper {
                merged.insert(key.clone(), entry.value().get());
            }
        }

        let mut out: Vec<(Vec<u8>, V)> = merged.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect();
        if reverse {
            out.reverse();
        }
        if let Some(n) = limit {
            out.truncate(n);
        }
        Ok(out)
    }

    /// Best-effort checkpoint flush (Phase A/B): saves every dirty record
    /// whose lock it can acquire without blocking, skipping the rest.
    /// Returns the number of records still dirty afterward.
    pub fn try_save_modified(&self) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self.modified_map.iter().map(|e| e.key().clone()).collect();
        let mut ops = Vec::new();
        let mut saved_keys = Vec::new();
        let mut residual = 0usize;

        for key in keys {
            let lock_id = self.lock_id(&key);
            match self.locks.try_lock(lock_id) {
                Some(_guard) => {
                    if let Some(rec) = self.modified_map.get(&key) {
                        let value = rec.get();
                        let storage_key = self.storage_key(&key);
                        ops.push(match &value {
                            Some(v) => WriteOp::Put(storage_key, encode_record_value(v)),
                            None => WriteOp::Delete(storage_key),
                        });
                        saved_keys.push((key, value));
                    }
                }
                None => residual += 1,
            }
        }

        if !ops.is_empty() {
            self.storage.write_batch(ops)?;
            let mut cache = self.read_cache.lock();
            for (key, value) in saved_keys {
                self.modified_map.remove(&key);
                if value.is_some() {
                    cache.put(key, Record::shared(value));
                } else {
                    cache.remove(&key);
                }
            }
        }

        if residual > 0 {
            log::debug!("table {}: {} dirty records skipped this pass (lock contention)", self.id, residual);
        }
        Ok(residual)
    }

    /// Unconditional checkpoint flush (Phase D): the caller (the checkpoint
    /// pipeline, holding the commit gate's exclusive side) guarantees no
    /// procedure can be mutating any record right now, so every dirty
    /// record is saved without attempting its lock.
    pub fn save_modified(&self) -> Result<()> {
        let keys: Vec<Vec<u8>> = self.modified_map.iter().map(|e| e.key().clone()).collect();
        let mut ops = Vec::new();
        let mut values = Vec::new();
        for key in &keys {
            if let Some(rec) = self.modified_map.get(key) {
                let value = rec.get();
                let storage_key = self.storage_key(key);
                ops.push(match &value {
                    Some(v) => WriteOp::Put(storage_key, encode_record_value(v)),
                    None => WriteOp::Delete(storage_key),
                });
                values.push(value);
            }
        }
        if !ops.is_empty() {
            self.storage.write_batch(ops)?;
        }
        let mut cache = self.read_cache.lock();
        for (key, value) in keys.into_iter().zip(values) {
            self.modified_map.remove(&key);
            if value.is_some() {
                cache.put(key, Record::shared(value));
            } else {
                cache.remove(&key);
            }
        }
        Ok(())
    }
}
