//! `TableLong`: a [`Table`] specialization for tables keyed by an
//! auto-incrementing 64-bit id.
//!
//! Record keys are fixed-width 8-byte big-endian encodings of the id, so
//! iteration order matches numeric order. The live counter lives in its own
//! global namespace, entirely outside any table's own key range: its
//! storage key is `[TABLE_LONG_ID_COUNTER_PREFIX] || uvarint(table_id) ||
//! varint(value)`, with the current value baked into the key itself rather
//! than carried as a payload, so persisting a new value means deleting the
//! old key and writing a new one. `TABLE_LONG_ID_COUNTER_PREFIX` can never
//! be a valid leading byte of `encode_table_key`'s output (that's a plain
//! `uvarint(table_id)`, and `0xF1` only appears there for table ids
//! `>= 0x0F10000000000` or so, well past any real table count), so the
//! counter never collides with a record key from any table.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::codec::record::Bean;
use crate::codec::{marshal_uvarint32, marshal_varint, unmarshal_varint, Octets, TABLE_LONG_ID_COUNTER_PREFIX};
use crate::error::Result;
use crate::storage::{IterMode, ScanDirection, Storage, WriteOp};

use super::lock_pool::LockPool;
use super::Table;

/// The first assigned id. 0 is reserved for special usage and never handed out.
const FIRST_ID: i64 = 1;

pub fn encode_long_key(id: i64) -> Vec<u8> {
    (id as u64).to_be_bytes().to_vec()
}

pub fn decode_long_key(bytes: &[u8]) -> Option<i64> {
    let buf: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(buf) as i64)
}

/// The fixed portion of a counter key for `table_id`, shared by every value
/// that table's counter ever takes.
fn counter_key_prefix(table_id: u32) -> Vec<u8> {
    let mut out = Octets::with_capacity(6);
    out.put_u8(TABLE_LONG_ID_COUNTER_PREFIX);
    marshal_uvarint32(&mut out, table_id);
    out.into_vec()
}

fn counter_key(table_id: u32, value: i64) -> Vec<u8> {
    let mut out = Octets::from_vec(counter_key_prefix(table_id));
    marshal_varint(&mut out, value);
    out.into_vec()
}

pub struct TableLong<V: Bean + Clone + Send + Sync + 'static> {
    inner: Table<V>,
    storage: Arc<dyn Storage>,
    table_id: u32,
    next_id: AtomicI64,
}

impl<V: Bean + Clone + Send + Sync + 'static> TableLong<V> {
    pub fn open(id: u32, name: &str, storage: Arc<dyn Storage>, locks: Arc<LockPool>, cache_capacity: usize) -> Result<Self> {
        let prefix = counter_key_prefix(id);
        let next_id = {
            let hits = storage.iter(IterMode::From(&prefix), None, ScanDirection::Forward, None)?;
            let mut found = None;
            for (k, _) in hits {
                if !k.starts_with(&prefix) {
                    break;
                }
                let mut inp = Octets::from_vec(k[prefix.len()..].to_vec());
                found = Some(unmarshal_varint(&mut inp)?);
            }
            found.unwrap_or(FIRST_ID)
        };
        let inner = Table::open(id, name, Arc::clone(&storage), locks, cache_capacity);
        Ok(Self { inner, storage, table_id: id, next_id: AtomicI64::new(next_id) })
    }

    pub fn table(&self) -> &Table<V> {
        &self.inner
    }

    fn persist_counter(&self, previous: i64, value: i64) -> Result<()> {
        self.storage.write_batch(vec![
            WriteOp::Delete(counter_key(self.table_id, previous)),
            WriteOp::Put(counter_key(self.table_id, value), Vec::new()),
        ])
    }

    /// Allocate the next id and durably persist the updated counter before
    /// returning it, so a crash never hands out the same id twice.
    pub fn next_id(&self) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.persist_counter(id, id + 1)?;
        Ok(id)
    }

    pub fn set_id_counter(&self, value: i64) -> Result<()> {
        let previous = self.next_id.swap(value, Ordering::SeqCst);
        self.persist_counter(previous, value)
    }

    pub fn get_id_counter(&self) -> i64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Caller must hold the lock for `self.lock_id(id)`.
    pub fn get(&self, id: i64) -> Result<Option<V>> {
        self.inner.get(&encode_long_key(id))
    }

    /// Caller must hold the lock for `self.lock_id(id)`.
    pub fn put(&self, id: i64, value: V) -> Result<()> {
        self.inner.put(&encode_long_key(id), value)
    }

    /// Caller must hold the lock for `self.lock_id(id)`.
    pub fn remove(&self, id: i64) -> Result<()> {
        self.inner.remove(&encode_long_key(id))
    }

    pub fn lock_id(&self, id: i64) -> u64 {
        self.inner.lock_id(&encode_long_key(id))
    }
}
