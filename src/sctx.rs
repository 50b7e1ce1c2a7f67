//! Safe-context rollback.
//!
//! Every procedure owns exactly one `SContext` for its run. Rather than
//! writing tables directly, a procedure body calls `SContext::put`/`remove`,
//! which captures the prior value before applying the write and pushes an
//! undo closure that restores it. A rollback replays those closures in
//! reverse (LIFO): the most recent write unwinds first, same as a nested
//! procedure call unwinding its own locals first.
//!
//! This plays the role Granite's WAL-based undo log plays for durable
//! transactions, but purely in memory: a procedure's writes never leave the
//! table cache (they sit in `modified_map` as dirty records) until a
//! checkpoint saves them, so undoing one is just restoring the in-memory
//! value that was there before.

use std::sync::Arc;

use crate::codec::record::Bean;
use crate::error::Result;
use crate::table::Table;

type Undo = Box<dyn FnOnce() + Send>;
type OnCommit = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct SContext {
    undo: Vec<Undo>,
    on_commit: Vec<OnCommit>,
    dirty: bool,
}

impl SContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one write has been recorded. The procedure
    /// runner uses this to skip checkpoint bookkeeping for read-only
    /// procedures.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Register an arbitrary undo action, run in LIFO order on rollback.
    /// Prefer [`SContext::put`]/[`SContext::remove`] for table writes; this
    /// is for side effects those helpers can't express directly.
    pub fn on_undo(&mut self, action: impl FnOnce() + Send + 'static) {
        self.mark_dirty();
        self.undo.push(Box::new(action));
    }

    /// Register an action to run once the procedure commits successfully
    /// (after every write is safely in the table cache). Runs in the order
    /// registered, after the undo log is discarded.
    pub fn on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    /// Write `value` to `table` at `key`, capturing an undo action that
    /// restores whatever was there before. Caller must already hold the
    /// record lock (`table.lock_id(key)`). Goes through [`Table::modify`]
    /// rather than [`Table::put`]/[`Table::remove`] directly, since a key
    /// already touched earlier in the same transaction is no longer
    /// `Unmanaged` and a raw `put` would reject it.
    pub fn put<V: Bean + Clone + Send + Sync + 'static>(&mut self, table: &Arc<Table<V>>, key: &[u8], value: V) -> Result<()> {
        let mut previous = None;
        table.modify(key, |current| {
            previous = current;
            Some(value)
        })?;
        let table = Arc::clone(table);
        let key = key.to_vec();
        self.on_undo(move || {
            let _ = table.modify(&key, |_| previous);
        });
        Ok(())
    }

    /// Delete `key` from `table`, capturing an undo action that restores it
    /// if it existed. A no-op (no undo recorded) if the key was already
    /// absent. Caller must already hold the record lock.
    pub fn remove<V: Bean + Clone + Send + Sync + 'static>(&mut self, table: &Arc<Table<V>>, key: &[u8]) -> Result<()> {
        let mut previous = None;
        table.modify(key, |current| {
            previous = current;
            None
        })?;
        if previous.is_none() {
            return Ok(());
        }
        let table = Arc::clone(table);
        let key = key.to_vec();
        self.on_undo(move || {
            let _ = table.modify(&key, |_| previous);
        });
        Ok(())
    }

    /// Replay every undo action in reverse order and discard any pending
    /// commit actions.
    pub fn rollback(&mut self) {
        for action in self.undo.drain(..).rev() {
            action();
        }
        self.on_commit.clear();
        self.dirty = false;
    }

    /// Discard the undo log and run commit actions in registration order.
    pub fn commit(&mut self) {
        self.undo.clear();
        for action in self.on_commit.drain(..) {
            action();
        }
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::octets::Octets;
    use crate::codec::record::{read_fields, read_int_value, write_int_field, write_terminator};
    use crate::config::StorageOptions;
    use crate::storage::memlsm::MemLsmStorage;
    use crate::table::lock_pool::LockPool;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq)]
    struct Counter(i64);

    impl Bean for Counter {
        fn marshal(&self, out: &mut Octets) {
            write_int_field(out, 1, self.0);
            write_terminator(out);
        }
        fn unmarshal(inp: &mut Octets) -> Result<Self> {
            let mut v = 0;
            read_fields(inp, |inp, tag, _k| {
                if tag == 1 {
                    v = read_int_value(inp)?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })?;
            Ok(Counter(v))
        }
    }

    fn open_table() -> (tempfile::TempDir, Arc<Table<Counter>>) {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn crate::storage::Storage> =
            Arc::new(MemLsmStorage::open(dir.path(), &StorageOptions::default()).unwrap());
        let locks = Arc::new(LockPool::new(16));
        (dir, Arc::new(Table::open(1, "counters", storage, locks, 4)))
    }

    #[test]
    fn rollback_restores_previous_value() {
        let (_dir, table) = open_table();
        let key = b"k".to_vec();
        let _guard = table.locks().lock(table.lock_id(&key));
        table.put(&key, Counter(1)).unwrap();
        table.save_modified().unwrap();

        let mut ctx = SContext::new();
        ctx.put(&table, b"k", Counter(2)).unwrap();
        assert_eq!(table.get(&key).unwrap(), Some(Counter(2)));
        ctx.rollback();
        assert_eq!(table.get(&key).unwrap(), Some(Counter(1)));
    }

    #[test]
    fn rollback_restores_absence_for_a_fresh_key() {
        let (_dir, table) = open_table();
        let key = b"new".to_vec();
        let _guard = table.locks().lock(table.lock_id(&key));
        let mut ctx = SContext::new();
        ctx.put(&table, b"new", Counter(5)).unwrap();
        ctx.rollback();
        assert_eq!(table.get(&key).unwrap(), None);
    }

    #[test]
    fn rollback_undoes_multiple_writes_in_lifo_order() {
        let (_dir, table) = open_table();
        let key = b"k".to_vec();
        let _guard = table.locks().lock(table.lock_id(&key));
        let mut ctx = SContext::new();
        ctx.put(&table, b"k", Counter(1)).unwrap();
        ctx.put(&table, b"k", Counter(2)).unwrap();
        ctx.put(&table, b"k", Counter(3)).unwrap();
        ctx.rollback();
        assert_eq!(table.get(&key).unwrap(), None);
    }

    #[test]
    fn remove_on_absent_key_records_no_undo() {
        let (_dir, table) = open_table();
        let key = b"absent".to_vec();
        let _guard = table.locks().lock(table.lock_id(&key));
        let mut ctx = SContext::new();
        ctx.remove(&table, b"absent").unwrap();
        assert!(!ctx.is_dirty());
    }

    #[test]
    fn commit_runs_on_commit_hooks_and_clears_undo_log() {
        let (_dir, table) = open_table();
        let key = b"k".to_vec();
        let _guard = table.locks().lock(table.lock_id(&key));
        let mut ctx = SContext::new();
        ctx.put(&table, b"k", Counter(1)).unwrap();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        ctx.on_commit(move || ran2.store(true, std::sync::atomic::Ordering::SeqCst));
        ctx.commit();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(table.get(&key).unwrap(), Some(Counter(1)));
    }
}
