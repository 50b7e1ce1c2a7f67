//! bedrock: a transactional, cached, log-structured key-value table engine.
//!
//! [`Engine`] is the top-level handle: `startup` opens the storage adapter
//! and lock pool, `open_table`/`open_table_long` register typed tables
//! against it, and `start_commit_thread` spins up the procedure worker
//! pool, watchdog, and checkpoint pipeline over whatever tables were open
//! at that point. Procedures (`crate::procedure::Procedure`) are submitted
//! through `submit_sync`/`submit_async`; they read and write tables via a
//! `crate::sctx::SContext` so a failed procedure unwinds cleanly.

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod dbmanager;
pub mod error;
pub mod procedure;
pub mod sctx;
pub mod storage;
pub mod table;
pub mod watchdog;

use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::checkpoint::{CheckpointReport, Checkpointable};
use crate::codec::record::Bean;
use crate::config::Config;
use crate::dbmanager::DBManager;
use crate::error::{Error, Result};
use crate::procedure::Procedure;
use crate::storage::memlsm::MemLsmStorage;
use crate::storage::Storage;
use crate::table::lock_pool::LockPool;
use crate::table::long::TableLong;
use crate::table::Table;

/// Top-level handle to a running engine instance: owns the storage
/// adapter, the lock pool, and every table opened against it. The
/// procedure worker pool, watchdog, and checkpoint pipeline don't exist
/// until [`Engine::start_commit_thread`] is called, so callers can open
/// every table they need first.
pub struct Engine {
    config: Config,
    storage: Arc<dyn Storage>,
    locks: Arc<LockPool>,
    tables: Mutex<Vec<Arc<dyn Checkpointable>>>,
    manager: Mutex<Option<DBManager>>,
}

impl Engine {
    /// Open (creating if absent) the storage adapter rooted at `data_dir`
    /// and prepare the lock pool. Does not start any background thread.
    pub fn startup(config: Config, data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let storage: Arc<dyn Storage> = Arc::new(MemLsmStorage::open(data_dir, &config.storage)?);
        let locks = Arc::new(LockPool::new(config.effective_lock_pool_size()));
        log::info!("engine: started up at {}", data_dir.display());
        Ok(Self { config, storage, locks, tables: Mutex::new(Vec::new()), manager: Mutex::new(None) })
    }

    /// Open a table keyed by caller-encoded bytes.
    pub fn open_table<V: Bean + Clone + Send + Sync + 'static>(&self, id: u32, name: &str, cache_capacity: usize) -> Arc<Table<V>> {
        let table = Arc::new(Table::open(id, name, Arc::clone(&self.storage), Arc::clone(&self.locks), cache_capacity));
        self.tables.lock().unwrap().push(Arc::clone(&table) as Arc<dyn Checkpointable>);
        table
    }

    /// Open a table keyed by an auto-incrementing id.
    pub fn open_table_long<V: Bean + Clone + Send + Sync + 'static>(
        &self,
        id: u32,
        name: &str,
        cache_capacity: usize,
    ) -> Result<Arc<TableLong<V>>> {
        let table = Arc::new(TableLong::open(id, name, Arc::clone(&self.storage), Arc::clone(&self.locks), cache_capacity)?);
        self.tables.lock().unwrap().push(Arc::clone(&table) as Arc<dyn Checkpointable>);
        Ok(table)
    }

    /// Start the procedure worker pool, watchdog, and checkpoint pipeline
    /// over every table opened so far. Tables opened afterward are not
    /// tracked by the checkpoint pipeline; open every table before calling
    /// this.
    pub fn start_commit_thread(&self) -> Result<()> {
        let mut manager = self.manager.lock().unwrap();
        if manager.is_some() {
            return Err(Error::Internal("commit thread already started".into()));
        }
        let tables = self.tables.lock().unwrap().clone();
        *manager = Some(DBManager::start(self.config.clone(), Arc::clone(&self.locks), tables, Arc::clone(&self.storage)));
        log::info!("engine: commit thread started");
        Ok(())
    }

    fn with_manager<T>(&self, f: impl FnOnce(&DBManager) -> Result<T>) -> Result<T> {
        let guard = self.manager.lock().unwrap();
        let manager = guard.as_ref().ok_or_else(|| Error::Internal("commit thread not started".into()))?;
        f(manager)
    }

    /// Run `procedure` for `sid` and block until it commits or fails.
    pub fn submit_sync(&self, sid: u64, procedure: Box<dyn Procedure>) -> Result<()> {
        self.with_manager(|m| m.submit_sync(sid, procedure))
    }

    /// Queue `procedure` for `sid` without waiting for the outcome.
    pub fn submit_async(&self, sid: u64, procedure: Box<dyn Procedure>) -> Result<()> {
        self.with_manager(|m| m.submit_async(sid, procedure))
    }

    /// Force a synchronous checkpoint pass (phases A-F), blocking until it
    /// completes.
    pub fn checkpoint(&self) -> Result<CheckpointReport> {
        self.with_manager(|m| m.checkpoint().run_once())
    }

    /// Trigger a checkpoint pass on a detached thread and return
    /// immediately.
    pub fn checkpoint_async(&self) -> Result<()> {
        self.with_manager(|m| {
            let pipeline = Arc::clone(m.checkpoint());
            std::thread::spawn(move || {
                if let Err(e) = pipeline.run_once() {
                    log::error!("engine: async checkpoint failed: {}", e);
                }
            });
            Ok(())
        })
    }

    /// Request a hot backup on the next checkpoint pass, regardless of
    /// whether `backup_period` has elapsed.
    pub fn backup_next_checkpoint(&self) -> Result<()> {
        self.with_manager(|m| {
            m.checkpoint().request_backup();
            Ok(())
        })
    }

    /// Stop accepting new procedure submissions; already-queued and
    /// in-flight work continues to drain normally.
    pub fn stop_queue(&self) -> Result<()> {
        self.with_manager(|m| {
            m.stop_accepting();
            Ok(())
        })
    }

    /// Stop the worker pool, watchdog, and checkpoint thread, blocking
    /// until every in-flight procedure finishes.
    pub fn shutdown(&self) {
        log::info!("engine: shutting down");
        *self.manager.lock().unwrap() = None;
    }
}
