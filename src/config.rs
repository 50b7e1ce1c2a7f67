//! Runtime configuration
//!
//! Mirrors the enumerated configuration surface: procedure pool sizing,
//! lock pool sizing, redo/session bounds, watchdog timing, checkpoint/backup
//! cadence, and the storage adapter's open options. Grounded in the
//! teacher's `GraniteConfig` preset pattern (`default()` / `synchronous()` /
//! `high_throughput()`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Options passed to [`crate::storage::Storage::open`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Write buffer size before the storage adapter must flush, in bytes.
    pub write_buffer_bytes: usize,
    /// Maximum number of open files the storage adapter may keep.
    pub max_open_files: usize,
    /// Block/page cache size, in bytes.
    pub cache_bytes: usize,
    /// Target size of a single storage file/segment, in bytes.
    pub file_size_bytes: usize,
    /// Whether to compress values at rest.
    pub compression_enabled: bool,
    /// Whether the adapter may reuse existing log files on open (faster
    /// restart, at the cost of skipping some consistency checks).
    pub reuse_logs: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 4 << 20,
            max_open_files: 1000,
            cache_bytes: 8 << 20,
            file_size_bytes: 2 << 20,
            compression_enabled: true,
            reuse_logs: true,
        }
    }
}

/// Top-level engine configuration. Every field corresponds to a named knob
/// in the external interface's enumerated configuration list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Size of the procedure worker pool (`dbThreadCount`).
    pub db_thread_count: usize,
    /// Cap on record locks a single procedure may hold at once (`maxLockPerProcedure`).
    pub max_lock_per_procedure: usize,
    /// Size of the reentrant lock pool; must be a power of two (`lockPoolSize`).
    pub lock_pool_size: usize,
    /// Retry budget for a procedure before it is aborted (`maxProceduerRedo`).
    pub max_procedure_redo: usize,
    /// Cap on procedures queued for one session (`maxSessionProcedure`).
    pub max_session_procedure: usize,
    /// Max procedures a session drainer runs per batch before resubmitting (`maxBatchProceduer`).
    pub max_batch_procedure: usize,
    /// A procedure running longer than this is a candidate for interruption (`procedureTimeout`).
    pub procedure_timeout: Duration,
    /// A procedure running longer than this *and* reported deadlocked is interrupted (`procedureDeadlockTimeout`).
    pub procedure_deadlock_timeout: Duration,
    /// How often the watchdog scans worker threads (`deadlockCheckInterval`).
    pub deadlock_check_interval: Duration,
    /// Dirty-record count threshold that forces a checkpoint (`dbCommitModCount`).
    pub commit_mod_count: usize,
    /// Residual modified-map size above which Phase B re-runs Phase A (`dbCommitResaveCount`).
    pub commit_resave_count: usize,
    /// Elapsed-time threshold that forces a checkpoint (`dbCommitPeriod`).
    pub commit_period: Duration,
    /// How often to take a hot backup (`dbBackupPeriod`, collapsed with
    /// `levelDBFullBackupPeriod` — see DESIGN.md).
    pub backup_period: Duration,
    /// Epoch that backup timestamps are quantized against (`dbBackupBase`).
    pub backup_base: Duration,
    /// Directory backups are written under.
    pub backup_path: std::path::PathBuf,
    /// Options forwarded to the storage adapter on open.
    pub storage: StorageOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_thread_count: 4,
            max_lock_per_procedure: 16,
            lock_pool_size: 1024,
            max_procedure_redo: 16,
            max_session_procedure: 64,
            max_batch_procedure: 8,
            procedure_timeout: Duration::from_secs(10),
            procedure_deadlock_timeout: Duration::from_secs(30),
            deadlock_check_interval: Duration::from_secs(1),
            commit_mod_count: 4000,
            commit_resave_count: 100,
            commit_period: Duration::from_secs(60),
            backup_period: Duration::from_secs(3600),
            backup_base: Duration::from_secs(0),
            backup_path: std::path::PathBuf::from("./backup"),
            storage: StorageOptions::default(),
        }
    }
}

impl Config {
    /// Low-latency preset: commits as soon as anything is dirty, short
    /// procedure timeouts. Good for interactive testing.
    pub fn low_latency() -> Self {
        Self {
            commit_period: Duration::from_millis(200),
            commit_mod_count: 64,
            procedure_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// High-throughput preset: batches more dirty records per checkpoint and
    /// tolerates longer-running procedures before the watchdog interrupts.
    pub fn high_throughput() -> Self {
        Self {
            commit_period: Duration::from_secs(5),
            commit_mod_count: 20_000,
            commit_resave_count: 1000,
            procedure_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    /// `lock_pool_size` rounded up to the next power of two, which
    /// `table::lock_pool::LockPool` requires for its mask-based indexing.
    pub fn effective_lock_pool_size(&self) -> usize {
        self.lock_pool_size.next_power_of_two().max(1)
    }

    /// Load a JSON-serialized config snapshot.
    pub fn load_from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| crate::error::Error::Internal(format!("config parse error: {}", e)))
    }

    /// Write a JSON-serialized snapshot of this config to `path`, via a
    /// temp-file-plus-rename so a crash mid-write never leaves a truncated
    /// config on disk.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        let tmp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| crate::error::Error::Internal(format!("config serialize error: {}", e)))?;
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
