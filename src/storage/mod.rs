//! Storage adapter: the narrow trait every table cache sits on top of.
//!
//! The engine never speaks to a concrete LSM/B-tree library directly; it
//! only ever goes through [`Storage`]. This mirrors the teacher's own
//! `StorageEngine` boundary (catalog + table data behind one type) but
//! narrows the surface to exactly what a cached, checkpointed table needs:
//! point reads, an atomic multi-key batch write, ordered iteration from a
//! position, and a hot backup hook. [`memlsm`] is the bundled
//! implementation; a real deployment would point this at RocksDB/LevelDB
//! instead, which is why the trait exists at all.

pub mod memlsm;

use std::path::Path;

use crate::config::StorageOptions;
use crate::error::Result;

/// One mutation in a [`Storage::write_batch`] call.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Where an [`Storage::iter`] scan should start relative to its anchor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterMode<'a> {
    /// From the smallest key onward (or, reversed, from the largest key
    /// downward).
    Start,
    /// From `key` inclusive.
    From(&'a [u8]),
    /// From the first key strictly beyond `key` in the scan direction
    /// (greater than `key` going forward, less than `key` going reverse).
    After(&'a [u8]),
}

/// Which way a [`Storage::iter`] scan walks the keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanDirection {
    #[default]
    Forward,
    Reverse,
}

/// A named, point-in-time-consistent snapshot location, as produced by
/// [`Storage::hot_backup`].
pub type BackupHandle = std::path::PathBuf;

/// The storage layer every [`crate::table::Table`] is built on.
///
/// Implementations must make [`Storage::write_batch`] atomic: either every
/// op in the batch is visible to subsequent reads, or none are. The
/// checkpoint pipeline's Phase D relies on this to make a quiesced set of
/// dirty records durable in one step.
pub trait Storage: Send + Sync + 'static {
    /// Open (creating if absent) a store rooted at `path`.
    fn open(path: &Path, options: &StorageOptions) -> Result<Self>
    where
        Self: Sized;

    /// Point lookup. `None` means absent, not an error.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply every op in `ops` atomically.
    fn write_batch(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Iterate `(key, value)` pairs starting at `mode`, walking `direction`,
    /// optionally stopping once `bound` is reached (inclusive; the smallest
    /// key not yet visited in the scan direction beyond it is excluded), up
    /// to `limit` entries (`None` for unbounded).
    fn iter(
        &self,
        mode: IterMode<'_>,
        bound: Option<&[u8]>,
        direction: ScanDirection,
        limit: Option<usize>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Snapshot the current store contents to a fresh, timestamped location
    /// under `backup_dir` and return its path.
    fn hot_backup(&self, backup_dir: &Path) -> Result<BackupHandle>;

    /// A named diagnostic property (row count, size on disk, ...), if the
    /// adapter tracks it. Absent properties return `None` rather than an
    /// error.
    fn property(&self, name: &str) -> Option<String>;
}
