//! Storage backend abstraction.
//!
//! The [`Engine`] trait abstracts the underlying storage mechanism. Two
//! engines exist: a log-structured append store ([`log`]) and a B-tree
//! store backed by SQLite ([`sqlite`]). The engine is chosen when a data
//! file is opened and cannot change afterwards.
//!
//! This module also owns the small amount of process-wide state the
//! backends share: a registry of open files (a path can be open in at
//! most one engine at a time) and the "is any file compacting" flag.

mod log;
mod sqlite;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::config::StorageEngine;
use crate::enumerator::EnumeratorOptions;
use crate::error::{Error, Result};
use crate::filepath::FilePath;
use crate::record::{ContentOption, DocFlags, Record, Sequence};

/// Identifies an open key store within an engine.
pub(crate) type StoreId = usize;

/// Per-store feature switches, fixed when the store is first opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Assign a strictly monotonic sequence to each mutation.
    pub sequences: bool,
    /// Keep a tombstone on delete instead of removing the record.
    pub soft_deletes: bool,
    /// Give each record a stable offset for O(1) historical reads.
    /// Only the log-structured engine honors this.
    pub get_by_offset: bool,
}

impl StoreOptions {
    pub(crate) fn to_bits(self) -> u8 {
        (self.sequences as u8) | (self.soft_deletes as u8) << 1 | (self.get_by_offset as u8) << 2
    }

    pub(crate) fn from_bits(bits: u8) -> StoreOptions {
        StoreOptions {
            sequences: bits & 0x01 != 0,
            soft_deletes: bits & 0x02 != 0,
            get_by_offset: bits & 0x04 != 0,
        }
    }
}

/// Options controlling how an engine opens its file.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineOptions {
    /// Create the backing file if absent.
    pub create: bool,
    /// Open for writing.
    pub writeable: bool,
}

/// A storage engine: the pluggable seam beneath a data file.
///
/// All payloads pass through unchanged; encryption happens above this
/// trait. Mutating operations (`set`, `put_raw`, `del`) may only be
/// called between [`begin`](Engine::begin) and
/// [`commit`](Engine::commit)/[`rollback`](Engine::rollback); the data
/// file layer enforces that.
pub(crate) trait Engine: Send {
    /// Which engine this is.
    fn kind(&self) -> StorageEngine;

    /// Opens (creating if needed and writeable) the named key store.
    /// Idempotent: reopening returns the same id.
    fn open_store(&mut self, name: &str, options: StoreOptions) -> Result<StoreId>;

    /// Names of all key stores present in the file.
    fn store_names(&self) -> Vec<String>;

    /// Reads a record by key. Tombstones are returned (flagged deleted);
    /// absent keys yield `None`.
    fn get(&mut self, store: StoreId, key: &[u8], content: ContentOption)
        -> Result<Option<Record>>;

    /// Reads a record by its stable offset. Only the log engine supports
    /// this; others fail [`Error::Unsupported`].
    fn get_by_offset(&mut self, store: StoreId, offset: u64) -> Result<Option<Record>>;

    /// Inserts or replaces a record, assigning the next sequence.
    fn set(&mut self, store: StoreId, key: &[u8], meta: &[u8], body: &[u8]) -> Result<Sequence>;

    /// Writes a record verbatim, preserving the given sequence and flags
    /// and leaving the store's sequence counter untouched. Used by rekey.
    fn put_raw(
        &mut self,
        store: StoreId,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        sequence: Sequence,
        flags: DocFlags,
    ) -> Result<()>;

    /// Deletes a record: a tombstone when the store keeps soft deletes,
    /// a hard removal otherwise. Returns true iff a live record existed.
    fn del(&mut self, store: StoreId, key: &[u8]) -> Result<bool>;

    /// Highest sequence ever issued in the store.
    fn last_sequence(&mut self, store: StoreId) -> Result<Sequence>;

    /// Number of live (non-tombstone) records in the store.
    fn document_count(&mut self, store: StoreId) -> Result<u64>;

    /// Materializes the records matching the options, in key order
    /// (reversed when descending). Payloads honor the content option.
    fn scan(&mut self, store: StoreId, options: &EnumeratorOptions) -> Result<Vec<Record>>;

    /// Begins the single write transaction.
    fn begin(&mut self) -> Result<()>;

    /// Commits the write transaction, making its mutations durable.
    fn commit(&mut self) -> Result<()>;

    /// Rolls the write transaction back, discarding its mutations.
    fn rollback(&mut self) -> Result<()>;

    /// Reclaims space from deleted or superseded records. Must not be
    /// called inside a transaction.
    fn compact(&mut self) -> Result<()>;

    /// Flushes and releases the backing file.
    fn close(&mut self) -> Result<()>;
}

/// Opens the backing file with the requested engine.
pub(crate) fn open_engine(
    kind: StorageEngine,
    path: &FilePath,
    options: &EngineOptions,
) -> Result<Box<dyn Engine>> {
    match kind {
        StorageEngine::Sqlite => Ok(Box::new(sqlite::SqliteEngine::open(path, options)?)),
        StorageEngine::Forest => Ok(Box::new(log::LogEngine::open(path, options)?)),
    }
}

/// Deletes the backing file(s) for the given engine kind, including any
/// sidecar files the engine maintains next to it.
pub(crate) fn delete_data_file(kind: StorageEngine, path: &FilePath) -> Result<()> {
    match kind {
        StorageEngine::Sqlite => sqlite::delete_file(path),
        StorageEngine::Forest => log::delete_file(path),
    }
}

// ---------------------------------------------------------------------------
// Process-wide state
// ---------------------------------------------------------------------------

static OPEN_FILES: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
static COMPACTING: AtomicUsize = AtomicUsize::new(0);

fn open_files() -> &'static Mutex<HashSet<PathBuf>> {
    OPEN_FILES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Registry key for a path: canonical where possible so the same file
/// reached through different spellings still collides. The file may not
/// exist yet (create case), so the parent directory is canonicalized
/// and the file name re-attached.
fn registry_key(path: &FilePath) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path.as_path()) {
        return canonical;
    }
    if let (Some(parent), Some(name)) = (path.as_path().parent(), path.as_path().file_name()) {
        if let Ok(canonical_parent) = std::fs::canonicalize(parent) {
            return canonical_parent.join(name);
        }
    }
    path.as_path().to_path_buf()
}

/// Claims a path in the open-file registry. Fails [`Error::Busy`] if the
/// path is already open in this process.
pub(crate) fn register_open(path: &FilePath) -> Result<PathBuf> {
    let key = registry_key(path);
    let mut files = open_files().lock();
    if !files.insert(key.clone()) {
        return Err(Error::Busy);
    }
    Ok(key)
}

/// Releases a previously claimed path.
pub(crate) fn unregister_open(key: &PathBuf) {
    open_files().lock().remove(key);
}

/// Marks a file as compacting for the duration of the returned guard.
pub(crate) struct CompactingGuard;

impl CompactingGuard {
    pub(crate) fn new() -> CompactingGuard {
        COMPACTING.fetch_add(1, Ordering::SeqCst);
        CompactingGuard
    }
}

impl Drop for CompactingGuard {
    fn drop(&mut self) {
        COMPACTING.fetch_sub(1, Ordering::SeqCst);
    }
}

/// True while any data file in the process is compacting.
pub fn is_any_compacting() -> bool {
    COMPACTING.load(Ordering::SeqCst) > 0
}

/// Quiesces process-wide backend state. Call at process exit, after all
/// databases have been closed; any entries still in the open-file
/// registry at that point belong to leaked handles and are dropped.
pub fn shutdown() {
    open_files().lock().clear();
}
