//! The database handle.
//!
//! [`Database`] is a cloneable facade over one [`DataFile`]: cloning
//! retains it, dropping releases it, and [`Database::delete`] consumes
//! the last handle. It adds the pieces the raw data file does not have:
//! bundle resolution, recursive transactions with a sticky abort flag,
//! and the document-expiration bookkeeping in the reserved `expiry`
//! store.
//!
//! # Thread model
//!
//! Every operation serializes on internal locks, and the transaction
//! nesting state sits behind a re-entrant mutex so a thread may nest
//! `begin_transaction` freely. A transaction *scope* is not a lock,
//! though: interleaving one handle's begin/end across threads is a
//! caller error.

use std::cell::RefCell;
use std::path::Path;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::backend::{self, StoreOptions};
use crate::config::{DatabaseConfig, EncryptionKey, StorageEngine};
use crate::datafile::{DataFile, DataFileOptions, Transaction};
use crate::enumerator::EnumeratorOptions;
use crate::error::{Error, Result};
use crate::filepath::FilePath;
use crate::keystore::{
    decode_expiry_mark, decode_expiry_timestamp, encode_expiry_timestamp, expiry_mark_key,
    KeyStore, EXPIRY_KEY_STORE_NAME,
};
use crate::record::{Record, Sequence};

#[derive(Default)]
struct TxnState {
    level: u32,
    /// Sticky: set by any nested `end_transaction(false)`; forces the
    /// outermost resolution to abort.
    abort: bool,
    txn: Option<Transaction>,
}

struct Inner {
    file: DataFile,
    /// The configuration the database was opened with, with
    /// `storage_engine` fixed to the resolved engine.
    config: DatabaseConfig,
    txn: ReentrantMutex<RefCell<TxnState>>,
}

/// A reference-counted handle over a document database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    /// Opens a database.
    ///
    /// When the configuration is `bundled`, `path` names a directory
    /// holding the backing file; otherwise it names the file itself.
    pub fn open(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<Database> {
        let base = FilePath::new(path.as_ref());
        let (db_file, engine) = if config.bundled {
            find_or_create_bundle(&base, config)?
        } else {
            (base, config.storage_engine.unwrap_or(StorageEngine::Sqlite))
        };

        let mut resolved = config.clone();
        resolved.storage_engine = Some(engine);

        let file = DataFile::open(
            &db_file,
            engine,
            &DataFileOptions {
                create: config.create,
                writeable: !config.read_only,
                store_defaults: StoreOptions {
                    sequences: true,
                    soft_deletes: true,
                    get_by_offset: !config.v2_format,
                },
                encryption: config.encryption,
            },
        )?;

        Ok(Database {
            inner: Arc::new(Inner {
                file,
                config: resolved,
                txn: ReentrantMutex::new(RefCell::new(TxnState::default())),
            }),
        })
    }

    /// Deletes the database at `path` without opening it.
    pub fn delete_at_path(path: impl AsRef<Path>, config: &DatabaseConfig) -> Result<()> {
        let path = FilePath::new(path.as_ref());
        if config.bundled {
            path.delete_recursive()
        } else {
            let engine = config.storage_engine.unwrap_or(StorageEngine::Sqlite);
            backend::delete_data_file(engine, &path)
        }
    }

    /// Path of the backing file (inside the bundle, when bundled).
    pub fn path(&self) -> &FilePath {
        self.inner.file.path()
    }

    /// The configuration this database was opened with; its
    /// `storage_engine` reflects the engine actually in use.
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    /// The underlying data file.
    pub fn data_file(&self) -> &DataFile {
        &self.inner.file
    }

    /// Opens (creating if writeable) a named key store.
    pub fn key_store(&self, name: &str) -> Result<KeyStore> {
        self.inner.file.get_key_store(name)
    }

    /// The default key store.
    pub fn default_key_store(&self) -> Result<KeyStore> {
        self.inner.file.default_key_store()
    }

    /// Closes the underlying data file. Requires no open transaction.
    pub fn close(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.inner.file.close()
    }

    /// Deletes the database, consuming the handle. Fails [`Error::Busy`]
    /// unless this is the last handle, and
    /// [`Error::TransactionNotClosed`] inside a transaction.
    pub fn delete(self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        let inner = Arc::try_unwrap(self.inner).map_err(|_| Error::Busy)?;
        match inner.file.close() {
            Ok(()) | Err(Error::NotOpen) => {}
            Err(e) => return Err(e),
        }
        if inner.config.bundled {
            match inner.file.path().parent() {
                Some(bundle) => bundle.delete_recursive(),
                None => Err(Error::invalid_parameter("bundle has no parent directory")),
            }
        } else {
            inner.file.delete_files()
        }
    }

    /// Reclaims space from deleted or superseded records. Requires no
    /// open transaction.
    pub fn compact(&self) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.inner.file.compact()
    }

    /// True while this database is compacting.
    pub fn is_compacting(&self) -> bool {
        self.inner.file.is_compacting()
    }

    /// Registers a compaction start/end callback.
    pub fn set_on_compact(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.inner.file.set_on_compact(callback);
    }

    /// Re-encrypts the database under a new key (or decrypts it when the
    /// new algorithm is none). Requires no open transaction.
    pub fn rekey(&self, new_key: &EncryptionKey) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::TransactionNotClosed);
        }
        self.inner.file.rekey(new_key)
    }

    /// Number of live (non-deleted) documents in the default store.
    pub fn document_count(&self) -> Result<u64> {
        self.default_key_store()?.document_count()
    }

    /// Highest sequence issued in the default store.
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.default_key_store()?.last_sequence()
    }

    // -----------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------

    /// True while this handle has a transaction open.
    pub fn in_transaction(&self) -> bool {
        self.inner.txn.lock().borrow().level > 0
    }

    /// Begins a (possibly nested) transaction. The outermost level opens
    /// the data file's transaction.
    pub fn begin_transaction(&self) -> Result<()> {
        let guard = self.inner.txn.lock();
        let mut state = guard.borrow_mut();
        if state.level == 0 {
            state.txn = Some(Transaction::begin(&self.inner.file)?);
            state.abort = false;
        }
        state.level += 1;
        Ok(())
    }

    /// Ends one nesting level. `commit = false` at any level marks the
    /// whole outermost scope for abort; the underlying transaction
    /// resolves when the outermost level ends.
    pub fn end_transaction(&self, commit: bool) -> Result<()> {
        let guard = self.inner.txn.lock();
        let mut state = guard.borrow_mut();
        if state.level == 0 {
            return Err(Error::NotInTransaction);
        }
        if !commit {
            state.abort = true;
        }
        state.level -= 1;
        if state.level > 0 {
            return Ok(());
        }
        let abort = std::mem::take(&mut state.abort);
        match state.txn.take() {
            Some(txn) if abort => txn.abort(),
            Some(txn) => txn.commit(),
            None => Err(Error::NotInTransaction),
        }
    }

    /// Runs `f` with the currently open transaction.
    fn with_txn<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let guard = self.inner.txn.lock();
        let state = guard.borrow();
        match state.txn.as_ref() {
            Some(txn) => f(txn),
            None => Err(Error::NotInTransaction),
        }
    }

    /// Wraps `f` in its own (possibly nested) transaction scope,
    /// committing iff it succeeds.
    fn in_own_transaction<T>(&self, f: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        self.begin_transaction()?;
        let result = self.with_txn(f);
        let ended = self.end_transaction(result.is_ok());
        match result {
            Ok(value) => ended.map(|()| value),
            Err(e) => Err(e),
        }
    }

    /// Removes a document from the default store. Must be called inside
    /// a transaction; fails [`Error::NotFound`] if no live document
    /// exists.
    pub fn purge_doc(&self, doc_id: &[u8]) -> Result<()> {
        let store = self.default_key_store()?;
        self.with_txn(|txn| {
            if store.del(doc_id, txn)? {
                Ok(())
            } else {
                Err(Error::NotFound)
            }
        })
    }

    // -----------------------------------------------------------------
    // Raw store access
    // -----------------------------------------------------------------

    /// Reads a record from a named store. Tombstones count as absent.
    pub fn raw_get(&self, store_name: &str, key: &[u8]) -> Result<Record> {
        let store = self.key_store(store_name)?;
        match store.get(key)? {
            Some(record) if !record.is_deleted() => Ok(record),
            _ => Err(Error::NotFound),
        }
    }

    /// Writes a record to a named store in its own transaction scope.
    /// Empty meta *and* body delete the key instead.
    pub fn raw_put(&self, store_name: &str, key: &[u8], meta: &[u8], body: &[u8]) -> Result<()> {
        let store = self.key_store(store_name)?;
        self.in_own_transaction(|txn| {
            if meta.is_empty() && body.is_empty() {
                store.del(key, txn)?;
            } else {
                store.set(key, meta, body, txn)?;
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------
    // Document expiration
    // -----------------------------------------------------------------

    /// Sets (or clears, with `None`) a document's expiration timestamp.
    /// Runs in its own transaction scope.
    pub fn set_expiration(&self, doc_id: &[u8], timestamp: Option<u64>) -> Result<()> {
        let expiry = self.key_store(EXPIRY_KEY_STORE_NAME)?;
        self.in_own_transaction(|txn| {
            // Clear any previous mark for this document.
            if let Some(existing) = expiry.get(doc_id)? {
                if !existing.is_deleted() {
                    if let Some(old_ts) = decode_expiry_timestamp(&existing.body) {
                        expiry.del(&expiry_mark_key(old_ts, doc_id), txn)?;
                    }
                }
            }
            match timestamp {
                Some(ts) => {
                    expiry.set(&expiry_mark_key(ts, doc_id), b"", b"", txn)?;
                    expiry.set(doc_id, b"", &encode_expiry_timestamp(ts), txn)?;
                }
                None => {
                    expiry.del(doc_id, txn)?;
                }
            }
            Ok(())
        })
    }

    /// The earliest pending expiration timestamp, or `None` when no
    /// document is scheduled to expire.
    pub fn next_doc_expiration(&self) -> Result<Option<u64>> {
        let expiry = match self.key_store(EXPIRY_KEY_STORE_NAME) {
            Ok(store) => store,
            // A database that never scheduled an expiration has no store.
            Err(Error::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut e = expiry.enumerate(EnumeratorOptions::default())?;
        if e.advance() {
            let doc = e.doc();
            if doc.body.is_empty() {
                if let Some((ts, _)) = decode_expiry_mark(&doc.key) {
                    return Ok(Some(ts));
                }
            }
        }
        Ok(None)
    }

    /// Purges every document whose expiration is at or before `now`,
    /// clearing its expiry entries. Returns how many were purged.
    pub fn purge_expired(&self, now: u64) -> Result<u64> {
        let expiry = self.key_store(EXPIRY_KEY_STORE_NAME)?;
        let default = self.default_key_store()?;
        self.in_own_transaction(|txn| {
            let due = expiry.enumerate(EnumeratorOptions {
                end_key: Some(expiry_mark_key(now.saturating_add(1), b"")),
                ..EnumeratorOptions::default()
            })?;
            let mut purged = 0;
            for mark in due {
                let Some((_, doc_id)) = decode_expiry_mark(&mark.key) else { continue };
                let doc_id = doc_id.to_vec();
                default.del(&doc_id, txn)?;
                expiry.del(&mark.key, txn)?;
                expiry.del(&doc_id, txn)?;
                purged += 1;
            }
            Ok(purged)
        })
    }
}

/// Resolves a bundle directory to its database file and engine.
///
/// 1. With `create`, the directory is made if absent; otherwise it must
///    already exist as a directory.
/// 2. An explicit engine maps to its filename; unspecified defaults to
///    SQLite.
/// 3. A freshly created directory, or an existing file of the chosen
///    engine, settles it.
/// 4. An unspecified engine falls back to the log-structured file if
///    that exists instead.
/// 5. Anything else is [`Error::WrongFormat`].
fn find_or_create_bundle(
    dir: &FilePath,
    config: &DatabaseConfig,
) -> Result<(FilePath, StorageEngine)> {
    let created_dir = config.create && dir.mkdir()?;
    if !created_dir {
        dir.must_exist_as_dir()?;
    }

    let engine = config.storage_engine.unwrap_or(StorageEngine::Sqlite);
    let db_file = dir.subpath(engine.filename());
    if created_dir || db_file.exists() {
        return Ok((db_file, engine));
    }

    if config.storage_engine.is_some() {
        // The bundle exists but not in the requested format.
        return Err(Error::WrongFormat);
    }

    let fallback = dir.subpath(StorageEngine::Forest.filename());
    if !fallback.exists() {
        // The bundle contains neither kind of database.
        return Err(Error::WrongFormat);
    }
    Ok((fallback, StorageEngine::Forest))
}
