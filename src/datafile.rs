//! Data files and their write transactions.
//!
//! A [`DataFile`] owns the storage engine for one backing file and the
//! named key stores inside it. It is a cheap `Clone` handle over shared
//! state; at most one [`Transaction`] may be active at a time, across
//! all holders.
//!
//! Encryption happens here: when the file was opened with a key, record
//! payloads are sealed before they reach the engine and opened on the
//! way out, so both engines get encryption uniformly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{self, Engine, EngineOptions, StoreId, StoreOptions};
use crate::config::{EncryptionKey, StorageEngine};
use crate::crypto::RecordCryptor;
use crate::enumerator::EnumeratorOptions;
use crate::error::{Error, Result};
use crate::filepath::FilePath;
use crate::keystore::KeyStore;
use crate::record::{ContentOption, Record, Sequence};

/// Options controlling how a data file is opened.
#[derive(Debug, Clone, Default)]
pub struct DataFileOptions {
    /// Create the backing file if absent.
    pub create: bool,
    /// Open for writing.
    pub writeable: bool,
    /// Feature switches applied to every key store opened in this file.
    pub store_defaults: StoreOptions,
    /// Payload encryption.
    pub encryption: EncryptionKey,
}

type OnCompactCallback = Box<dyn Fn(bool) + Send + Sync>;

struct State {
    engine: Option<Box<dyn Engine>>,
    txn_active: bool,
    cryptor: Option<RecordCryptor>,
    stores: HashMap<String, (StoreId, StoreOptions)>,
}

struct Core {
    path: FilePath,
    kind: StorageEngine,
    writeable: bool,
    store_defaults: StoreOptions,
    state: Mutex<State>,
    on_compact: Mutex<Option<OnCompactCallback>>,
    compacting: AtomicBool,
    /// Open-file registry claim; released on close.
    registry_key: Mutex<Option<PathBuf>>,
}

/// A container of named key stores over one backing file.
#[derive(Clone)]
pub struct DataFile {
    core: Arc<Core>,
}

impl DataFile {
    /// Opens (or creates) the backing file with the given engine.
    ///
    /// A path can be open in at most one engine per process; a second
    /// open fails [`Error::Busy`].
    pub fn open(
        path: &FilePath,
        kind: StorageEngine,
        options: &DataFileOptions,
    ) -> Result<DataFile> {
        let registry_key = backend::register_open(path)?;

        let opened = (|| {
            let engine = backend::open_engine(
                kind,
                path,
                &EngineOptions { create: options.create, writeable: options.writeable },
            )?;
            let cryptor = RecordCryptor::from_key(&options.encryption)?;
            Ok::<_, Error>((engine, cryptor))
        })();
        let (engine, cryptor) = match opened {
            Ok(parts) => parts,
            Err(e) => {
                backend::unregister_open(&registry_key);
                return Err(e);
            }
        };

        debug!(path = %path, engine = %kind, "opened data file");
        Ok(DataFile {
            core: Arc::new(Core {
                path: path.clone(),
                kind,
                writeable: options.writeable,
                store_defaults: options.store_defaults,
                state: Mutex::new(State {
                    engine: Some(engine),
                    txn_active: false,
                    cryptor,
                    stores: HashMap::new(),
                }),
                on_compact: Mutex::new(None),
                compacting: AtomicBool::new(false),
                registry_key: Mutex::new(Some(registry_key)),
            }),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &FilePath {
        &self.core.path
    }

    /// The storage engine this file was opened with.
    pub fn kind(&self) -> StorageEngine {
        self.core.kind
    }

    /// True if the file accepts writes.
    pub fn writeable(&self) -> bool {
        self.core.writeable
    }

    /// Flushes and releases the backing file. Subsequent operations on
    /// this file (through any handle or key store) fail
    /// [`Error::NotOpen`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.core.state.lock();
        if state.txn_active {
            return Err(Error::TransactionNotClosed);
        }
        let Some(mut engine) = state.engine.take() else { return Err(Error::NotOpen) };
        engine.close()?;
        drop(state);

        if let Some(key) = self.core.registry_key.lock().take() {
            backend::unregister_open(&key);
        }
        debug!(path = %self.core.path, "closed data file");
        Ok(())
    }

    /// Deletes the backing file(s). The file must already be closed.
    pub(crate) fn delete_files(&self) -> Result<()> {
        if self.core.state.lock().engine.is_some() {
            return Err(Error::Busy);
        }
        backend::delete_data_file(self.core.kind, &self.core.path)
    }

    /// Opens (creating if writeable) the named key store. Idempotent.
    pub fn get_key_store(&self, name: &str) -> Result<KeyStore> {
        let mut state = self.core.state.lock();
        if let Some(&(id, options)) = state.stores.get(name) {
            return Ok(KeyStore::new(self.clone(), name.to_string(), id, options));
        }
        let defaults = self.core.store_defaults;
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        let id = engine.open_store(name, defaults)?;
        state.stores.insert(name.to_string(), (id, defaults));
        Ok(KeyStore::new(self.clone(), name.to_string(), id, defaults))
    }

    /// The default key store.
    pub fn default_key_store(&self) -> Result<KeyStore> {
        self.get_key_store(crate::keystore::DEFAULT_KEY_STORE_NAME)
    }

    /// True while this file is compacting.
    pub fn is_compacting(&self) -> bool {
        self.core.compacting.load(Ordering::SeqCst)
    }

    /// Registers a callback fired with `true` when compaction starts and
    /// `false` when it ends.
    pub fn set_on_compact(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        *self.core.on_compact.lock() = Some(Box::new(callback));
    }

    /// Reclaims space from deleted or superseded records.
    ///
    /// Runs online: concurrent readers keep a consistent view, and the
    /// registered callback observes start and end. Fails on read-only
    /// files and inside a transaction.
    pub fn compact(&self) -> Result<()> {
        if !self.core.writeable {
            return Err(Error::ReadOnly);
        }
        {
            let state = self.core.state.lock();
            if state.engine.is_none() {
                return Err(Error::NotOpen);
            }
            if state.txn_active {
                return Err(Error::TransactionNotClosed);
            }
        }

        let _global = backend::CompactingGuard::new();
        self.core.compacting.store(true, Ordering::SeqCst);
        self.fire_on_compact(true);

        let result = {
            let mut state = self.core.state.lock();
            match state.engine.as_mut() {
                Some(engine) => engine.compact(),
                None => Err(Error::NotOpen),
            }
        };

        self.fire_on_compact(false);
        self.core.compacting.store(false, Ordering::SeqCst);
        result
    }

    fn fire_on_compact(&self, compacting: bool) {
        // Take the callback out while invoking so it may re-enter the
        // data file without deadlocking on the callback slot.
        let callback = self.core.on_compact.lock().take();
        if let Some(callback) = callback {
            callback(compacting);
            let mut slot = self.core.on_compact.lock();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }

    /// Re-encrypts every record under `new_key` (or decrypts when the
    /// algorithm is none), atomically: on failure the file keeps its old
    /// key and contents. Requires no active transaction.
    pub fn rekey(&self, new_key: &EncryptionKey) -> Result<()> {
        if !self.core.writeable {
            return Err(Error::ReadOnly);
        }
        let new_cryptor = RecordCryptor::from_key(new_key)?;

        {
            let mut state = self.core.state.lock();
            if state.txn_active {
                return Err(Error::TransactionNotClosed);
            }
            let State { engine, cryptor, .. } = &mut *state;
            let engine = engine.as_mut().ok_or(Error::NotOpen)?;

            engine.begin()?;
            let rewritten =
                rekey_rewrite(engine.as_mut(), cryptor, &new_cryptor).and_then(|()| engine.commit());
            match rewritten {
                Ok(()) => *cryptor = new_cryptor,
                Err(e) => {
                    if let Err(rollback_err) = engine.rollback() {
                        warn!(error = %rollback_err, "rollback after failed rekey also failed");
                    }
                    return Err(e);
                }
            }
        }

        // Leave no superseded ciphertext behind. The data is already
        // durable under the new key; a compaction failure only delays
        // space reclamation.
        if let Err(e) = self.compact() {
            warn!(error = %e, "compaction after rekey failed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Key store operations (called through KeyStore handles)
    // -----------------------------------------------------------------

    pub(crate) fn ks_get(
        &self,
        store: StoreId,
        key: &[u8],
        content: ContentOption,
    ) -> Result<Option<Record>> {
        let mut state = self.core.state.lock();
        let State { engine, cryptor, .. } = &mut *state;
        let engine = engine.as_mut().ok_or(Error::NotOpen)?;
        match engine.get(store, key, content)? {
            Some(record) => Ok(Some(unseal_record(cryptor, record, content)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn ks_get_by_offset(&self, store: StoreId, offset: u64) -> Result<Option<Record>> {
        let mut state = self.core.state.lock();
        let State { engine, cryptor, .. } = &mut *state;
        let engine = engine.as_mut().ok_or(Error::NotOpen)?;
        match engine.get_by_offset(store, offset)? {
            Some(record) => Ok(Some(unseal_record(cryptor, record, ContentOption::Full)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn ks_set(
        &self,
        store: StoreId,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
    ) -> Result<Sequence> {
        if !self.core.writeable {
            return Err(Error::ReadOnly);
        }
        let mut state = self.core.state.lock();
        if !state.txn_active {
            return Err(Error::NotInTransaction);
        }
        let State { engine, cryptor, .. } = &mut *state;
        let engine = engine.as_mut().ok_or(Error::NotOpen)?;
        let sealed_meta = seal_payload(cryptor, meta)?;
        let sealed_body = seal_payload(cryptor, body)?;
        engine.set(store, key, &sealed_meta, &sealed_body)
    }

    pub(crate) fn ks_del(&self, store: StoreId, key: &[u8]) -> Result<bool> {
        if !self.core.writeable {
            return Err(Error::ReadOnly);
        }
        let mut state = self.core.state.lock();
        if !state.txn_active {
            return Err(Error::NotInTransaction);
        }
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        engine.del(store, key)
    }

    pub(crate) fn ks_last_sequence(&self, store: StoreId) -> Result<Sequence> {
        let mut state = self.core.state.lock();
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        engine.last_sequence(store)
    }

    pub(crate) fn ks_document_count(&self, store: StoreId) -> Result<u64> {
        let mut state = self.core.state.lock();
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        engine.document_count(store)
    }

    pub(crate) fn ks_scan(
        &self,
        store: StoreId,
        options: &EnumeratorOptions,
    ) -> Result<Vec<Record>> {
        let mut state = self.core.state.lock();
        let State { engine, cryptor, .. } = &mut *state;
        let engine = engine.as_mut().ok_or(Error::NotOpen)?;
        let records = engine.scan(store, options)?;
        records
            .into_iter()
            .map(|record| unseal_record(cryptor, record, options.content))
            .collect()
    }

    // -----------------------------------------------------------------
    // Transaction plumbing
    // -----------------------------------------------------------------

    pub(crate) fn begin_transaction_raw(&self) -> Result<()> {
        if !self.core.writeable {
            return Err(Error::ReadOnly);
        }
        let mut state = self.core.state.lock();
        if state.txn_active {
            return Err(Error::TransactionNotClosed);
        }
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        engine.begin()?;
        state.txn_active = true;
        Ok(())
    }

    pub(crate) fn end_transaction_raw(&self, commit: bool) -> Result<()> {
        let mut state = self.core.state.lock();
        if !state.txn_active {
            return Err(Error::NotInTransaction);
        }
        let engine = state.engine.as_mut().ok_or(Error::NotOpen)?;
        let result = if commit {
            let committed = engine.commit();
            if committed.is_err() {
                // A failed commit must not leave the engine mid-transaction.
                if let Err(e) = engine.rollback() {
                    warn!(error = %e, "rollback after failed commit also failed");
                }
            }
            committed
        } else {
            engine.rollback()
        };
        state.txn_active = false;
        result
    }

    /// True while a transaction is open on this file.
    pub fn in_transaction(&self) -> bool {
        self.core.state.lock().txn_active
    }

    pub(crate) fn same_file(&self, other: &DataFile) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if let Some(engine) = self.state.get_mut().engine.as_mut() {
            if let Err(e) = engine.close() {
                warn!(path = %self.path, error = %e, "error closing data file on drop");
            }
        }
        if let Some(key) = self.registry_key.get_mut().take() {
            backend::unregister_open(&key);
        }
    }
}

/// Rewrites every non-empty payload under the new cryptor. Runs inside
/// an engine transaction owned by the caller.
fn rekey_rewrite(
    engine: &mut dyn Engine,
    old: &Option<RecordCryptor>,
    new: &Option<RecordCryptor>,
) -> Result<()> {
    let scan_options =
        EnumeratorOptions { include_deleted: true, ..EnumeratorOptions::default() };
    for name in engine.store_names() {
        // Idempotent: resolves the id whether or not the store was
        // already materialized in this process.
        let id = engine.open_store(&name, StoreOptions::default())?;
        for record in engine.scan(id, &scan_options)? {
            if record.meta.is_empty() && record.body.is_empty() {
                continue;
            }
            let meta = seal_payload(new, &open_payload(old, &record.meta)?)?;
            let body = seal_payload(new, &open_payload(old, &record.body)?)?;
            engine.put_raw(id, &record.key, &meta, &body, record.sequence, record.flags)?;
        }
    }
    Ok(())
}

fn seal_payload(cryptor: &Option<RecordCryptor>, payload: &[u8]) -> Result<Vec<u8>> {
    match cryptor {
        Some(c) => c.seal(payload),
        None => Ok(payload.to_vec()),
    }
}

fn open_payload(cryptor: &Option<RecordCryptor>, payload: &[u8]) -> Result<Vec<u8>> {
    match cryptor {
        Some(c) => c.open(payload),
        None => Ok(payload.to_vec()),
    }
}

fn unseal_record(
    cryptor: &Option<RecordCryptor>,
    mut record: Record,
    content: ContentOption,
) -> Result<Record> {
    if cryptor.is_some() {
        if content != ContentOption::KeyOnly {
            record.meta = open_payload(cryptor, &record.meta)?;
        }
        if content == ContentOption::Full {
            record.body = open_payload(cryptor, &record.body)?;
        }
    }
    Ok(record)
}

/// A write scope on a data file.
///
/// All mutations issued through a transaction are applied atomically on
/// [`commit`](Transaction::commit) and discarded on
/// [`abort`](Transaction::abort). Dropping an unresolved transaction
/// aborts it.
pub struct Transaction {
    file: DataFile,
    resolved: bool,
}

impl Transaction {
    /// Begins the file's single write transaction. Fails
    /// [`Error::TransactionNotClosed`] while another one is active.
    pub fn begin(file: &DataFile) -> Result<Transaction> {
        file.begin_transaction_raw()?;
        Ok(Transaction { file: file.clone(), resolved: false })
    }

    /// Commits the transaction's mutations.
    pub fn commit(mut self) -> Result<()> {
        self.resolved = true;
        self.file.end_transaction_raw(true)
    }

    /// Discards the transaction's mutations.
    pub fn abort(mut self) -> Result<()> {
        self.resolved = true;
        self.file.end_transaction_raw(false)
    }

    /// True if this transaction belongs to `file`.
    pub(crate) fn belongs_to(&self, file: &DataFile) -> bool {
        self.file.same_file(file)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.resolved {
            if let Err(e) = self.file.end_transaction_raw(false) {
                warn!(error = %e, "aborting dropped transaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::config::EncryptionKey;

    fn open_file(dir: &std::path::Path, engine: StorageEngine) -> DataFile {
        let path = FilePath::new(dir).subpath(engine.filename());
        DataFile::open(
            &path,
            engine,
            &DataFileOptions {
                create: true,
                writeable: true,
                store_defaults: StoreOptions {
                    sequences: true,
                    soft_deletes: true,
                    get_by_offset: engine == StorageEngine::Forest,
                },
                encryption: EncryptionKey::NONE,
            },
        )
        .unwrap()
    }

    fn for_both_engines(test: impl Fn(DataFile)) {
        for engine in [StorageEngine::Sqlite, StorageEngine::Forest] {
            let dir = tempdir().unwrap();
            test(open_file(dir.path(), engine));
        }
    }

    #[test]
    fn test_single_transaction_rule() {
        for_both_engines(|file| {
            let txn = Transaction::begin(&file).unwrap();
            assert!(file.in_transaction());
            assert!(matches!(Transaction::begin(&file), Err(Error::TransactionNotClosed)));
            txn.commit().unwrap();
            assert!(!file.in_transaction());
        });
    }

    #[test]
    fn test_drop_aborts() {
        for_both_engines(|file| {
            let store = file.default_key_store().unwrap();
            {
                let txn = Transaction::begin(&file).unwrap();
                store.set(b"doc", b"", b"body", &txn).unwrap();
                // Dropped unresolved.
            }
            assert!(!file.in_transaction());
            assert!(store.get(b"doc").unwrap().is_none());
        });
    }

    #[test]
    fn test_mutation_requires_transaction() {
        for_both_engines(|file| {
            let store = file.default_key_store().unwrap();
            // A transaction on a different file does not count.
            let other_dir = tempdir().unwrap();
            let other = open_file(other_dir.path(), StorageEngine::Sqlite);
            let foreign = Transaction::begin(&other).unwrap();
            assert!(matches!(
                store.set(b"k", b"", b"v", &foreign),
                Err(Error::InvalidParameter { .. })
            ));
            foreign.abort().unwrap();
        });
    }

    #[test]
    fn test_close_then_use_fails() {
        for_both_engines(|file| {
            let store = file.default_key_store().unwrap();
            file.close().unwrap();
            assert!(matches!(store.get(b"k"), Err(Error::NotOpen)));
            assert!(matches!(file.close(), Err(Error::NotOpen)));
        });
    }

    #[test]
    fn test_double_open_is_busy() {
        let dir = tempdir().unwrap();
        let file = open_file(dir.path(), StorageEngine::Sqlite);
        let path = file.path().clone();
        let second = DataFile::open(
            &path,
            StorageEngine::Sqlite,
            &DataFileOptions { create: false, writeable: true, ..Default::default() },
        );
        assert!(matches!(second, Err(Error::Busy)));
    }

    #[test]
    fn test_compact_callback_and_flags() {
        use std::sync::atomic::AtomicU32;

        for_both_engines(|file| {
            let events = Arc::new(AtomicU32::new(0));
            let seen = Arc::clone(&events);
            file.set_on_compact(move |compacting| {
                // Bit 0 records a start, bit 1 an end.
                seen.fetch_or(if compacting { 1 } else { 2 }, Ordering::SeqCst);
            });

            let store = file.default_key_store().unwrap();
            let txn = Transaction::begin(&file).unwrap();
            store.set(b"doc", b"", b"body", &txn).unwrap();
            txn.commit().unwrap();

            file.compact().unwrap();
            assert_eq!(events.load(Ordering::SeqCst), 3);
            assert!(!file.is_compacting());
        });
    }

    #[test]
    fn test_compact_rejected_in_transaction() {
        for_both_engines(|file| {
            let txn = Transaction::begin(&file).unwrap();
            assert!(matches!(file.compact(), Err(Error::TransactionNotClosed)));
            txn.abort().unwrap();
        });
    }

    #[test]
    fn test_encrypted_roundtrip_and_rekey() {
        let key_a = EncryptionKey::aes256([0x11; 32]);
        let key_b = EncryptionKey::aes256([0x22; 32]);

        for engine in [StorageEngine::Sqlite, StorageEngine::Forest] {
            let dir = tempdir().unwrap();
            let path = FilePath::new(dir.path()).subpath(engine.filename());
            let options = DataFileOptions {
                create: true,
                writeable: true,
                store_defaults: StoreOptions {
                    sequences: true,
                    soft_deletes: true,
                    get_by_offset: false,
                },
                encryption: key_a,
            };

            {
                let file = DataFile::open(&path, engine, &options).unwrap();
                let store = file.default_key_store().unwrap();
                let txn = Transaction::begin(&file).unwrap();
                store.set(b"doc", b"meta", b"secret body", &txn).unwrap();
                txn.commit().unwrap();

                file.rekey(&key_b).unwrap();
                let rec = store.get(b"doc").unwrap().unwrap();
                assert_eq!(rec.body, b"secret body");
                file.close().unwrap();
            }

            // Old key no longer decrypts; new key does.
            {
                let stale = DataFile::open(&path, engine, &options).unwrap();
                let store = stale.default_key_store().unwrap();
                assert!(matches!(store.get(b"doc"), Err(Error::Crypto { .. })));
                stale.close().unwrap();
            }
            {
                let fresh = DataFile::open(
                    &path,
                    engine,
                    &DataFileOptions { encryption: key_b, ..options.clone() },
                )
                .unwrap();
                let store = fresh.default_key_store().unwrap();
                let rec = store.get(b"doc").unwrap().unwrap();
                assert_eq!(rec.body, b"secret body");
                assert_eq!(rec.sequence, 1, "rekey preserves sequences");
            }
        }
    }

    #[test]
    fn test_rekey_to_plaintext() {
        let dir = tempdir().unwrap();
        let path = FilePath::new(dir.path()).subpath("db.sqlite3");
        let encrypted = DataFileOptions {
            create: true,
            writeable: true,
            store_defaults: StoreOptions { sequences: true, soft_deletes: true, ..Default::default() },
            encryption: EncryptionKey::aes256([9; 32]),
        };

        {
            let file = DataFile::open(&path, StorageEngine::Sqlite, &encrypted).unwrap();
            let store = file.default_key_store().unwrap();
            let txn = Transaction::begin(&file).unwrap();
            store.set(b"doc", b"", b"plain soon", &txn).unwrap();
            txn.commit().unwrap();
            file.rekey(&EncryptionKey::NONE).unwrap();
        }

        let file = DataFile::open(
            &path,
            StorageEngine::Sqlite,
            &DataFileOptions { encryption: EncryptionKey::NONE, ..encrypted },
        )
        .unwrap();
        let store = file.default_key_store().unwrap();
        assert_eq!(store.get(b"doc").unwrap().unwrap().body, b"plain soon");
    }
}
