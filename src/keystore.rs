//! Key stores: named, sorted record stores inside a data file.
//!
//! A [`KeyStore`] is a lightweight handle bound to its [`DataFile`].
//! Reads copy out of the backend; mutations require the file's open
//! [`Transaction`] as proof of a write scope.
//!
//! This module also defines the reserved store names and the key
//! encoding used by the `expiry` store for TTL bookkeeping.

use byteorder::{BigEndian, ByteOrder};

use crate::backend::{StoreId, StoreOptions};
use crate::datafile::{DataFile, Transaction};
use crate::enumerator::{DocEnumerator, EnumeratorOptions};
use crate::error::{Error, Result};
use crate::record::{ContentOption, Record, Sequence};

/// Name of the default key store.
pub const DEFAULT_KEY_STORE_NAME: &str = "default";

/// Name of the reserved store holding TTL expiration entries.
pub const EXPIRY_KEY_STORE_NAME: &str = "expiry";

/// A sorted-by-key record store with optional sequencing and
/// soft deletes.
#[derive(Clone)]
pub struct KeyStore {
    file: DataFile,
    name: String,
    id: StoreId,
    options: StoreOptions,
}

impl KeyStore {
    pub(crate) fn new(file: DataFile, name: String, id: StoreId, options: StoreOptions) -> Self {
        Self { file, name, id, options }
    }

    /// The store's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store's feature switches.
    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Reads the full record stored under `key`. Tombstones are returned
    /// (flagged deleted); absence yields `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>> {
        self.get_with_content(key, ContentOption::Full)
    }

    /// Reads the record under `key`, materializing only as much as
    /// `content` asks for.
    pub fn get_with_content(&self, key: &[u8], content: ContentOption) -> Result<Option<Record>> {
        self.file.ks_get(self.id, key, content)
    }

    /// Reads a historical record by its stable offset. Only available
    /// when the store was opened with
    /// [`get_by_offset`](StoreOptions::get_by_offset) on a backend that
    /// supports it.
    pub fn get_by_offset(&self, offset: u64) -> Result<Option<Record>> {
        if !self.options.get_by_offset {
            return Err(Error::Unsupported);
        }
        self.file.ks_get_by_offset(self.id, offset)
    }

    /// Inserts or replaces the record under `key`, returning the
    /// sequence assigned to the mutation.
    ///
    /// `txn` must be the open transaction of this store's data file.
    pub fn set(
        &self,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        txn: &Transaction,
    ) -> Result<Sequence> {
        self.check_txn(txn)?;
        self.file.ks_set(self.id, key, meta, body)
    }

    /// Deletes the record under `key`: a tombstone when the store keeps
    /// soft deletes, a hard removal otherwise. Returns true iff a live
    /// record existed.
    pub fn del(&self, key: &[u8], txn: &Transaction) -> Result<bool> {
        self.check_txn(txn)?;
        self.file.ks_del(self.id, key)
    }

    /// Highest sequence ever issued in this store, persistent across
    /// reopens.
    pub fn last_sequence(&self) -> Result<Sequence> {
        self.file.ks_last_sequence(self.id)
    }

    /// Number of live (non-tombstone) records.
    pub fn document_count(&self) -> Result<u64> {
        self.file.ks_document_count(self.id)
    }

    /// Creates an enumerator over the records matching `options`.
    pub fn enumerate(&self, options: EnumeratorOptions) -> Result<DocEnumerator> {
        Ok(DocEnumerator::new(self.file.ks_scan(self.id, &options)?))
    }

    fn check_txn(&self, txn: &Transaction) -> Result<()> {
        if !txn.belongs_to(&self.file) {
            return Err(Error::invalid_parameter("transaction belongs to another data file"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Expiry store key encoding
// ---------------------------------------------------------------------------
//
// The expiry store holds two entries per expiring document:
//
//   mark entry:   key = 0x00 ‖ timestamp(BE u64) ‖ doc id,  empty body
//   doc-id entry: key = doc id,                   body = timestamp(BE u64)
//
// Doc ids are non-empty and never start with 0x00, so mark entries sort
// first and an ascending enumeration yields the next expiration as its
// first record.

/// Builds a mark-entry key for the given expiration and document.
pub(crate) fn expiry_mark_key(timestamp: u64, doc_id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + doc_id.len());
    key.push(0x00);
    let mut ts = [0u8; 8];
    BigEndian::write_u64(&mut ts, timestamp);
    key.extend_from_slice(&ts);
    key.extend_from_slice(doc_id);
    key
}

/// Splits a mark-entry key back into timestamp and document id.
pub(crate) fn decode_expiry_mark(key: &[u8]) -> Option<(u64, &[u8])> {
    if key.len() < 9 || key[0] != 0x00 {
        return None;
    }
    Some((BigEndian::read_u64(&key[1..9]), &key[9..]))
}

/// Encodes a timestamp for a doc-id entry's body.
pub(crate) fn encode_expiry_timestamp(timestamp: u64) -> [u8; 8] {
    let mut ts = [0u8; 8];
    BigEndian::write_u64(&mut ts, timestamp);
    ts
}

/// Decodes a doc-id entry's body.
pub(crate) fn decode_expiry_timestamp(body: &[u8]) -> Option<u64> {
    if body.len() != 8 {
        return None;
    }
    Some(BigEndian::read_u64(body))
}
