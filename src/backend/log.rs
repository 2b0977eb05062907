//! Log-structured append engine.
//!
//! The backing file is a fixed header followed by a sequence of CRC32
//! framed records. Mutations append; nothing is rewritten in place. A
//! commit marker ends each transaction, and replay on open applies
//! records only up to the last valid marker, so a torn tail from a crash
//! is discarded cleanly.
//!
//! Every live record's frame offset is kept in an in-memory `BTreeMap`
//! per key store. That offset is also surfaced to callers as the
//! record's stable address for historical reads (until a compaction
//! rewrites the file).

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::ops::Bound;

use tracing::{debug, warn};

use super::{Engine, EngineOptions, StoreId, StoreOptions};
use crate::config::StorageEngine;
use crate::enumerator::EnumeratorOptions;
use crate::error::{Error, Result};
use crate::filepath::FilePath;
use crate::record::{ContentOption, DocFlags, Record, Sequence};

/// Magic number for log-structured database files.
const MAGIC: &[u8; 8] = b"VELLUMLG";
/// Current file format version.
const FORMAT_VERSION: u16 = 1;
/// File header size: magic + version + reserved.
const HEADER_SIZE: u64 = 16;
/// Frame header: payload length + CRC32 of the payload.
const FRAME_HEADER_SIZE: u64 = 8;
/// Upper bound on a single frame payload; larger lengths mean corruption.
const MAX_PAYLOAD: u32 = 1 << 30;

const KIND_STORE_DEF: u8 = 1;
const KIND_PUT: u8 = 2;
const KIND_REMOVE: u8 = 3;
const KIND_COMMIT: u8 = 4;

/// Suffix of the temporary file compaction writes before renaming.
const COMPACT_SUFFIX: &str = ".compact";

/// Committed index entry for one key.
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    offset: u64,
    sequence: Sequence,
    flags: DocFlags,
}

impl IndexEntry {
    fn is_live(&self) -> bool {
        !self.flags.contains(DocFlags::DELETED)
    }
}

/// One key store's committed state.
struct LogStore {
    name: String,
    options: StoreOptions,
    index: BTreeMap<Vec<u8>, IndexEntry>,
    last_sequence: Sequence,
    live_count: u64,
}

/// An uncommitted mutation, overlaid on the committed index for
/// read-your-own-writes inside the transaction.
#[derive(Debug, Clone, Copy)]
enum PendingEntry {
    Put(IndexEntry),
    Remove,
}

/// State of the single open write transaction.
struct PendingTxn {
    /// File length at begin; rollback truncates back to here.
    start_len: u64,
    overlay: HashMap<StoreId, BTreeMap<Vec<u8>, PendingEntry>>,
    last_sequences: HashMap<StoreId, Sequence>,
    /// Stores created during the transaction. Their definition frames
    /// are re-appended after a rollback truncation so disk and memory
    /// stay in agreement.
    new_stores: Vec<StoreId>,
}

/// The log-structured engine.
pub(crate) struct LogEngine {
    file: File,
    len: u64,
    path: FilePath,
    writeable: bool,
    stores: Vec<LogStore>,
    by_name: HashMap<String, StoreId>,
    txn: Option<PendingTxn>,
}

impl LogEngine {
    pub(crate) fn open(path: &FilePath, options: &EngineOptions) -> Result<LogEngine> {
        let exists = path.exists();
        if !exists && !(options.create && options.writeable) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no database at {path}"),
            )
            .into());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(options.writeable)
            .create(options.create && options.writeable)
            .open(path.as_path())?;

        let mut engine = LogEngine {
            len: file.metadata()?.len(),
            file,
            path: path.clone(),
            writeable: options.writeable,
            stores: Vec::new(),
            by_name: HashMap::new(),
            txn: None,
        };

        if engine.len == 0 {
            if !engine.writeable {
                return Err(Error::WrongFormat);
            }
            engine.write_new_header()?;
        } else {
            engine.read_header()?;
            engine.replay()?;
        }

        Ok(engine)
    }

    fn write_new_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        write_all_at(&self.file, &header, 0)?;
        self.file.sync_data()?;
        self.len = HEADER_SIZE;
        Ok(())
    }

    fn read_header(&mut self) -> Result<()> {
        if self.len < HEADER_SIZE {
            return Err(Error::WrongFormat);
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        read_exact_at(&self.file, &mut header, 0)?;
        if &header[0..8] != MAGIC {
            return Err(Error::WrongFormat);
        }
        let version = u16::from_le_bytes([header[8], header[9]]);
        if version > FORMAT_VERSION {
            return Err(Error::Unsupported);
        }
        Ok(())
    }

    /// Replays the log, applying records up to the last valid commit
    /// marker. Store definitions written outside a transaction apply
    /// immediately; everything else waits for its marker.
    fn replay(&mut self) -> Result<()> {
        let mut staged: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut committed_len = HEADER_SIZE;
        let mut pos = HEADER_SIZE;

        while let Some((payload, next)) = self.read_frame(pos)? {
            match payload.first().copied() {
                Some(KIND_COMMIT) => {
                    for (offset, op) in staged.drain(..) {
                        self.apply_staged(offset, &op)?;
                    }
                    // The marker carries the authoritative per-store
                    // sequence counters; they survive compaction even
                    // when superseded frames do not.
                    for (store, sequence) in decode_commit(&payload)? {
                        if let Ok(st) = self.store_mut(store) {
                            if sequence > st.last_sequence {
                                st.last_sequence = sequence;
                            }
                        }
                    }
                    committed_len = next;
                }
                Some(KIND_STORE_DEF) if staged.is_empty() => {
                    self.apply_store_def(&payload)?;
                    committed_len = next;
                }
                Some(KIND_STORE_DEF) | Some(KIND_PUT) | Some(KIND_REMOVE) => {
                    staged.push((pos, payload));
                }
                _ => {
                    warn!(offset = pos, "unknown record kind in log; stopping replay");
                    break;
                }
            }
            pos = next;
        }

        if committed_len < self.len {
            let dropped = self.len - committed_len;
            warn!(bytes = dropped, "discarding uncommitted log tail");
            if self.writeable {
                self.file.set_len(committed_len)?;
            }
            self.len = committed_len;
        }
        Ok(())
    }

    /// Reads the frame at `pos`. Returns `None` at a clean end of log or
    /// at a torn/corrupt frame (replay stops there).
    fn read_frame(&self, pos: u64) -> Result<Option<(Vec<u8>, u64)>> {
        if pos + FRAME_HEADER_SIZE > self.len {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE as usize];
        read_exact_at(&self.file, &mut header, pos)?;
        let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if payload_len == 0 || payload_len > MAX_PAYLOAD {
            return Ok(None);
        }
        let end = pos + FRAME_HEADER_SIZE + payload_len as u64;
        if end > self.len {
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len as usize];
        read_exact_at(&self.file, &mut payload, pos + FRAME_HEADER_SIZE)?;
        if crc32fast::hash(&payload) != crc {
            warn!(offset = pos, "log frame checksum mismatch");
            return Ok(None);
        }
        Ok(Some((payload, end)))
    }

    /// Appends a frame and returns its offset.
    fn append_frame(&mut self, payload: &[u8]) -> Result<u64> {
        let offset = self.len;
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE as usize + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
        frame.extend_from_slice(payload);
        write_all_at(&self.file, &frame, offset)?;
        self.len += frame.len() as u64;
        Ok(offset)
    }

    fn apply_store_def(&mut self, payload: &[u8]) -> Result<()> {
        let (id, options, name) = decode_store_def(payload)?;
        if id != self.stores.len() {
            return Err(Error::corrupt(format!("store definition out of order (id {id})")));
        }
        self.by_name.insert(name.clone(), id);
        self.stores.push(LogStore {
            name,
            options,
            index: BTreeMap::new(),
            last_sequence: 0,
            live_count: 0,
        });
        Ok(())
    }

    /// Applies one staged frame during replay, once its commit marker
    /// has been reached. `offset` is the frame's position in the file.
    fn apply_staged(&mut self, offset: u64, payload: &[u8]) -> Result<()> {
        match payload.first().copied() {
            Some(KIND_STORE_DEF) => self.apply_store_def(payload),
            Some(KIND_PUT) => {
                let put = decode_put(payload)?;
                let entry = IndexEntry { offset, sequence: put.sequence, flags: put.flags };
                self.apply_put(put.store, put.key, entry, true)
            }
            Some(KIND_REMOVE) => {
                let (store, key) = decode_remove(payload)?;
                self.apply_remove(store, &key)
            }
            _ => Err(Error::corrupt("unknown staged record kind")),
        }
    }

    /// Mutates committed state for a put.
    fn apply_put(
        &mut self,
        store: StoreId,
        key: Vec<u8>,
        entry: IndexEntry,
        bump_last_sequence: bool,
    ) -> Result<()> {
        let st = self.store_mut(store)?;
        let prior_live = st.index.get(&key).map(IndexEntry::is_live).unwrap_or(false);
        let now_live = entry.is_live();
        if bump_last_sequence && entry.sequence > st.last_sequence {
            st.last_sequence = entry.sequence;
        }
        st.index.insert(key, entry);
        match (prior_live, now_live) {
            (false, true) => st.live_count += 1,
            (true, false) => st.live_count -= 1,
            _ => {}
        }
        Ok(())
    }

    fn apply_remove(&mut self, store: StoreId, key: &[u8]) -> Result<()> {
        let st = self.store_mut(store)?;
        if let Some(prior) = st.index.remove(key) {
            if prior.is_live() {
                st.live_count -= 1;
            }
        }
        Ok(())
    }

    fn store(&self, id: StoreId) -> Result<&LogStore> {
        self.stores.get(id).ok_or_else(|| Error::invalid_parameter("unknown key store id"))
    }

    fn store_mut(&mut self, id: StoreId) -> Result<&mut LogStore> {
        self.stores.get_mut(id).ok_or_else(|| Error::invalid_parameter("unknown key store id"))
    }

    /// The effective view of a key: the transaction overlay if present,
    /// else the committed index.
    fn effective_entry(&self, store: StoreId, key: &[u8]) -> Result<Option<IndexEntry>> {
        if let Some(txn) = &self.txn {
            if let Some(pending) = txn.overlay.get(&store).and_then(|ov| ov.get(key)) {
                return Ok(match pending {
                    PendingEntry::Put(entry) => Some(*entry),
                    PendingEntry::Remove => None,
                });
            }
        }
        Ok(self.store(store)?.index.get(key).copied())
    }

    /// Builds a record from an index entry, reading payloads from the
    /// file as the content option requires.
    fn build_record(
        &self,
        store: StoreId,
        key: &[u8],
        entry: IndexEntry,
        content: ContentOption,
    ) -> Result<Record> {
        let surface_offset =
            if self.store(store)?.options.get_by_offset { Some(entry.offset) } else { None };

        if content == ContentOption::KeyOnly {
            return Ok(Record {
                key: key.to_vec(),
                sequence: entry.sequence,
                flags: entry.flags,
                offset: surface_offset,
                ..Record::default()
            });
        }

        let (payload, _) = self
            .read_frame(entry.offset)?
            .ok_or_else(|| Error::corrupt("record frame missing or corrupt"))?;
        let put = decode_put(&payload)?;
        Ok(Record {
            key: key.to_vec(),
            meta: put.meta,
            body: if content == ContentOption::Full { put.body } else { Vec::new() },
            sequence: entry.sequence,
            flags: entry.flags,
            offset: surface_offset,
        })
    }

    fn next_sequence(&self, store: StoreId) -> Result<Sequence> {
        let committed = self.store(store)?.last_sequence;
        let pending = self
            .txn
            .as_ref()
            .and_then(|txn| txn.last_sequences.get(&store).copied())
            .unwrap_or(committed);
        Ok(pending.max(committed) + 1)
    }
}

impl Engine for LogEngine {
    fn kind(&self) -> StorageEngine {
        StorageEngine::Forest
    }

    fn open_store(&mut self, name: &str, options: StoreOptions) -> Result<StoreId> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if !self.writeable {
            return Err(Error::NotFound);
        }

        let id = self.stores.len();
        let payload = encode_store_def(id, options, name);
        self.append_frame(&payload)?;
        self.by_name.insert(name.to_string(), id);
        self.stores.push(LogStore {
            name: name.to_string(),
            options,
            index: BTreeMap::new(),
            last_sequence: 0,
            live_count: 0,
        });
        if let Some(txn) = &mut self.txn {
            txn.new_stores.push(id);
        }
        debug!(store = name, id, "created key store");
        Ok(id)
    }

    fn store_names(&self) -> Vec<String> {
        self.stores.iter().map(|s| s.name.clone()).collect()
    }

    fn get(
        &mut self,
        store: StoreId,
        key: &[u8],
        content: ContentOption,
    ) -> Result<Option<Record>> {
        match self.effective_entry(store, key)? {
            Some(entry) => Ok(Some(self.build_record(store, key, entry, content)?)),
            None => Ok(None),
        }
    }

    fn get_by_offset(&mut self, store: StoreId, offset: u64) -> Result<Option<Record>> {
        if !self.store(store)?.options.get_by_offset {
            return Err(Error::Unsupported);
        }
        let Some((payload, _)) = self.read_frame(offset)? else {
            return Ok(None);
        };
        let put = match decode_put(&payload) {
            Ok(put) => put,
            Err(_) => return Ok(None),
        };
        if put.store != store {
            return Ok(None);
        }
        Ok(Some(Record {
            key: put.key,
            meta: put.meta,
            body: put.body,
            sequence: put.sequence,
            flags: put.flags,
            offset: Some(offset),
        }))
    }

    fn set(&mut self, store: StoreId, key: &[u8], meta: &[u8], body: &[u8]) -> Result<Sequence> {
        if self.txn.is_none() {
            return Err(Error::NotInTransaction);
        }
        let options = self.store(store)?.options;
        let sequence = if options.sequences { self.next_sequence(store)? } else { 0 };

        let payload = encode_put(store, sequence, DocFlags::NONE, key, meta, body);
        let offset = self.append_frame(&payload)?;

        let Some(txn) = self.txn.as_mut() else { return Err(Error::NotInTransaction) };
        if options.sequences {
            txn.last_sequences.insert(store, sequence);
        }
        txn.overlay.entry(store).or_default().insert(
            key.to_vec(),
            PendingEntry::Put(IndexEntry { offset, sequence, flags: DocFlags::NONE }),
        );
        Ok(sequence)
    }

    fn put_raw(
        &mut self,
        store: StoreId,
        key: &[u8],
        meta: &[u8],
        body: &[u8],
        sequence: Sequence,
        flags: DocFlags,
    ) -> Result<()> {
        if self.txn.is_none() {
            return Err(Error::NotInTransaction);
        }
        self.store(store)?;
        let payload = encode_put(store, sequence, flags, key, meta, body);
        let offset = self.append_frame(&payload)?;

        let Some(txn) = self.txn.as_mut() else { return Err(Error::NotInTransaction) };
        txn.overlay
            .entry(store)
            .or_default()
            .insert(key.to_vec(), PendingEntry::Put(IndexEntry { offset, sequence, flags }));
        Ok(())
    }

    fn del(&mut self, store: StoreId, key: &[u8]) -> Result<bool> {
        if self.txn.is_none() {
            return Err(Error::NotInTransaction);
        }
        let options = self.store(store)?.options;
        let existing = self.effective_entry(store, key)?;
        let was_live = existing.map(|e| e.is_live()).unwrap_or(false);
        if !was_live {
            return Ok(false);
        }

        if options.soft_deletes {
            let sequence = if options.sequences { self.next_sequence(store)? } else { 0 };
            let payload = encode_put(store, sequence, DocFlags::DELETED, key, &[], &[]);
            let offset = self.append_frame(&payload)?;

            let Some(txn) = self.txn.as_mut() else { return Err(Error::NotInTransaction) };
            if options.sequences {
                txn.last_sequences.insert(store, sequence);
            }
            txn.overlay.entry(store).or_default().insert(
                key.to_vec(),
                PendingEntry::Put(IndexEntry { offset, sequence, flags: DocFlags::DELETED }),
            );
        } else {
            let payload = encode_remove(store, key);
            self.append_frame(&payload)?;

            let Some(txn) = self.txn.as_mut() else { return Err(Error::NotInTransaction) };
            txn.overlay.entry(store).or_default().insert(key.to_vec(), PendingEntry::Remove);
        }
        Ok(true)
    }

    fn last_sequence(&mut self, store: StoreId) -> Result<Sequence> {
        let committed = self.store(store)?.last_sequence;
        Ok(self
            .txn
            .as_ref()
            .and_then(|txn| txn.last_sequences.get(&store).copied())
            .unwrap_or(committed)
            .max(committed))
    }

    fn document_count(&mut self, store: StoreId) -> Result<u64> {
        let mut count = self.store(store)?.live_count as i64;
        if let Some(txn) = &self.txn {
            if let Some(overlay) = txn.overlay.get(&store) {
                let index = &self.stores[store].index;
                for (key, pending) in overlay {
                    let prior_live = index.get(key).map(IndexEntry::is_live).unwrap_or(false);
                    let now_live =
                        matches!(pending, PendingEntry::Put(entry) if entry.is_live());
                    count += now_live as i64 - prior_live as i64;
                }
            }
        }
        Ok(count.max(0) as u64)
    }

    fn scan(&mut self, store: StoreId, options: &EnumeratorOptions) -> Result<Vec<Record>> {
        let lower = match &options.start_key {
            Some(k) => Bound::Included(k.as_slice()),
            None => Bound::Unbounded,
        };
        let upper = match &options.end_key {
            Some(k) => Bound::Excluded(k.as_slice()),
            None => Bound::Unbounded,
        };

        // Committed range, then the transaction overlay on top.
        let mut merged: BTreeMap<Vec<u8>, IndexEntry> = self
            .store(store)?
            .index
            .range::<[u8], _>((lower, upper))
            .map(|(k, e)| (k.clone(), *e))
            .collect();
        if let Some(txn) = &self.txn {
            if let Some(overlay) = txn.overlay.get(&store) {
                for (key, pending) in overlay {
                    if !options.in_bounds(key) {
                        continue;
                    }
                    match pending {
                        PendingEntry::Put(entry) => {
                            merged.insert(key.clone(), *entry);
                        }
                        PendingEntry::Remove => {
                            merged.remove(key);
                        }
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(merged.len());
        for (key, entry) in &merged {
            if !options.include_deleted && !entry.is_live() {
                continue;
            }
            records.push(self.build_record(store, key, *entry, options.content)?);
        }
        if options.descending {
            records.reverse();
        }
        Ok(records)
    }

    fn begin(&mut self) -> Result<()> {
        if !self.writeable {
            return Err(Error::ReadOnly);
        }
        if self.txn.is_some() {
            return Err(Error::TransactionNotClosed);
        }
        self.txn = Some(PendingTxn {
            start_len: self.len,
            overlay: HashMap::new(),
            last_sequences: HashMap::new(),
            new_stores: Vec::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else { return Err(Error::NotInTransaction) };

        // Marker payload: the post-transaction sequence counter of every
        // store, so replay never has to reconstruct counters from frames.
        let counters: Vec<(StoreId, Sequence)> = self
            .stores
            .iter()
            .enumerate()
            .map(|(id, st)| {
                let pending = txn.last_sequences.get(&id).copied().unwrap_or(0);
                (id, st.last_sequence.max(pending))
            })
            .collect();
        self.append_frame(&encode_commit(&counters))?;
        self.file.sync_data()?;

        for (store, overlay) in txn.overlay {
            for (key, pending) in overlay {
                match pending {
                    PendingEntry::Put(entry) => self.apply_put(store, key, entry, false)?,
                    PendingEntry::Remove => self.apply_remove(store, &key)?,
                }
            }
        }
        for (store, sequence) in counters {
            let st = self.store_mut(store)?;
            if sequence > st.last_sequence {
                st.last_sequence = sequence;
            }
        }
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let Some(txn) = self.txn.take() else { return Err(Error::NotInTransaction) };

        self.file.set_len(txn.start_len)?;
        self.len = txn.start_len;
        self.file.sync_data()?;

        // Stores created inside the aborted transaction stay usable;
        // rewrite their definitions so the file agrees with memory.
        for id in txn.new_stores {
            let payload = {
                let st = self.store(id)?;
                encode_store_def(id, st.options, &st.name)
            };
            self.append_frame(&payload)?;
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::TransactionNotClosed);
        }
        if !self.writeable {
            return Err(Error::ReadOnly);
        }

        let tmp_path = self.path.appending(COMPACT_SUFFIX);
        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp_path.as_path())?;
        let mut writer = BufWriter::new(tmp);
        let mut pos: u64 = 0;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..10].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        writer.write_all(&header)?;
        pos += HEADER_SIZE;

        // Copy store definitions, then the latest frame for every key
        // (tombstones included; superseded versions are left behind).
        let mut new_offsets: Vec<BTreeMap<Vec<u8>, u64>> = Vec::with_capacity(self.stores.len());
        for (id, store) in self.stores.iter().enumerate() {
            let payload = encode_store_def(id, store.options, &store.name);
            pos += write_frame_to(&mut writer, &payload)?;
            new_offsets.push(BTreeMap::new());
        }
        for (id, store) in self.stores.iter().enumerate() {
            for (key, entry) in &store.index {
                let (payload, _) = self
                    .read_frame(entry.offset)?
                    .ok_or_else(|| Error::corrupt("record frame missing during compaction"))?;
                new_offsets[id].insert(key.clone(), pos);
                pos += write_frame_to(&mut writer, &payload)?;
            }
        }
        let counters: Vec<(StoreId, Sequence)> =
            self.stores.iter().enumerate().map(|(id, st)| (id, st.last_sequence)).collect();
        pos += write_frame_to(&mut writer, &encode_commit(&counters))?;

        writer.flush()?;
        let tmp = writer.into_inner().map_err(|e| Error::Io { source: e.into_error() })?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(tmp_path.as_path(), self.path.as_path())?;
        self.file = OpenOptions::new().read(true).write(true).open(self.path.as_path())?;
        let old_len = self.len;
        self.len = pos;

        for (id, offsets) in new_offsets.into_iter().enumerate() {
            for (key, offset) in offsets {
                if let Some(entry) = self.stores[id].index.get_mut(&key) {
                    entry.offset = offset;
                }
            }
        }
        debug!(before = old_len, after = pos, "log compaction finished");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.writeable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// Removes the backing file and any leftover compaction temp file.
pub(crate) fn delete_file(path: &FilePath) -> Result<()> {
    path.remove_file_if_exists()?;
    path.appending(COMPACT_SUFFIX).remove_file_if_exists()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Payload encoding
// ---------------------------------------------------------------------------

struct PutPayload {
    store: StoreId,
    sequence: Sequence,
    flags: DocFlags,
    key: Vec<u8>,
    meta: Vec<u8>,
    body: Vec<u8>,
}

fn encode_store_def(id: StoreId, options: StoreOptions, name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + name.len());
    payload.push(KIND_STORE_DEF);
    payload.extend_from_slice(&(id as u32).to_le_bytes());
    payload.push(options.to_bits());
    payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
    payload.extend_from_slice(name.as_bytes());
    payload
}

fn decode_store_def(payload: &[u8]) -> Result<(StoreId, StoreOptions, String)> {
    let mut p = Parser::new(payload);
    if p.u8()? != KIND_STORE_DEF {
        return Err(Error::corrupt("not a store definition"));
    }
    let id = p.u32()? as StoreId;
    let options = StoreOptions::from_bits(p.u8()?);
    let name_len = p.u16()? as usize;
    let name = String::from_utf8(p.bytes(name_len)?.to_vec())
        .map_err(|_| Error::corrupt("store name is not UTF-8"))?;
    Ok((id, options, name))
}

fn encode_put(
    store: StoreId,
    sequence: Sequence,
    flags: DocFlags,
    key: &[u8],
    meta: &[u8],
    body: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24 + key.len() + meta.len() + body.len());
    payload.push(KIND_PUT);
    payload.extend_from_slice(&(store as u32).to_le_bytes());
    payload.extend_from_slice(&sequence.to_le_bytes());
    payload.push(flags.bits());
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(&(meta.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(body.len() as u32).to_le_bytes());
    payload.extend_from_slice(key);
    payload.extend_from_slice(meta);
    payload.extend_from_slice(body);
    payload
}

fn decode_put(payload: &[u8]) -> Result<PutPayload> {
    let mut p = Parser::new(payload);
    if p.u8()? != KIND_PUT {
        return Err(Error::corrupt("not a put record"));
    }
    let store = p.u32()? as StoreId;
    let sequence = p.u64()?;
    let flags = DocFlags::from_bits(p.u8()?);
    let key_len = p.u16()? as usize;
    let meta_len = p.u32()? as usize;
    let body_len = p.u32()? as usize;
    let key = p.bytes(key_len)?.to_vec();
    let meta = p.bytes(meta_len)?.to_vec();
    let body = p.bytes(body_len)?.to_vec();
    Ok(PutPayload { store, sequence, flags, key, meta, body })
}

fn encode_commit(counters: &[(StoreId, Sequence)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + counters.len() * 12);
    payload.push(KIND_COMMIT);
    payload.extend_from_slice(&(counters.len() as u32).to_le_bytes());
    for (store, sequence) in counters {
        payload.extend_from_slice(&(*store as u32).to_le_bytes());
        payload.extend_from_slice(&sequence.to_le_bytes());
    }
    payload
}

fn decode_commit(payload: &[u8]) -> Result<Vec<(StoreId, Sequence)>> {
    let mut p = Parser::new(payload);
    if p.u8()? != KIND_COMMIT {
        return Err(Error::corrupt("not a commit marker"));
    }
    let count = p.u32()? as usize;
    let mut counters = Vec::with_capacity(count);
    for _ in 0..count {
        let store = p.u32()? as StoreId;
        let sequence = p.u64()?;
        counters.push((store, sequence));
    }
    Ok(counters)
}

fn encode_remove(store: StoreId, key: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(8 + key.len());
    payload.push(KIND_REMOVE);
    payload.extend_from_slice(&(store as u32).to_le_bytes());
    payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
    payload.extend_from_slice(key);
    payload
}

fn decode_remove(payload: &[u8]) -> Result<(StoreId, Vec<u8>)> {
    let mut p = Parser::new(payload);
    if p.u8()? != KIND_REMOVE {
        return Err(Error::corrupt("not a remove record"));
    }
    let store = p.u32()? as StoreId;
    let key_len = p.u16()? as usize;
    let key = p.bytes(key_len)?.to_vec();
    Ok((store, key))
}

/// Bounds-checked little-endian payload reader.
struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else { return Err(Error::corrupt("truncated log record")) };
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}

/// Writes one frame sequentially; returns the frame's total size.
fn write_frame_to(writer: &mut impl Write, payload: &[u8]) -> Result<u64> {
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(payload).to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(FRAME_HEADER_SIZE + payload.len() as u64)
}

// ---------------------------------------------------------------------------
// Positional I/O
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read").into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
