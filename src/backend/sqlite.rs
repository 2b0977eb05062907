//! B-tree engine backed by SQLite.
//!
//! Each key store is one `kv_<name>` table keyed by the record's key
//! blob; a `kv_meta` table tracks per-store options and the persistent
//! sequence counter. The connection runs in WAL mode with
//! `synchronous=NORMAL`, and the engine's transactions map directly to
//! `BEGIN IMMEDIATE` / `COMMIT` / `ROLLBACK`.
//!
//! Records in this engine have no stable byte offset; offset-addressable
//! reads are unsupported.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use super::{Engine, EngineOptions, StoreId, StoreOptions};
use crate::config::StorageEngine;
use crate::enumerator::EnumeratorOptions;
use crate::error::{Error, Result};
use crate::filepath::FilePath;
use crate::record::{ContentOption, DocFlags, Record, Sequence};

/// Store catalog: one row per key store.
const CREATE_META: &str = "
CREATE TABLE IF NOT EXISTS kv_meta (
    name          TEXT PRIMARY KEY NOT NULL,
    last_sequence INTEGER NOT NULL DEFAULT 0,
    options       INTEGER NOT NULL DEFAULT 0
)";

struct SqliteStore {
    name: String,
    table: String,
    options: StoreOptions,
    /// Cached sequence counter; `None` after a rollback until reloaded.
    last_sequence: Option<Sequence>,
}

/// The SQLite engine.
pub(crate) struct SqliteEngine {
    conn: Connection,
    writeable: bool,
    stores: Vec<SqliteStore>,
    by_name: HashMap<String, StoreId>,
    in_txn: bool,
}

impl SqliteEngine {
    pub(crate) fn open(path: &FilePath, options: &EngineOptions) -> Result<SqliteEngine> {
        let mut flags = OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI;
        if options.writeable {
            flags |= OpenFlags::SQLITE_OPEN_READ_WRITE;
            if options.create {
                flags |= OpenFlags::SQLITE_OPEN_CREATE;
            }
        } else {
            flags |= OpenFlags::SQLITE_OPEN_READ_ONLY;
        }

        let conn = Connection::open_with_flags(path.as_path(), flags)?;

        // SQLite opens lazily; force a read so a wrong-format file is
        // rejected here rather than on first use.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;

        if options.writeable {
            conn.execute_batch("PRAGMA journal_mode = WAL")?;
            conn.execute_batch("PRAGMA synchronous = NORMAL")?;
            conn.execute_batch(CREATE_META)?;
        }

        let mut engine = SqliteEngine {
            conn,
            writeable: options.writeable,
            stores: Vec::new(),
            by_name: HashMap::new(),
            in_txn: false,
        };
        engine.load_catalog()?;
        Ok(engine)
    }

    /// Loads the store catalog from `kv_meta`, if present.
    fn load_catalog(&mut self) -> Result<()> {
        let has_meta: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'kv_meta'",
            [],
            |row| row.get(0),
        )?;
        if has_meta == 0 {
            return Ok(());
        }

        let mut stmt =
            self.conn.prepare("SELECT name, options FROM kv_meta ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut catalog = Vec::new();
        for row in rows {
            catalog.push(row?);
        }
        drop(stmt);

        for (name, option_bits) in catalog {
            let id = self.stores.len();
            self.by_name.insert(name.clone(), id);
            self.stores.push(SqliteStore {
                table: store_table(&name)?,
                name,
                options: StoreOptions::from_bits(option_bits as u8),
                last_sequence: None,
            });
        }
        Ok(())
    }

    fn store(&self, id: StoreId) -> Result<&SqliteStore> {
        self.stores.get(id).ok_or_else(|| Error::invalid_parameter("unknown key store id"))
    }

    fn store_mut(&mut self, id: StoreId) -> Result<&mut SqliteStore> {
        self.stores.get_mut(id).ok_or_else(|| Error::invalid_parameter("unknown key store id"))
    }

    /// The store's sequence counter, loading it from `kv_meta` if the
    /// cache was invalidated by a rollback.
    fn ensure_last_sequence(&mut self, id: StoreId) -> Result<Sequence> {
        if let Some(sequence) = self.store(id)?.last_sequence {
            return Ok(sequence);
        }
        let name = self.store(id)?.name.clone();
        let sequence: i64 = self.conn.query_row(
            "SELECT last_sequence FROM kv_meta WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        let sequence = sequence as Sequence;
        self.store_mut(id)?.last_sequence = Some(sequence);
        Ok(sequence)
    }

    /// Assigns the next sequence and persists the counter.
    fn bump_sequence(&mut self, id: StoreId) -> Result<Sequence> {
        let next = self.ensure_last_sequence(id)? + 1;
        let name = self.store(id)?.name.clone();
        self.conn.execute(
            "UPDATE kv_meta SET last_sequence = ?1 WHERE name = ?2",
            params![next as i64, name],
        )?;
        self.store_mut(id)?.last_sequence = Some(next);
        Ok(next)
    }
}

impl Engine for SqliteEngine {
    fn kind(&self) -> StorageEngine {
        StorageEngine::Sqlite
    }

    fn open_store(&mut self, name: &str, options: StoreOptions) -> Result<StoreId> {
        if let Some(&id) = self.by_name.get(name) {
            return Ok(id);
        }
        if !self.writeable {
            return Err(Error::NotFound);
        }

        let table = store_table(name)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key      BLOB PRIMARY KEY NOT NULL,
                sequence INTEGER NOT NULL DEFAULT 0,
                flags    INTEGER NOT NULL DEFAULT 0,
                meta     BLOB NOT NULL DEFAULT x'',
                body     BLOB NOT NULL DEFAULT x''
            ) WITHOUT ROWID"
        ))?;
        self.conn.execute(
            "INSERT OR IGNORE INTO kv_meta (name, last_sequence, options) VALUES (?1, 0, ?2)",
            params![name, options.to_bits() as i64],
        )?;

        let id = self.stores.len();
        self.by_name.insert(name.to_string(), id);
        self.stores.push(SqliteStore {
            name: name.to_string(),
            table,
            options,
            last_sequence: Some(0),
        });
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
        let table = &self.store(store)?.table;
        let sql = match content {
            ContentOption::Full => {
                format!("SELECT sequence, flags, meta, body FROM {table} WHERE key = ?1")
            }
            ContentOption::MetaOnly => {
                format!("SELECT sequence, flags, meta FROM {table} WHERE key = ?1")
            }
            ContentOption::KeyOnly => {
                format!("SELECT sequence, flags FROM {table} WHERE key = ?1")
            }
        };
        let record = self
            .conn
            .query_row(&sql, params![key], |row| {
                Ok(Record {
                    key: key.to_vec(),
                    sequence: row.get::<_, i64>(0)? as Sequence,
                    flags: DocFlags::from_bits(row.get::<_, i64>(1)? as u8),
                    meta: match content {
                        ContentOption::KeyOnly => Vec::new(),
                        _ => row.get(2)?,
                    },
                    body: match content {
                        ContentOption::Full => row.get(3)?,
                        _ => Vec::new(),
                    },
                    offset: None,
                })
            })
            .optional()?;
        Ok(record)
    }

    fn get_by_offset(&mut self, _store: StoreId, _offset: u64) -> Result<Option<Record>> {
        Err(Error::Unsupported)
    }

    fn set(&mut self, store: StoreId, key: &[u8], meta: &[u8], body: &[u8]) -> Result<Sequence> {
        if !self.in_txn {
            return Err(Error::NotInTransaction);
        }
        let options = self.store(store)?.options;
        let sequence = if options.sequences { self.bump_sequence(store)? } else { 0 };
        let table = &self.store(store)?.table;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (key, sequence, flags, meta, body)
                 VALUES (?1, ?2, 0, ?3, ?4)"
            ),
            params![key, sequence as i64, meta, body],
        )?;
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
        if !self.in_txn {
            return Err(Error::NotInTransaction);
        }
        let table = &self.store(store)?.table;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {table} (key, sequence, flags, meta, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![key, sequence as i64, flags.bits() as i64, meta, body],
        )?;
        Ok(())
    }

    fn del(&mut self, store: StoreId, key: &[u8]) -> Result<bool> {
        if !self.in_txn {
            return Err(Error::NotInTransaction);
        }
        let options = self.store(store)?.options;
        let table = self.store(store)?.table.clone();

        let flags: Option<i64> = self
            .conn
            .query_row(&format!("SELECT flags FROM {table} WHERE key = ?1"), params![key], |row| {
                row.get(0)
            })
            .optional()?;
        let live = match flags {
            None => false,
            Some(bits) => !DocFlags::from_bits(bits as u8).contains(DocFlags::DELETED),
        };
        if !live {
            return Ok(false);
        }

        if options.soft_deletes {
            let sequence = if options.sequences { self.bump_sequence(store)? } else { 0 };
            self.conn.execute(
                &format!(
                    "UPDATE {table} SET sequence = ?1, flags = ?2, meta = x'', body = x''
                     WHERE key = ?3"
                ),
                params![sequence as i64, DocFlags::DELETED.bits() as i64, key],
            )?;
        } else {
            self.conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
        }
        Ok(true)
    }

    fn last_sequence(&mut self, store: StoreId) -> Result<Sequence> {
        self.ensure_last_sequence(store)
    }

    fn document_count(&mut self, store: StoreId) -> Result<u64> {
        let deleted = DocFlags::DELETED.bits();
        let table = &self.store(store)?.table;
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE (flags & {deleted}) = 0"),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn scan(&mut self, store: StoreId, options: &EnumeratorOptions) -> Result<Vec<Record>> {
        let table = &self.store(store)?.table;
        let columns = match options.content {
            ContentOption::Full => "key, sequence, flags, meta, body",
            ContentOption::MetaOnly => "key, sequence, flags, meta",
            ContentOption::KeyOnly => "key, sequence, flags",
        };

        let mut sql = format!("SELECT {columns} FROM {table}");
        let mut clauses = Vec::new();
        let mut bound_params: Vec<Vec<u8>> = Vec::new();
        if let Some(start) = &options.start_key {
            bound_params.push(start.clone());
            clauses.push(format!("key >= ?{}", bound_params.len()));
        }
        if let Some(end) = &options.end_key {
            bound_params.push(end.clone());
            clauses.push(format!("key < ?{}", bound_params.len()));
        }
        if !options.include_deleted {
            let deleted = DocFlags::DELETED.bits();
            clauses.push(format!("(flags & {deleted}) = 0"));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(if options.descending { " ORDER BY key DESC" } else { " ORDER BY key ASC" });

        let content = options.content;
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bound_params.iter()), |row| {
            Ok(Record {
                key: row.get(0)?,
                sequence: row.get::<_, i64>(1)? as Sequence,
                flags: DocFlags::from_bits(row.get::<_, i64>(2)? as u8),
                meta: match content {
                    ContentOption::KeyOnly => Vec::new(),
                    _ => row.get(3)?,
                },
                body: match content {
                    ContentOption::Full => row.get(4)?,
                    _ => Vec::new(),
                },
                offset: None,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn begin(&mut self) -> Result<()> {
        if !self.writeable {
            return Err(Error::ReadOnly);
        }
        if self.in_txn {
            return Err(Error::TransactionNotClosed);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.in_txn = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::NotInTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_txn = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_txn {
            return Err(Error::NotInTransaction);
        }
        self.conn.execute_batch("ROLLBACK")?;
        self.in_txn = false;
        // The rollback reverted kv_meta; drop cached counters.
        for store in &mut self.stores {
            store.last_sequence = None;
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(Error::TransactionNotClosed);
        }
        if !self.writeable {
            return Err(Error::ReadOnly);
        }
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.writeable {
            if let Err(e) = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)") {
                debug!(error = %e, "wal checkpoint on close failed");
            }
        }
        Ok(())
    }
}

/// Removes the database and its WAL/shm sidecars.
pub(crate) fn delete_file(path: &FilePath) -> Result<()> {
    path.remove_file_if_exists()?;
    path.appending("-wal").remove_file_if_exists()?;
    path.appending("-shm").remove_file_if_exists()?;
    Ok(())
}

/// Maps a store name to its table name, rejecting names that cannot be
/// a SQL identifier suffix.
fn store_table(name: &str) -> Result<String> {
    if name.is_empty()
        || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(Error::invalid_parameter(format!("invalid key store name {name:?}")));
    }
    Ok(format!("kv_{name}"))
}
