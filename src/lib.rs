//! vellum: an embeddable document-storage engine with a pluggable
//! storage backend, plus the streaming compression codec used by its
//! replication transport.
//!
//! The database core is a transactional handle over named key stores
//! held in one backing file:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               Database handle                │
//! │  (bundles, nested txns, expiry, raw access) │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                 DataFile                     │
//! │ (key stores, one Transaction, encryption,   │
//! │  compaction, rekey)                         │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │              Storage engine                  │
//! │   (log-structured append / SQLite B-tree)   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The codec side is independent of the database: [`Deflater`] and
//! [`Inflater`] transform a message-oriented byte stream incrementally,
//! with a CRC32 over plaintext that the transport frames at message
//! boundaries.
//!
//! ## Core invariants
//!
//! 1. **Single writer**: at most one [`Transaction`] is active per
//!    [`DataFile`], across all holders; mutations outside one fail.
//! 2. **Atomic commits**: a transaction's writes are applied entirely on
//!    commit or not at all.
//! 3. **Monotonic sequences**: every mutation of a sequenced store gets
//!    a strictly increasing sequence, durable across reopens.
//! 4. **Tombstones**: soft-deleted records stay distinguishable from
//!    absent ones (replication needs the difference).
//! 5. **Flush means flush**: a sync-flushed compressor has handed every
//!    plaintext byte to the output stream; partial output buffers never
//!    silently split a message.
//!
//! ## Quick start
//!
//! ```no_run
//! use vellum::{Database, DatabaseConfig};
//!
//! let config = DatabaseConfig { create: true, bundled: true, ..Default::default() };
//! let db = Database::open("data/db", &config)?;
//!
//! db.begin_transaction()?;
//! db.raw_put("info", b"greeting", b"", b"hello")?;
//! db.end_transaction(true)?;
//!
//! let record = db.raw_get("info", b"greeting")?;
//! assert_eq!(record.body, b"hello");
//! # Ok::<(), vellum::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod buf;
pub mod codec;
pub mod config;
pub mod database;
pub mod datafile;
pub mod enumerator;
pub mod error;
pub mod filepath;
pub mod keystore;
pub mod record;

mod crypto;

pub use backend::{is_any_compacting, shutdown, StoreOptions};
pub use buf::{ReadBuf, WriteBuf};
pub use codec::{Checksum, Codec, Deflater, Inflater, Mode, CHECKSUM_SIZE};
pub use config::{DatabaseConfig, EncryptionAlgorithm, EncryptionKey, StorageEngine};
pub use database::Database;
pub use datafile::{DataFile, DataFileOptions, Transaction};
pub use enumerator::{DocEnumerator, EnumeratorOptions};
pub use error::{Error, Result};
pub use filepath::FilePath;
pub use keystore::{KeyStore, DEFAULT_KEY_STORE_NAME, EXPIRY_KEY_STORE_NAME};
pub use record::{ContentOption, DocFlags, Record, Sequence};
