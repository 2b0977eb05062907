//! Database configuration: open flags, storage-engine selection, encryption.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Storage-engine selector.
///
/// The string and filename forms are fixed on-disk/wire contracts:
/// `"SQLite"` maps to `db.sqlite3`, `"ForestDB"` to `db.forestdb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEngine {
    /// B-tree backend stored in a SQLite file. The default.
    Sqlite,
    /// Log-structured append backend. Supports offset-addressable reads.
    Forest,
}

impl StorageEngine {
    /// The filename this engine uses inside a bundle directory.
    pub fn filename(self) -> &'static str {
        match self {
            StorageEngine::Sqlite => "db.sqlite3",
            StorageEngine::Forest => "db.forestdb",
        }
    }

    /// The selector string for this engine.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageEngine::Sqlite => "SQLite",
            StorageEngine::Forest => "ForestDB",
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageEngine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "SQLite" => Ok(StorageEngine::Sqlite),
            "ForestDB" => Ok(StorageEngine::Forest),
            other => Err(Error::invalid_parameter(format!("unknown storage engine {other:?}"))),
        }
    }
}

/// Encryption algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionAlgorithm {
    /// No encryption.
    #[default]
    None,
    /// AES-256 (GCM mode, per-record).
    Aes256,
}

/// Encryption configuration: algorithm plus 32 bytes of key material.
///
/// The key bytes are ignored when the algorithm is
/// [`EncryptionAlgorithm::None`].
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct EncryptionKey {
    /// Which algorithm to use.
    pub algorithm: EncryptionAlgorithm,
    /// Raw key material.
    pub bytes: [u8; 32],
}

impl EncryptionKey {
    /// No encryption.
    pub const NONE: EncryptionKey =
        EncryptionKey { algorithm: EncryptionAlgorithm::None, bytes: [0; 32] };

    /// AES-256 encryption with the given key.
    pub fn aes256(bytes: [u8; 32]) -> Self {
        Self { algorithm: EncryptionAlgorithm::Aes256, bytes }
    }

    /// True when this configuration enables encryption.
    pub fn is_encrypted(&self) -> bool {
        self.algorithm != EncryptionAlgorithm::None
    }
}

// Manual Debug so key material never lands in logs.
impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

/// Options controlling how a database is opened.
#[derive(Debug, Clone, Default)]
pub struct DatabaseConfig {
    /// Materialize the backing store if absent.
    pub create: bool,
    /// Reject writes.
    pub read_only: bool,
    /// The path refers to a bundle directory containing the backing file.
    pub bundled: bool,
    /// Use the newer storage schema; disables offset-addressable access.
    pub v2_format: bool,
    /// Storage engine to use. `None` means: default to SQLite for new
    /// databases, probe existing bundles.
    pub storage_engine: Option<StorageEngine>,
    /// Encryption for record payloads.
    pub encryption: EncryptionKey,
}
