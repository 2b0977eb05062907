//! Error types for the vellum storage engine and codec.

use std::io;

use snafu::Snafu;

/// Result type alias for vellum operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during vellum operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Caller misuse: unknown storage engine, foreign transaction, bad option combination.
    #[snafu(display("Invalid parameter: {reason}"))]
    InvalidParameter {
        /// Description of the offending parameter.
        reason: String,
    },

    /// On-disk content contradicts the requested configuration.
    #[snafu(display("File is not in the requested storage format"))]
    WrongFormat,

    /// Key or key store is absent.
    #[snafu(display("Not found"))]
    NotFound,

    /// A reference or lock is held elsewhere.
    #[snafu(display("Database is busy"))]
    Busy,

    /// A mutation or commit was attempted outside a transaction.
    #[snafu(display("No transaction is open"))]
    NotInTransaction,

    /// An operation that requires a quiesced database ran inside a transaction,
    /// or a second transaction was begun while one is active.
    #[snafu(display("A transaction is still open"))]
    TransactionNotClosed,

    /// The backend does not support the requested operation or schema.
    #[snafu(display("Unsupported operation for this storage engine"))]
    Unsupported,

    /// Codec or record integrity failure.
    #[snafu(display("Corrupt data: {reason}"))]
    CorruptData {
        /// What was corrupted.
        reason: String,
    },

    /// Encryption or decryption failure (bad key material, auth failure).
    #[snafu(display("Crypto error: {reason}"))]
    Crypto {
        /// What the cipher reported.
        reason: String,
    },

    /// The database is open read-only.
    #[snafu(display("Database is read-only"))]
    ReadOnly,

    /// The database handle has been closed.
    #[snafu(display("Database is not open"))]
    NotOpen,

    /// I/O error from the underlying storage.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// Error reported by the SQLite backend.
    #[snafu(display("SQLite error: {source}"))]
    Sqlite {
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },
}

// Automatic conversions for ergonomic ? usage.
impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(source: rusqlite::Error) -> Self {
        // A SQLite "not a database" error means the file on disk is not in
        // the format the configuration asked for.
        if let rusqlite::Error::SqliteFailure(e, _) = &source {
            if e.code == rusqlite::ErrorCode::NotADatabase {
                return Error::WrongFormat;
            }
        }
        Error::Sqlite { source }
    }
}

impl Error {
    /// Shorthand for an [`Error::InvalidParameter`] with the given reason.
    pub(crate) fn invalid_parameter(reason: impl Into<String>) -> Self {
        Error::InvalidParameter { reason: reason.into() }
    }

    /// Shorthand for an [`Error::CorruptData`] with the given reason.
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptData { reason: reason.into() }
    }
}
