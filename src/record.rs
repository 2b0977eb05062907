//! Records stored in key stores.
//!
//! A record is an opaque key plus two payloads (`meta` and `body`), a
//! monotonic sequence number, document flags, and, on backends that
//! support it, a stable byte offset for historical reads. Records own
//! their bytes: the engine copies on read, so a record stays valid past
//! the transaction or enumerator step that produced it.

use std::fmt;

/// Monotonic per-store sequence number. Sequence 0 means "not sequenced".
pub type Sequence = u64;

/// Per-record flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct DocFlags(u8);

impl DocFlags {
    /// No flags set.
    pub const NONE: DocFlags = DocFlags(0);
    /// The record is a deletion tombstone.
    pub const DELETED: DocFlags = DocFlags(0x01);

    /// Builds flags from raw bits, dropping unknown ones.
    pub fn from_bits(bits: u8) -> DocFlags {
        DocFlags(bits & Self::DELETED.0)
    }

    /// The raw bit pattern.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// True if all bits of `other` are set in `self`.
    pub fn contains(self, other: DocFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags with all bits of `other` also set.
    pub fn with(self, other: DocFlags) -> DocFlags {
        DocFlags(self.0 | other.0)
    }
}

impl fmt::Debug for DocFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(DocFlags::DELETED) {
            f.write_str("DocFlags(DELETED)")
        } else {
            f.write_str("DocFlags(NONE)")
        }
    }
}

/// How much of a record to materialize when reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentOption {
    /// Key, meta, and body.
    #[default]
    Full,
    /// Key and meta; the body is left empty.
    MetaOnly,
    /// Key only; meta and body are left empty.
    KeyOnly,
}

/// A record read from (or about to be written to) a key store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Opaque key, unique within its store.
    pub key: Vec<u8>,
    /// Small metadata payload (revision info, document flags of higher layers).
    pub meta: Vec<u8>,
    /// Document body.
    pub body: Vec<u8>,
    /// Sequence assigned by the last mutation, 0 if the store is unsequenced.
    pub sequence: Sequence,
    /// Record flags.
    pub flags: DocFlags,
    /// Stable byte offset for historical reads; `None` on backends
    /// without offset-addressable access.
    pub offset: Option<u64>,
}

impl Record {
    /// True if this record is a deletion tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DocFlags::DELETED)
    }
}
