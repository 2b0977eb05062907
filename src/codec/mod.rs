//! Streaming codecs for the replication transport.
//!
//! A codec transforms bytes incrementally between an input cursor and an
//! output cursor ([`ReadBuf`]/[`WriteBuf`]), advancing both by exactly
//! what it consumed and produced. Alongside the transform it maintains a
//! CRC32 over the *plaintext* (the bytes consumed when compressing, the
//! bytes produced when decompressing), which the transport frames at
//! message boundaries via [`Codec::write_checksum`] and
//! [`Codec::read_and_verify_checksum`]. The codec itself never injects
//! checksum bytes into the stream.
//!
//! Codec logging goes to the `zip` target.

mod zlib;

pub use zlib::{Deflater, Inflater};

use tracing::trace;

use crate::buf::{ReadBuf, WriteBuf};
use crate::error::{Error, Result};

/// Size of the framed checksum in bytes.
pub const CHECKSUM_SIZE: usize = 4;

/// Write modes, in increasing order of flush strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Copy bytes through without compression (framing or
    /// pre-compressed data). Still folds them into the checksum.
    Raw,
    /// Feed input; emit whatever output the engine naturally produces.
    NoFlush,
    /// Flush to a bit-boundary-safe point without ending the block.
    PartialFlush,
    /// Emit an end-of-block marker so the decoder can produce every byte
    /// fed so far.
    #[default]
    SyncFlush,
}

/// Incremental CRC32 over plaintext bytes.
#[derive(Default)]
pub struct Checksum {
    hasher: crc32fast::Hasher,
}

impl Checksum {
    /// A fresh accumulator (initial value zero).
    pub fn new() -> Checksum {
        Checksum::default()
    }

    /// Folds bytes into the checksum.
    pub fn add(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// The current checksum value.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Writes the checksum, big-endian, into the output cursor.
    ///
    /// # Panics
    ///
    /// Panics unless the output has at least [`CHECKSUM_SIZE`] bytes of
    /// room; the transport sizes its frame buffers to guarantee that.
    pub fn write_to(&self, output: &mut WriteBuf<'_>) {
        let ok = output.write_from(&self.value().to_be_bytes());
        assert!(ok, "no room to write checksum");
    }

    /// Consumes a big-endian checksum from the input cursor and compares
    /// it with the current value.
    pub fn read_and_verify(&self, input: &mut ReadBuf<'_>) -> Result<()> {
        let mut bytes = [0u8; CHECKSUM_SIZE];
        if !input.read_into(&mut bytes) {
            return Err(Error::corrupt("message ends before checksum"));
        }
        if u32::from_be_bytes(bytes) != self.value() {
            return Err(Error::corrupt("invalid checksum"));
        }
        Ok(())
    }
}

/// An incremental byte-stream transformer with a plaintext CRC32.
pub trait Codec {
    /// Reads from `input` and writes transformed bytes to `output`,
    /// advancing both cursors past what was consumed and produced.
    fn write(&mut self, input: &mut ReadBuf<'_>, output: &mut WriteBuf<'_>, mode: Mode)
        -> Result<()>;

    /// Bytes fed to the codec but not yet represented in emitted output.
    /// Engines that cannot report this return 0; the explicit trailing
    /// sync flush still guarantees delivery.
    fn unflushed_bytes(&self) -> usize {
        0
    }

    /// The codec's plaintext checksum accumulator.
    fn checksum(&self) -> &Checksum;

    /// Emits the current checksum into `output` (transport framing).
    fn write_checksum(&self, output: &mut WriteBuf<'_>) {
        self.checksum().write_to(output);
    }

    /// Consumes and verifies a checksum from `input` (transport framing).
    fn read_and_verify_checksum(&self, input: &mut ReadBuf<'_>) -> Result<()> {
        self.checksum().read_and_verify(input)
    }
}

/// Uncompressed write: copies as much input as fits, folding it into the
/// checksum and advancing both cursors.
pub(crate) fn write_raw(checksum: &mut Checksum, input: &mut ReadBuf<'_>, output: &mut WriteBuf<'_>) {
    let n = input.len().min(output.len());
    trace!(target: "zip", bytes = n, "copying without compression");
    checksum.add(&input.as_slice()[..n]);
    output.as_mut_slice()[..n].copy_from_slice(&input.as_slice()[..n]);
    input.move_start(n);
    output.move_start(n);
}
