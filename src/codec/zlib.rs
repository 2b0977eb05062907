//! DEFLATE codecs over incremental zlib streams.
//!
//! The stream format is *raw* DEFLATE (no zlib header or trailer), so
//! the codec keeps its own CRC32 over plaintext and the engine's adler
//! checksum is unused. Dictionary state persists across messages on the
//! same stream: each message is a run of blocks ended by a sync flush,
//! and the transport appends the codec's checksum after the flush.
//!
//! The window size is 2^15 (the engine's maximum and its default for
//! raw streams).

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::trace;

use super::{write_raw, Checksum, Codec, Mode};
use crate::buf::{ReadBuf, WriteBuf};
use crate::error::{Error, Result};

/// Room left for flush bytes when feeding a constrained chunk.
const FLUSH_HEADROOM: usize = 12;

/// Stop the guarded flush loop when this little output room remains;
/// the caller refills the buffer and writes again.
const STOP_AT_OUTPUT_SIZE: usize = 100;

/// Worst-case deflate output for `len` input bytes (zlib's documented
/// bound), used to decide when a sync flush is guaranteed to terminate.
fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

/// Streaming raw-DEFLATE compressor.
pub struct Deflater {
    compress: Compress,
    checksum: Checksum,
}

impl Deflater {
    /// A compressor at the default level.
    pub fn new() -> Deflater {
        Deflater::with_level(Compression::default())
    }

    /// A compressor at the given level.
    pub fn with_level(level: Compression) -> Deflater {
        Deflater { compress: Compress::new(level, false), checksum: Checksum::new() }
    }

    /// One engine call: feeds at most `max_input` bytes, advances both
    /// cursors, and folds the consumed plaintext into the checksum.
    fn run(
        &mut self,
        input: &mut ReadBuf<'_>,
        output: &mut WriteBuf<'_>,
        flush: FlushCompress,
        max_input: usize,
    ) -> Result<()> {
        let take = input.len().min(max_input);
        let chunk = &input.as_slice()[..take];

        let before_in = self.compress.total_in();
        let before_out = self.compress.total_out();
        let status = self
            .compress
            .compress(chunk, output.as_mut_slice(), flush)
            .map_err(|e| Error::corrupt(format!("deflate error: {e}")))?;
        let consumed = (self.compress.total_in() - before_in) as usize;
        let produced = (self.compress.total_out() - before_out) as usize;
        trace!(target: "zip", consumed, produced, ?status, "deflate");

        self.checksum.add(&input.as_slice()[..consumed]);
        input.move_start(consumed);
        output.move_start(produced);
        Ok(())
    }

    /// The guarded sync flush.
    ///
    /// Naively requesting a sync flush into a too-small output buffer
    /// can leave bits buffered in the engine even though the caller was
    /// promised a flush, silently splitting a message across the next
    /// write. So: while the output cannot provably hold the whole
    /// remainder, feed conservative chunks without flushing; once it
    /// can, sync-flush the rest. If the loop ends without a sync flush
    /// having happened, issue one more zero-input sync flush to push the
    /// buffered state out.
    fn write_and_flush(&mut self, input: &mut ReadBuf<'_>, output: &mut WriteBuf<'_>) -> Result<()> {
        let mut mode = FlushCompress::Partial;
        while !input.is_empty() {
            if output.len() >= deflate_bound(input.len()) {
                // The whole remainder fits: flush for real.
                mode = FlushCompress::Sync;
                self.run(input, output, FlushCompress::Sync, usize::MAX)?;
            } else {
                // Feed only what the remaining room can safely absorb,
                // keeping headroom for flush bytes.
                let max_input = output.len().saturating_sub(FLUSH_HEADROOM);
                self.run(input, output, mode, max_input)?;
            }
            if output.len() <= STOP_AT_OUTPUT_SIZE {
                break;
            }
        }

        if !matches!(mode, FlushCompress::Sync) {
            // No sync flush happened above; push buffered state now.
            self.run(input, output, FlushCompress::Sync, 0)?;
        }
        Ok(())
    }
}

impl Default for Deflater {
    fn default() -> Self {
        Deflater::new()
    }
}

impl Codec for Deflater {
    fn write(
        &mut self,
        input: &mut ReadBuf<'_>,
        output: &mut WriteBuf<'_>,
        mode: Mode,
    ) -> Result<()> {
        trace!(target: "zip", input = input.len(), room = output.len(), ?mode, "compress");
        match mode {
            Mode::Raw => {
                write_raw(&mut self.checksum, input, output);
                Ok(())
            }
            Mode::NoFlush => self.run(input, output, FlushCompress::None, usize::MAX),
            Mode::PartialFlush => self.run(input, output, FlushCompress::Partial, usize::MAX),
            Mode::SyncFlush => self.write_and_flush(input, output),
        }
    }

    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

/// Streaming raw-DEFLATE decompressor.
pub struct Inflater {
    decompress: Decompress,
    checksum: Checksum,
}

impl Inflater {
    /// A decompressor for raw DEFLATE streams.
    pub fn new() -> Inflater {
        Inflater { decompress: Decompress::new(false), checksum: Checksum::new() }
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Inflater::new()
    }
}

impl Codec for Inflater {
    fn write(
        &mut self,
        input: &mut ReadBuf<'_>,
        output: &mut WriteBuf<'_>,
        mode: Mode,
    ) -> Result<()> {
        if mode == Mode::Raw {
            write_raw(&mut self.checksum, input, output);
            return Ok(());
        }
        trace!(target: "zip", input = input.len(), room = output.len(), ?mode, "decompress");

        let flush = match mode {
            Mode::NoFlush => FlushDecompress::None,
            _ => FlushDecompress::Sync,
        };
        let before_in = self.decompress.total_in();
        let before_out = self.decompress.total_out();
        let status = self
            .decompress
            .decompress(input.as_slice(), output.as_mut_slice(), flush)
            .map_err(|e| Error::corrupt(format!("inflate error: {e}")))?;
        let consumed = (self.decompress.total_in() - before_in) as usize;
        let produced = (self.decompress.total_out() - before_out) as usize;
        trace!(target: "zip", consumed, produced, ?status, "inflate");

        // The checksum covers the plaintext *produced*.
        self.checksum.add(&output.as_mut_slice()[..produced]);
        input.move_start(consumed);
        output.move_start(produced);

        match status {
            Status::Ok | Status::BufError | Status::StreamEnd => Ok(()),
        }
    }

    fn checksum(&self) -> &Checksum {
        &self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Compresses `plaintext` as one sync-flushed message, returning the
    /// produced bytes.
    fn deflate_to_vec(deflater: &mut Deflater, plaintext: &[u8]) -> Vec<u8> {
        let mut storage = vec![0u8; deflate_bound(plaintext.len()) + 64];
        let capacity = storage.len();
        let produced = {
            let mut input = ReadBuf::new(plaintext);
            let mut output = WriteBuf::new(&mut storage);
            deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            assert!(input.is_empty(), "sync flush must consume all input");
            capacity - output.len()
        };
        storage.truncate(produced);
        storage
    }

    /// Decompresses one message's worth of bytes.
    fn inflate_to_vec(inflater: &mut Inflater, compressed: &[u8], max_len: usize) -> Vec<u8> {
        let mut storage = vec![0u8; max_len];
        let produced = {
            let mut input = ReadBuf::new(compressed);
            let mut output = WriteBuf::new(&mut storage);
            inflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            assert!(input.is_empty(), "decoder must consume the whole message");
            max_len - output.len()
        };
        storage.truncate(produced);
        storage
    }

    #[test]
    fn test_roundtrip_with_checksums() {
        let plaintext = b"Hello, BLIP!";
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        let compressed = deflate_to_vec(&mut deflater, plaintext);
        let decoded = inflate_to_vec(&mut inflater, &compressed, 256);

        assert_eq!(decoded, plaintext);
        assert_eq!(deflater.checksum().value(), inflater.checksum().value());
        assert_eq!(deflater.unflushed_bytes(), 0);
    }

    #[test]
    fn test_checksum_frames_across_transport() {
        let plaintext = b"framed message body";
        let mut deflater = Deflater::new();
        let mut inflater = Inflater::new();

        // Sender: compressed message, then the 4-byte checksum frame.
        let mut message = deflate_to_vec(&mut deflater, plaintext);
        let mut frame = [0u8; 4];
        {
            let mut out = WriteBuf::new(&mut frame);
            deflater.write_checksum(&mut out);
        }
        message.extend_from_slice(&frame);

        // Receiver: decode the body, then verify the trailer.
        let (body, trailer) = message.split_at(message.len() - 4);
        let decoded = inflate_to_vec(&mut inflater, body, 256);
        assert_eq!(decoded, plaintext);
        let mut trailer_buf = ReadBuf::new(trailer);
        inflater.read_and_verify_checksum(&mut trailer_buf).unwrap();
    }

    #[test]
    fn test_small_output_buffer_flush_loop() {
        // Sizable input, tiny output buffers: the guarded loop stops
        // early, the caller refills, and the final write still ends with
        // a real sync flush.
        let plaintext: Vec<u8> = (0..32_768u32).map(|i| (i % 251) as u8).collect();
        let mut deflater = Deflater::new();
        let mut compressed = Vec::new();

        let mut input = ReadBuf::new(&plaintext);
        loop {
            let mut chunk = [0u8; 256];
            let produced = {
                let mut output = WriteBuf::new(&mut chunk);
                deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
                256 - output.len()
            };
            compressed.extend_from_slice(&chunk[..produced]);
            if input.is_empty() && produced < 256 {
                break;
            }
        }

        let mut inflater = Inflater::new();
        let decoded = inflate_to_vec(&mut inflater, &compressed, plaintext.len() + 16);
        assert_eq!(decoded, plaintext);
        assert_eq!(deflater.checksum().value(), inflater.checksum().value());
    }

    #[test]
    fn test_split_compressed_stream_decodes_identically() {
        let plaintext = b"split me at every boundary and I still decode";
        let mut deflater = Deflater::new();
        let compressed = deflate_to_vec(&mut deflater, plaintext);

        for split in 0..=compressed.len() {
            let mut inflater = Inflater::new();
            let mut decoded = Vec::new();
            for part in [&compressed[..split], &compressed[split..]] {
                let mut storage = [0u8; 256];
                let produced = {
                    let mut input = ReadBuf::new(part);
                    let mut output = WriteBuf::new(&mut storage);
                    inflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
                    assert!(input.is_empty());
                    256 - output.len()
                };
                decoded.extend_from_slice(&storage[..produced]);
            }
            assert_eq!(decoded, plaintext, "split at byte {split}");
        }
    }

    #[test]
    fn test_raw_mode_passthrough() {
        let mut deflater = Deflater::new();
        let mut storage = [0u8; 16];
        let mut input = ReadBuf::new(b"uncompressed");
        let mut output = WriteBuf::new(&mut storage);
        deflater.write(&mut input, &mut output, Mode::Raw).unwrap();
        assert!(input.is_empty());
        assert_eq!(&storage[..12], b"uncompressed");
        assert_eq!(deflater.checksum().value(), crc32fast::hash(b"uncompressed"));
    }

    #[test]
    fn test_empty_sync_flush_emits_marker() {
        // A sync flush with no input still emits the empty-block marker,
        // so a decoder waiting on a message boundary can proceed.
        let mut deflater = Deflater::new();
        let mut storage = [0u8; 16];
        let produced = {
            let mut input = ReadBuf::new(b"");
            let mut output = WriteBuf::new(&mut storage);
            deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            16 - output.len()
        };
        assert!(produced >= 4);
        // A raw-deflate sync flush ends with 00 00 FF FF.
        assert_eq!(&storage[produced - 4..produced], &[0x00, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn test_dictionary_persists_across_messages() {
        // The second message compresses better because the dictionary
        // from the first is still loaded.
        let text: &[u8] = b"the quick brown fox jumps over the lazy dog; \
                            the quick brown fox jumps over the lazy dog";
        let mut deflater = Deflater::new();
        let first = deflate_to_vec(&mut deflater, text);
        let second = deflate_to_vec(&mut deflater, text);
        assert!(second.len() < first.len());

        let mut inflater = Inflater::new();
        assert_eq!(inflate_to_vec(&mut inflater, &first, 256), text);
        assert_eq!(inflate_to_vec(&mut inflater, &second, 256), text);
        assert_eq!(deflater.checksum().value(), inflater.checksum().value());
    }

    #[test]
    fn test_garbage_input_is_corrupt_data() {
        let mut inflater = Inflater::new();
        // An invalid block type right at the start of the stream.
        let garbage = [0x07, 0x13, 0x9C, 0xDE, 0xAD, 0xBE, 0xEF, 0x55, 0xAA, 0xFF];
        let mut storage = [0u8; 64];
        let mut input = ReadBuf::new(&garbage);
        let mut output = WriteBuf::new(&mut storage);
        let result = inflater.write(&mut input, &mut output, Mode::SyncFlush);
        assert!(matches!(result, Err(Error::CorruptData { .. })));
    }

    #[test]
    fn test_no_flush_then_sync() {
        let plaintext = b"buffered without flushing";
        let mut deflater = Deflater::new();
        let mut compressed = Vec::new();

        {
            let mut storage = [0u8; 256];
            let produced = {
                let mut input = ReadBuf::new(plaintext);
                let mut output = WriteBuf::new(&mut storage);
                deflater.write(&mut input, &mut output, Mode::NoFlush).unwrap();
                256 - output.len()
            };
            compressed.extend_from_slice(&storage[..produced]);
        }
        // A later sync flush with no further input delivers the rest.
        {
            let mut storage = [0u8; 256];
            let produced = {
                let mut input = ReadBuf::new(b"");
                let mut output = WriteBuf::new(&mut storage);
                deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
                256 - output.len()
            };
            compressed.extend_from_slice(&storage[..produced]);
        }

        let mut inflater = Inflater::new();
        let decoded = inflate_to_vec(&mut inflater, &compressed, 256);
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn test_deflate_bound_is_generous() {
        for len in [0usize, 1, 100, 4096, 1 << 20] {
            assert!(deflate_bound(len) > len);
        }
    }
}
