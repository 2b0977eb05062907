//! Transport-level codec tests: message framing with checksums, stream
//! splits, and mixed raw/compressed traffic.

use vellum::{Codec, Deflater, Inflater, Mode, ReadBuf, WriteBuf, CHECKSUM_SIZE};

/// Compresses one sync-flushed message and appends the sender's
/// checksum frame, the way the transport does.
fn send_message(deflater: &mut Deflater, plaintext: &[u8]) -> Vec<u8> {
    let mut storage = vec![0u8; plaintext.len() + 256];
    let capacity = storage.len();
    let produced = {
        let mut input = ReadBuf::new(plaintext);
        let mut output = WriteBuf::new(&mut storage);
        deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
        assert!(input.is_empty());
        assert_eq!(deflater.unflushed_bytes(), 0);
        deflater.write_checksum(&mut output);
        capacity - output.len()
    };
    storage.truncate(produced);
    storage
}

/// Decodes one framed message and verifies the trailing checksum.
fn receive_message(inflater: &mut Inflater, message: &[u8], max_len: usize) -> Vec<u8> {
    let (body, trailer) = message.split_at(message.len() - CHECKSUM_SIZE);
    let mut storage = vec![0u8; max_len];
    let produced = {
        let mut input = ReadBuf::new(body);
        let mut output = WriteBuf::new(&mut storage);
        inflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
        assert!(input.is_empty());
        max_len - output.len()
    };
    storage.truncate(produced);

    let mut trailer_buf = ReadBuf::new(trailer);
    inflater.read_and_verify_checksum(&mut trailer_buf).unwrap();
    storage
}

/// Deterministic pseudo-random bytes (xorshift), no RNG dependency.
fn pseudo_random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        bytes.extend_from_slice(&seed.to_le_bytes());
    }
    bytes.truncate(len);
    bytes
}

#[test]
fn hello_blip_roundtrip() {
    let plaintext = b"Hello, BLIP!";
    let mut deflater = Deflater::new();
    let mut inflater = Inflater::new();

    let message = send_message(&mut deflater, plaintext);
    let sender_checksum = deflater.checksum().value();

    let decoded = receive_message(&mut inflater, &message, 256);
    assert_eq!(decoded, plaintext);
    assert_eq!(inflater.checksum().value(), sender_checksum);
}

#[test]
fn many_messages_share_one_stream() {
    let mut deflater = Deflater::new();
    let mut inflater = Inflater::new();

    for i in 0..20u32 {
        let plaintext = format!("message number {i}, padded with repetitive text text text");
        let message = send_message(&mut deflater, plaintext.as_bytes());
        let decoded = receive_message(&mut inflater, &message, 512);
        assert_eq!(decoded, plaintext.as_bytes());
        assert_eq!(deflater.checksum().value(), inflater.checksum().value());
    }
}

#[test]
fn split_stream_decodes_identically() {
    // Invariant: for all splits of the compressed stream into two
    // writes, the inflater produces the same plaintext.
    let plaintext = b"boundary-independence is what framing is all about";
    let mut deflater = Deflater::new();
    let message = send_message(&mut deflater, plaintext);
    let body = &message[..message.len() - CHECKSUM_SIZE];

    for split in 0..=body.len() {
        let mut inflater = Inflater::new();
        let mut decoded = Vec::new();
        for part in [&body[..split], &body[split..]] {
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
fn large_incompressible_payload_roundtrips() {
    // Pseudo-random data stresses the bound check in the guarded flush
    // loop: output room must cover worst-case expansion before the
    // final sync flush is attempted.
    let plaintext = pseudo_random_bytes(200_000, 0x5EED_CAFE);
    let mut deflater = Deflater::new();
    let mut inflater = Inflater::new();

    let message = send_message(&mut deflater, &plaintext);
    let decoded = receive_message(&mut inflater, &message, plaintext.len() + 64);
    assert_eq!(decoded, plaintext);
    assert_eq!(deflater.checksum().value(), inflater.checksum().value());
}

#[test]
fn chunked_sender_with_tiny_buffers() {
    // The sender drains a large message through 512-byte output buffers;
    // the receiver sees one continuous stream.
    let plaintext: Vec<u8> = (0..100_000u32).map(|i| (i / 100) as u8).collect();
    let mut deflater = Deflater::new();
    let mut compressed = Vec::new();

    let mut input = ReadBuf::new(&plaintext);
    loop {
        let mut chunk = [0u8; 512];
        let produced = {
            let mut output = WriteBuf::new(&mut chunk);
            deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            512 - output.len()
        };
        compressed.extend_from_slice(&chunk[..produced]);
        if input.is_empty() && produced < 512 {
            break;
        }
    }

    let mut inflater = Inflater::new();
    let mut storage = vec![0u8; plaintext.len() + 64];
    let capacity = storage.len();
    let produced = {
        let mut in_buf = ReadBuf::new(&compressed);
        let mut output = WriteBuf::new(&mut storage);
        inflater.write(&mut in_buf, &mut output, Mode::SyncFlush).unwrap();
        assert!(in_buf.is_empty());
        capacity - output.len()
    };
    storage.truncate(produced);
    assert_eq!(storage, plaintext);
    assert_eq!(deflater.checksum().value(), inflater.checksum().value());
}

#[test]
fn raw_frames_mix_with_compressed() {
    // Framing bytes travel uncompressed but still count toward the
    // checksum on both sides.
    let frame_header = b"\x00\x01\x02";
    let body = b"compressed portion of the message";

    let mut deflater = Deflater::new();
    let mut wire = Vec::new();
    {
        let mut storage = [0u8; 128];
        let produced = {
            let mut input = ReadBuf::new(frame_header);
            let mut output = WriteBuf::new(&mut storage);
            deflater.write(&mut input, &mut output, Mode::Raw).unwrap();
            let mut input = ReadBuf::new(body);
            deflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            128 - output.len()
        };
        wire.extend_from_slice(&storage[..produced]);
    }

    let mut inflater = Inflater::new();
    let mut decoded = Vec::new();
    {
        // The receiver knows the frame layout: 3 raw bytes, then deflate.
        let mut storage = [0u8; 128];
        let raw_len = frame_header.len();
        let produced = {
            let mut input = ReadBuf::new(&wire[..raw_len]);
            let mut output = WriteBuf::new(&mut storage);
            inflater.write(&mut input, &mut output, Mode::Raw).unwrap();
            let mut input = ReadBuf::new(&wire[raw_len..]);
            inflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();
            128 - output.len()
        };
        decoded.extend_from_slice(&storage[..produced]);
    }

    let mut expected = frame_header.to_vec();
    expected.extend_from_slice(body);
    assert_eq!(decoded, expected);
    assert_eq!(deflater.checksum().value(), inflater.checksum().value());
}

#[test]
fn corrupted_message_fails_checksum() {
    let plaintext = b"integrity matters";
    let mut deflater = Deflater::new();
    let message = send_message(&mut deflater, plaintext);

    // Flip a bit in the checksum trailer; the body still decodes, but
    // verification must fail.
    let mut tampered = message.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    let (body, trailer) = tampered.split_at(tampered.len() - CHECKSUM_SIZE);
    let mut inflater = Inflater::new();
    let mut storage = [0u8; 128];
    let mut input = ReadBuf::new(body);
    let mut output = WriteBuf::new(&mut storage);
    inflater.write(&mut input, &mut output, Mode::SyncFlush).unwrap();

    let mut trailer_buf = ReadBuf::new(trailer);
    let err = inflater.read_and_verify_checksum(&mut trailer_buf).unwrap_err();
    assert_eq!(format!("{err}"), "Corrupt data: invalid checksum");
}

#[test]
fn truncated_message_fails_before_checksum() {
    let plaintext = b"short";
    let mut deflater = Deflater::new();
    let message = send_message(&mut deflater, plaintext);

    // Cut the message inside the checksum trailer.
    let cut = &message[message.len() - CHECKSUM_SIZE..message.len() - 2];
    let mut inflater = Inflater::new();
    let mut trailer_buf = ReadBuf::new(cut);
    let err = inflater.read_and_verify_checksum(&mut trailer_buf).unwrap_err();
    assert_eq!(format!("{err}"), "Corrupt data: message ends before checksum");
}
