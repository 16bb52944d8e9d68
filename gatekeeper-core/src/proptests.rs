//! Property-based tests for gatekeeper-core
//!
//! These tests verify the framing and streaming-primitive properties using proptest.

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use std::io::Cursor;

    use crate::bench::{MemorySerial, MemorySink};
    use crate::crypto::{Aes256CtrCipher, ChunkCipher, ChunkDigest, SessionKeys, Sha256Digest};
    use crate::frame::{decode_frame, encode_frame, FrameDecoder, FrameEncoder};
    use crate::receiver::{Receiver, Verdict, WireReader};
    use crate::transfer::TransferPipeline;
    use crate::{Error, CHUNK_SIZE};

    fn digest_of(parts: &[&[u8]]) -> Vec<u8> {
        let mut digest = Sha256Digest::init();
        for part in parts {
            digest.update(part);
        }
        digest.finalize()
    }

    // Any payload within the chunk bound survives encode/decode, with or
    // without the end marker.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_frame_round_trip(
            payload in prop::collection::vec(any::<u8>(), 0..=CHUNK_SIZE),
            end_marker in any::<bool>()
        ) {
            let wire = FrameEncoder::new(end_marker).encode(&payload).unwrap();
            let decoded = FrameDecoder::default().decode(&mut Cursor::new(wire.to_vec())).unwrap();
            prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn test_plain_frame_round_trip(payload in prop::collection::vec(any::<u8>(), 0..=CHUNK_SIZE)) {
            let wire = encode_frame(&payload).unwrap();
            prop_assert_eq!(decode_frame(&mut Cursor::new(wire.to_vec())).unwrap(), payload);
        }

        #[test]
        fn test_oversize_payload_rejected(len in (CHUNK_SIZE + 1)..(3 * CHUNK_SIZE)) {
            let payload = vec![0u8; len];
            let result = encode_frame(&payload);
            prop_assert!(
                matches!(result, Err(Error::PayloadTooLarge { len: l, max }) if l == len && max == CHUNK_SIZE),
                "expected PayloadTooLarge error"
            );
        }
    }

    // Encrypting chunk by chunk equals encrypting the whole message at once.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_chunked_cipher_matches_one_shot(
            key in any::<[u8; 32]>(),
            iv in any::<[u8; 16]>(),
            message in prop::collection::vec(any::<u8>(), 0..3000),
            cuts in prop::collection::vec(0usize..3000, 0..8)
        ) {
            let mut one_shot = Aes256CtrCipher::init(&key, &iv).unwrap();
            let expected = one_shot.update(&message);

            let mut bounds: Vec<usize> = cuts.into_iter().map(|c| c.min(message.len())).collect();
            bounds.push(0);
            bounds.push(message.len());
            bounds.sort_unstable();

            let mut chunked = Aes256CtrCipher::init(&key, &iv).unwrap();
            let mut actual = Vec::with_capacity(message.len());
            for pair in bounds.windows(2) {
                let chunk = &message[pair[0]..pair[1]];
                let out = chunked.update(chunk);
                prop_assert_eq!(out.len(), chunk.len());
                actual.extend_from_slice(&out);
            }
            chunked.finalize();

            prop_assert_eq!(actual, expected);
        }

        #[test]
        fn test_digest_is_order_sensitive(
            a in prop::collection::vec(any::<u8>(), 1..256),
            b in prop::collection::vec(any::<u8>(), 1..256)
        ) {
            // "x" + "xx" and "xx" + "x" are the same byte stream
            prop_assume!([a.as_slice(), b.as_slice()].concat() != [b.as_slice(), a.as_slice()].concat());
            prop_assert_ne!(digest_of(&[&a, &b]), digest_of(&[&b, &a]));
        }

        #[test]
        fn test_digest_ignores_chunk_boundaries(
            message in prop::collection::vec(any::<u8>(), 0..2000),
            split in 0usize..2000
        ) {
            let split = split.min(message.len());
            let (head, tail) = message.split_at(split);
            prop_assert_eq!(digest_of(&[head, tail]), digest_of(&[&message]));
        }
    }

    // Whatever the device sends, a receiver holding the same keys accepts it.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_receiver_accepts_pipeline_output(
            data in prop::collection::vec(any::<u8>(), 0..10_000),
            chunk_size in 1usize..=CHUNK_SIZE
        ) {
            let keys = SessionKeys::new(&[5u8; 32], &[6u8; 16]).unwrap();
            let serial = MemorySerial::new();
            let mut port = serial.clone();
            let report = TransferPipeline::new(keys.clone())
                .chunk_size(chunk_size)
                .unwrap()
                .run(&mut Cursor::new(data.clone()), &mut port)
                .unwrap();

            let sink = MemorySink::new();
            let mut reader = WireReader::new(Cursor::new(serial.sent()));
            let mut receiver = Receiver::new(keys).with_sink(sink.clone());
            while receiver.next_event(&mut reader).unwrap().is_some() {}

            let mut files = sink.files();
            prop_assert_eq!(files.len(), 1);
            let (file, plaintext) = files.remove(0);
            prop_assert_eq!(file.verdict, Verdict::Allow);
            prop_assert_eq!(file.frames, report.frames);
            prop_assert_eq!(plaintext, data);
        }
    }
}
