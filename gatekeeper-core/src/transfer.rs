// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Chunked encrypt-digest-frame pipeline
//!
//! Each transfer draws a fresh nonce and announces it as `NONCE:<hex>` before any
//! frame; the cipher runs under the keys derived from it. Then, for each chunk of at
//! most `chunk_size` bytes read from the file source:
//! 1. encrypt it with the cipher context
//! 2. feed the plaintext into the digest context
//! 3. frame the ciphertext and write the frame to the serial port
//!
//! After the last chunk the digest is finalized and `HASH:<hex>` followed by
//! `STATUS:COMPLETE` is written. Any read or write error aborts the transfer
//! without a completion status. A chunk is framed only once it is complete.

use crate::control::ControlMessage;
use crate::crypto::{
    encode_hex, transfer_nonce, Aes256CtrCipher, ChunkCipher, ChunkDigest, SessionKeys,
    Sha256Digest,
};
use crate::frame::FrameEncoder;
use crate::hal::SerialPort;
use crate::{Error, Result, CHUNK_SIZE};
use std::io::{ErrorKind, Read};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// Summary of one completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Plaintext bytes read from the source
    pub bytes: u64,
    /// Frames written
    pub frames: u32,
    /// Lowercase hex of the plaintext digest
    pub digest_hex: String,
    pub elapsed: Duration,
}

/// Transfer pipeline, generic over the primitive contract
pub struct TransferPipeline<C = Aes256CtrCipher, D = Sha256Digest> {
    keys: SessionKeys,
    encoder: FrameEncoder,
    chunk_size: usize,
    _primitives: PhantomData<fn() -> (C, D)>,
}

impl TransferPipeline {
    /// Pipeline using AES-256-CTR and SHA-256
    pub fn new(keys: SessionKeys) -> Self {
        Self::with_primitives(keys)
    }
}

impl<C: ChunkCipher, D: ChunkDigest> TransferPipeline<C, D> {
    /// Pipeline using caller-chosen primitives
    pub fn with_primitives(keys: SessionKeys) -> Self {
        Self {
            keys,
            encoder: FrameEncoder::new(true),
            chunk_size: CHUNK_SIZE,
            _primitives: PhantomData,
        }
    }

    /// Set the chunk size (1..=CHUNK_SIZE)
    pub fn chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size > CHUNK_SIZE {
            return Err(Error::PayloadTooLarge {
                len: chunk_size,
                max: CHUNK_SIZE,
            });
        }
        self.chunk_size = chunk_size;
        Ok(self)
    }

    /// Choose whether frames carry the trailing end marker
    pub fn end_marker(mut self, enabled: bool) -> Self {
        self.encoder = FrameEncoder::new(enabled);
        self
    }

    /// Stream the whole source to the serial port
    #[instrument(skip_all, fields(chunk_size = self.chunk_size))]
    pub fn run(&self, source: &mut dyn Read, serial: &mut dyn SerialPort) -> Result<TransferReport> {
        let started = Instant::now();
        let nonce = transfer_nonce();
        let mut cipher: C = self.keys.for_transfer(&nonce).cipher()?;
        let mut digest = D::init();
        serial.write(ControlMessage::nonce(&nonce).to_line().as_bytes())?;

        let mut chunk = vec![0u8; self.chunk_size];
        let mut bytes = 0u64;
        let mut frames = 0u32;

        loop {
            let filled = fill_chunk(source, &mut chunk)?;
            if filled == 0 {
                break;
            }
            let plaintext = &chunk[..filled];

            let ciphertext = cipher.update(plaintext);
            digest.update(plaintext);
            let frame = self.encoder.encode(&ciphertext)?;
            serial.write(&frame)?;

            frames += 1;
            bytes += filled as u64;
            debug!("Sent frame #{} ({} bytes)", frames, filled);

            if filled < chunk.len() {
                break;
            }
        }
        cipher.finalize();

        let digest_hex = encode_hex(&digest.finalize());
        let hash = ControlMessage::Hash(digest_hex.clone());
        serial.write(hash.to_line().as_bytes())?;
        serial.write(ControlMessage::StatusComplete.to_line().as_bytes())?;

        let report = TransferReport {
            bytes,
            frames,
            digest_hex,
            elapsed: started.elapsed(),
        };
        info!(
            "Transfer complete: {} bytes in {} frames ({:?})",
            report.bytes, report.frames, report.elapsed
        );
        Ok(report)
    }
}

/// Read until `chunk` is full or the source is exhausted
fn fill_chunk(source: &mut dyn Read, chunk: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < chunk.len() {
        match source.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(filled)
}
