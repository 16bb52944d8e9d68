// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Binary chunk framing on the serial link
//!
//! Wire format:
//! ```text
//! [0]        0xAA start marker
//! [1..4]     u32 big-endian payload length N (N <= 4096)
//! [5..4+N]   N bytes of ciphertext
//! [5+N]      0x55 end marker (optional)
//! ```
//!
//! The end marker is optional on the wire. When the byte after a payload is not
//! `0x55`, it is accepted as "marker absent" only if it can begin the next item on
//! the link: another start marker or an uppercase ASCII control line. Anything else
//! is a framing error local to that frame.
//!
//! This only works because every control line starts with an uppercase letter. An
//! unmarked frame followed by lowercase text, digits or `\r\n` is reported as a
//! framing error even though the payload was intact. The firmware emits the marker
//! by default (`GATEKEEPER_EMIT_END_MARKER`); turn it off only for peers whose
//! next output is always a frame or a control line.

use crate::{Error, Result, CHUNK_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{BufRead, ErrorKind, Read};

/// Frame start marker
pub const START_MARKER: u8 = 0xAA;

/// Optional frame end marker
pub const END_MARKER: u8 = 0x55;

/// Start marker plus length header
pub const HEADER_LEN: usize = 5;

/// Encode one payload without end marker
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    FrameEncoder::new(false).encode(payload)
}

/// Decode one frame from a buffered byte stream
pub fn decode_frame<R: BufRead + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    FrameDecoder::default().decode(reader)
}

/// Frame encoder
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    end_marker: bool,
}

impl FrameEncoder {
    /// Create an encoder, optionally appending the `0x55` end marker
    pub fn new(end_marker: bool) -> Self {
        Self { end_marker }
    }

    /// Bytes on the wire for a payload of `len` bytes
    pub fn encoded_len(&self, len: usize) -> usize {
        HEADER_LEN + len + usize::from(self.end_marker)
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > CHUNK_SIZE {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max: CHUNK_SIZE,
            });
        }

        let mut wire = BytesMut::with_capacity(self.encoded_len(payload.len()));
        wire.put_u8(START_MARKER);
        // Bounded by CHUNK_SIZE above
        wire.put_u32(payload.len() as u32);
        wire.put_slice(payload);
        if self.end_marker {
            wire.put_u8(END_MARKER);
        }
        Ok(wire.freeze())
    }
}

/// Frame decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder {
    /// Require the end marker after every payload
    strict_end_marker: bool,
}

impl FrameDecoder {
    /// Decoder that rejects frames without an end marker
    pub fn strict() -> Self {
        Self {
            strict_end_marker: true,
        }
    }

    pub fn decode<R: BufRead + ?Sized>(&self, reader: &mut R) -> Result<Vec<u8>> {
        let mut marker = [0u8; 1];
        read_fully(reader, &mut marker)?;
        if marker[0] != START_MARKER {
            return Err(Error::Framing {
                expected: START_MARKER,
                found: marker[0],
            });
        }

        let mut header = [0u8; 4];
        read_fully(reader, &mut header)?;
        let length = u32::from_be_bytes(header);
        if length as usize > CHUNK_SIZE {
            return Err(Error::LengthOutOfRange(length));
        }

        let mut payload = vec![0u8; length as usize];
        read_fully(reader, &mut payload)?;

        self.consume_end_marker(reader)?;
        Ok(payload)
    }

    /// Consume the end marker, or decide it was left out
    ///
    /// Lenient mode treats `0xAA` or an uppercase ASCII byte as the start of the
    /// next item. Any other byte is taken as a corrupt marker and consumed.
    fn consume_end_marker<R: BufRead + ?Sized>(&self, reader: &mut R) -> Result<()> {
        let next = match peek_byte(reader)? {
            Some(byte) => byte,
            None if self.strict_end_marker => {
                return Err(Error::Truncated {
                    expected: 1,
                    received: 0,
                })
            }
            None => return Ok(()),
        };

        if next == END_MARKER {
            reader.consume(1);
            return Ok(());
        }

        if !self.strict_end_marker && (next == START_MARKER || next.is_ascii_uppercase()) {
            return Ok(());
        }

        // Consume the bad byte so the caller can resynchronise on what follows
        reader.consume(1);
        Err(Error::Framing {
            expected: END_MARKER,
            found: next,
        })
    }
}

/// Look at the next byte without consuming it
pub(crate) fn peek_byte<R: BufRead + ?Sized>(reader: &mut R) -> Result<Option<u8>> {
    loop {
        match reader.fill_buf() {
            Ok(buf) => return Ok(buf.first().copied()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_read_error(e)),
        }
    }
}

/// Fill `buf` completely, mapping short reads to `Truncated` and stalls to `Timeout`
pub(crate) fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(Error::Truncated {
                    expected: buf.len(),
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_read_error(e)),
        }
    }
    Ok(())
}

fn map_read_error(e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout,
        _ => Error::Io(e),
    }
}
