//! PC-side stream decoding and digest verification
//!
//! The serial link interleaves binary frames and ASCII control lines. [`WireReader`]
//! splits them apart: a leading `0xAA` starts a frame, anything else is a line.
//! [`Receiver`] keys each transfer from its `NONCE:` line, decrypts the frames that
//! follow, digests the plaintext, and when the device announces `HASH:<hex>` compares
//! both digests to reach a verdict. Plaintext is streamed chunk by chunk to a
//! [`PlaintextSink`]; nothing but the running digest is kept in memory.

use crate::control::ControlMessage;
use crate::crypto::{
    decode_hex, encode_hex, Aes256CtrCipher, ChunkCipher, ChunkDigest, SessionKeys, Sha256Digest,
    NONCE_LEN,
};
use crate::frame::{peek_byte, FrameDecoder, START_MARKER};
use crate::{Error, Result};
use serde::Serialize;
use std::io::{self, BufRead, ErrorKind};
use tracing::{debug, info, warn};

/// One item on the device → PC link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireItem {
    /// Frame payload (ciphertext)
    Frame(Vec<u8>),
    /// Text line without its terminator
    Line(String),
}

/// Splits a serial byte stream into frames and lines
pub struct WireReader<R: BufRead> {
    inner: R,
    decoder: FrameDecoder,
}

impl<R: BufRead> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::default(),
        }
    }

    /// Require an end marker after every frame
    pub fn strict(mut self) -> Self {
        self.decoder = FrameDecoder::strict();
        self
    }

    /// Next item, or `None` at end of stream
    ///
    /// Frame-local errors (see [`Error::is_frame_local`]) leave the reader usable.
    pub fn next_item(&mut self) -> Result<Option<WireItem>> {
        match peek_byte(&mut self.inner)? {
            None => Ok(None),
            Some(START_MARKER) => self.decoder.decode(&mut self.inner).map(|p| Some(WireItem::Frame(p))),
            Some(_) => {
                let mut raw = Vec::new();
                loop {
                    match self.inner.read_until(b'\n', &mut raw) {
                        Ok(_) => break,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == ErrorKind::TimedOut => return Err(Error::Timeout),
                        Err(e) => return Err(Error::Io(e)),
                    }
                }
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                Ok(Some(WireItem::Line(line)))
            }
        }
    }
}

/// Outcome of checking one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Cut,
}

impl Verdict {
    /// Line the PC sends back to the device
    pub fn reply(&self) -> ControlMessage {
        match self {
            Verdict::Allow => ControlMessage::Allow,
            Verdict::Cut => ControlMessage::Cut,
        }
    }
}

/// A fully received file
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// 1-based count of transfers seen by this receiver
    pub sequence: u32,
    /// Plaintext bytes handed to the sink
    pub bytes: u64,
    pub frames: u32,
    pub expected_hex: String,
    pub computed_hex: String,
    /// A frame was malformed, or the transfer was never announced
    pub corrupt: bool,
    pub verdict: Verdict,
}

/// Something the PC operator should know about
#[derive(Debug, Clone)]
pub enum ReceiverEvent {
    DeviceInserted,
    AuthOk,
    AuthFailed,
    /// `HASH:` line evaluated against the received plaintext
    Verified(ReceivedFile),
    Complete,
    RelayCut,
}

/// Destination for decrypted file contents
///
/// Each transfer sees `begin`, any number of `write` calls, then exactly one of
/// `finish` or `discard`.
pub trait PlaintextSink {
    fn begin(&mut self, sequence: u32) -> io::Result<()>;

    /// Append one decrypted chunk
    fn write(&mut self, plaintext: &[u8]) -> io::Result<()>;

    /// The digest arrived and was checked
    fn finish(&mut self, file: &ReceivedFile) -> io::Result<()>;

    /// The transfer ended before its digest arrived
    fn discard(&mut self) -> io::Result<()>;
}

/// Drops plaintext after digesting it
struct NullSink;

impl PlaintextSink for NullSink {
    fn begin(&mut self, _sequence: u32) -> io::Result<()> {
        Ok(())
    }

    fn write(&mut self, _plaintext: &[u8]) -> io::Result<()> {
        Ok(())
    }

    fn finish(&mut self, _file: &ReceivedFile) -> io::Result<()> {
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct InboundTransfer<C, D> {
    sequence: u32,
    cipher: C,
    digest: D,
    bytes: u64,
    frames: u32,
    corrupt: bool,
}

/// Verifying receiver for one serial link
pub struct Receiver<C = Aes256CtrCipher, D = Sha256Digest> {
    keys: SessionKeys,
    transfer: Option<InboundTransfer<C, D>>,
    transfers: u32,
    sink: Box<dyn PlaintextSink>,
}

impl Receiver {
    pub fn new(keys: SessionKeys) -> Self {
        Self::with_primitives(keys)
    }
}

impl<C: ChunkCipher, D: ChunkDigest> Receiver<C, D> {
    pub fn with_primitives(keys: SessionKeys) -> Self {
        Self {
            keys,
            transfer: None,
            transfers: 0,
            sink: Box::new(NullSink),
        }
    }

    /// Stream decrypted plaintext to `sink`
    pub fn with_sink(mut self, sink: impl PlaintextSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Read items until one produces an event; `None` at end of stream
    pub fn next_event<R: BufRead>(&mut self, reader: &mut WireReader<R>) -> Result<Option<ReceiverEvent>> {
        loop {
            let item = match reader.next_item() {
                Ok(Some(item)) => item,
                Ok(None) => return Ok(None),
                Err(e) if e.is_frame_local() => {
                    self.frame_error(&e)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(event) = self.process(item)? {
                return Ok(Some(event));
            }
        }
    }

    /// Feed one decoded item
    pub fn process(&mut self, item: WireItem) -> Result<Option<ReceiverEvent>> {
        match item {
            WireItem::Frame(ciphertext) => {
                self.on_frame(&ciphertext)?;
                Ok(None)
            }
            WireItem::Line(line) => self.on_line(&line),
        }
    }

    /// Record a malformed frame against the current transfer
    pub fn frame_error(&mut self, err: &Error) -> Result<()> {
        warn!("Malformed frame: {}", err);
        self.current()?.corrupt = true;
        Ok(())
    }

    fn on_frame(&mut self, ciphertext: &[u8]) -> Result<()> {
        let transfer = self.current()?;
        let plaintext = transfer.cipher.update(ciphertext);
        transfer.digest.update(&plaintext);
        transfer.bytes += plaintext.len() as u64;
        transfer.frames += 1;
        debug!("Received frame #{} ({} bytes)", transfer.frames, ciphertext.len());
        self.sink.write(&plaintext)?;
        Ok(())
    }

    fn on_line(&mut self, line: &str) -> Result<Option<ReceiverEvent>> {
        let Some(message) = ControlMessage::parse(line) else {
            if !line.is_empty() {
                debug!("Device text: {}", line);
            }
            return Ok(None);
        };

        let event = match message {
            ControlMessage::UsbInserted => {
                info!("USB inserted");
                self.abandon()?;
                ReceiverEvent::DeviceInserted
            }
            ControlMessage::AuthOk => ReceiverEvent::AuthOk,
            ControlMessage::AuthFail => {
                info!("Operator authentication failed");
                self.abandon()?;
                ReceiverEvent::AuthFailed
            }
            ControlMessage::RelayCut => {
                info!("Relay cut acknowledged");
                self.abandon()?;
                ReceiverEvent::RelayCut
            }
            ControlMessage::Nonce(hex) => {
                self.announce(&hex)?;
                return Ok(None);
            }
            ControlMessage::Hash(expected_hex) => ReceiverEvent::Verified(self.verify(expected_hex)?),
            ControlMessage::StatusComplete => ReceiverEvent::Complete,
            ControlMessage::Allow | ControlMessage::Cut => {
                warn!("Ignoring device-bound command seen on the PC side: {}", line);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    /// Open a transfer keyed by the announced nonce
    fn announce(&mut self, nonce_hex: &str) -> Result<()> {
        let nonce: [u8; NONCE_LEN] = decode_hex(nonce_hex)?
            .try_into()
            .map_err(|raw: Vec<u8>| Error::Hex(format!("nonce of {} bytes", raw.len())))?;
        self.abandon()?;
        let cipher = self.keys.for_transfer(&nonce).cipher()?;
        let transfer = self.start(cipher, false)?;
        debug!("Transfer #{} announced", transfer.sequence);
        self.transfer = Some(transfer);
        Ok(())
    }

    fn start(&mut self, cipher: C, corrupt: bool) -> Result<InboundTransfer<C, D>> {
        self.transfers += 1;
        self.sink.begin(self.transfers)?;
        Ok(InboundTransfer {
            sequence: self.transfers,
            cipher,
            digest: D::init(),
            bytes: 0,
            frames: 0,
            corrupt,
        })
    }

    /// Data arrived outside an announced transfer; it can only be rejected
    fn unannounced(&mut self) -> Result<InboundTransfer<C, D>> {
        warn!("Device data without a NONCE announcement");
        let cipher = self.keys.cipher()?;
        self.start(cipher, true)
    }

    /// Drop an unfinished transfer
    fn abandon(&mut self) -> Result<()> {
        if let Some(transfer) = self.transfer.take() {
            debug!(
                "Discarding transfer #{} after {} frame(s)",
                transfer.sequence, transfer.frames
            );
            transfer.cipher.finalize();
            self.sink.discard()?;
        }
        Ok(())
    }

    fn verify(&mut self, expected_hex: String) -> Result<ReceivedFile> {
        let transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => self.unannounced()?,
        };
        transfer.cipher.finalize();
        let computed_hex = encode_hex(&transfer.digest.finalize());

        let verdict = if transfer.corrupt || computed_hex != expected_hex {
            Verdict::Cut
        } else {
            Verdict::Allow
        };

        if verdict == Verdict::Cut {
            warn!(
                "Transfer #{} rejected: expected {}, computed {}, corrupt {}",
                transfer.sequence, expected_hex, computed_hex, transfer.corrupt
            );
        } else {
            info!("Transfer #{} verified ({} bytes)", transfer.sequence, transfer.bytes);
        }

        let file = ReceivedFile {
            sequence: transfer.sequence,
            bytes: transfer.bytes,
            frames: transfer.frames,
            expected_hex,
            computed_hex,
            corrupt: transfer.corrupt,
            verdict,
        };
        self.sink.finish(&file)?;
        Ok(file)
    }

    fn current(&mut self) -> Result<&mut InboundTransfer<C, D>> {
        let transfer = match self.transfer.take() {
            Some(transfer) => transfer,
            None => self.unannounced()?,
        };
        Ok(self.transfer.insert(transfer))
    }
}
