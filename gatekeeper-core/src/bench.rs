//! Bench adapters for running the gatekeeper without hardware
//!
//! Each adapter implements one [`crate::hal`] trait, or the receiver's
//! [`PlaintextSink`]. Handles are cheap to clone and
//! share their state, so a test can keep one handle for inspection while the
//! controller owns another.

use crate::frame::{HEADER_LEN, START_MARKER};
use crate::hal::{Authenticator, FileSource, RelayActuator, RelayState, Scanner, SerialPort, UsbMonitor};
use crate::receiver::{PlaintextSink, ReceivedFile};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Cursor, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Relay that records every actuation
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<Mutex<RelayLog>>,
}

#[derive(Default)]
struct RelayLog {
    state: RelayState,
    history: Vec<RelayState>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every actuation in order
    pub fn history(&self) -> Vec<RelayState> {
        self.inner.lock().history.clone()
    }

    pub fn current(&self) -> RelayState {
        self.inner.lock().state
    }

    fn set(&self, state: RelayState) {
        let mut log = self.inner.lock();
        log.state = state;
        log.history.push(state);
    }
}

impl RelayActuator for MemoryRelay {
    fn allow(&mut self) {
        self.set(RelayState::Connected);
    }

    fn cut(&mut self) {
        self.set(RelayState::Disconnected);
    }

    fn state(&self) -> RelayState {
        self.current()
    }
}

/// USB presence driven by a script, then by the last value set
#[derive(Clone, Default)]
pub struct ScriptedUsb {
    inner: Arc<Mutex<UsbScript>>,
}

#[derive(Default)]
struct UsbScript {
    script: VecDeque<bool>,
    present: bool,
}

impl ScriptedUsb {
    /// Presence reported by successive polls; the final value sticks
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        let script: VecDeque<bool> = script.into_iter().collect();
        Self {
            inner: Arc::new(Mutex::new(UsbScript {
                present: script.back().copied().unwrap_or(false),
                script,
            })),
        }
    }

    pub fn present() -> Self {
        Self::new([true])
    }

    pub fn absent() -> Self {
        Self::new([false])
    }

    /// Override presence from now on
    pub fn set_present(&self, present: bool) {
        let mut inner = self.inner.lock();
        inner.script.clear();
        inner.present = present;
    }
}

impl UsbMonitor for ScriptedUsb {
    fn device_present(&mut self) -> bool {
        let mut inner = self.inner.lock();
        match inner.script.pop_front() {
            Some(present) => present,
            None => inner.present,
        }
    }
}

/// Device is "present" while a path exists on disk
pub struct PathPresence {
    path: PathBuf,
}

impl PathPresence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UsbMonitor for PathPresence {
    fn device_present(&mut self) -> bool {
        self.path.exists()
    }
}

/// Authenticator with a fixed verdict
#[derive(Clone)]
pub struct FixedAuthenticator {
    verdict: bool,
    calls: Arc<AtomicUsize>,
}

impl FixedAuthenticator {
    pub fn new(verdict: bool) -> Self {
        Self {
            verdict,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Authenticator for FixedAuthenticator {
    fn authenticate(&mut self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
    }
}

/// Scanner with a fixed verdict
#[derive(Clone)]
pub struct StaticScanner {
    threat: bool,
    scans: Arc<AtomicUsize>,
}

impl StaticScanner {
    pub fn clean() -> Self {
        Self::new(false)
    }

    pub fn infected() -> Self {
        Self::new(true)
    }

    fn new(threat: bool) -> Self {
        Self {
            threat,
            scans: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl Scanner for StaticScanner {
    fn scan(&mut self, _source: &mut dyn FileSource) -> Result<bool> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.threat)
    }
}

/// Flags a file containing any of a set of byte patterns
pub struct PatternScanner {
    patterns: Vec<Vec<u8>>,
}

impl PatternScanner {
    pub fn new(patterns: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            patterns: patterns.into_iter().filter(|p| !p.is_empty()).collect(),
        }
    }

    fn longest(&self) -> usize {
        self.patterns.iter().map(Vec::len).max().unwrap_or(0)
    }
}

impl Scanner for PatternScanner {
    fn scan(&mut self, source: &mut dyn FileSource) -> Result<bool> {
        let keep = self.longest().saturating_sub(1);
        let name = source.name().to_string();
        let mut reader = source.open()?;
        let mut window: Vec<u8> = Vec::new();
        let mut buf = [0u8; 4096];

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            window.extend_from_slice(&buf[..n]);

            for pattern in &self.patterns {
                if window.windows(pattern.len()).any(|w| w == pattern.as_slice()) {
                    debug!("Pattern match in {}", name);
                    return Ok(true);
                }
            }

            // Carry the tail so patterns spanning reads are still found
            let excess = window.len().saturating_sub(keep);
            window.drain(..excess);
        }
    }
}

/// Inbound byte queue shared by the serial adapters
#[derive(Default)]
struct Inbound {
    bytes: VecDeque<u8>,
}

impl Inbound {
    fn push(&mut self, data: &[u8]) {
        self.bytes.extend(data);
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=end).collect();
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(&['\r', '\n'][..])
                .to_string(),
        )
    }

    fn take_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.bytes.is_empty() {
            return Err(Error::Timeout);
        }
        if self.bytes.len() < n {
            let received = self.bytes.len();
            self.bytes.clear();
            return Err(Error::Truncated {
                expected: n,
                received,
            });
        }
        Ok(self.bytes.drain(..n).collect())
    }
}

/// In-memory UART with optional write-failure injection
#[derive(Clone, Default)]
pub struct MemorySerial {
    inner: Arc<Mutex<SerialInner>>,
}

#[derive(Default)]
struct SerialInner {
    sent: Vec<u8>,
    inbound: Inbound,
    frames_written: usize,
    fail_on_frame: Option<usize>,
}

impl MemorySerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the write of the n-th frame (1-based)
    pub fn fail_on_frame(self, n: usize) -> Self {
        self.inner.lock().fail_on_frame = Some(n);
        self
    }

    /// Queue a PC → device line; the newline is added
    pub fn push_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        inner.inbound.push(line.as_bytes());
        inner.inbound.push(b"\n");
    }

    /// Queue raw PC → device bytes
    pub fn push_bytes(&self, bytes: &[u8]) {
        self.inner.lock().inbound.push(bytes);
    }

    /// Everything written so far
    pub fn sent(&self) -> Vec<u8> {
        self.inner.lock().sent.clone()
    }
}

impl SerialPort for MemorySerial {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if bytes.len() >= HEADER_LEN && bytes[0] == START_MARKER {
            inner.frames_written += 1;
            if inner.fail_on_frame == Some(inner.frames_written) {
                return Err(Error::Io(std::io::Error::new(
                    ErrorKind::BrokenPipe,
                    "injected UART failure",
                )));
            }
        }
        inner.sent.extend_from_slice(bytes);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.inner.lock().inbound.take_line())
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        self.inner.lock().inbound.take_exact(n)
    }
}

/// UART that writes to any sink and replays a fixed set of inbound commands
pub struct CaptureSerial<W: Write> {
    out: W,
    inbound: Inbound,
}

impl<W: Write> CaptureSerial<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            inbound: Inbound::default(),
        }
    }

    /// Preload PC → device bytes (usually newline-separated commands)
    pub fn with_inbound(mut self, bytes: &[u8]) -> Self {
        self.inbound.push(bytes);
        self
    }
}

impl<W: Write> SerialPort for CaptureSerial<W> {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.out.write_all(bytes)?;
        self.out.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.inbound.take_line())
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        self.inbound.take_exact(n)
    }
}

/// Receiver sink that keeps finished files in memory
#[derive(Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<SinkLog>>,
}

#[derive(Default)]
struct SinkLog {
    open: Option<Vec<u8>>,
    files: Vec<(ReceivedFile, Vec<u8>)>,
    discarded: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished transfers with their plaintext, in order
    pub fn files(&self) -> Vec<(ReceivedFile, Vec<u8>)> {
        self.inner.lock().files.clone()
    }

    /// Plaintext of the transfer still in progress
    pub fn pending(&self) -> Option<Vec<u8>> {
        self.inner.lock().open.clone()
    }

    /// Transfers dropped before their digest arrived
    pub fn discarded(&self) -> usize {
        self.inner.lock().discarded
    }
}

impl PlaintextSink for MemorySink {
    fn begin(&mut self, _sequence: u32) -> std::io::Result<()> {
        self.inner.lock().open = Some(Vec::new());
        Ok(())
    }

    fn write(&mut self, plaintext: &[u8]) -> std::io::Result<()> {
        match self.inner.lock().open.as_mut() {
            Some(open) => {
                open.extend_from_slice(plaintext);
                Ok(())
            }
            None => Err(std::io::Error::new(ErrorKind::NotConnected, "no open transfer")),
        }
    }

    fn finish(&mut self, file: &ReceivedFile) -> std::io::Result<()> {
        let mut log = self.inner.lock();
        let plaintext = log.open.take().unwrap_or_default();
        log.files.push((file.clone(), plaintext));
        Ok(())
    }

    fn discard(&mut self) -> std::io::Result<()> {
        let mut log = self.inner.lock();
        log.open = None;
        log.discarded += 1;
        Ok(())
    }
}

/// File held in memory
#[derive(Clone)]
pub struct MemoryFile {
    name: String,
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

impl FileSource for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> std::io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(Cursor::new(self.data.as_slice())))
    }
}

/// File read from disk on every open
pub struct DiskFile {
    path: PathBuf,
    name: String,
}

impl DiskFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = path.display().to_string();
        Self { path, name }
    }
}

impl FileSource for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> std::io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(BufReader::new(File::open(&self.path)?)))
    }
}
