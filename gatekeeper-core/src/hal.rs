//! Hardware abstraction traits
//!
//! Each vendor-specific collaborator (GPIO relay, USB host stack, fingerprint sensor,
//! malware scanner, UART) is reduced to the minimal method set the controller needs.
//! Concrete adapters are injected at the outer boundary through [`Peripherals`].

use crate::Result;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Electrical state of the USB data-line relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// USB lines switched through to the host
    Connected,
    /// USB lines open; the fail-closed default
    #[default]
    Disconnected,
}

/// Relay driver
pub trait RelayActuator {
    /// Switch the USB lines through to the host
    fn allow(&mut self);

    /// Open the USB lines immediately
    fn cut(&mut self);

    /// Current relay position
    fn state(&self) -> RelayState;
}

/// USB host-stack presence detection
pub trait UsbMonitor {
    /// True while a mass-storage device is enumerated and ready
    fn device_present(&mut self) -> bool;
}

/// Operator authentication (fingerprint sensor)
///
/// `authenticate` blocks until the sensor produces a verdict. Nothing else runs
/// on the controller while it waits.
pub trait Authenticator {
    fn authenticate(&mut self) -> bool;
}

/// A file offered by the USB device
pub trait FileSource {
    /// Display name for logs
    fn name(&self) -> &str;

    /// Open a fresh reader positioned at the start of the file
    fn open(&mut self) -> std::io::Result<Box<dyn Read + '_>>;
}

/// Malware scanner
pub trait Scanner {
    /// Returns `true` when a threat is found
    fn scan(&mut self, source: &mut dyn FileSource) -> Result<bool>;
}

/// UART byte transport
pub trait SerialPort {
    /// Transmit all bytes or fail
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Poll for one complete inbound line, without its terminator
    ///
    /// Returns `Ok(None)` immediately when no complete line is pending.
    fn read_line(&mut self) -> Result<Option<String>>;

    /// Read exactly `n` bytes within the bounded transport wait
    ///
    /// Fails with [`crate::Error::Truncated`] or [`crate::Error::Timeout`] rather
    /// than blocking indefinitely.
    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>>;
}

/// Concrete collaborators owned by the controller
pub struct Peripherals {
    pub relay: Box<dyn RelayActuator>,
    pub usb: Box<dyn UsbMonitor>,
    pub authenticator: Box<dyn Authenticator>,
    pub scanner: Box<dyn Scanner>,
    pub serial: Box<dyn SerialPort>,
    pub source: Box<dyn FileSource>,
}
