// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Error types for the gatekeeper
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.
//! Every variant is fail-closed at the controller: the relay is cut and the session ends.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for gatekeeper operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Frame payload exceeds the chunk bound
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Length header announces more than one chunk
    #[error("Frame length out of range: {0}")]
    LengthOutOfRange(u32),

    /// Bad start or end marker
    #[error("Framing error: expected 0x{expected:02X}, found 0x{found:02X}")]
    Framing { expected: u8, found: u8 },

    /// Transport ended before the expected number of bytes arrived
    #[error("Truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    /// Transport read did not complete within the bounded wait
    #[error("Operation timed out")]
    Timeout,

    /// Cipher key has the wrong length
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// Cipher IV has the wrong length
    #[error("Invalid IV length: {0} bytes")]
    InvalidIvLength(usize),

    /// Operator authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Scanner reported a threat on the device
    #[error("Threat detected")]
    ThreatDetected,

    /// PC requested a relay cut
    #[error("Cancelled by CUT command")]
    Cancelled,

    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hexadecimal text could not be decoded
    #[error("Invalid hex: {0}")]
    Hex(String),

    /// I/O error on the file source or transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if error originated in the serial transport
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Truncated { .. } | Error::Timeout)
    }

    /// Check if error only invalidates the current frame, not the stream
    pub fn is_frame_local(&self) -> bool {
        matches!(self, Error::Framing { .. } | Error::LengthOutOfRange(_))
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Error::Config(format!("Failed to parse environment variables: {}", e))
    }
}
