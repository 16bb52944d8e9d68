//! ASCII control-line protocol
//!
//! Lines are newline-terminated. Device → PC: `EVENT:USB_INSERTED`, `AUTH:OK`,
//! `AUTH:FAIL`, `NONCE:<hex>`, `HASH:<hex>`, `STATUS:COMPLETE`, `ACTION:RELAY_CUT`.
//! PC → device: `ALLOW`, `CUT`.
//!
//! The same channel carries free-form diagnostic text, so parsing is permissive:
//! anything unrecognized is logged and dropped.

use crate::crypto::{encode_hex, DIGEST_LEN, NONCE_LEN};
use std::fmt;
use tracing::debug;

/// Which side of the link originates a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DeviceToPc,
    PcToDevice,
}

/// A recognized control line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    UsbInserted,
    AuthOk,
    AuthFail,
    /// Lowercase hex of the nonce keying the transfer that follows
    Nonce(String),
    /// Lowercase hex of the final digest
    Hash(String),
    StatusComplete,
    RelayCut,
    Allow,
    Cut,
}

impl ControlMessage {
    /// Build a `HASH:` message from raw digest bytes
    pub fn hash(digest: &[u8]) -> Self {
        Self::Hash(encode_hex(digest))
    }

    /// Build a `NONCE:` message from raw nonce bytes
    pub fn nonce(nonce: &[u8]) -> Self {
        Self::Nonce(encode_hex(nonce))
    }

    /// Parse one line; surrounding whitespace and `\r\n` are ignored
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let message = match line {
            "EVENT:USB_INSERTED" => Self::UsbInserted,
            "AUTH:OK" => Self::AuthOk,
            "AUTH:FAIL" => Self::AuthFail,
            "STATUS:COMPLETE" => Self::StatusComplete,
            "ACTION:RELAY_CUT" => Self::RelayCut,
            "ALLOW" => Self::Allow,
            "CUT" => Self::Cut,
            _ => {
                if let Some(hex) = line.strip_prefix("HASH:").filter(|h| is_lower_hex(h, DIGEST_LEN)) {
                    Self::Hash(hex.to_string())
                } else if let Some(hex) = line.strip_prefix("NONCE:").filter(|h| is_lower_hex(h, NONCE_LEN)) {
                    Self::Nonce(hex.to_string())
                } else {
                    debug!("Ignoring unrecognized control line: {:?}", line);
                    return None;
                }
            }
        };
        Some(message)
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::Allow | Self::Cut => Direction::PcToDevice,
            _ => Direction::DeviceToPc,
        }
    }

    /// Wire form including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsbInserted => f.write_str("EVENT:USB_INSERTED"),
            Self::AuthOk => f.write_str("AUTH:OK"),
            Self::AuthFail => f.write_str("AUTH:FAIL"),
            Self::Nonce(hex) => write!(f, "NONCE:{}", hex),
            Self::Hash(hex) => write!(f, "HASH:{}", hex),
            Self::StatusComplete => f.write_str("STATUS:COMPLETE"),
            Self::RelayCut => f.write_str("ACTION:RELAY_CUT"),
            Self::Allow => f.write_str("ALLOW"),
            Self::Cut => f.write_str("CUT"),
        }
    }
}

fn is_lower_hex(s: &str, bytes: usize) -> bool {
    s.len() == 2 * bytes && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
