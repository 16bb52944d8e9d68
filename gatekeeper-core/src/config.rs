//! Configuration management for gatekeeper components

use crate::crypto::{SessionKeys, IV_LEN, KEY_LEN};
use crate::{Error, Result, CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Device-side configuration
#[derive(Clone, Deserialize, Serialize)]
pub struct GatekeeperConfig {
    /// AES-256 key (hex-encoded, 32 bytes)
    pub key_hex: String,

    /// Base CTR counter block (hex-encoded, 16 bytes); each transfer folds its nonce in
    pub iv_hex: String,

    /// Plaintext bytes per frame
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Idle polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Append the 0x55 end marker to frames
    #[serde(default = "default_true")]
    pub emit_end_marker: bool,
}

impl GatekeeperConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("GATEKEEPER_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_key_material(&self.key_hex, &self.iv_hex)?;

        if self.chunk_size == 0 || self.chunk_size > CHUNK_SIZE {
            return Err(Error::Config(format!(
                "chunk_size must be between 1 and {}",
                CHUNK_SIZE
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be > 0".to_string()));
        }

        Ok(())
    }

    pub fn session_keys(&self) -> Result<SessionKeys> {
        SessionKeys::from_hex(&self.key_hex, &self.iv_hex)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl std::fmt::Debug for GatekeeperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatekeeperConfig")
            .field("key_hex", &"<redacted>")
            .field("iv_hex", &"<redacted>")
            .field("chunk_size", &self.chunk_size)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("emit_end_marker", &self.emit_end_marker)
            .finish()
    }
}

/// PC-side receiver configuration
#[derive(Clone, Deserialize, Serialize)]
pub struct ReceiverConfig {
    /// AES-256 key (hex-encoded, 32 bytes)
    pub key_hex: String,

    /// Base CTR counter block (hex-encoded, 16 bytes); each transfer folds its nonce in
    pub iv_hex: String,

    /// Directory for received files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Reject frames that lack the end marker
    #[serde(default)]
    pub strict_end_marker: bool,
}

impl ReceiverConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("GATEKEEPER_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_key_material(&self.key_hex, &self.iv_hex)?;

        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::Config("output_dir cannot be empty".to_string()));
        }
        Ok(())
    }

    pub fn session_keys(&self) -> Result<SessionKeys> {
        SessionKeys::from_hex(&self.key_hex, &self.iv_hex)
    }
}

impl std::fmt::Debug for ReceiverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiverConfig")
            .field("key_hex", &"<redacted>")
            .field("iv_hex", &"<redacted>")
            .field("output_dir", &self.output_dir)
            .field("strict_end_marker", &self.strict_end_marker)
            .finish()
    }
}

fn validate_key_material(key_hex: &str, iv_hex: &str) -> Result<()> {
    if key_hex.trim().len() != 2 * KEY_LEN {
        return Err(Error::Config(format!(
            "key_hex must be {} hex characters",
            2 * KEY_LEN
        )));
    }
    if iv_hex.trim().len() != 2 * IV_LEN {
        return Err(Error::Config(format!(
            "iv_hex must be {} hex characters",
            2 * IV_LEN
        )));
    }
    SessionKeys::from_hex(key_hex, iv_hex)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("Invalid key material: {}", e)))
}

// Default value functions
fn default_chunk_size() -> usize {
    CHUNK_SIZE
}

fn default_poll_interval_ms() -> u64 {
    50
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_true() -> bool {
    true
}
