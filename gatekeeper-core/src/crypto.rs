//! Streaming cipher and digest contract
//!
//! The transfer pipeline drives two lifecycles, independent of algorithm:
//!
//! - Cipher: `init(key, iv)` → `update(chunk)`* → `finalize()`. Output length equals
//!   input length, nothing is buffered across calls, key material is zeroized on release.
//! - Digest: `init()` → `update(bytes)`* → `finalize()` → fixed-length digest.
//!
//! `finalize` consumes the context, so no update can follow it. Contexts also release
//! their key material on drop, which covers early aborts.
//!
//! Concrete primitives: AES-256-CTR (128-bit big-endian counter seeded from the IV)
//! and SHA-256.
//!
//! A CTR keystream must never cover two plaintexts. Every transfer therefore runs
//! under [`SessionKeys::for_transfer`], keyed by a fresh random nonce that the
//! device announces before the first frame.

use crate::{Error, Result};
use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Cipher key length in bytes
pub const KEY_LEN: usize = 32;

/// Cipher IV length in bytes
pub const IV_LEN: usize = 16;

/// Digest output length in bytes
pub const DIGEST_LEN: usize = 32;

/// Per-transfer nonce length in bytes
pub const NONCE_LEN: usize = 8;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Stream cipher lifecycle
pub trait ChunkCipher: Sized {
    /// Set up a context; fails on wrong key or IV length
    fn init(key: &[u8], iv: &[u8]) -> Result<Self>;

    /// Transform one chunk; `out.len() == chunk.len()`
    fn update(&mut self, chunk: &[u8]) -> Vec<u8>;

    /// Release the context and its key material
    fn finalize(self) {}
}

/// Running digest lifecycle
pub trait ChunkDigest: Sized {
    /// Digest length produced by `finalize`
    const OUTPUT_LEN: usize;

    fn init() -> Self;

    /// Absorb bytes; order matters
    fn update(&mut self, bytes: &[u8]);

    fn finalize(self) -> Vec<u8>;
}

/// AES-256 in counter mode
///
/// The key schedule and keystream buffer are zeroized when the context is dropped.
pub struct Aes256CtrCipher {
    inner: Aes256Ctr,
}

impl ChunkCipher for Aes256CtrCipher {
    fn init(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        if iv.len() != IV_LEN {
            return Err(Error::InvalidIvLength(iv.len()));
        }
        let inner = Aes256Ctr::new_from_slices(key, iv)
            .map_err(|_| Error::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }

    fn update(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut out = chunk.to_vec();
        self.inner.apply_keystream(&mut out);
        out
    }
}

/// SHA-256 running digest
pub struct Sha256Digest {
    inner: Sha256,
}

impl ChunkDigest for Sha256Digest {
    const OUTPUT_LEN: usize = DIGEST_LEN;

    fn init() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(self) -> Vec<u8> {
        self.inner.finalize().to_vec()
    }
}

/// Provisioned key and IV for one link
///
/// Both buffers are zeroized on drop and never printed.
#[derive(Clone)]
pub struct SessionKeys {
    key: Zeroizing<Vec<u8>>,
    iv: Zeroizing<Vec<u8>>,
}

impl SessionKeys {
    /// Create from raw bytes, checking lengths
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::InvalidKeyLength(key.len()));
        }
        if iv.len() != IV_LEN {
            return Err(Error::InvalidIvLength(iv.len()));
        }
        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            iv: Zeroizing::new(iv.to_vec()),
        })
    }

    /// Create from hex-encoded key and IV
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self> {
        let key = Zeroizing::new(decode_hex(key_hex)?);
        let iv = Zeroizing::new(decode_hex(iv_hex)?);
        Self::new(&key, &iv)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Start a cipher context with these keys
    pub fn cipher<C: ChunkCipher>(&self) -> Result<C> {
        C::init(&self.key, &self.iv)
    }

    /// Keys for one transfer: the nonce is XORed into the high half of the IV
    ///
    /// The counter runs through the low half, so two transfers with different
    /// nonces share keystream only past 2^64 blocks.
    pub fn for_transfer(&self, nonce: &[u8; NONCE_LEN]) -> SessionKeys {
        let mut iv = self.iv.clone();
        for (byte, n) in iv.iter_mut().zip(nonce) {
            *byte ^= n;
        }
        Self {
            key: self.key.clone(),
            iv,
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// Random nonce for one transfer
pub fn transfer_nonce() -> [u8; NONCE_LEN] {
    use rand::Rng;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce[..]);
    nonce
}

/// Encode bytes to lowercase hexadecimal string
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode hexadecimal string to bytes
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(Error::Hex(format!("odd length {}", s.len())));
    }
    hex::decode(s).map_err(|e| Error::Hex(e.to_string()))
}
