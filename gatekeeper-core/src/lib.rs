// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! USB Gatekeeper Core Library
//!
//! This crate provides the control logic of an embedded gatekeeper that sits between an
//! untrusted USB storage device and a protected host. The operator is authenticated, the
//! device contents are scanned, and only then are the files relayed to the host as an
//! encrypted, digest-checked stream over a serial link. The USB data lines stay
//! physically disconnected (relay cut) whenever a check fails or has not yet succeeded.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `frame`: Binary chunk framing on the serial link
//! - `control`: ASCII control-line protocol between device and PC
//! - `crypto`: Streaming cipher/digest contract and its AES-256-CTR / SHA-256 implementation
//! - `transfer`: Chunked encrypt-digest-frame pipeline
//! - `controller`: The gatekeeper state machine (fail-closed relay ownership)
//! - `hal`: Traits for the hardware collaborators (relay, USB, fingerprint, scanner, UART)
//! - `receiver`: PC-side stream decoding and digest verification
//! - `bench`: In-memory and on-disk adapters for running without hardware
//! - `config`: Configuration management with validation
//! - `metrics`: Counters and Prometheus text output
//! - `error`: Unified error types
//!
//! # Design Principles
//!
//! 1. **Fail-closed**: every error path leaves the relay disconnected
//! 2. **Single authority**: only the controller mutates relay and session state
//! 3. **Swappable primitives**: the pipeline drives a lifecycle contract, not an algorithm
//! 4. **Testability**: hardware behind traits, injected at the outer boundary

pub mod bench;
pub mod config;
pub mod control;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod hal;
pub mod metrics;
pub mod receiver;
pub mod transfer;

#[cfg(test)]
mod proptests;

pub use error::{Error, Result};
pub use hal::RelayState;

/// Library version for protocol compatibility
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum payload carried by one frame (and the largest chunk the pipeline reads)
pub const CHUNK_SIZE: usize = 4096;
