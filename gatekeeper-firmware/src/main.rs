// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Gatekeeper Firmware - Bench Build of the Device Loop
//!
//! Runs the gatekeeper state machine against bench adapters instead of hardware.
//! A file on disk stands in for the USB volume (present while it exists), a capture
//! file receives everything the UART would send, and an optional command file
//! supplies the PC's `ALLOW` / `CUT` lines.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    scan/read    ┌──────────────┐   frames+lines  ┌──────────────┐
//! │  USB volume  │ ───────────────>│  Gatekeeper  │ ───────────────>│   Capture    │
//! │  (--source)  │                 │  Controller  │     (UART)      │ (--capture)  │
//! └──────────────┘                 └──────────────┘                 └──────────────┘
//!                                         ^
//!                                         │ ALLOW / CUT
//!                                  (--commands)
//! ```
//!
//! Key material comes from `GATEKEEPER_KEY_HEX` and `GATEKEEPER_IV_HEX`.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gatekeeper_core::{
    bench::{CaptureSerial, DiskFile, FixedAuthenticator, MemoryRelay, PathPresence, PatternScanner, StaticScanner},
    config::GatekeeperConfig,
    controller::Gatekeeper,
    hal::{Peripherals, Scanner},
    metrics::Metrics,
};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AuthMode {
    /// Every fingerprint is accepted
    Ok,
    /// Every fingerprint is rejected
    Fail,
}

#[derive(Parser, Debug)]
#[command(name = "gatekeeper-firmware")]
#[command(about = "USB Gatekeeper - Bench build of the device control loop", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// File offered by the USB device; the device is present while it exists
    #[arg(long)]
    source: PathBuf,

    /// Where UART output is written
    #[arg(long)]
    capture: PathBuf,

    /// PC-to-device command lines (ALLOW / CUT)
    #[arg(long)]
    commands: Option<PathBuf>,

    /// Simulated fingerprint verdict
    #[arg(long, value_enum, default_value = "ok")]
    auth: AuthMode,

    /// Hex byte pattern the scanner treats as a threat (repeatable)
    #[arg(long = "threat-hex")]
    threat_hex: Vec<String>,

    /// Stop after this many polls (runs forever when omitted)
    #[arg(long)]
    polls: Option<u64>,
}

fn scanner(patterns: &[String]) -> Result<Box<dyn Scanner>> {
    if patterns.is_empty() {
        return Ok(Box::new(StaticScanner::clean()));
    }
    let decoded = patterns
        .iter()
        .map(|p| hex::decode(p).with_context(|| format!("Invalid threat pattern: {}", p)))
        .collect::<Result<Vec<_>>>()?;
    info!("Scanner loaded with {} pattern(s)", decoded.len());
    Ok(Box::new(PatternScanner::new(decoded)))
}

fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .json()
        .init();

    info!("USB Gatekeeper firmware v{}", gatekeeper_core::VERSION);

    // Load configuration from environment variables
    info!("Loading configuration from environment variables");
    let config =
        GatekeeperConfig::from_env().context("Failed to load configuration from environment")?;
    info!("Chunk size: {} bytes", config.chunk_size);
    info!("Poll interval: {:?}", config.poll_interval());

    let capture = File::create(&args.capture)
        .with_context(|| format!("Failed to create capture file {}", args.capture.display()))?;
    let mut serial = CaptureSerial::new(BufWriter::new(capture));
    if let Some(path) = &args.commands {
        let commands = fs::read(path)
            .with_context(|| format!("Failed to read command file {}", path.display()))?;
        serial = serial.with_inbound(&commands);
    }

    let hw = Peripherals {
        relay: Box::new(MemoryRelay::new()),
        usb: Box::new(PathPresence::new(&args.source)),
        authenticator: Box::new(FixedAuthenticator::new(matches!(args.auth, AuthMode::Ok))),
        scanner: scanner(&args.threat_hex)?,
        serial: Box::new(serial),
        source: Box::new(DiskFile::new(&args.source)),
    };

    let metrics = Metrics::new();
    let mut gatekeeper = Gatekeeper::from_config(hw, &config)
        .context("Failed to initialize gatekeeper")?
        .with_metrics(metrics.clone());

    gatekeeper.run(args.polls);

    info!(
        "Relay {:?}; sessions {}, transfers {}, relay cuts {}",
        gatekeeper.relay_state(),
        metrics.sessions_total(),
        metrics.transfers_completed(),
        metrics.relay_cuts()
    );
    info!("Metrics:\n{}", metrics.prometheus_format());
    Ok(())
}
