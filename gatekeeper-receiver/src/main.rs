// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Gatekeeper Receiver - PC Side of the Serial Link
//!
//! Reads the device's serial stream, decrypts every framed chunk, recomputes the
//! digest of the plaintext and compares it with the `HASH:` line announced by the
//! device. Decrypted chunks are appended to `received_<n>.bin` as they arrive; once
//! the digest is checked a JSON manifest is written next to the file, and the
//! verdict (`ALLOW` on match, `CUT` otherwise) is sent back to the device. Files of
//! abandoned transfers are removed.
//!
//! Key material comes from `GATEKEEPER_KEY_HEX` and `GATEKEEPER_IV_HEX`.

use anyhow::{Context, Result};
use clap::Parser;
use gatekeeper_core::{
    config::ReceiverConfig,
    receiver::{PlaintextSink, ReceivedFile, Receiver, ReceiverEvent, Verdict, WireReader},
};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gatekeeper-receiver")]
#[command(about = "USB Gatekeeper - Decrypts and verifies files relayed over serial", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Serial capture to read ("-" for stdin)
    #[arg(long, default_value = "-")]
    input: String,

    /// Append verdict lines (ALLOW / CUT) to this file
    #[arg(long)]
    reply: Option<PathBuf>,
}

/// Sidecar written next to each received file
#[derive(Serialize)]
struct Manifest<'a> {
    sequence: u32,
    bytes: u64,
    frames: u32,
    expected_hash: &'a str,
    computed_hash: &'a str,
    corrupt: bool,
    verdict: Verdict,
}

fn file_path(dir: &Path, sequence: u32) -> PathBuf {
    dir.join(format!("received_{}.bin", sequence))
}

/// Streams each transfer into `received_<n>.bin` under one directory
struct DirectorySink {
    dir: PathBuf,
    open: Option<(PathBuf, BufWriter<File>)>,
}

impl DirectorySink {
    fn new(dir: PathBuf) -> Self {
        Self { dir, open: None }
    }
}

impl PlaintextSink for DirectorySink {
    fn begin(&mut self, sequence: u32) -> io::Result<()> {
        let path = file_path(&self.dir, sequence);
        let file = File::create(&path)?;
        debug!("Receiving into {}", path.display());
        self.open = Some((path, BufWriter::new(file)));
        Ok(())
    }

    fn write(&mut self, plaintext: &[u8]) -> io::Result<()> {
        match self.open.as_mut() {
            Some((_, out)) => out.write_all(plaintext),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no transfer in progress")),
        }
    }

    fn finish(&mut self, file: &ReceivedFile) -> io::Result<()> {
        let path = match self.open.take() {
            Some((path, mut out)) => {
                out.flush()?;
                path
            }
            None => file_path(&self.dir, file.sequence),
        };

        let manifest = Manifest {
            sequence: file.sequence,
            bytes: file.bytes,
            frames: file.frames,
            expected_hash: &file.expected_hex,
            computed_hash: &file.computed_hex,
            corrupt: file.corrupt,
            verdict: file.verdict,
        };
        fs::write(path.with_extension("json"), serde_json::to_vec_pretty(&manifest)?)
    }

    fn discard(&mut self) -> io::Result<()> {
        if let Some((path, out)) = self.open.take() {
            drop(out);
            fs::remove_file(&path)?;
            debug!("Removed partial {}", path.display());
        }
        Ok(())
    }
}

fn open_input(input: &str) -> Result<Box<dyn BufRead>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("Failed to open {}", input))?;
    Ok(Box::new(BufReader::new(file)))
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

    info!("USB Gatekeeper receiver v{}", gatekeeper_core::VERSION);

    // Load configuration from environment variables
    info!("Loading configuration from environment variables");
    let config =
        ReceiverConfig::from_env().context("Failed to load configuration from environment")?;
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;
    info!("Writing received files to {}", config.output_dir.display());

    let mut reply: Option<File> = match &args.reply {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open reply file {}", path.display()))?,
        ),
        None => None,
    };

    let mut reader = WireReader::new(open_input(&args.input)?);
    if config.strict_end_marker {
        reader = reader.strict();
    }
    let mut receiver = Receiver::new(config.session_keys()?)
        .with_sink(DirectorySink::new(config.output_dir.clone()));

    let (mut allowed, mut rejected) = (0u32, 0u32);
    while let Some(event) = receiver.next_event(&mut reader).context("Serial stream error")? {
        match event {
            ReceiverEvent::DeviceInserted => info!("Device inserted"),
            ReceiverEvent::AuthOk => info!("Operator authenticated"),
            ReceiverEvent::AuthFailed => warn!("Operator authentication failed"),
            ReceiverEvent::RelayCut => warn!("Device reported relay cut"),
            ReceiverEvent::Complete => info!("Transfer complete"),
            ReceiverEvent::Verified(file) => {
                let path = file_path(&config.output_dir, file.sequence);
                match file.verdict {
                    Verdict::Allow => {
                        allowed += 1;
                        info!("File #{} OK, saved to {}", file.sequence, path.display());
                    }
                    Verdict::Cut => {
                        rejected += 1;
                        warn!("File #{} failed verification, saved to {}", file.sequence, path.display());
                    }
                }

                let line = file.verdict.reply().to_line();
                if let Some(out) = reply.as_mut() {
                    out.write_all(line.as_bytes()).context("Failed to send verdict")?;
                    out.flush()?;
                }
            }
        }
    }

    info!("End of stream: {} file(s) verified, {} rejected", allowed, rejected);
    Ok(())
}
