// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Metrics collection and reporting

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Gatekeeper metrics collector
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,

    // Session metrics
    sessions_total: AtomicU64,
    auth_failures: AtomicU64,
    threats_detected: AtomicU64,

    // Transfer metrics
    transfers_completed: AtomicU64,
    transfers_failed: AtomicU64,
    frames_sent: AtomicU64,
    bytes_transferred: AtomicU64,

    // Relay metrics
    relay_cuts: AtomicU64,
    pc_cut_commands: AtomicU64,

    // Transfer durations (milliseconds)
    transfer_durations: RwLock<Vec<u64>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                sessions_total: AtomicU64::new(0),
                auth_failures: AtomicU64::new(0),
                threats_detected: AtomicU64::new(0),
                transfers_completed: AtomicU64::new(0),
                transfers_failed: AtomicU64::new(0),
                frames_sent: AtomicU64::new(0),
                bytes_transferred: AtomicU64::new(0),
                relay_cuts: AtomicU64::new(0),
                pc_cut_commands: AtomicU64::new(0),
                transfer_durations: RwLock::new(Vec::with_capacity(1000)),
            }),
        }
    }

    // Session metrics
    pub fn record_session(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.inner.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_threat(&self) {
        self.inner.threats_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_total(&self) -> u64 {
        self.inner.sessions_total.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self) -> u64 {
        self.inner.auth_failures.load(Ordering::Relaxed)
    }

    pub fn threats_detected(&self) -> u64 {
        self.inner.threats_detected.load(Ordering::Relaxed)
    }

    // Transfer metrics
    pub fn record_transfer(&self, frames: u32, bytes: u64, elapsed: Duration) {
        self.inner.transfers_completed.fetch_add(1, Ordering::Relaxed);
        self.inner.frames_sent.fetch_add(u64::from(frames), Ordering::Relaxed);
        self.inner.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);

        let mut durations = self.inner.transfer_durations.write();
        durations.push(elapsed.as_millis() as u64);
        if durations.len() > 1000 {
            durations.drain(0..500);
        }
    }

    pub fn record_transfer_failure(&self) {
        self.inner.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfers_completed(&self) -> u64 {
        self.inner.transfers_completed.load(Ordering::Relaxed)
    }

    pub fn transfers_failed(&self) -> u64 {
        self.inner.transfers_failed.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.inner.bytes_transferred.load(Ordering::Relaxed)
    }

    // Relay metrics
    pub fn record_relay_cut(&self) {
        self.inner.relay_cuts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pc_cut(&self) {
        self.inner.pc_cut_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn relay_cuts(&self) -> u64 {
        self.inner.relay_cuts.load(Ordering::Relaxed)
    }

    pub fn pc_cut_commands(&self) -> u64 {
        self.inner.pc_cut_commands.load(Ordering::Relaxed)
    }

    // Derived metrics
    pub fn uptime_seconds(&self) -> u64 {
        self.inner.start_time.elapsed().as_secs()
    }

    pub fn duration_percentile(&self, percentile: f64) -> Option<u64> {
        let durations = self.inner.transfer_durations.read();
        if durations.is_empty() {
            return None;
        }

        let mut sorted = durations.clone();
        sorted.sort_unstable();
        let index = ((sorted.len() as f64 * percentile).ceil() as usize).min(sorted.len() - 1);
        Some(sorted[index])
    }

    pub fn duration_p50(&self) -> Option<u64> {
        self.duration_percentile(0.50)
    }

    pub fn duration_p99(&self) -> Option<u64> {
        self.duration_percentile(0.99)
    }

    /// Generate Prometheus-compatible metrics output
    pub fn prometheus_format(&self) -> String {
        let mut output = String::new();

        let counters = [
            ("gatekeeper_sessions_total", "Sessions started", self.sessions_total()),
            ("gatekeeper_auth_failures_total", "Failed operator authentications", self.auth_failures()),
            ("gatekeeper_threats_total", "Devices blocked by the scanner", self.threats_detected()),
            ("gatekeeper_transfers_completed_total", "Transfers completed", self.transfers_completed()),
            ("gatekeeper_transfers_failed_total", "Transfers aborted", self.transfers_failed()),
            ("gatekeeper_frames_sent_total", "Frames written to the serial link", self.frames_sent()),
            ("gatekeeper_bytes_transferred_total", "Plaintext bytes transferred", self.bytes_transferred()),
            ("gatekeeper_relay_cuts_total", "Relay cuts", self.relay_cuts()),
            ("gatekeeper_pc_cut_commands_total", "CUT commands received from the PC", self.pc_cut_commands()),
        ];

        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }

        output.push_str("# HELP gatekeeper_uptime_seconds Uptime in seconds\n");
        output.push_str("# TYPE gatekeeper_uptime_seconds gauge\n");
        output.push_str(&format!("gatekeeper_uptime_seconds {}\n", self.uptime_seconds()));

        if let Some(p50) = self.duration_p50() {
            output.push_str("# HELP gatekeeper_transfer_p50_milliseconds Transfer duration 50th percentile\n");
            output.push_str("# TYPE gatekeeper_transfer_p50_milliseconds gauge\n");
            output.push_str(&format!("gatekeeper_transfer_p50_milliseconds {}\n", p50));
        }

        if let Some(p99) = self.duration_p99() {
            output.push_str("# HELP gatekeeper_transfer_p99_milliseconds Transfer duration 99th percentile\n");
            output.push_str("# TYPE gatekeeper_transfer_p99_milliseconds gauge\n");
            output.push_str(&format!("gatekeeper_transfer_p99_milliseconds {}\n", p99));
        }

        output
    }
}
