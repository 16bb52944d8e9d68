// SPDX-License-Identifier: MIT
//
// USB Gatekeeper: Authenticated, Scanned, Encrypted USB Relay
// Copyright (c) 2025 USB Gatekeeper Contributors

//! Gatekeeper controller
//!
//! Sequences device detection, relay actuation, operator authentication, scanning
//! and the transfer pipeline. The controller is the only writer of relay and
//! session state, and every failure path leaves the relay disconnected.
//!
//! ```text
//! IDLE -> DEVICE_PRESENT -> AUTHENTICATING -> (AUTH_FAIL -> IDLE)
//!                                          |  SCANNING -> (THREAT -> BLOCKED -> IDLE)
//!                                          |  TRANSFERRING -> (DONE -> IDLE)
//!                                          |               |  (ERROR -> BLOCKED -> IDLE)
//! ```
//!
//! PC commands are polled at decision points only. `CUT` never interrupts the
//! blocking authentication call or a chunk in flight; it takes effect at the
//! next boundary.
//!
//! `ALLOW` is the PC's verdict on a verified file. After a completed transfer it
//! leaves the relay as it is; after a failed or cancelled session it re-arms the
//! present device for one more session.

use crate::config::GatekeeperConfig;
use crate::control::ControlMessage;
use crate::crypto::{Aes256CtrCipher, ChunkCipher, ChunkDigest, Sha256Digest};
use crate::hal::{Peripherals, RelayState};
use crate::metrics::Metrics;
use crate::transfer::{TransferPipeline, TransferReport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

/// Controller states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatekeeperState {
    Idle,
    DevicePresent,
    Authenticating,
    Scanning,
    Transferring,
    Blocked,
}

/// One insertion-to-completion lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub state: GatekeeperState,
    pub device_present: bool,
    pub authenticated: bool,
    pub scan_clean: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: GatekeeperState::DevicePresent,
            device_present: true,
            authenticated: false,
            scan_clean: false,
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Transfer finished; the relay stays connected
    Completed(TransferReport),
    /// Session was closed fail-closed with this error
    Failed(Error),
}

impl SessionOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SessionOutcome::Completed(_))
    }
}

/// Final snapshot of a session
#[derive(Debug)]
pub struct SessionReport {
    pub session: Session,
    pub outcome: SessionOutcome,
}

/// The gatekeeper state machine
pub struct Gatekeeper<C = Aes256CtrCipher, D = Sha256Digest> {
    hw: Peripherals,
    pipeline: TransferPipeline<C, D>,
    metrics: Metrics,
    poll_interval: Duration,
    state: GatekeeperState,
    /// A present device may start a session
    armed: bool,
    /// `CUT` seen since the last decision point
    cut_requested: bool,
    /// The last session on this insertion completed and the relay is still connected
    delivered: bool,
}

impl Gatekeeper {
    /// Build a controller from validated configuration
    pub fn from_config(hw: Peripherals, config: &GatekeeperConfig) -> Result<Self> {
        let pipeline = TransferPipeline::new(config.session_keys()?)
            .chunk_size(config.chunk_size)?
            .end_marker(config.emit_end_marker);
        Ok(Self::new(hw, pipeline).poll_interval(config.poll_interval()))
    }
}

impl<C: ChunkCipher, D: ChunkDigest> Gatekeeper<C, D> {
    /// Take ownership of the hardware; the relay is cut before anything else
    pub fn new(mut hw: Peripherals, pipeline: TransferPipeline<C, D>) -> Self {
        hw.relay.cut();
        info!("Gatekeeper started, relay disconnected");

        Self {
            hw,
            pipeline,
            metrics: Metrics::new(),
            poll_interval: Duration::from_millis(50),
            state: GatekeeperState::Idle,
            armed: true,
            cut_requested: false,
            delivered: false,
        }
    }

    /// Share an existing metrics handle
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> GatekeeperState {
        self.state
    }

    pub fn relay_state(&self) -> RelayState {
        self.hw.relay.state()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Poll forever, or `limit` times
    pub fn run(&mut self, limit: Option<u64>) {
        info!("Entering polling loop (interval {:?})", self.poll_interval);
        let mut polls = 0u64;
        loop {
            if matches!(limit, Some(max) if polls >= max) {
                break;
            }
            self.poll();
            polls += 1;
            std::thread::sleep(self.poll_interval);
        }
        info!("Polling loop stopped after {} polls", polls);
    }

    /// One iteration of the idle loop
    ///
    /// Returns a report when a session ran to its end during this poll.
    pub fn poll(&mut self) -> Option<SessionReport> {
        self.drain_commands();
        if self.cut_requested {
            self.cut_requested = false;
            self.idle_cut();
        }

        if !self.hw.usb.device_present() {
            if self.hw.relay.state() == RelayState::Connected {
                info!("Device removed, cutting relay");
                self.cut_relay();
            }
            if !self.armed {
                debug!("Device absent, re-armed");
            }
            self.armed = true;
            self.delivered = false;
            return None;
        }

        if !self.armed {
            return None;
        }
        self.armed = false;
        Some(self.run_session())
    }

    fn run_session(&mut self) -> SessionReport {
        let mut session = Session::new();
        let span = info_span!(
            "session",
            id = %session.id,
            started_at = %session.started_at.to_rfc3339()
        );
        let _guard = span.enter();

        self.metrics.record_session();
        info!("USB device detected");
        self.transition(&mut session, GatekeeperState::DevicePresent);

        let outcome = match self.drive(&mut session) {
            Ok(report) => {
                self.metrics
                    .record_transfer(report.frames, report.bytes, report.elapsed);
                info!("Session complete, digest {}", report.digest_hex);
                SessionOutcome::Completed(report)
            }
            Err(e) => {
                self.fail_closed(&mut session, &e);
                SessionOutcome::Failed(e)
            }
        };

        self.delivered = outcome.is_completed();
        self.transition(&mut session, GatekeeperState::Idle);
        SessionReport { session, outcome }
    }

    fn drive(&mut self, session: &mut Session) -> Result<TransferReport> {
        self.emit(&ControlMessage::UsbInserted)?;
        self.hw.relay.allow();
        self.transition(session, GatekeeperState::Authenticating);

        self.checkpoint()?;
        let authenticated = self.hw.authenticator.authenticate();
        self.checkpoint()?;
        if !authenticated {
            return Err(Error::AuthFailed);
        }
        session.authenticated = true;
        self.emit(&ControlMessage::AuthOk)?;
        self.transition(session, GatekeeperState::Scanning);

        let threat = self.hw.scanner.scan(self.hw.source.as_mut())?;
        self.checkpoint()?;
        if threat {
            return Err(Error::ThreatDetected);
        }
        session.scan_clean = true;
        self.transition(session, GatekeeperState::Transferring);

        info!("Transferring {}", self.hw.source.name());
        let mut reader = self.hw.source.open()?;
        self.pipeline.run(reader.as_mut(), self.hw.serial.as_mut())
    }

    /// Cut the relay and report the failure on the link
    fn fail_closed(&mut self, session: &mut Session, err: &Error) {
        self.cut_relay();

        let message = match err {
            Error::AuthFailed => {
                warn!("Operator authentication failed");
                self.metrics.record_auth_failure();
                ControlMessage::AuthFail
            }
            Error::ThreatDetected => {
                warn!("Scanner reported a threat");
                self.metrics.record_threat();
                self.transition(session, GatekeeperState::Blocked);
                ControlMessage::RelayCut
            }
            Error::Cancelled => {
                warn!("Session cancelled by PC");
                self.metrics.record_pc_cut();
                ControlMessage::RelayCut
            }
            other => {
                if other.is_transport_error() {
                    error!("Serial link stalled in {:?}: {}", session.state, other);
                } else {
                    error!("Session aborted in {:?}: {}", session.state, other);
                }
                if session.state == GatekeeperState::Transferring {
                    self.metrics.record_transfer_failure();
                }
                self.transition(session, GatekeeperState::Blocked);
                ControlMessage::RelayCut
            }
        };

        if let Err(e) = self.emit(&message) {
            error!("Could not report {} to PC: {}", message, e);
        }
    }

    /// Honor `CUT` at a decision point
    fn checkpoint(&mut self) -> Result<()> {
        self.drain_commands();
        if self.cut_requested {
            self.cut_requested = false;
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Read every pending PC line
    fn drain_commands(&mut self) {
        loop {
            let line = match self.hw.serial.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Serial read failed, treating as CUT: {}", e);
                    self.cut_requested = true;
                    self.armed = false;
                    self.delivered = false;
                    break;
                }
            };
            match ControlMessage::parse(&line) {
                Some(ControlMessage::Cut) => {
                    info!("CUT received from PC");
                    self.cut_requested = true;
                    self.armed = false;
                    self.delivered = false;
                }
                Some(ControlMessage::Allow) if self.delivered => {
                    info!("ALLOW received from PC, transfer accepted");
                }
                Some(ControlMessage::Allow) => {
                    info!("ALLOW received from PC, re-armed");
                    self.armed = true;
                }
                Some(other) => debug!("Ignoring device-originated message from PC: {}", other),
                None => {}
            }
        }
    }

    /// `CUT` outside a session
    fn idle_cut(&mut self) {
        self.cut_relay();
        self.metrics.record_pc_cut();
        if let Err(e) = self.emit(&ControlMessage::RelayCut) {
            error!("Could not acknowledge CUT: {}", e);
        }
    }

    fn cut_relay(&mut self) {
        self.hw.relay.cut();
        self.metrics.record_relay_cut();
    }

    fn emit(&mut self, message: &ControlMessage) -> Result<()> {
        debug!("-> {}", message);
        self.hw.serial.write(message.to_line().as_bytes())
    }

    fn transition(&mut self, session: &mut Session, to: GatekeeperState) {
        debug!("{:?} -> {:?}", self.state, to);
        self.state = to;
        session.state = to;
    }
}
