//! End-to-end gatekeeper scenarios on bench hardware

use gatekeeper_core::bench::{
    FixedAuthenticator, MemoryFile, MemoryRelay, MemorySerial, MemorySink, ScriptedUsb,
    StaticScanner,
};
use gatekeeper_core::controller::{Gatekeeper, GatekeeperState, SessionOutcome};
use gatekeeper_core::crypto::SessionKeys;
use gatekeeper_core::hal::{Authenticator, FileSource, Peripherals, Scanner};
use gatekeeper_core::receiver::{ReceivedFile, Receiver, ReceiverEvent, Verdict, WireItem, WireReader};
use gatekeeper_core::transfer::TransferPipeline;
use gatekeeper_core::{Error, RelayState};
use std::io::{self, Cursor};

struct Bench {
    relay: MemoryRelay,
    usb: ScriptedUsb,
    serial: MemorySerial,
    auth: FixedAuthenticator,
    scanner: StaticScanner,
}

impl Bench {
    fn new(usb: ScriptedUsb, authenticated: bool, scanner: StaticScanner) -> Self {
        Self {
            relay: MemoryRelay::new(),
            usb,
            serial: MemorySerial::new(),
            auth: FixedAuthenticator::new(authenticated),
            scanner,
        }
    }

    fn with_serial(mut self, serial: MemorySerial) -> Self {
        self.serial = serial;
        self
    }

    fn gatekeeper(&self, file: Vec<u8>) -> Gatekeeper {
        self.gatekeeper_with(Box::new(self.auth.clone()), file)
    }

    fn gatekeeper_with(&self, authenticator: Box<dyn Authenticator>, file: Vec<u8>) -> Gatekeeper {
        self.build(authenticator, Box::new(self.scanner.clone()), file)
    }

    fn build(&self, authenticator: Box<dyn Authenticator>, scanner: Box<dyn Scanner>, file: Vec<u8>) -> Gatekeeper {
        let hw = Peripherals {
            relay: Box::new(self.relay.clone()),
            usb: Box::new(self.usb.clone()),
            authenticator,
            scanner,
            serial: Box::new(self.serial.clone()),
            source: Box::new(MemoryFile::new("payload.bin", file)),
        };
        Gatekeeper::new(hw, TransferPipeline::new(keys()))
    }

    fn items(&self) -> Vec<WireItem> {
        let mut reader = WireReader::new(Cursor::new(self.serial.sent()));
        let mut items = Vec::new();
        while let Some(item) = reader.next_item().unwrap() {
            items.push(item);
        }
        items
    }

    fn lines(&self) -> Vec<String> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                WireItem::Line(line) => Some(line),
                WireItem::Frame(_) => None,
            })
            .collect()
    }

    fn frames(&self) -> Vec<Vec<u8>> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                WireItem::Frame(payload) => Some(payload),
                WireItem::Line(_) => None,
            })
            .collect()
    }

    /// Decrypt and verify everything the device sent
    fn receive(&self) -> Vec<(ReceivedFile, Vec<u8>)> {
        let sink = MemorySink::new();
        let mut reader = WireReader::new(Cursor::new(self.serial.sent()));
        let mut receiver = Receiver::new(keys()).with_sink(sink.clone());
        while receiver.next_event(&mut reader).unwrap().is_some() {}
        sink.files()
    }

    fn frame_sizes(&self) -> Vec<usize> {
        self.frames().iter().map(Vec::len).collect()
    }
}

fn keys() -> SessionKeys {
    SessionKeys::from_hex(
        "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4",
        "f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff",
    )
    .unwrap()
}

fn file(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_absent_device_stays_idle() {
    let bench = Bench::new(ScriptedUsb::absent(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(100));

    for _ in 0..5 {
        assert!(gatekeeper.poll().is_none());
    }

    assert_eq!(gatekeeper.state(), GatekeeperState::Idle);
    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert!(bench.serial.sent().is_empty());
    assert_eq!(bench.auth.calls(), 0);
}

#[test]
fn test_auth_failure_cuts_relay() {
    let bench = Bench::new(ScriptedUsb::present(), false, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(100));

    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::AuthFailed)));
    assert_eq!(bench.lines(), vec!["EVENT:USB_INSERTED", "AUTH:FAIL"]);
    assert_eq!(
        bench.relay.history(),
        vec![RelayState::Disconnected, RelayState::Connected, RelayState::Disconnected]
    );
    assert_eq!(bench.scanner.scans(), 0);
}

#[test]
fn test_threat_cuts_relay() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::infected());
    let mut gatekeeper = bench.gatekeeper(file(100));

    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::ThreatDetected)));
    assert_eq!(
        bench.lines(),
        vec!["EVENT:USB_INSERTED", "AUTH:OK", "ACTION:RELAY_CUT"]
    );
    assert!(bench.frame_sizes().is_empty());
    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert_eq!(
        bench.relay.history(),
        vec![RelayState::Disconnected, RelayState::Connected, RelayState::Disconnected]
    );
}

#[test]
fn test_clean_transfer_of_10000_bytes() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let data = file(10_000);
    let mut gatekeeper = bench.gatekeeper(data.clone());

    let report = gatekeeper.poll().unwrap();
    let transfer = match report.outcome {
        SessionOutcome::Completed(transfer) => transfer,
        other => panic!("transfer did not complete: {:?}", other),
    };
    assert_eq!(transfer.frames, 3);
    assert_eq!(bench.frame_sizes(), vec![4096, 4096, 1808]);

    let lines = bench.lines();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[..2], ["EVENT:USB_INSERTED", "AUTH:OK"]);
    assert!(lines[2].starts_with("NONCE:"));
    let hex = lines[3].strip_prefix("HASH:").unwrap();
    assert_eq!(hex.len(), 64);
    assert!(hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)));
    assert_eq!(lines[4], "STATUS:COMPLETE");

    // HASH comes after the last frame
    let items = bench.items();
    assert!(matches!(items.last(), Some(WireItem::Line(l)) if l == "STATUS:COMPLETE"));
    assert!(matches!(&items[items.len() - 3], WireItem::Frame(p) if p.len() == 1808));

    assert_eq!(bench.relay.current(), RelayState::Connected);

    // The PC side decrypts and verifies the same stream
    let received = bench.receive();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].0.verdict, Verdict::Allow);
    assert_eq!(received[0].0.bytes, 10_000);
    assert_eq!(received[0].1, data);
}

#[test]
fn test_receiver_verdict_does_not_restart_transfer() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(3000));
    let mut receiver = Receiver::new(keys());
    let mut seen = 0;

    // Loop the PC's verdicts back to the device, as the receiver binary does
    for _ in 0..4 {
        gatekeeper.poll();
        let sent = bench.serial.sent();
        let mut reader = WireReader::new(Cursor::new(sent[seen..].to_vec()));
        seen = sent.len();
        while let Some(event) = receiver.next_event(&mut reader).unwrap() {
            if let ReceiverEvent::Verified(file) = event {
                bench.serial.push_line(&file.verdict.reply().to_string());
            }
        }
    }

    assert_eq!(bench.auth.calls(), 1);
    assert_eq!(gatekeeper.metrics().sessions_total(), 1);
    assert_eq!(bench.frame_sizes(), vec![3000]);
    assert_eq!(bench.relay.current(), RelayState::Connected);
}

#[test]
fn test_each_transfer_has_its_own_keystream() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(5000));

    assert!(gatekeeper.poll().unwrap().outcome.is_completed());
    bench.usb.set_present(false);
    assert!(gatekeeper.poll().is_none());
    bench.usb.set_present(true);
    assert!(gatekeeper.poll().unwrap().outcome.is_completed());

    let frames = bench.frames();
    assert_eq!(frames.len(), 4);
    assert_ne!(frames[0], frames[2]);
    assert_ne!(frames[1], frames[3]);

    let received = bench.receive();
    assert_eq!(received.len(), 2);
    for (verdict, plaintext) in received.iter().map(|(f, p)| (f.verdict, p)) {
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(plaintext, &file(5000));
    }
}

#[test]
fn test_write_failure_on_frame_two() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean())
        .with_serial(MemorySerial::new().fail_on_frame(2));
    let mut gatekeeper = bench.gatekeeper(file(10_000));

    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::Io(_))));
    assert_eq!(bench.frame_sizes(), vec![4096]);

    let lines = bench.lines();
    assert!(!lines.iter().any(|l| l == "STATUS:COMPLETE"));
    assert!(!lines.iter().any(|l| l.starts_with("HASH:")));
    assert_eq!(lines.last().map(String::as_str), Some("ACTION:RELAY_CUT"));

    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert_eq!(
        bench.relay.history(),
        vec![RelayState::Disconnected, RelayState::Connected, RelayState::Disconnected]
    );
    assert_eq!(gatekeeper.metrics().transfers_failed(), 1);
}

/// Scanner whose engine cannot read the volume
struct UnreadableVolume;

impl Scanner for UnreadableVolume {
    fn scan(&mut self, _source: &mut dyn FileSource) -> Result<bool, Error> {
        Err(Error::Io(io::Error::new(io::ErrorKind::Other, "signature database missing")))
    }
}

#[test]
fn test_scan_error_cuts_relay() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.build(Box::new(bench.auth.clone()), Box::new(UnreadableVolume), file(100));

    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::Io(_))));
    assert!(report.session.authenticated);
    assert!(!report.session.scan_clean);
    assert_eq!(
        bench.lines(),
        vec!["EVENT:USB_INSERTED", "AUTH:OK", "ACTION:RELAY_CUT"]
    );
    assert!(bench.frame_sizes().is_empty());
    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert_eq!(
        bench.relay.history(),
        vec![RelayState::Disconnected, RelayState::Connected, RelayState::Disconnected]
    );
    assert_eq!(gatekeeper.metrics().transfers_failed(), 0);
}

/// Operator succeeds, but the PC sends CUT while the sensor is busy
struct CutWhileWaiting(MemorySerial);

impl Authenticator for CutWhileWaiting {
    fn authenticate(&mut self) -> bool {
        self.0.push_line("CUT");
        true
    }
}

#[test]
fn test_cut_during_authentication_takes_effect_after_it() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper_with(Box::new(CutWhileWaiting(bench.serial.clone())), file(100));

    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::Cancelled)));
    assert_eq!(bench.lines(), vec!["EVENT:USB_INSERTED", "ACTION:RELAY_CUT"]);
    assert_eq!(bench.scanner.scans(), 0);
    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert_eq!(
        bench.relay.history(),
        vec![RelayState::Disconnected, RelayState::Connected, RelayState::Disconnected]
    );
    assert_eq!(gatekeeper.metrics().pc_cut_commands(), 1);

    // No new session until the device is re-presented or the PC allows it
    assert!(gatekeeper.poll().is_none());
}

#[test]
fn test_cut_before_session_discards_it() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(100));

    bench.serial.push_line("CUT");
    let report = gatekeeper.poll();
    assert!(report.is_none());
    assert_eq!(bench.lines(), vec!["ACTION:RELAY_CUT"]);
    assert_eq!(bench.auth.calls(), 0);
    assert_eq!(bench.relay.current(), RelayState::Disconnected);

    // CUT discarded the pending session; the device must be re-presented or allowed
    assert!(gatekeeper.poll().is_none());
    assert_eq!(bench.scanner.scans(), 0);
}

#[test]
fn test_allow_rearms_present_device() {
    let bench = Bench::new(ScriptedUsb::present(), false, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(100));

    assert!(gatekeeper.poll().is_some());
    assert!(gatekeeper.poll().is_none());
    assert_eq!(bench.auth.calls(), 1);

    bench.serial.push_line("ALLOW");
    let report = gatekeeper.poll().unwrap();
    assert!(matches!(report.outcome, SessionOutcome::Failed(Error::AuthFailed)));
    assert_eq!(bench.auth.calls(), 2);
}

#[test]
fn test_removal_after_transfer_cuts_relay() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(500));

    assert!(gatekeeper.poll().unwrap().outcome.is_completed());
    assert_eq!(bench.relay.current(), RelayState::Connected);

    bench.usb.set_present(false);
    assert!(gatekeeper.poll().is_none());
    assert_eq!(bench.relay.current(), RelayState::Disconnected);
}

#[test]
fn test_cut_after_transfer_cuts_relay() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(500));

    assert!(gatekeeper.poll().unwrap().outcome.is_completed());
    bench.serial.push_line("CUT");
    assert!(gatekeeper.poll().is_none());

    assert_eq!(bench.relay.current(), RelayState::Disconnected);
    assert_eq!(bench.lines().last().map(String::as_str), Some("ACTION:RELAY_CUT"));
    assert_eq!(gatekeeper.metrics().pc_cut_commands(), 1);
}

#[test]
fn test_unrecognized_pc_lines_are_ignored() {
    let bench = Bench::new(ScriptedUsb::present(), true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(500));

    bench.serial.push_line("hello from the PC");
    bench.serial.push_line("AUTH:OK");
    assert!(gatekeeper.poll().unwrap().outcome.is_completed());
    assert_eq!(bench.relay.current(), RelayState::Connected);
}

#[test]
fn test_insertion_after_idle_polls() {
    let usb = ScriptedUsb::new([false, false, true]);
    let bench = Bench::new(usb, true, StaticScanner::clean());
    let mut gatekeeper = bench.gatekeeper(file(10));

    assert!(gatekeeper.poll().is_none());
    assert!(gatekeeper.poll().is_none());
    assert!(bench.serial.sent().is_empty());
    assert!(gatekeeper.poll().is_some());
    assert_eq!(bench.lines()[0], "EVENT:USB_INSERTED");
}
