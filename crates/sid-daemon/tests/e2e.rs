//! End-to-end tests against a real daemon process.
//!
//! Each test spawns the `sid` binary in the foreground on a private
//! filesystem socket inside a temporary directory, talks to it like a
//! client would, and tears it down afterwards. The idle timeout is
//! shortened so reaping is observable in test time.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use sid_daemon::protocol::{
    CommandKind, MsgHeader, Version, MSG_HEADER_LEN, UBRIDGE_PROTOCOL, VERSION,
};
use tempfile::TempDir;

/// Shortened idle timeout for the tests, in milliseconds.
const IDLE_TIMEOUT_MS: u64 = 300;

struct TestDaemon {
    child: Child,
    socket_path: PathBuf,
    _dir: TempDir,
}

impl TestDaemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let socket_path = dir.path().join("sid.socket");

        let child = Command::new(env!("CARGO_BIN_EXE_sid"))
            .args([
                "--no-daemon",
                "--socket",
                socket_path.to_str().expect("utf-8 socket path"),
                "--idle-timeout-ms",
                &IDLE_TIMEOUT_MS.to_string(),
                "--log-level",
                "warn",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn the daemon");

        // The socket appears once the listener is bound.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !socket_path.exists() {
            assert!(Instant::now() < deadline, "daemon did not come up");
            std::thread::sleep(Duration::from_millis(20));
        }

        Self {
            child,
            socket_path,
            _dir: dir,
        }
    }

    /// Sends one framed request on a fresh connection and returns the
    /// response frame without its size prefix.
    fn request(&self, frame: &[u8]) -> Vec<u8> {
        let mut stream = UnixStream::connect(&self.socket_path).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        stream.write_all(frame).expect("request write");

        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix).expect("response prefix");
        let total = u32::from_be_bytes(prefix) as usize;
        assert!(total >= 4, "bogus frame length");

        let mut rest = vec![0u8; total - 4];
        stream.read_exact(&mut rest).expect("response body");
        rest
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn frame(protocol: u8, cmd_number: u8, status: u64, payload: &[u8]) -> Vec<u8> {
    let total = 4 + MSG_HEADER_LEN + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&u32::try_from(total).expect("frame fits u32").to_be_bytes());
    out.extend_from_slice(
        &MsgHeader {
            protocol,
            cmd_number,
            status,
        }
        .encode(),
    );
    out.extend_from_slice(payload);
    out
}

#[test]
fn version_request_round_trips() {
    let daemon = TestDaemon::start();

    // 14-byte request: prefix + header, no payload.
    let request = frame(UBRIDGE_PROTOCOL, CommandKind::Version.as_wire(), 0, &[]);
    assert_eq!(request.len(), 14);

    let response = daemon.request(&request);
    // 20-byte response: prefix + header + three u16.
    assert_eq!(response.len() + 4, 20);

    let (header, payload) = MsgHeader::parse(&response).expect("response header");
    assert_eq!(header.protocol, UBRIDGE_PROTOCOL);
    assert_eq!(header.cmd_number, CommandKind::Reply.as_wire());
    assert_eq!(header.status, 0);
    assert_eq!(Version::parse(payload).expect("version payload"), VERSION);
}

#[test]
fn unknown_command_is_a_successful_noop() {
    let daemon = TestDaemon::start();
    let response = daemon.request(&frame(UBRIDGE_PROTOCOL, 99, 0, &[]));

    let (header, payload) = MsgHeader::parse(&response).expect("response header");
    assert_eq!(header.cmd_number, CommandKind::Reply.as_wire());
    assert_eq!(header.status & 1, 0);
    assert!(payload.is_empty());
}

#[test]
fn identify_accepts_a_device_event() {
    let daemon = TestDaemon::start();
    let payload = b"ACTION=add\0DEVNAME=/dev/sda\0DEVTYPE=disk\0MAJOR=8\0MINOR=0\0SEQNUM=42\0";
    let response = daemon.request(&frame(
        UBRIDGE_PROTOCOL,
        CommandKind::Identify.as_wire(),
        42,
        payload,
    ));

    let (header, _) = MsgHeader::parse(&response).expect("response header");
    assert_eq!(header.status & 1, 0);
}

#[test]
fn malformed_identify_reports_failure() {
    let daemon = TestDaemon::start();
    let response = daemon.request(&frame(
        UBRIDGE_PROTOCOL,
        CommandKind::Identify.as_wire(),
        0,
        b"ACTION\0",
    ));

    let (header, _) = MsgHeader::parse(&response).expect("response header");
    assert_eq!(header.status & 1, 1);
}

#[test]
fn back_to_back_connections_are_served() {
    let daemon = TestDaemon::start();
    let request = frame(UBRIDGE_PROTOCOL, CommandKind::Version.as_wire(), 0, &[]);

    for _ in 0..2 {
        let response = daemon.request(&request);
        let (header, _) = MsgHeader::parse(&response).expect("response header");
        assert_eq!(header.status, 0);
    }
}

#[test]
fn idle_workers_are_reaped_and_replaced() {
    let daemon = TestDaemon::start();
    let request = frame(UBRIDGE_PROTOCOL, CommandKind::Version.as_wire(), 0, &[]);

    let response = daemon.request(&request);
    assert_eq!(response.len(), MSG_HEADER_LEN + Version::WIRE_LEN);

    // Wait past the idle timeout so the observer SIGTERMs the worker and is
    // destroyed by the child-exit watcher.
    std::thread::sleep(Duration::from_millis(IDLE_TIMEOUT_MS * 3));

    // The daemon is still healthy and spawns a fresh worker on demand.
    let response = daemon.request(&request);
    let (header, payload) = MsgHeader::parse(&response).expect("response header");
    assert_eq!(header.status, 0);
    assert_eq!(Version::parse(payload).expect("version payload"), VERSION);
}
