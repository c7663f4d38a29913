//! Worker pool and observer controller.
//!
//! Workers are forked, short-lived processes, each serving one request at a
//! time on its own event loop. The parent keeps one `observer` resource per
//! worker: it watches the worker process for exit, talks to it over a
//! datagram control channel, and tracks the worker through a small state
//! machine:
//!
//! ```text
//!            connection assigned          reports RUNNING
//!   IDLE ───────────────────────▶ INIT ───────────────────▶ RUNNING
//!    ▲  ╲                                                      │
//!    │   ╲ idle timeout                         reports IDLE   │
//!    │    ▶ FINI (SIGTERM)                                     │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! A worker process exit — clean or not — destroys its observer, shrinking
//! the pool by one. Around `fork()` every signal is blocked: the parent
//! restores its mask immediately, the child leaves signals blocked until its
//! own signalfd sources are installed, so nothing is ever delivered to a
//! half-initialised worker.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use sid_core::buffer::{
    Buffer, BufferBackend, BufferError, BufferInit, BufferMode, BufferShape, BufferSpec,
};
use sid_core::comms;
use sid_core::kvstore::{create_kv_store, KvStoreParams};
use sid_core::resource::{
    ChildExit, EventSource, IoEvents, Resource, ResourceError, ResourceFlags, ResourceType,
};
use sid_core::util::{now_usec, TimerClock};
use tracing::{debug, error, info};

use crate::command;
use crate::config::SidConfig;

/// Control byte: the worker accepted a connection and is serving it.
pub const COMMS_CMD_RUNNING: u8 = 1;

/// Control byte: the worker finished a request and is idle again.
pub const COMMS_CMD_IDLE: u8 = 2;

/// Id of the key-value store each worker mounts.
pub(crate) const WORKER_KV_ID: &str = "main";

/// Resource type of a parent-side observer.
pub static OBSERVER: ResourceType = ResourceType {
    name: "observer",
    owns_event_loop: false,
    has_watchdog: false,
};

/// Resource type of a forked worker's root.
pub static WORKER: ResourceType = ResourceType {
    name: "worker",
    owns_event_loop: true,
    has_watchdog: false,
};

/// Observer-tracked worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a connection.
    Idle,
    /// A connection was handed over, the worker has not confirmed yet.
    Init,
    /// Serving a request.
    Running,
    /// Reaped after the idle timeout; SIGTERM is on its way.
    Fini,
}

/// Events driving the worker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The ubridge handed the worker a connection.
    ConnectionAssigned,
    /// The worker reported [`COMMS_CMD_RUNNING`].
    ReportedRunning,
    /// The worker reported [`COMMS_CMD_IDLE`].
    ReportedIdle,
    /// The idle timeout fired.
    IdleTimeout,
}

impl WorkerState {
    /// The transition table; `None` marks an invalid transition, which the
    /// observer ignores.
    #[must_use]
    pub fn on_event(self, event: WorkerEvent) -> Option<Self> {
        match (self, event) {
            (Self::Idle, WorkerEvent::ConnectionAssigned) => Some(Self::Init),
            (Self::Init, WorkerEvent::ReportedRunning) => Some(Self::Running),
            (Self::Running, WorkerEvent::ReportedIdle) => Some(Self::Idle),
            (Self::Idle, WorkerEvent::IdleTimeout) => Some(Self::Fini),
            _ => None,
        }
    }
}

/// Parent-side record of one worker. The child-exit and control-channel
/// event sources live with the observer resource itself; only the idle
/// timer is kept as a handle, because it is cancelled and re-armed.
#[derive(Debug)]
pub struct Observer {
    worker_pid: Pid,
    comms_fd: OwnedFd,
    idle_timeout_es: Option<EventSource>,
    worker_state: WorkerState,
    idle_timeout: Duration,
}

impl Observer {
    /// Current state of the observed worker.
    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.worker_state
    }

    /// PID of the observed worker process.
    #[must_use]
    pub fn worker_pid(&self) -> Pid {
        self.worker_pid
    }
}

/// Worker-process state: the control channel, the current connection and
/// the receive buffer.
#[derive(Debug)]
pub struct Worker {
    comms_fd: OwnedFd,
    conn_fd: Option<OwnedFd>,
    conn_es: Option<EventSource>,
    buf: Buffer,
}

impl Worker {
    /// Raw descriptor of the connection being served, if any.
    pub(crate) fn conn_raw(&self) -> Option<RawFd> {
        self.conn_fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Which side of the fork the caller is on after [`spawn_worker`].
pub enum Spawned {
    /// Parent: the new observer child of the ubridge.
    Observer(Rc<Resource>),
    /// Forked child: the worker root; run its event loop and exit the
    /// process when it returns.
    Worker(Rc<Resource>),
}

/// Forks a new worker and wires both sides up.
///
/// The child tears down the inherited resource tree (closing every
/// parent-owned descriptor it copied) and builds a fresh worker root; the
/// parent records an observer under `ubridge_res`.
///
/// # Errors
///
/// Socketpair/fork failures, and observer-creation failures in the parent.
/// Inside the forked child, failure to build the worker exits the process.
pub fn spawn_worker(
    ubridge_res: &Rc<Resource>,
    config: &SidConfig,
) -> Result<Spawned, ResourceError> {
    let (parent_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )?;

    // Block everything around the fork; nothing may be delivered before
    // each side is ready for it.
    let mut original = SigSet::empty();
    sigprocmask(
        SigmaskHow::SIG_SETMASK,
        Some(&SigSet::all()),
        Some(&mut original),
    )?;

    // SAFETY: the daemon is single-threaded; the child only runs
    // fork-safe teardown before building its own state.
    let fork_result = unsafe { fork() };

    match fork_result {
        Err(e) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&original), None);
            Err(e.into())
        },
        Ok(ForkResult::Child) => {
            drop(parent_end);
            let pid = getpid();
            if ubridge_res.top_level().destroy().is_err() {
                error!(
                    id = %ubridge_res.full_id(),
                    "failed to clean resource tree after forking a new worker"
                );
            }
            // Signals stay blocked until the worker's signalfd sources are
            // installed by its init below.
            match create_worker(pid, child_end, config) {
                Ok(worker_res) => Ok(Spawned::Worker(worker_res)),
                Err(e) => {
                    error!(error = %e, "failed to create worker resource");
                    std::process::exit(1);
                },
            }
        },
        Ok(ForkResult::Parent { child }) => {
            drop(child_end);
            // SIGCHLD stays blocked from the first fork on: the child-exit
            // watcher reads it from a signalfd, and a worker exiting before
            // the watcher is installed must stay pending, not be discarded
            // by the default disposition.
            original.add(Signal::SIGCHLD);
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&original), None)?;
            debug!(id = %ubridge_res.full_id(), pid = child.as_raw(), "spawned new worker process");
            let observer = create_observer(ubridge_res, child, parent_end, config)?;
            Ok(Spawned::Observer(observer))
        },
    }
}

/// Hands an accepted connection to the worker behind `observer_res` and
/// advances the state machine to INIT. The parent's copy of the descriptor
/// is closed; the kernel keeps the in-flight reference alive.
///
/// # Errors
///
/// Control-channel send failures; the connection is closed in that case.
pub fn assign_connection(
    observer_res: &Rc<Resource>,
    conn_fd: OwnedFd,
) -> Result<(), ResourceError> {
    {
        let observer = observer_res
            .data::<Observer>()
            .ok_or(ResourceError::Invalid("observer state is missing"))?;
        comms::unix_send(
            observer.comms_fd.as_raw_fd(),
            &[],
            Some(conn_fd.as_raw_fd()),
        )?;
    }
    drop(conn_fd);

    cancel_idle_timeout(observer_res);
    observer_transition(observer_res, WorkerEvent::ConnectionAssigned);
    Ok(())
}

/// Current worker state behind an observer resource.
#[must_use]
pub fn observer_state(observer_res: &Rc<Resource>) -> Option<WorkerState> {
    observer_res
        .data::<Observer>()
        .map(|observer| observer.worker_state)
}

fn create_observer(
    ubridge_res: &Rc<Resource>,
    worker_pid: Pid,
    comms_fd: OwnedFd,
    config: &SidConfig,
) -> Result<Rc<Resource>, ResourceError> {
    let idle_timeout = config.idle_timeout;
    Resource::create(
        Some(ubridge_res),
        &OBSERVER,
        ResourceFlags::NONE,
        worker_pid.as_raw().to_string(),
        move |res| {
            res.create_child_event_source(worker_pid, on_observer_child_event)?;
            res.create_io_event_source(comms_fd.as_raw_fd(), on_observer_comms_event)?;
            Ok(Observer {
                worker_pid,
                comms_fd,
                idle_timeout_es: None,
                worker_state: WorkerState::Idle,
                idle_timeout,
            })
        },
    )
}

fn observer_transition(observer_res: &Rc<Resource>, event: WorkerEvent) {
    let Some(mut observer) = observer_res.data_mut::<Observer>() else {
        return;
    };
    match observer.worker_state.on_event(event) {
        Some(next) => {
            observer.worker_state = next;
            debug!(id = %observer_res.full_id(), state = ?next, "worker state changed");
        },
        None => {
            debug!(
                id = %observer_res.full_id(),
                state = ?observer.worker_state,
                event = ?event,
                "ignoring invalid worker state transition"
            );
        },
    }
}

fn cancel_idle_timeout(observer_res: &Rc<Resource>) {
    let timer = observer_res
        .data_mut::<Observer>()
        .and_then(|mut observer| observer.idle_timeout_es.take());
    if let Some(es) = timer {
        observer_res.destroy_event_source(&es);
    }
}

fn on_observer_comms_event(
    observer_res: &Rc<Resource>,
    fd: RawFd,
    _events: IoEvents,
) -> Result<(), ResourceError> {
    let mut code = [0u8; 1];
    let dgram = match comms::unix_recv(fd, &mut code) {
        Ok(dgram) => dgram,
        Err(Errno::EAGAIN | Errno::EINTR) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if dgram.len == 0 {
        return Ok(());
    }

    match code[0] {
        COMMS_CMD_RUNNING => {
            cancel_idle_timeout(observer_res);
            observer_transition(observer_res, WorkerEvent::ReportedRunning);
        },
        COMMS_CMD_IDLE => {
            arm_idle_timeout(observer_res)?;
            observer_transition(observer_res, WorkerEvent::ReportedIdle);
        },
        other => {
            debug!(id = %observer_res.full_id(), code = other, "unexpected control byte");
        },
    }
    Ok(())
}

fn arm_idle_timeout(observer_res: &Rc<Resource>) -> Result<(), ResourceError> {
    cancel_idle_timeout(observer_res);
    let idle_timeout = observer_res
        .data::<Observer>()
        .map(|observer| observer.idle_timeout)
        .unwrap_or_default();
    #[allow(clippy::cast_possible_truncation)] // timeouts are seconds, not eras
    let deadline = now_usec(TimerClock::Monotonic) + idle_timeout.as_micros() as u64;
    let es =
        observer_res.create_time_event_source(TimerClock::Monotonic, deadline, on_idle_timeout)?;
    if let Some(mut observer) = observer_res.data_mut::<Observer>() {
        observer.idle_timeout_es = Some(es);
    }
    Ok(())
}

fn on_idle_timeout(
    observer_res: &Rc<Resource>,
    _now_usec: u64,
) -> Result<(), ResourceError> {
    debug!(id = %observer_res.full_id(), "idle timeout expired");
    observer_transition(observer_res, WorkerEvent::IdleTimeout);
    let pid = observer_res
        .data::<Observer>()
        .map(|observer| observer.worker_pid);
    if let Some(pid) = pid {
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(id = %observer_res.full_id(), error = %e, "failed to signal worker");
        }
    }
    Ok(())
}

fn on_observer_child_event(
    observer_res: &Rc<Resource>,
    exit: ChildExit,
) -> Result<(), ResourceError> {
    let pid = observer_res
        .data::<Observer>()
        .map_or(0, |observer| observer.worker_pid.as_raw());
    match exit {
        ChildExit::Exited(code) => {
            debug!(id = %observer_res.full_id(), pid, code, "worker exited");
        },
        ChildExit::Signaled {
            signal,
            core_dumped,
        } => {
            debug!(
                id = %observer_res.full_id(),
                pid,
                signal = %signal,
                core_dumped,
                "worker terminated by signal"
            );
        },
    }
    let _ = observer_res.destroy();
    Ok(())
}

/// Builds the worker root resource in a freshly forked child.
fn create_worker(
    pid: Pid,
    comms_fd: OwnedFd,
    config: &SidConfig,
) -> Result<Rc<Resource>, ResourceError> {
    let frame_limit = config.frame_limit;
    let kv_initial_size = config.kv_initial_size;
    Resource::create(
        None,
        &WORKER,
        ResourceFlags::NONE,
        pid.as_raw().to_string(),
        move |res| {
            res.create_signal_event_source(Signal::SIGTERM, on_worker_signal)?;
            res.create_signal_event_source(Signal::SIGINT, on_worker_signal)?;
            res.create_io_event_source(comms_fd.as_raw_fd(), on_worker_comms_event)?;
            let buf = Buffer::new(
                BufferSpec {
                    backend: BufferBackend::Heap,
                    shape: BufferShape::Linear,
                    mode: BufferMode::SizePrefix,
                },
                BufferInit {
                    size: 0,
                    alloc_step: 4096,
                    limit: frame_limit,
                },
            )
            .map_err(|e| ResourceError::Init(e.to_string()))?;
            create_kv_store(
                res,
                WORKER_KV_ID,
                KvStoreParams {
                    initial_size: kv_initial_size,
                },
            )?;
            Ok(Worker {
                comms_fd,
                conn_fd: None,
                conn_es: None,
                buf,
            })
        },
    )
}

fn on_worker_signal(worker_res: &Rc<Resource>, signo: i32) -> Result<(), ResourceError> {
    info!(id = %worker_res.full_id(), signal = signo, "received signal");
    worker_res.exit_event_loop()
}

fn on_worker_comms_event(
    worker_res: &Rc<Resource>,
    fd: RawFd,
    events: IoEvents,
) -> Result<(), ResourceError> {
    if events.error() || events.hangup() {
        error!(id = %worker_res.full_id(), "observer channel lost");
        return worker_res.exit_event_loop();
    }

    let mut code = [0u8; 1];
    let dgram = match comms::unix_recv(fd, &mut code) {
        Ok(dgram) => dgram,
        Err(Errno::EAGAIN | Errno::EINTR) => return Ok(()),
        Err(e) => {
            error!(id = %worker_res.full_id(), error = %e, "observer channel failed");
            let _ = worker_res.exit_event_loop();
            return Err(e.into());
        },
    };

    if let Some(conn_fd) = dgram.fd {
        let conn_es = worker_res.create_io_event_source(conn_fd.as_raw_fd(), on_worker_conn_event)?;
        {
            let Some(mut worker) = worker_res.data_mut::<Worker>() else {
                return Err(ResourceError::Invalid("worker state is missing"));
            };
            worker.conn_fd = Some(conn_fd);
            worker.conn_es = Some(conn_es);
        }
        comms::unix_send(fd, &[COMMS_CMD_RUNNING], None)?;
    }
    Ok(())
}

fn on_worker_conn_event(
    worker_res: &Rc<Resource>,
    fd: RawFd,
    events: IoEvents,
) -> Result<(), ResourceError> {
    if events.error() {
        if events.hangup() {
            error!(id = %worker_res.full_id(), "peer connection closed prematurely");
        } else {
            error!(id = %worker_res.full_id(), "connection error");
        }
        worker_cleanup(worker_res);
        return Ok(());
    }
    // A plain hang-up still reaches the read below: the peer may have sent
    // a complete request before closing its side.

    let read_result = {
        let Some(mut worker) = worker_res.data_mut::<Worker>() else {
            return Err(ResourceError::Invalid("worker state is missing"));
        };
        worker.buf.read(fd)
    };

    match read_result {
        Ok(0) => worker_cleanup(worker_res),
        Ok(_) => {
            let complete = worker_res
                .data::<Worker>()
                .is_some_and(|worker| worker.buf.is_complete());
            if complete {
                let frame = worker_res
                    .data::<Worker>()
                    .map(|worker| worker.buf.data().to_vec())
                    .unwrap_or_default();
                if let Err(e) = command::create_command(worker_res, &frame) {
                    error!(
                        id = %worker_res.full_id(),
                        error = %e,
                        "failed to register command for processing"
                    );
                    worker_cleanup(worker_res);
                    return Ok(());
                }
                if let Some(mut worker) = worker_res.data_mut::<Worker>() {
                    worker.buf.reset(0);
                }
            }
        },
        Err(BufferError::Io(Errno::EAGAIN | Errno::EINTR)) => {},
        Err(e) => {
            error!(id = %worker_res.full_id(), error = %e, "failed to read request");
            worker_cleanup(worker_res);
        },
    }
    Ok(())
}

/// Wraps up the current request cycle: the command children go away, the
/// connection is dropped, the receive buffer is cleared and the observer is
/// told the worker is idle again.
pub(crate) fn request_finished(worker_res: &Rc<Resource>) {
    worker_cleanup(worker_res);
}

fn worker_cleanup(worker_res: &Rc<Resource>) {
    let mut iter = worker_res.iter();
    while let Some(child) = iter.next() {
        if child.is_type_of(&command::COMMAND) {
            let _ = child.destroy();
        }
    }

    let Some((conn_es, conn_fd)) = worker_res
        .data_mut::<Worker>()
        .map(|mut worker| (worker.conn_es.take(), worker.conn_fd.take()))
    else {
        return;
    };
    if let Some(es) = conn_es {
        worker_res.destroy_event_source(&es);
    }
    drop(conn_fd);

    let comms_raw = {
        let Some(mut worker) = worker_res.data_mut::<Worker>() else {
            return;
        };
        worker.buf.reset(0);
        worker.comms_fd.as_raw_fd()
    };

    if comms::unix_send(comms_raw, &[COMMS_CMD_IDLE], None).is_err() {
        error!(id = %worker_res.full_id(), "failed to report idle state");
        let _ = worker_res.exit_event_loop();
    }
}

#[cfg(test)]
mod tests {
    use sid_core::kvstore::KvStore;
    use sid_core::kvstore::KV_STORE;
    use nix::unistd::{read, write};

    use super::*;
    use crate::protocol::{
        CommandKind, MsgHeader, Version, MSG_HEADER_LEN, MSG_MIN_FRAME_LEN, UBRIDGE_PROTOCOL,
        VERSION,
    };

    #[test]
    fn state_machine_matches_the_table() {
        use WorkerEvent::{ConnectionAssigned, IdleTimeout, ReportedIdle, ReportedRunning};
        use WorkerState::{Fini, Idle, Init, Running};

        let states = [Idle, Init, Running, Fini];
        let events = [ConnectionAssigned, ReportedRunning, ReportedIdle, IdleTimeout];
        for state in states {
            for event in events {
                let expected = match (state, event) {
                    (Idle, ConnectionAssigned) => Some(Init),
                    (Init, ReportedRunning) => Some(Running),
                    (Running, ReportedIdle) => Some(Idle),
                    (Idle, IdleTimeout) => Some(Fini),
                    _ => None,
                };
                assert_eq!(state.on_event(event), expected, "{state:?} + {event:?}");
            }
        }
    }

    /// In-process worker harness: the test plays both the observer and the
    /// client, no fork involved.
    struct Harness {
        worker: Rc<Resource>,
        observer_end: OwnedFd,
    }

    fn harness() -> Harness {
        let (observer_end, worker_end) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        let worker = create_worker(getpid(), worker_end, &SidConfig::default()).unwrap();
        Harness {
            worker,
            observer_end,
        }
    }

    fn frame(protocol: u8, cmd_number: u8, status: u64, payload: &[u8]) -> Vec<u8> {
        let total = MSG_MIN_FRAME_LEN + payload.len();
        let mut out = Vec::with_capacity(total);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(total as u32).to_be_bytes());
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

    /// Hands a connection to the worker, sends one request and collects the
    /// response bytes (without the size prefix).
    fn roundtrip(h: &Harness, request: &[u8]) -> Vec<u8> {
        let (client, service) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        comms::unix_send(
            h.observer_end.as_raw_fd(),
            &[],
            Some(service.as_raw_fd()),
        )
        .unwrap();
        drop(service);
        write(&client, request).unwrap();

        let deadline = now_usec(TimerClock::Monotonic) + 150_000;
        h.worker
            .create_time_event_source(TimerClock::Monotonic, deadline, |res, _| {
                res.exit_event_loop()
            })
            .unwrap();
        h.worker.run_event_loop().unwrap();

        let mut response = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match read(client.as_raw_fd(), &mut chunk) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(e) => panic!("response read failed: {e}"),
            }
        }
        assert!(response.len() >= MSG_MIN_FRAME_LEN, "no response received");
        let announced = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        assert_eq!(announced as usize, response.len());
        response.split_off(4)
    }

    fn drain_control(h: &Harness) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut code = [0u8; 1];
        while let Ok(dgram) = comms::unix_recv(h.observer_end.as_raw_fd(), &mut code) {
            if dgram.len == 1 {
                seen.push(code[0]);
            }
        }
        seen
    }

    #[test]
    fn serves_a_version_request() {
        let h = harness();
        let response = roundtrip(&h, &frame(UBRIDGE_PROTOCOL, 2, 0, &[]));

        let (header, payload) = MsgHeader::parse(&response).unwrap();
        assert_eq!(header.cmd_number, CommandKind::Reply.as_wire());
        assert_eq!(header.status, 0);
        assert_eq!(Version::parse(payload).unwrap(), VERSION);
        // 4 (prefix) + 10 (header) + 6 (version triple) = 20 bytes total.
        assert_eq!(response.len(), MSG_HEADER_LEN + Version::WIRE_LEN);

        assert_eq!(drain_control(&h), vec![COMMS_CMD_RUNNING, COMMS_CMD_IDLE]);
    }

    #[test]
    fn unknown_commands_reply_with_success() {
        let h = harness();
        let response = roundtrip(&h, &frame(UBRIDGE_PROTOCOL, 99, 0, &[]));

        let (header, payload) = MsgHeader::parse(&response).unwrap();
        assert_eq!(header.status & 1, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn identify_decodes_and_records_the_device() {
        let h = harness();
        let payload = b"ACTION=add\0MAJOR=8\0MINOR=0\0SEQNUM=42\0";
        let response = roundtrip(&h, &frame(UBRIDGE_PROTOCOL, 3, 42, payload));

        let (header, _) = MsgHeader::parse(&response).unwrap();
        assert_eq!(header.status, 0);

        // The ident phase stored the decoded fields in the worker's store.
        let kv_res = h.worker.get_child(&KV_STORE, WORKER_KV_ID).unwrap();
        let kv = kv_res.data::<KvStore>().unwrap();
        let action = kv.get("udev", "ACTION").unwrap().0.bytes().unwrap().to_vec();
        assert_eq!(action, b"add");
        let seqnum = kv.get("udev", "SEQNUM").unwrap().0.bytes().unwrap().to_vec();
        assert_eq!(seqnum, b"42");
        drop(kv);

        // The request cycle is wrapped up: no command children remain.
        assert_eq!(h.worker.child_count(), 1); // just the kv store
    }

    #[test]
    fn malformed_identify_sets_the_failure_bit() {
        let h = harness();
        let response = roundtrip(&h, &frame(UBRIDGE_PROTOCOL, 3, 0, b"ACTION\0"));

        let (header, _) = MsgHeader::parse(&response).unwrap();
        assert_eq!(header.status & 1, 1);
    }

    #[test]
    fn newer_protocol_is_refused() {
        let h = harness();
        let response = roundtrip(&h, &frame(UBRIDGE_PROTOCOL + 1, 2, 0, &[]));

        let (header, payload) = MsgHeader::parse(&response).unwrap();
        assert_eq!(header.status & 1, 1);
        assert!(payload.is_empty());
    }
}
