//! The epoll-backed event loop behind loop-owning resources.
//!
//! One loop serves one process thread. Event sources are registered with a
//! numeric token; the loop maps readiness back to the source entry and runs
//! its callback with the owning resource as context. Five source kinds
//! exist:
//!
//! - **io** — readiness on a caller-owned descriptor;
//! - **signal** — a per-signal `signalfd` (the loop blocks the signal on
//!   registration, which signalfd delivery requires);
//! - **child** — process exit, multiplexed over one shared `SIGCHLD`
//!   signalfd and reaped with `waitid(WEXITED | WNOHANG)`;
//! - **timer** — a one-shot `timerfd` armed at an absolute microsecond
//!   deadline on the monotonic or realtime clock;
//! - **deferred** — a one-shot callback that runs before the next poll.
//!
//! Deferred sources always drain ahead of I/O on a tick. A callback error
//! removes the offending source and the loop keeps running; only epoll
//! failures end [`EventLoop::run`] itself.
//!
//! # Fork behaviour
//!
//! The epoll instance is shared with any forked child until the child tears
//! its inherited tree down. The loop records its origin PID and skips all
//! epoll bookkeeping when called from a different process, so a child's
//! teardown closes descriptors without disturbing the parent's
//! registrations. The destroy-while-dispatching guard is scoped the same
//! way.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{
    ClockId as TimerClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags,
};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, read, Pid};
use tracing::{debug, error};

use super::{Resource, ResourceError};
use crate::util::{now_usec, TimerClock};

/// Reserved token for the shared SIGCHLD watcher.
const TOKEN_CHILD_WATCH: u64 = 0;

/// Readiness flags delivered to io handlers.
#[derive(Debug, Clone, Copy)]
pub struct IoEvents(EpollFlags);

impl IoEvents {
    /// Data is available to read.
    #[must_use]
    pub fn readable(self) -> bool {
        self.0.contains(EpollFlags::EPOLLIN)
    }

    /// The descriptor is in an error state.
    #[must_use]
    pub fn error(self) -> bool {
        self.0.contains(EpollFlags::EPOLLERR)
    }

    /// The peer hung up.
    #[must_use]
    pub fn hangup(self) -> bool {
        self.0.contains(EpollFlags::EPOLLHUP)
    }
}

/// How a watched child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by a signal.
    Signaled {
        /// The terminating signal.
        signal: Signal,
        /// Whether a core dump was produced.
        core_dumped: bool,
    },
}

pub(crate) type IoHandler =
    Box<dyn FnMut(&Rc<Resource>, RawFd, IoEvents) -> Result<(), ResourceError>>;
pub(crate) type SignalHandler = Box<dyn FnMut(&Rc<Resource>, i32) -> Result<(), ResourceError>>;
pub(crate) type ChildHandler =
    Box<dyn FnMut(&Rc<Resource>, ChildExit) -> Result<(), ResourceError>>;
pub(crate) type TimeHandler = Box<dyn FnMut(&Rc<Resource>, u64) -> Result<(), ResourceError>>;
pub(crate) type DeferredHandler = Box<dyn FnMut(&Rc<Resource>) -> Result<(), ResourceError>>;

enum SourceKind {
    Io { fd: RawFd },
    Signal { sfd: SignalFd },
    Timer { tfd: TimerFd, clock: TimerClock },
    Child { pid: Pid },
    Deferred,
}

enum Handler {
    Io(IoHandler),
    Signal(SignalHandler),
    Child(ChildHandler),
    Time(TimeHandler),
    Deferred(DeferredHandler),
}

struct SourceEntry {
    kind: SourceKind,
    owner: Weak<Resource>,
    handler: RefCell<Handler>,
    enabled: Cell<bool>,
}

/// Handle to a registered event source.
///
/// The handle is cheap to clone; the owning resource keeps one so the source
/// is destroyed no later than the resource itself, and the caller may keep
/// another to destroy it earlier.
#[derive(Clone)]
pub struct EventSource {
    event_loop: Weak<EventLoop>,
    token: u64,
}

impl EventSource {
    pub(crate) fn token(&self) -> u64 {
        self.token
    }

    /// Unregisters the source from its loop, if both still exist.
    pub(crate) fn disarm(&self) {
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove(self.token);
        }
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("token", &self.token)
            .finish()
    }
}

/// A single-threaded epoll event loop.
pub(crate) struct EventLoop {
    epoll: Epoll,
    entries: RefCell<HashMap<u64, Rc<SourceEntry>>>,
    deferred: RefCell<VecDeque<u64>>,
    next_token: Cell<u64>,
    running: Cell<bool>,
    dispatching: Cell<u32>,
    exit_requested: Cell<bool>,
    /// PID of the process that created the loop; see the module docs.
    origin: Pid,
    child_watch: RefCell<Option<SignalFd>>,
}

impl EventLoop {
    pub(crate) fn new() -> Result<Rc<Self>, ResourceError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Rc::new(Self {
            epoll,
            entries: RefCell::new(HashMap::new()),
            deferred: RefCell::new(VecDeque::new()),
            next_token: Cell::new(TOKEN_CHILD_WATCH + 1),
            running: Cell::new(false),
            dispatching: Cell::new(0),
            exit_requested: Cell::new(false),
            origin: getpid(),
            child_watch: RefCell::new(None),
        }))
    }

    /// True while any callback on this loop is executing.
    pub(crate) fn in_dispatch(&self) -> bool {
        self.dispatching.get() > 0
    }

    /// True in the process that created the loop; false after `fork()` in
    /// the child.
    pub(crate) fn same_process(&self) -> bool {
        self.origin == getpid()
    }

    /// Requests loop exit; takes effect when the current callback returns.
    pub(crate) fn exit(&self) {
        self.exit_requested.set(true);
    }

    /// Runs the loop until an exit is requested.
    pub(crate) fn run(&self) -> Result<(), ResourceError> {
        if self.running.replace(true) {
            return Err(ResourceError::Invalid("event loop is already running"));
        }
        let result = self.run_inner();
        self.running.set(false);
        self.exit_requested.set(false);
        result
    }

    fn run_inner(&self) -> Result<(), ResourceError> {
        let mut events = vec![EpollEvent::empty(); 64];
        loop {
            self.dispatch_deferred();
            if self.exit_requested.get() {
                return Ok(());
            }
            // Deferred sources scheduled by the batch above must run before
            // we block for I/O again.
            let timeout = if self.deferred.borrow().is_empty() {
                EpollTimeout::NONE
            } else {
                EpollTimeout::ZERO
            };
            let ready = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(ResourceError::Os(e)),
            };
            for event in &events[..ready] {
                self.dispatch(event.data(), event.events());
                if self.exit_requested.get() {
                    return Ok(());
                }
            }
        }
    }

    fn alloc_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }

    fn insert(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        kind: SourceKind,
        handler: Handler,
    ) -> (u64, Rc<SourceEntry>) {
        let token = self.alloc_token();
        let entry = Rc::new(SourceEntry {
            kind,
            owner: Rc::downgrade(owner),
            handler: RefCell::new(handler),
            enabled: Cell::new(true),
        });
        self.entries.borrow_mut().insert(token, Rc::clone(&entry));
        (token, entry)
    }

    fn source(self: &Rc<Self>, token: u64) -> EventSource {
        EventSource {
            event_loop: Rc::downgrade(self),
            token,
        }
    }

    pub(crate) fn add_io(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        fd: RawFd,
        handler: IoHandler,
    ) -> Result<EventSource, ResourceError> {
        let (token, _) = self.insert(owner, SourceKind::Io { fd }, Handler::Io(handler));
        // SAFETY: the caller owns `fd` and keeps it open while registered.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = self
            .epoll
            .add(borrowed, EpollEvent::new(EpollFlags::EPOLLIN, token))
        {
            self.entries.borrow_mut().remove(&token);
            return Err(e.into());
        }
        Ok(self.source(token))
    }

    pub(crate) fn add_signal(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        signal: Signal,
        handler: SignalHandler,
    ) -> Result<EventSource, ResourceError> {
        // signalfd only sees blocked signals.
        let mut mask = SigSet::empty();
        mask.add(signal);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let token = self.alloc_token();
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token);
        self.epoll.add(sfd.as_fd(), event)?;
        let entry = Rc::new(SourceEntry {
            kind: SourceKind::Signal { sfd },
            owner: Rc::downgrade(owner),
            handler: RefCell::new(Handler::Signal(handler)),
            enabled: Cell::new(true),
        });
        self.entries.borrow_mut().insert(token, entry);
        Ok(self.source(token))
    }

    pub(crate) fn add_child(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        pid: Pid,
        handler: ChildHandler,
    ) -> Result<EventSource, ResourceError> {
        self.ensure_child_watch()?;
        let (token, _) = self.insert(owner, SourceKind::Child { pid }, Handler::Child(handler));
        Ok(self.source(token))
    }

    pub(crate) fn add_timer(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        clock: TimerClock,
        deadline_usec: u64,
        handler: TimeHandler,
    ) -> Result<EventSource, ResourceError> {
        let clock_id = match clock {
            TimerClock::Monotonic => TimerClockId::CLOCK_MONOTONIC,
            TimerClock::Realtime => TimerClockId::CLOCK_REALTIME,
        };
        let tfd = TimerFd::new(
            clock_id,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )?;
        // An absolute deadline in the past still fires immediately, but a
        // literal zero would disarm the timer.
        let deadline = TimeSpec::from_duration(Duration::from_micros(deadline_usec.max(1)));
        tfd.set(
            Expiration::OneShot(deadline),
            TimerSetTimeFlags::TFD_TIMER_ABSTIME,
        )?;

        let token = self.alloc_token();
        let event = EpollEvent::new(EpollFlags::EPOLLIN, token);
        self.epoll.add(tfd.as_fd(), event)?;
        let entry = Rc::new(SourceEntry {
            kind: SourceKind::Timer { tfd, clock },
            owner: Rc::downgrade(owner),
            handler: RefCell::new(Handler::Time(handler)),
            enabled: Cell::new(true),
        });
        self.entries.borrow_mut().insert(token, entry);
        Ok(self.source(token))
    }

    pub(crate) fn add_deferred(
        self: &Rc<Self>,
        owner: &Rc<Resource>,
        handler: DeferredHandler,
    ) -> Result<EventSource, ResourceError> {
        let (token, _) = self.insert(owner, SourceKind::Deferred, Handler::Deferred(handler));
        self.deferred.borrow_mut().push_back(token);
        Ok(self.source(token))
    }

    /// Unregisters a source. Descriptors owned by the entry close with it;
    /// epoll bookkeeping is skipped in a forked child (see module docs).
    pub(crate) fn remove(&self, token: u64) {
        let Some(entry) = self.entries.borrow_mut().remove(&token) else {
            return;
        };
        entry.enabled.set(false);
        if self.same_process() {
            let result = match &entry.kind {
                SourceKind::Io { fd } => {
                    // SAFETY: registered fds outlive their registration.
                    self.epoll.delete(unsafe { BorrowedFd::borrow_raw(*fd) })
                },
                SourceKind::Signal { sfd } => self.epoll.delete(sfd.as_fd()),
                SourceKind::Timer { tfd, .. } => self.epoll.delete(tfd.as_fd()),
                SourceKind::Child { .. } | SourceKind::Deferred => Ok(()),
            };
            if let Err(e) = result {
                debug!(token, error = %e, "event source deregistration failed");
            }
        }
        if matches!(entry.kind, SourceKind::Deferred) {
            self.deferred.borrow_mut().retain(|t| *t != token);
        }
    }

    fn lookup(&self, token: u64) -> Option<Rc<SourceEntry>> {
        self.entries.borrow().get(&token).cloned()
    }

    /// Runs the currently queued deferred sources, one shot each.
    fn dispatch_deferred(&self) {
        let batch: Vec<u64> = self.deferred.borrow_mut().drain(..).collect();
        for token in batch {
            if self.exit_requested.get() {
                // Keep un-run sources queued for the next tick.
                self.deferred.borrow_mut().push_back(token);
                continue;
            }
            let Some(entry) = self.lookup(token) else {
                continue;
            };
            let Some(owner) = self.live_owner(&entry, token) else {
                continue;
            };
            let result = {
                let mut handler = entry.handler.borrow_mut();
                let Handler::Deferred(callback) = &mut *handler else {
                    continue;
                };
                self.dispatching.set(self.dispatching.get() + 1);
                let r = callback(&owner);
                self.dispatching.set(self.dispatching.get() - 1);
                r
            };
            self.finish_one_shot(token, &owner, result);
        }
    }

    fn dispatch(&self, token: u64, flags: EpollFlags) {
        if token == TOKEN_CHILD_WATCH {
            self.dispatch_children();
            return;
        }
        let Some(entry) = self.lookup(token) else {
            return;
        };
        if !entry.enabled.get() {
            return;
        }
        let Some(owner) = self.live_owner(&entry, token) else {
            return;
        };

        self.dispatching.set(self.dispatching.get() + 1);
        let result = match &entry.kind {
            SourceKind::Io { fd } => {
                let mut handler = entry.handler.borrow_mut();
                match &mut *handler {
                    Handler::Io(callback) => callback(&owner, *fd, IoEvents(flags)),
                    _ => Ok(()),
                }
            },
            SourceKind::Signal { sfd } => {
                self.drain_signals(sfd.as_fd().as_raw_fd(), &entry, &owner)
            },
            SourceKind::Timer { tfd, clock } => {
                drain_timer(tfd.as_fd().as_raw_fd());
                let now = now_usec(*clock);
                let mut handler = entry.handler.borrow_mut();
                match &mut *handler {
                    Handler::Time(callback) => callback(&owner, now),
                    _ => Ok(()),
                }
            },
            // Child sources are dispatched through the shared watcher.
            SourceKind::Child { .. } | SourceKind::Deferred => Ok(()),
        };
        self.dispatching.set(self.dispatching.get() - 1);

        if let Err(e) = result {
            error!(id = %owner.full_id(), error = %e, "event handler failed, removing source");
            self.remove(token);
        }
    }

    fn drain_signals(
        &self,
        fd: RawFd,
        entry: &Rc<SourceEntry>,
        owner: &Rc<Resource>,
    ) -> Result<(), ResourceError> {
        // Read raw signalfd_siginfo records; ssi_signo is the leading u32.
        let mut raw = [0u8; std::mem::size_of::<nix::libc::signalfd_siginfo>()];
        loop {
            match read(fd, &mut raw) {
                Ok(n) if n == raw.len() => {
                    #[allow(clippy::cast_possible_wrap)] // signal numbers are small
                    let signo =
                        u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as i32;
                    let mut handler = entry.handler.borrow_mut();
                    if let Handler::Signal(callback) = &mut *handler {
                        callback(owner, signo)?;
                    }
                },
                Ok(_) => return Ok(()),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => {},
                Err(e) => return Err(ResourceError::Os(e)),
            }
            if self.exit_requested.get() {
                return Ok(());
            }
        }
    }

    /// Reaps and dispatches every watched child that has exited.
    fn dispatch_children(&self) {
        if let Some(sfd) = &*self.child_watch.borrow() {
            drain_signalfd(sfd.as_fd().as_raw_fd());
        }
        let watched: Vec<(u64, Pid)> = self
            .entries
            .borrow()
            .iter()
            .filter_map(|(token, entry)| match entry.kind {
                SourceKind::Child { pid } if entry.enabled.get() => Some((*token, pid)),
                _ => None,
            })
            .collect();

        for (token, pid) in watched {
            let status = match waitid(
                Id::Pid(pid),
                WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG,
            ) {
                Ok(WaitStatus::Exited(_, code)) => ChildExit::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, core_dumped)) => ChildExit::Signaled {
                    signal,
                    core_dumped,
                },
                Ok(_) => continue,
                Err(Errno::ECHILD) => {
                    self.remove(token);
                    continue;
                },
                Err(e) => {
                    debug!(pid = pid.as_raw(), error = %e, "waitid failed");
                    continue;
                },
            };

            let Some(entry) = self.lookup(token) else {
                continue;
            };
            let Some(owner) = self.live_owner(&entry, token) else {
                continue;
            };
            let result = {
                let mut handler = entry.handler.borrow_mut();
                let Handler::Child(callback) = &mut *handler else {
                    continue;
                };
                self.dispatching.set(self.dispatching.get() + 1);
                let r = callback(&owner, status);
                self.dispatching.set(self.dispatching.get() - 1);
                r
            };
            self.finish_one_shot(token, &owner, result);
        }
    }

    fn finish_one_shot(&self, token: u64, owner: &Rc<Resource>, result: Result<(), ResourceError>) {
        if let Err(e) = result {
            error!(id = %owner.full_id(), error = %e, "event handler failed");
        }
        self.remove(token);
    }

    fn live_owner(&self, entry: &Rc<SourceEntry>, token: u64) -> Option<Rc<Resource>> {
        match entry.owner.upgrade() {
            Some(owner) if !owner.is_destroyed() => Some(owner),
            _ => {
                self.remove(token);
                None
            },
        }
    }

    fn ensure_child_watch(&self) -> Result<(), ResourceError> {
        if self.child_watch.borrow().is_some() {
            return Ok(());
        }
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)?;
        let sfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        self.epoll.add(
            sfd.as_fd(),
            EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_CHILD_WATCH),
        )?;
        *self.child_watch.borrow_mut() = Some(sfd);
        Ok(())
    }
}

/// Discards pending expirations of a timerfd.
fn drain_timer(fd: RawFd) {
    let mut expirations = [0u8; 8];
    let _ = read(fd, &mut expirations);
}

/// Discards pending records of a signalfd.
fn drain_signalfd(fd: RawFd) {
    let mut raw = [0u8; std::mem::size_of::<nix::libc::signalfd_siginfo>()];
    while matches!(read(fd, &mut raw), Ok(n) if n > 0) {}
}
