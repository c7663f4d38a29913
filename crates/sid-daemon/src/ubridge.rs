//! The ubridge: listening socket and connection dispatch.
//!
//! The ubridge resource owns the daemon's listening socket. Every readiness
//! event on it means at least one pending connection: the ubridge picks the
//! first observer child whose worker is idle (insertion order), or forks a
//! fresh worker when none is, then accepts the connection and hands the
//! descriptor over the observer's control channel.
//!
//! The forked child returns out of [`spawn_worker`] as the worker side; the
//! interface handler runs its event loop and leaves the process when it
//! exits — the child never returns into the parent's accept path.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::socket::{
    accept4, bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType,
};
use sid_core::resource::{
    IoEvents, Resource, ResourceError, ResourceFlags, ResourceType,
};
use sid_core::util::{is_abstract_socket, unix_socket_addr};
use tracing::{debug, error, info};

use crate::config::SidConfig;
use crate::worker::{self, spawn_worker, Spawned, WorkerState};

/// Resource type of the daemon root.
pub static SID: ResourceType = ResourceType {
    name: "sid",
    owns_event_loop: true,
    has_watchdog: true,
};

/// Resource type of the listener.
pub static UBRIDGE: ResourceType = ResourceType {
    name: "ubridge",
    owns_event_loop: false,
    has_watchdog: false,
};

/// Root user data; shutdown is driven entirely by the signal sources.
#[derive(Debug)]
struct Sid;

/// Listener state.
#[derive(Debug)]
pub struct Ubridge {
    socket_fd: OwnedFd,
    socket_spec: String,
    /// Process that bound the socket. A forked worker tears its inherited
    /// copy down too; only the binding process may unlink the inode.
    origin: nix::unistd::Pid,
    config: SidConfig,
}

impl Drop for Ubridge {
    fn drop(&mut self) {
        // A filesystem socket leaves an inode behind; abstract names vanish
        // with the descriptor.
        if !is_abstract_socket(&self.socket_spec) && nix::unistd::getpid() == self.origin {
            let _ = std::fs::remove_file(&self.socket_spec);
        }
    }
}

/// Creates the daemon root: a loop-owning `sid` resource with shutdown
/// signal sources and the ubridge child.
///
/// # Errors
///
/// Socket setup and resource-creation failures; the partial root is torn
/// down on error.
pub fn create_root(config: SidConfig) -> Result<Rc<Resource>, ResourceError> {
    let root = Resource::create(None, &SID, ResourceFlags::NONE, "sid", |res| {
        res.create_signal_event_source(Signal::SIGTERM, on_root_signal)?;
        res.create_signal_event_source(Signal::SIGINT, on_root_signal)?;
        Ok(Sid)
    })?;
    if let Err(e) = create_ubridge(&root, config) {
        let _ = root.destroy();
        return Err(e);
    }
    Ok(root)
}

fn on_root_signal(root_res: &Rc<Resource>, signo: i32) -> Result<(), ResourceError> {
    info!(id = %root_res.full_id(), signal = signo, "received signal");
    root_res.exit_event_loop()
}

/// Creates the ubridge listener under `parent`.
///
/// # Errors
///
/// Socket creation/bind/listen failures and event-source registration
/// failures.
pub fn create_ubridge(
    parent: &Rc<Resource>,
    config: SidConfig,
) -> Result<Rc<Resource>, ResourceError> {
    Resource::create(
        Some(parent),
        &UBRIDGE,
        ResourceFlags::NONE,
        "ubridge",
        move |res| {
            let socket_fd = bind_listener(&config.socket_path)?;
            res.create_io_event_source(socket_fd.as_raw_fd(), on_interface_event)?;
            info!(id = %res.full_id(), socket = %config.socket_path, "listening");
            Ok(Ubridge {
                socket_fd,
                socket_spec: config.socket_path.clone(),
                origin: nix::unistd::getpid(),
                config,
            })
        },
    )
}

fn bind_listener(spec: &str) -> Result<OwnedFd, ResourceError> {
    let addr = unix_socket_addr(spec)?;
    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    if !is_abstract_socket(spec) {
        // A stale socket inode from a previous run blocks bind.
        let _ = std::fs::remove_file(spec);
    }
    bind(fd.as_raw_fd(), &addr)?;
    listen(&fd, Backlog::new(128)?)?;
    Ok(fd)
}

/// Listener readiness: route the pending connection to an idle worker,
/// spawning one when needed. Transient failures are logged and the
/// connection stays pending for the next readiness event.
fn on_interface_event(
    ubridge_res: &Rc<Resource>,
    _fd: std::os::fd::RawFd,
    _events: IoEvents,
) -> Result<(), ResourceError> {
    debug!(id = %ubridge_res.full_id(), "received an event");

    let observer_res = match find_idle_observer(ubridge_res) {
        Some(observer_res) => observer_res,
        None => {
            debug!(id = %ubridge_res.full_id(), "idle worker not found, spawning a new one");
            let config = match ubridge_res.data::<Ubridge>() {
                Some(ubridge) => ubridge.config.clone(),
                None => return Ok(()),
            };
            match spawn_worker(ubridge_res, &config) {
                Ok(Spawned::Observer(observer_res)) => observer_res,
                Ok(Spawned::Worker(worker_res)) => {
                    // Forked child: serve until the loop exits, then leave.
                    let code = match worker_res.run_event_loop() {
                        Ok(()) => 0,
                        Err(e) => {
                            error!(id = %worker_res.full_id(), error = %e, "worker loop failed");
                            1
                        },
                    };
                    let _ = worker_res.destroy();
                    std::process::exit(code);
                },
                Err(e) => {
                    error!(id = %ubridge_res.full_id(), error = %e, "failed to spawn worker");
                    return Ok(());
                },
            }
        },
    };

    if let Err(e) = accept_and_pass(ubridge_res, &observer_res) {
        error!(id = %ubridge_res.full_id(), error = %e, "failed to dispatch connection");
    }
    Ok(())
}

fn find_idle_observer(ubridge_res: &Rc<Resource>) -> Option<Rc<Resource>> {
    let mut iter = ubridge_res.iter();
    while let Some(child) = iter.next() {
        if child.is_type_of(&worker::OBSERVER)
            && worker::observer_state(&child) == Some(WorkerState::Idle)
        {
            return Some(child);
        }
    }
    None
}

fn accept_and_pass(
    ubridge_res: &Rc<Resource>,
    observer_res: &Rc<Resource>,
) -> Result<(), ResourceError> {
    let listener = ubridge_res
        .data::<Ubridge>()
        .ok_or(ResourceError::Invalid("ubridge state is missing"))?
        .socket_fd
        .as_raw_fd();
    let conn_fd = match accept4(listener, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
        // SAFETY: accept4 returned a fresh descriptor we now own.
        Ok(raw) => unsafe { OwnedFd::from_raw_fd(raw) },
        // Another readiness event will retry.
        Err(Errno::EAGAIN) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    worker::assign_connection(observer_res, conn_fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_owns_listener_and_cleans_up_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("sid.socket");
        let config = SidConfig {
            socket_path: socket_path.to_string_lossy().into_owned(),
            ..SidConfig::default()
        };

        let root = create_root(config.clone()).unwrap();
        assert!(socket_path.exists());

        let ubridge_res = root.get_child(&UBRIDGE, "ubridge").unwrap();
        assert!(ubridge_res.is_type_of(&UBRIDGE));
        assert!(ubridge_res.is_ancestor_of_type(&SID));

        // A second root on the same path replaces the stale inode.
        root.destroy().unwrap();
        assert!(!socket_path.exists());

        let root = create_root(config).unwrap();
        assert!(socket_path.exists());
        root.destroy().unwrap();
    }

    #[test]
    fn dot_dump_shows_the_daemon_tree() {
        let dir = tempfile::tempdir().unwrap();
        let config = SidConfig {
            socket_path: dir
                .path()
                .join("sid.socket")
                .to_string_lossy()
                .into_owned(),
            ..SidConfig::default()
        };
        let root = create_root(config).unwrap();
        let dot = root.dump_dot();
        assert!(dot.contains("\"sid\" -> \"sid/ubridge\";"));
        root.destroy().unwrap();
    }
}
