//! # sid-daemon
//!
//! The storage-identification daemon: listens on a local stream socket for
//! device events emitted by the host's device manager, dispatches each
//! connection to a forked short-lived worker, classifies the device through
//! a multi-phase command pipeline and replies to the client.
//!
//! ## Architecture
//!
//! ```text
//! sid (root, event loop)
//! └── ubridge (listening socket)
//!     ├── observer 1401  ◀── control channel ──▶  worker process 1401
//!     │                                           └── command (per request)
//!     └── observer 1402  ◀── control channel ──▶  worker process 1402
//! ```
//!
//! Everything hangs off one resource tree (`sid_core::resource`). The root
//! drives the parent's event loop; each forked worker tears down its copy of
//! the tree and runs its own loop. Accepted connections travel to workers as
//! `SCM_RIGHTS` descriptors over per-worker datagram channels.
//!
//! - [`protocol`]: wire format — size-prefixed frames, packed header,
//!   device-manager environment decoding.
//! - [`command`]: per-request command resources and the `identify` phase
//!   pipeline.
//! - [`worker`]: fork protocol, worker event loop, observer state machine
//!   and idle-timeout reaping.
//! - [`ubridge`]: the listener and connection dispatch.
//! - [`config`]: TOML configuration with CLI overrides.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod config;
pub mod protocol;
pub mod ubridge;
pub mod worker;

pub use config::SidConfig;
pub use protocol::{CommandKind, Device, DeviceAction, MsgHeader, Version, UBRIDGE_PROTOCOL};
