//! # sid-core
//!
//! Core building blocks for the SID storage-identification daemon.
//!
//! This crate provides the subsystems everything else in the daemon is built
//! from, in dependency order:
//!
//! - [`buffer`]: framed byte buffers with heap and memfd backends, linear and
//!   vector shapes, and optional size-prefix framing. Every wire and internal
//!   channel in the daemon moves data through one of these.
//! - [`kvstore`]: an in-process key-value store with caller-selectable value
//!   semantics (copy vs shared, scalar vs vector, optional merge).
//! - [`resource`]: a hierarchical resource tree with scoped lifetimes, typed
//!   children and per-node event sources (I/O, signal, child-exit, timer,
//!   deferred) driven by a single-threaded epoll event loop.
//! - [`comms`]: datagram control-channel helpers with `SCM_RIGHTS` file
//!   descriptor passing, used between an observer and its forked worker.
//!
//! # Concurrency model
//!
//! Within a process exactly one thread drives the event loop of its top-level
//! loop-owning resource; callbacks are cooperative and run to completion.
//! Cross-process concurrency is achieved by forking worker processes, which
//! share no state with the parent after the fork. Nothing in this crate is
//! `Send` or `Sync` by design.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod buffer;
pub mod comms;
pub mod kvstore;
pub mod resource;
pub mod util;

pub use buffer::{Buffer, BufferBackend, BufferError, BufferInit, BufferMode, BufferShape};
pub use kvstore::{KvStore, KvValue};
pub use resource::{EventSource, Resource, ResourceError, ResourceFlags, ResourceType};
