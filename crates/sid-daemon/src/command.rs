//! Command execution pipeline.
//!
//! Each complete request frame becomes a `command` resource child of the
//! worker that received it. The command schedules a deferred event source,
//! so execution happens on the next loop tick, strictly one command at a
//! time in arrival order. The deferred handler:
//!
//! 1. reserves a zeroed response header segment in the command's result
//!    buffer (vector shape, size-prefixed);
//! 2. executes the command through [`COMMAND_EXECUTORS`] when the client's
//!    protocol is supported, otherwise marks the response failed;
//! 3. patches the header segment (response command is always `reply`,
//!    status bit 0 set on any failure) and writes the frame to the
//!    connection;
//! 4. hands control back to the worker, which finishes the request cycle.
//!
//! `identify` runs the fixed phase sequence in [`IdentPhase::MAIN_SEQUENCE`]
//! and short-circuits on the first failing phase. The two trigger-action
//! phases exist as reserved hooks for a later pass and are never invoked by
//! `identify` itself.

use std::rc::Rc;

use nix::unistd::getpid;
use sid_core::buffer::{
    Buffer, BufferBackend, BufferError, BufferInit, BufferMode, BufferShape, BufferSpec,
};
use sid_core::kvstore::{KvInput, KvStore, KV_STORE};
use sid_core::resource::{Resource, ResourceError, ResourceFlags, ResourceType};
use tracing::{debug, error};

use crate::protocol::{
    CommandKind, Device, MsgHeader, ProtocolError, COMMAND_STATUS_FAILURE, COMMAND_STATUS_SUCCESS,
    MSG_HEADER_LEN, UBRIDGE_PROTOCOL, VERSION,
};
use crate::worker;

/// Resource type of an in-flight command.
pub static COMMAND: ResourceType = ResourceType {
    name: "command",
    owns_event_loop: false,
    has_watchdog: false,
};

/// Errors raised while creating or executing a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The request frame or payload is malformed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The result buffer refused an operation.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// A resource-tree operation failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),
    /// The worker no longer has a connection to reply on.
    #[error("no connection to write the response to")]
    NoConnection,
    /// The command resource lost its data.
    #[error("command state is missing")]
    MissingState,
}

/// Per-command state.
#[derive(Debug)]
pub struct Command {
    /// Client protocol version from the request header.
    protocol: u8,
    /// Normalised command type.
    kind: CommandKind,
    /// Request status field (device event seqnum).
    request_status: u64,
    /// Device record decoded by `identify`.
    device: Device,
    /// Raw device-manager environment bytes from the payload.
    raw_env: Vec<u8>,
    /// Response under construction.
    result: Buffer,
}

impl Command {
    /// The command's normalised type.
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The request's device event sequence number.
    #[must_use]
    pub fn seqnum(&self) -> u64 {
        self.request_status
    }

    /// The device record decoded so far.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Creates a command resource under `worker_res` from a complete request
/// frame (size prefix already stripped) and schedules its execution.
///
/// # Errors
///
/// Frame-header parse failures and resource-creation failures.
pub fn create_command(
    worker_res: &Rc<Resource>,
    frame: &[u8],
) -> Result<Rc<Resource>, CommandError> {
    let (header, payload) = MsgHeader::parse(frame)?;
    let kind = CommandKind::from_wire(header.cmd_number);
    let id = format!("{}/{}", getpid().as_raw(), kind.name());
    let raw_env = payload.to_vec();

    let res = Resource::create(
        Some(worker_res),
        &COMMAND,
        ResourceFlags::NONE,
        id,
        move |res| {
            let result = Buffer::new(
                BufferSpec {
                    backend: BufferBackend::Heap,
                    shape: BufferShape::Vector,
                    mode: BufferMode::SizePrefix,
                },
                BufferInit {
                    size: 0,
                    alloc_step: 64,
                    limit: 0,
                },
            )
            .map_err(|e| ResourceError::Init(e.to_string()))?;
            res.create_deferred_event_source(on_command_tick)?;
            Ok(Command {
                protocol: header.protocol,
                kind,
                request_status: header.status,
                device: Device::default(),
                raw_env,
                result,
            })
        },
    )?;
    Ok(res)
}

/// Deferred handler: run the command, then let the worker wrap the request
/// cycle up. Per-request failures are logged here and reported through the
/// response status, never up into the event loop.
fn on_command_tick(cmd_res: &Rc<Resource>) -> Result<(), ResourceError> {
    if let Err(e) = execute(cmd_res) {
        error!(id = %cmd_res.full_id(), error = %e, "failed to execute command");
    }
    if let Some(worker_res) = cmd_res.parent() {
        worker::request_finished(&worker_res);
    }
    Ok(())
}

/// Builds and writes the response frame.
fn execute(cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    let header_index = {
        let mut cmd = cmd_res
            .data_mut::<Command>()
            .ok_or(CommandError::MissingState)?;
        cmd.result.add(&[0u8; MSG_HEADER_LEN])?
    };

    let (protocol, kind) = {
        let cmd = cmd_res
            .data::<Command>()
            .ok_or(CommandError::MissingState)?;
        (cmd.protocol, cmd.kind)
    };

    // A client speaking an older protocol gets a reply in its own protocol;
    // a newer one only gets the failure bit.
    let supported = protocol <= UBRIDGE_PROTOCOL;
    let mut status = COMMAND_STATUS_SUCCESS;
    if supported {
        if let Err(e) = COMMAND_EXECUTORS[kind as usize](cmd_res) {
            error!(id = %cmd_res.full_id(), error = %e, "command execution failed");
            status |= COMMAND_STATUS_FAILURE;
        }
    } else {
        debug!(
            id = %cmd_res.full_id(),
            requested = protocol,
            supported = UBRIDGE_PROTOCOL,
            "unsupported protocol version"
        );
        status |= COMMAND_STATUS_FAILURE;
    }

    let response = MsgHeader {
        protocol: if supported { protocol } else { 0 },
        cmd_number: CommandKind::Reply.as_wire(),
        status,
    };

    let conn_fd = cmd_res
        .parent()
        .and_then(|worker_res| {
            worker_res
                .data::<worker::Worker>()
                .and_then(|w| w.conn_raw())
        })
        .ok_or(CommandError::NoConnection)?;

    let mut cmd = cmd_res
        .data_mut::<Command>()
        .ok_or(CommandError::MissingState)?;
    cmd.result.rewrite_segment(header_index, &response.encode())?;
    cmd.result.write(conn_fd)?;
    Ok(())
}

type Executor = fn(&Rc<Resource>) -> Result<(), CommandError>;

/// Dispatch table indexed by [`CommandKind`].
static COMMAND_EXECUTORS: [Executor; CommandKind::COUNT] = [
    execute_unknown,
    execute_reply,
    execute_version,
    execute_identify,
    execute_checkpoint,
];

fn execute_unknown(_cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    Ok(())
}

fn execute_reply(_cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    Ok(())
}

fn execute_version(cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    let mut cmd = cmd_res
        .data_mut::<Command>()
        .ok_or(CommandError::MissingState)?;
    cmd.result.add(&VERSION.encode())?;
    Ok(())
}

fn execute_identify(cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    init_device(cmd_res)?;
    for phase in IdentPhase::MAIN_SEQUENCE {
        debug!(id = %cmd_res.full_id(), phase = phase.name(), "executing identify phase");
        if let Err(e) = phase.run(cmd_res) {
            error!(id = %cmd_res.full_id(), phase = phase.name(), "identify phase failed");
            return Err(e);
        }
    }
    Ok(())
}

fn execute_checkpoint(_cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    Ok(())
}

/// Decodes the raw device-manager environment into the device record.
fn init_device(cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    let raw = cmd_res
        .data::<Command>()
        .ok_or(CommandError::MissingState)?
        .raw_env
        .clone();
    match crate::protocol::decode_udev_env(&raw) {
        Ok(device) => {
            cmd_res
                .data_mut::<Command>()
                .ok_or(CommandError::MissingState)?
                .device = device;
            Ok(())
        },
        Err(e) => {
            error!(id = %cmd_res.full_id(), error = %e, "failed to parse device-manager environment");
            Err(e.into())
        },
    }
}

/// Phases of the `identify` pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentPhase {
    /// Record the decoded device in the worker's key-value store.
    Ident,
    /// Pre-scan hook.
    ScanPre,
    /// Scan of the current device generation.
    ScanCoreCurrent,
    /// Basic scan of the next device generation.
    ScanCoreNextBasic,
    /// Extended scan of the next device generation.
    ScanCoreNextExtended,
    /// Post-scan hook.
    ScanPost,
    /// Reserved: trigger actions on the current generation, run by a later
    /// pass outside `identify`.
    TriggerActionCurrent,
    /// Reserved: trigger actions on the next generation.
    TriggerActionNext,
}

impl IdentPhase {
    /// The fixed sequence `identify` executes, in order.
    pub const MAIN_SEQUENCE: [Self; 6] = [
        Self::Ident,
        Self::ScanPre,
        Self::ScanCoreCurrent,
        Self::ScanCoreNextBasic,
        Self::ScanCoreNextExtended,
        Self::ScanPost,
    ];

    /// Reserved trigger-action hooks; present in the enumeration, invoked
    /// only by a later pass.
    pub const TRIGGER_ACTIONS: [Self; 2] = [Self::TriggerActionCurrent, Self::TriggerActionNext];

    /// The phase's canonical name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ident => "ident",
            Self::ScanPre => "scan-pre",
            Self::ScanCoreCurrent => "scan-core-current",
            Self::ScanCoreNextBasic => "scan-core-next-basic",
            Self::ScanCoreNextExtended => "scan-core-next-extended",
            Self::ScanPost => "scan-post",
            Self::TriggerActionCurrent => "trigger-action-current",
            Self::TriggerActionNext => "trigger-action-next",
        }
    }

    /// Runs the phase against a command resource.
    fn run(self, cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
        match self {
            Self::Ident => phase_ident(cmd_res),
            // Scan hooks and the reserved trigger actions have no behaviour
            // yet.
            Self::ScanPre
            | Self::ScanCoreCurrent
            | Self::ScanCoreNextBasic
            | Self::ScanCoreNextExtended
            | Self::ScanPost
            | Self::TriggerActionCurrent
            | Self::TriggerActionNext => Ok(()),
        }
    }
}

/// Records the decoded device fields in the worker's key-value store under
/// the `udev` prefix.
fn phase_ident(cmd_res: &Rc<Resource>) -> Result<(), CommandError> {
    let Some(worker_res) = cmd_res.parent() else {
        return Ok(());
    };
    let Some(kv_res) = worker_res.get_child(&KV_STORE, worker::WORKER_KV_ID) else {
        return Ok(());
    };
    let device = cmd_res
        .data::<Command>()
        .ok_or(CommandError::MissingState)?
        .device
        .clone();
    let Some(mut kv) = kv_res.data_mut::<KvStore>() else {
        return Ok(());
    };

    kv.set(
        "udev",
        "ACTION",
        KvInput::Bytes(device.action.as_str().as_bytes()),
        false,
        None,
    );
    kv.set(
        "udev",
        "MAJOR",
        KvInput::Bytes(device.major.to_string().as_bytes()),
        false,
        None,
    );
    kv.set(
        "udev",
        "MINOR",
        KvInput::Bytes(device.minor.to_string().as_bytes()),
        false,
        None,
    );
    kv.set(
        "udev",
        "SEQNUM",
        KvInput::Bytes(device.seqnum.to_string().as_bytes()),
        false,
        None,
    );
    if let Some(name) = &device.name {
        kv.set("udev", "DEVNAME", KvInput::Bytes(name.as_bytes()), false, None);
    }
    if let Some(devtype) = &device.devtype {
        kv.set("udev", "DEVTYPE", KvInput::Bytes(devtype.as_bytes()), false, None);
    }
    if let Some(uuid) = &device.synth_uuid {
        kv.set("udev", "SYNTH_UUID", KvInput::Bytes(uuid.as_bytes()), false, None);
    }
    Ok(())
}
