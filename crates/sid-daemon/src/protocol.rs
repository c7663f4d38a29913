//! Wire protocol between clients and the daemon.
//!
//! Every message on the ubridge socket is one size-prefixed frame:
//!
//! ```text
//! +---------------------+-------------+------------+--------------+---------+
//! | Length (4 bytes BE) | protocol u8 | command u8 | status u64 LE | payload |
//! +---------------------+-------------+------------+--------------+---------+
//! ```
//!
//! The length covers the whole frame including the prefix itself. On a
//! request the status field carries the device event sequence number; on a
//! response it carries status flags, bit 0 set on any failure. The frame
//! length is validated against the receive buffer's limit before allocation.
//!
//! The `identify` payload is a concatenation of NUL-terminated `KEY=VALUE`
//! strings — the raw device-manager environment. Recognised keys are decoded
//! into a [`Device`] record; anything else is ignored.

use sid_core::buffer::MSG_SIZE_PREFIX_LEN;

/// Protocol version spoken by this daemon.
pub const UBRIDGE_PROTOCOL: u8 = 1;

/// Default listening socket; the leading `@` selects the abstract namespace.
pub const DEFAULT_SOCKET_PATH: &str = "@sid-ubridge.socket";

/// Packed header length: protocol (1) + command (1) + status (8).
pub const MSG_HEADER_LEN: usize = 10;

/// Whole-frame length of a payload-less message.
pub const MSG_MIN_FRAME_LEN: usize = MSG_SIZE_PREFIX_LEN + MSG_HEADER_LEN;

/// Response status: everything succeeded.
pub const COMMAND_STATUS_SUCCESS: u64 = 0;

/// Response status bit 0: overall failure.
pub const COMMAND_STATUS_FAILURE: u64 = 1;

/// Errors produced while decoding frames and payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is too short to carry a header.
    #[error("frame too short: {len} bytes, header needs {MSG_HEADER_LEN}")]
    ShortFrame {
        /// Received frame length (without the size prefix).
        len: usize,
    },
    /// The payload violates the `KEY=VALUE` format or carries a bad number.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// The closed command enumeration. Anything outside the open range on the
/// wire is normalised to [`CommandKind::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    /// Out-of-range or unrecognised command.
    Unknown = 0,
    /// Response marker; never executed as a request for anything.
    Reply = 1,
    /// Daemon version query.
    Version = 2,
    /// Device identification pipeline.
    Identify = 3,
    /// Checkpoint marker.
    Checkpoint = 4,
}

impl CommandKind {
    /// Number of commands, including `Unknown`.
    pub const COUNT: usize = 5;

    /// Maps a wire command number onto the enumeration, normalising
    /// out-of-range values to `Unknown`.
    #[must_use]
    pub fn from_wire(raw: u8) -> Self {
        match raw {
            1 => Self::Reply,
            2 => Self::Version,
            3 => Self::Identify,
            4 => Self::Checkpoint,
            _ => Self::Unknown,
        }
    }

    /// The command's wire number.
    #[must_use]
    pub fn as_wire(self) -> u8 {
        self as u8
    }

    /// Command name, used in log identifiers.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Reply => "reply",
            Self::Version => "version",
            Self::Identify => "identify",
            Self::Checkpoint => "checkpoint",
        }
    }
}

/// The packed message header following the size prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    /// Protocol version of the sender.
    pub protocol: u8,
    /// Raw command number (request) or [`CommandKind::Reply`] (response).
    pub cmd_number: u8,
    /// Request: device seqnum. Response: status flags.
    pub status: u64,
}

impl MsgHeader {
    /// Encodes the header into its packed wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; MSG_HEADER_LEN] {
        let mut out = [0u8; MSG_HEADER_LEN];
        out[0] = self.protocol;
        out[1] = self.cmd_number;
        out[2..].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    /// Parses a header from the start of a frame (size prefix already
    /// stripped), returning it with the remaining payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ShortFrame`] when `frame` cannot hold a header.
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        if frame.len() < MSG_HEADER_LEN {
            return Err(ProtocolError::ShortFrame { len: frame.len() });
        }
        let status = u64::from_le_bytes([
            frame[2], frame[3], frame[4], frame[5], frame[6], frame[7], frame[8], frame[9],
        ]);
        Ok((
            Self {
                protocol: frame[0],
                cmd_number: frame[1],
                status,
            },
            &frame[MSG_HEADER_LEN..],
        ))
    }
}

/// Device-manager event action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAction {
    /// Unrecognised action string.
    #[default]
    Unknown,
    /// Device added.
    Add,
    /// Device removed.
    Remove,
    /// Device changed.
    Change,
    /// Device moved.
    Move,
    /// Device came online.
    Online,
    /// Device went offline.
    Offline,
    /// Driver bound.
    Bind,
    /// Driver unbound.
    Unbind,
}

impl DeviceAction {
    /// Maps a device-manager action string; unrecognised strings become
    /// `Unknown`.
    #[must_use]
    pub fn from_udev(value: &str) -> Self {
        match value {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "change" => Self::Change,
            "move" => Self::Move,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "bind" => Self::Bind,
            "unbind" => Self::Unbind,
            _ => Self::Unknown,
        }
    }

    /// The action's canonical string.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Change => "change",
            Self::Move => "move",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }
}

/// Decoded device fields of an `identify` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Device {
    /// Event action.
    pub action: DeviceAction,
    /// Device major number.
    pub major: i32,
    /// Device minor number.
    pub minor: i32,
    /// Device node name (`DEVNAME`).
    pub name: Option<String>,
    /// Device type (`DEVTYPE`).
    pub devtype: Option<String>,
    /// Event sequence number.
    pub seqnum: u64,
    /// Synthetic event UUID, if any.
    pub synth_uuid: Option<String>,
}

/// Decodes a NUL-delimited `KEY=VALUE` environment payload into a device
/// record. Unrecognised keys are ignored.
///
/// # Errors
///
/// [`ProtocolError::Malformed`] on a missing terminator, a missing `=`, an
/// empty value, or an unparsable number.
pub fn decode_udev_env(payload: &[u8]) -> Result<Device, ProtocolError> {
    let mut device = Device::default();
    let mut offset = 0;

    while offset < payload.len() {
        let rest = &payload[offset..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| ProtocolError::Malformed("unterminated entry".into()))?;
        let entry = std::str::from_utf8(&rest[..nul])
            .map_err(|_| ProtocolError::Malformed("entry is not valid UTF-8".into()))?;
        decode_entry(entry, &mut device)?;
        offset += nul + 1;
    }

    Ok(device)
}

fn decode_entry(entry: &str, device: &mut Device) -> Result<(), ProtocolError> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| ProtocolError::Malformed(format!("entry without '=': {entry:?}")))?;
    if value.is_empty() {
        return Err(ProtocolError::Malformed(format!("empty value for {key}")));
    }

    match key {
        "ACTION" => device.action = DeviceAction::from_udev(value),
        "DEVNAME" => device.name = Some(value.to_string()),
        "DEVTYPE" => device.devtype = Some(value.to_string()),
        "MAJOR" => device.major = parse_number(key, value)?,
        "MINOR" => device.minor = parse_number(key, value)?,
        "SEQNUM" => device.seqnum = parse_number(key, value)?,
        "SYNTH_UUID" => device.synth_uuid = Some(value.to_string()),
        _ => {},
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::Malformed(format!("bad number for {key}: {value:?}")))
}

/// Daemon version triple, three little-endian `u16` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Release number.
    pub release: u16,
}

/// The compiled-in daemon version.
pub const VERSION: Version = Version {
    major: 0,
    minor: 1,
    release: 0,
};

impl Version {
    /// Wire length of an encoded version.
    pub const WIRE_LEN: usize = 6;

    /// Encodes the triple.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut out = [0u8; Self::WIRE_LEN];
        out[0..2].copy_from_slice(&self.major.to_le_bytes());
        out[2..4].copy_from_slice(&self.minor.to_le_bytes());
        out[4..6].copy_from_slice(&self.release.to_le_bytes());
        out
    }

    /// Parses a version triple from a response payload.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Malformed`] when the payload is not 6 bytes.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != Self::WIRE_LEN {
            return Err(ProtocolError::Malformed(format!(
                "version payload has {} bytes, expected {}",
                payload.len(),
                Self::WIRE_LEN
            )));
        }
        Ok(Self {
            major: u16::from_le_bytes([payload[0], payload[1]]),
            minor: u16::from_le_bytes([payload[2], payload[3]]),
            release: u16::from_le_bytes([payload[4], payload[5]]),
        })
    }
}
