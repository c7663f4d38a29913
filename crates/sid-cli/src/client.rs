//! Client side of the ubridge protocol.
//!
//! Each operation is stateless: connect, send one framed request, read one
//! framed reply, close. The connection is plain `UnixStream` I/O; only the
//! connect step goes through `nix`, because the daemon usually listens in
//! the abstract namespace which the standard library cannot address.

use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType};
use sid_core::util::unix_socket_addr;
use sid_daemon::protocol::{CommandKind, MsgHeader, ProtocolError, MSG_HEADER_LEN};

/// Upper bound on a reply frame; validated before allocation.
pub const MAX_REPLY_SIZE: usize = 16 * 1024 * 1024;

/// Default I/O timeout for a request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from talking to the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The daemon socket does not exist or refuses connections.
    #[error("daemon is not running")]
    DaemonNotRunning,
    /// Stream I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A system call failed.
    #[error("system error: {0}")]
    Os(#[from] Errno),
    /// The reply violates the wire format.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The reply announces more than [`MAX_REPLY_SIZE`] bytes.
    #[error("reply too large: {size} bytes (max {max})")]
    ReplyTooLarge {
        /// Announced frame size.
        size: usize,
        /// Permitted maximum.
        max: usize,
    },
}

/// One parsed reply frame.
#[derive(Debug)]
pub struct Reply {
    /// The reply header.
    pub header: MsgHeader,
    /// Command-specific payload.
    pub payload: Vec<u8>,
}

impl Reply {
    /// True when the daemon set the overall-failure bit.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.header.status & 1 != 0
    }
}

/// Stateless daemon client bound to one socket address.
#[derive(Debug)]
pub struct DaemonClient {
    socket_spec: String,
    timeout: Duration,
}

impl DaemonClient {
    /// Creates a client for the given socket specification (a leading `@`
    /// selects the abstract namespace).
    #[must_use]
    pub fn new(socket_spec: impl Into<String>) -> Self {
        Self {
            socket_spec: socket_spec.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sends one request and reads the reply.
    ///
    /// # Errors
    ///
    /// Connection, I/O and frame-format failures. A reply with the failure
    /// bit set is returned as `Ok`; interpreting it is the caller's call.
    pub fn request(
        &self,
        command: CommandKind,
        status: u64,
        payload: &[u8],
    ) -> Result<Reply, ClientError> {
        let mut stream = self.connect()?;

        let total = 4 + MSG_HEADER_LEN + payload.len();
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(
            &u32::try_from(total)
                .map_err(|_| ClientError::ReplyTooLarge {
                    size: total,
                    max: u32::MAX as usize,
                })?
                .to_be_bytes(),
        );
        frame.extend_from_slice(
            &MsgHeader {
                protocol: sid_daemon::protocol::UBRIDGE_PROTOCOL,
                cmd_number: command.as_wire(),
                status,
            }
            .encode(),
        );
        frame.extend_from_slice(payload);
        stream.write_all(&frame)?;

        let mut prefix = [0u8; 4];
        stream.read_exact(&mut prefix)?;
        let announced = u32::from_be_bytes(prefix) as usize;
        if announced > MAX_REPLY_SIZE {
            return Err(ClientError::ReplyTooLarge {
                size: announced,
                max: MAX_REPLY_SIZE,
            });
        }
        if announced < 4 + MSG_HEADER_LEN {
            return Err(ProtocolError::ShortFrame {
                len: announced.saturating_sub(4),
            }
            .into());
        }

        let mut body = vec![0u8; announced - 4];
        stream.read_exact(&mut body)?;
        let (header, reply_payload) = MsgHeader::parse(&body)?;
        Ok(Reply {
            header,
            payload: reply_payload.to_vec(),
        })
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let addr = unix_socket_addr(&self.socket_spec)?;
        let fd = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        connect(fd.as_raw_fd(), &addr).map_err(|e| match e {
            Errno::ENOENT | Errno::ECONNREFUSED => ClientError::DaemonNotRunning,
            other => ClientError::Os(other),
        })?;

        let stream = UnixStream::from(fd);
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }
}
