//! Observer/worker control channel primitives.
//!
//! The observer and its forked worker talk over a `socketpair(AF_UNIX,
//! SOCK_DGRAM)`. Messages are single-byte control codes, optionally carrying
//! a file descriptor as `SCM_RIGHTS` ancillary data (this is how an accepted
//! connection is handed to a worker). These helpers wrap `sendmsg`/`recvmsg`
//! so the rest of the daemon never touches control-message plumbing.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags,
};

/// One received control-channel datagram.
#[derive(Debug)]
pub struct Datagram {
    /// Payload bytes received (zero or one control code in practice).
    pub len: usize,
    /// File descriptor passed alongside the payload, if any. The descriptor
    /// is owned by the receiver from this point on.
    pub fd: Option<OwnedFd>,
}

/// Sends a datagram on the control channel.
///
/// `data` may be empty: passing a descriptor with no payload is how the
/// observer hands a connection over.
///
/// # Errors
///
/// Any `sendmsg` failure, including `EAGAIN` on a full socket buffer.
pub fn unix_send(fd: RawFd, data: &[u8], pass_fd: Option<RawFd>) -> Result<usize, Errno> {
    let iov = [IoSlice::new(data)];
    let fds;
    let cmsgs: &[ControlMessage] = match pass_fd {
        Some(raw) => {
            fds = [raw];
            &[ControlMessage::ScmRights(&fds)]
        },
        None => &[],
    };
    sendmsg::<()>(fd, &iov, cmsgs, MsgFlags::empty(), None)
}

/// Receives one datagram from the control channel.
///
/// # Errors
///
/// Any `recvmsg` failure; `EAGAIN` when the channel is drained.
pub fn unix_recv(fd: RawFd, buf: &mut [u8]) -> Result<Datagram, Errno> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(fd, &mut iov, Some(&mut space), MsgFlags::empty())?;

    let mut received = None;
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                // SAFETY: the kernel installed a fresh descriptor for us; we
                // are its sole owner.
                received = Some(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }

    Ok(Datagram {
        len: msg.bytes,
        fd: received,
    })
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::{read, write};

    use super::*;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn sends_control_byte() {
        let (a, b) = pair();
        unix_send(a.as_raw_fd(), &[2], None).unwrap();

        let mut buf = [0u8; 1];
        let dgram = unix_recv(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(dgram.len, 1);
        assert_eq!(buf[0], 2);
        assert!(dgram.fd.is_none());
    }

    #[test]
    fn passes_descriptor() {
        let (a, b) = pair();
        let (payload_r, payload_w) = nix::unistd::pipe().unwrap();

        unix_send(a.as_raw_fd(), &[], Some(payload_r.as_raw_fd())).unwrap();
        drop(payload_r);

        let mut buf = [0u8; 1];
        let dgram = unix_recv(b.as_raw_fd(), &mut buf).unwrap();
        let received = dgram.fd.expect("descriptor expected");

        // The received descriptor references the same pipe.
        write(&payload_w, b"x").unwrap();
        let mut data = [0u8; 1];
        assert_eq!(read(received.as_raw_fd(), &mut data).unwrap(), 1);
        assert_eq!(&data, b"x");
    }

    #[test]
    fn drained_channel_reports_eagain() {
        let (_a, b) = pair();
        let mut buf = [0u8; 1];
        assert!(matches!(unix_recv(b.as_raw_fd(), &mut buf), Err(Errno::EAGAIN)));
    }
}
