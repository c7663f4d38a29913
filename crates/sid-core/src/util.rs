//! Small shared helpers: clocks and socket address parsing.

use nix::errno::Errno;
use nix::sys::socket::UnixAddr;
use nix::time::{clock_gettime, ClockId};

/// Clock selector for timer event sources and deadline arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClock {
    /// `CLOCK_MONOTONIC`.
    Monotonic,
    /// `CLOCK_REALTIME`.
    Realtime,
}

/// Returns the current time on `clock` in microseconds.
#[must_use]
pub fn now_usec(clock: TimerClock) -> u64 {
    let id = match clock {
        TimerClock::Monotonic => ClockId::CLOCK_MONOTONIC,
        TimerClock::Realtime => ClockId::CLOCK_REALTIME,
    };
    // clock_gettime on these clocks cannot fail with a valid clock id.
    let ts = clock_gettime(id).expect("clock_gettime on these clocks cannot fail with a valid clock id");
    #[allow(clippy::cast_sign_loss)] // both clocks are past the epoch
    {
        ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000
    }
}

/// Parses a socket address specification into a Unix socket address.
///
/// A leading `@` selects the abstract namespace (`@sid-ubridge.socket`);
/// anything else is a filesystem path.
///
/// # Errors
///
/// Returns an error if the name exceeds the address size limit.
pub fn unix_socket_addr(spec: &str) -> Result<UnixAddr, Errno> {
    match spec.strip_prefix('@') {
        Some(name) => UnixAddr::new_abstract(name.as_bytes()),
        None => UnixAddr::new(spec),
    }
}

/// Returns `true` when `spec` names an abstract-namespace socket.
#[must_use]
pub fn is_abstract_socket(spec: &str) -> bool {
    spec.starts_with('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = now_usec(TimerClock::Monotonic);
        let b = now_usec(TimerClock::Monotonic);
        assert!(b >= a);
    }

    #[test]
    fn abstract_address_parses() {
        let addr = unix_socket_addr("@sid-test.socket").unwrap();
        assert!(addr.path().is_none());
        assert!(is_abstract_socket("@sid-test.socket"));
    }

    #[test]
    fn path_address_parses() {
        let addr = unix_socket_addr("/run/sid/test.socket").unwrap();
        assert!(addr.path().is_some());
        assert!(!is_abstract_socket("/run/sid/test.socket"));
    }
}
