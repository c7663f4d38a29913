//! Framed byte buffers.
//!
//! Every wire and internal channel in the daemon moves data through a
//! [`Buffer`]. A buffer is configured along three independent axes:
//!
//! - **backend** — where the bytes live: a heap region, or an anonymous
//!   `memfd` grown with `ftruncate` and mapped writable (intended for
//!   zero-copy handoff between processes);
//! - **shape** — [`Linear`](BufferShape::Linear) appends form a flat stream,
//!   [`Vector`](BufferShape::Vector) appends are recorded as ordered segments
//!   and written out with `writev`;
//! - **mode** — [`Plain`](BufferMode::Plain) leaves framing to the caller,
//!   [`SizePrefix`](BufferMode::SizePrefix) reserves 4 leading bytes holding
//!   the whole frame length (including the prefix) as a big-endian `u32`,
//!   updated on every mutation.
//!
//! The size prefix is what makes one message on a stream socket a *frame*:
//! a reader keeps calling [`Buffer::read`] until [`Buffer::is_complete`]
//! reports that `used` covers the announced length. The frame length is
//! validated against the configured `limit` before any allocation happens,
//! so a hostile length prefix cannot balloon memory.

use std::fmt;
use std::io::IoSlice;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::libc::c_void;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::uio::writev;
use nix::unistd::{ftruncate, read, write};

/// Number of leading bytes reserved by [`BufferMode::SizePrefix`].
pub const MSG_SIZE_PREFIX_LEN: usize = 4;

/// Default read chunk when the frame length is not yet known.
const DEFAULT_READ_CHUNK: usize = 4096;

/// Where the buffer's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferBackend {
    /// Heap-allocated region.
    Heap,
    /// Anonymous file descriptor, `ftruncate`-grown and mapped writable.
    Memfd,
}

/// How appended data is organised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferShape {
    /// Appended bytes form a flat stream.
    Linear,
    /// Appends are recorded as ordered segments, written with `writev`.
    Vector,
}

/// Framing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// The caller manages framing.
    Plain,
    /// 4 leading bytes hold the whole frame length, big-endian.
    SizePrefix,
}

/// The three configuration axes of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Storage backend.
    pub backend: BufferBackend,
    /// Data shape.
    pub shape: BufferShape,
    /// Framing mode.
    pub mode: BufferMode,
}

/// Allocation parameters fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInit {
    /// Bytes allocated up front.
    pub size: usize,
    /// Growth granularity; allocation is rounded up to a multiple of this.
    pub alloc_step: usize,
    /// Hard allocation cap; `0` means unlimited.
    pub limit: usize,
}

/// Current allocation and fill level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferUsage {
    /// Bytes currently allocated.
    pub allocated: usize,
    /// Bytes currently used (including the size prefix, if any).
    pub used: usize,
}

/// Snapshot of a buffer's configuration and usage.
#[derive(Debug, Clone, Copy)]
pub struct BufferStat {
    /// Configuration axes.
    pub spec: BufferSpec,
    /// Allocation parameters.
    pub init: BufferInit,
    /// Current usage.
    pub usage: BufferUsage,
}

/// Errors produced by buffer operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Growing past the configured limit was refused.
    #[error("buffer limit exceeded: {needed} bytes needed, limit is {limit}")]
    Exhausted {
        /// Total bytes the operation would have required.
        needed: usize,
        /// Configured allocation cap.
        limit: usize,
    },
    /// The operation does not apply to this buffer's configuration.
    #[error("invalid buffer operation: {0}")]
    Invalid(&'static str),
    /// An underlying system call failed.
    #[error("buffer i/o failed: {0}")]
    Io(#[from] Errno),
}

/// One recorded segment of a vector-shaped buffer.
#[derive(Debug, Clone, Copy)]
struct Segment {
    offset: usize,
    len: usize,
}

/// Backing storage. Both variants expose a contiguous byte region; growth
/// preserves content.
enum Region {
    Heap(Vec<u8>),
    Memfd {
        fd: OwnedFd,
        map: Option<(NonNull<c_void>, usize)>,
    },
}

impl Region {
    fn new(backend: BufferBackend) -> Result<Self, BufferError> {
        match backend {
            BufferBackend::Heap => Ok(Self::Heap(Vec::new())),
            BufferBackend::Memfd => {
                let fd = memfd_create(c"sid-buffer", MemFdCreateFlag::MFD_CLOEXEC)?;
                Ok(Self::Memfd { fd, map: None })
            },
        }
    }

    /// Resizes the region to exactly `cap` bytes, keeping existing content.
    fn grow(&mut self, cap: usize) -> Result<(), BufferError> {
        match self {
            Self::Heap(vec) => {
                vec.resize(cap, 0);
                Ok(())
            },
            Self::Memfd { fd, map } => {
                if let Some((ptr, len)) = map.take() {
                    // SAFETY: ptr/len describe the mapping we created below.
                    unsafe { munmap(ptr, len) }?;
                }
                #[allow(clippy::cast_possible_wrap)] // caps are far below i64::MAX
                ftruncate(&*fd, cap as i64)?;
                if let Some(len) = NonZeroUsize::new(cap) {
                    // SAFETY: mapping a file we own at a fresh address.
                    let ptr = unsafe {
                        mmap(
                            None,
                            len,
                            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                            MapFlags::MAP_SHARED,
                            &*fd,
                            0,
                        )
                    }?;
                    *map = Some((ptr, cap));
                }
                Ok(())
            },
        }
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Heap(vec) => vec.as_slice(),
            Self::Memfd { map, .. } => match map {
                // SAFETY: the mapping is live and sized `len`.
                Some((ptr, len)) => unsafe {
                    std::slice::from_raw_parts(ptr.as_ptr().cast::<u8>(), *len)
                },
                None => &[],
            },
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(vec) => vec.as_mut_slice(),
            Self::Memfd { map, .. } => match map {
                // SAFETY: the mapping is live, writable and sized `len`.
                Some((ptr, len)) => unsafe {
                    std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), *len)
                },
                None => &mut [],
            },
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Self::Memfd { map, .. } = self {
            if let Some((ptr, len)) = map.take() {
                // SAFETY: dropping the mapping we created; errors are moot here.
                let _ = unsafe { munmap(ptr, len) };
            }
        }
    }
}

/// A framed byte buffer. See the module docs for the configuration axes.
pub struct Buffer {
    spec: BufferSpec,
    init: BufferInit,
    region: Region,
    allocated: usize,
    used: usize,
    /// Segment table; populated only for [`BufferShape::Vector`].
    segments: Vec<Segment>,
}

impl Buffer {
    /// Creates a buffer with the given configuration, allocating
    /// `init.size` bytes up front.
    ///
    /// # Errors
    ///
    /// Fails when the up-front allocation exceeds `init.limit` or the memfd
    /// backend cannot be set up.
    pub fn new(spec: BufferSpec, init: BufferInit) -> Result<Self, BufferError> {
        if init.limit > 0 && init.size > init.limit {
            return Err(BufferError::Exhausted {
                needed: init.size,
                limit: init.limit,
            });
        }
        let mut region = Region::new(spec.backend)?;
        if init.size > 0 {
            region.grow(init.size)?;
        }
        Ok(Self {
            spec,
            init,
            region,
            allocated: init.size,
            used: 0,
            segments: Vec::new(),
        })
    }

    /// Returns the buffer's configuration and usage snapshot.
    #[must_use]
    pub fn stat(&self) -> BufferStat {
        BufferStat {
            spec: self.spec,
            init: self.init,
            usage: BufferUsage {
                allocated: self.allocated,
                used: self.used,
            },
        }
    }

    /// Appends `bytes` to the buffer.
    ///
    /// In size-prefix mode the first append lazily reserves the prefix; the
    /// prefix value tracks `used` from then on. For vector shape the return
    /// value is the index of the new segment, for linear shape the byte
    /// offset the data landed at.
    ///
    /// # Errors
    ///
    /// [`BufferError::Exhausted`] when growth would exceed the limit; the
    /// buffer is left unchanged in that case.
    pub fn add(&mut self, bytes: &[u8]) -> Result<usize, BufferError> {
        self.reserve_prefix()?;
        let offset = self.used;
        self.ensure(bytes.len())?;
        self.region.bytes_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.used = offset + bytes.len();
        let handle = match self.spec.shape {
            BufferShape::Linear => offset,
            BufferShape::Vector => {
                self.segments.push(Segment {
                    offset,
                    len: bytes.len(),
                });
                self.segments.len() - 1
            },
        };
        self.update_prefix();
        Ok(handle)
    }

    /// Appends formatted text, e.g. `buf.add_fmt(format_args!("{pid}"))`.
    ///
    /// # Errors
    ///
    /// Same growth failures as [`Buffer::add`].
    pub fn add_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        self.add(args.to_string().as_bytes())
    }

    /// Overwrites an existing vector segment with equal-length content.
    ///
    /// This serves the reserve-then-patch pattern: append a zeroed header
    /// segment first, fill in the real header once the payload is known.
    ///
    /// # Errors
    ///
    /// [`BufferError::Invalid`] on a linear buffer, an out-of-range index or
    /// a length mismatch.
    pub fn rewrite_segment(&mut self, index: usize, bytes: &[u8]) -> Result<(), BufferError> {
        if self.spec.shape != BufferShape::Vector {
            return Err(BufferError::Invalid("segment rewrite on a linear buffer"));
        }
        let segment = *self
            .segments
            .get(index)
            .ok_or(BufferError::Invalid("segment index out of range"))?;
        if segment.len != bytes.len() {
            return Err(BufferError::Invalid("segment length mismatch"));
        }
        self.region.bytes_mut()[segment.offset..segment.offset + segment.len]
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Returns the buffer payload: everything after the size prefix in
    /// size-prefix mode, the whole content otherwise.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        let start = match self.spec.mode {
            BufferMode::SizePrefix => MSG_SIZE_PREFIX_LEN.min(self.used),
            BufferMode::Plain => 0,
        };
        &self.region.bytes()[start..self.used]
    }

    /// Returns the recorded segments of a vector buffer as io slices
    /// (the size prefix, when present, is the first slice).
    #[must_use]
    pub fn segments(&self) -> Vec<IoSlice<'_>> {
        let bytes = self.region.bytes();
        self.segments
            .iter()
            .map(|s| IoSlice::new(&bytes[s.offset..s.offset + s.len]))
            .collect()
    }

    /// Number of recorded segments, including the size prefix segment.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// True when a size-prefixed frame has been fully received, i.e.
    /// `used >= 4` and `used` covers the announced frame length. Plain
    /// buffers are always complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.spec.mode {
            BufferMode::Plain => true,
            BufferMode::SizePrefix => {
                self.used >= MSG_SIZE_PREFIX_LEN && self.used >= self.prefix_value()
            },
        }
    }

    /// Drops the buffer content. A non-zero `size` additionally shrinks the
    /// allocation to `size` bytes; zero retains the current allocation.
    pub fn reset(&mut self, size: usize) {
        self.used = 0;
        self.segments.clear();
        if size > 0 && size < self.allocated {
            // Shrinking cannot fail on either backend.
            if self.region.grow(size).is_ok() {
                self.allocated = size;
            }
        }
    }

    /// Reads from `fd` into the buffer, at most up to the end of the current
    /// frame in size-prefix mode.
    ///
    /// Returns the number of bytes read; `Ok(0)` signals end of stream.
    ///
    /// # Errors
    ///
    /// `EAGAIN`/`EINTR` are passed through for the caller's retry policy;
    /// a frame announcing more than the configured limit fails with
    /// [`BufferError::Exhausted`] before any allocation.
    pub fn read(&mut self, fd: RawFd) -> Result<usize, BufferError> {
        let want = match self.spec.mode {
            BufferMode::SizePrefix if self.used < MSG_SIZE_PREFIX_LEN => {
                MSG_SIZE_PREFIX_LEN - self.used
            },
            BufferMode::SizePrefix => {
                let frame = self.prefix_value().max(MSG_SIZE_PREFIX_LEN);
                if frame <= self.used {
                    return Ok(0);
                }
                frame - self.used
            },
            BufferMode::Plain => self.init.alloc_step.max(DEFAULT_READ_CHUNK),
        };
        self.ensure(want)?;
        let offset = self.used;
        let n = read(fd, &mut self.region.bytes_mut()[offset..offset + want])?;
        self.used += n;
        Ok(n)
    }

    /// Writes the whole current frame (prefix included) to `fd`, resuming
    /// partial and interrupted writes until done.
    ///
    /// # Errors
    ///
    /// Any unrecoverable write failure.
    pub fn write(&self, fd: RawFd) -> Result<(), BufferError> {
        // SAFETY: the caller guarantees `fd` stays open for the duration.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut written = 0usize;

        if self.spec.shape == BufferShape::Vector && !self.segments.is_empty() {
            match writev(borrowed, &self.segments()) {
                Ok(n) => written = n,
                Err(Errno::EAGAIN | Errno::EINTR) => {},
                Err(e) => return Err(e.into()),
            }
        }

        let frame = &self.region.bytes()[..self.used];
        while written < frame.len() {
            match write(borrowed, &frame[written..]) {
                Ok(0) => return Err(BufferError::Io(Errno::EIO)),
                Ok(n) => written += n,
                Err(Errno::EINTR) => {},
                Err(Errno::EAGAIN) => wait_writable(borrowed)?,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reserves the size prefix on the first mutation of a size-prefixed
    /// buffer.
    fn reserve_prefix(&mut self) -> Result<(), BufferError> {
        if self.spec.mode != BufferMode::SizePrefix || self.used != 0 {
            return Ok(());
        }
        self.ensure(MSG_SIZE_PREFIX_LEN)?;
        self.region.bytes_mut()[..MSG_SIZE_PREFIX_LEN].fill(0);
        self.used = MSG_SIZE_PREFIX_LEN;
        if self.spec.shape == BufferShape::Vector {
            self.segments.push(Segment {
                offset: 0,
                len: MSG_SIZE_PREFIX_LEN,
            });
        }
        Ok(())
    }

    /// Grows the region so `need` more bytes fit, honouring step and limit.
    fn ensure(&mut self, need: usize) -> Result<(), BufferError> {
        let required = self
            .used
            .checked_add(need)
            .ok_or(BufferError::Invalid("buffer size overflow"))?;
        if required <= self.allocated {
            return Ok(());
        }
        if self.init.limit > 0 && required > self.init.limit {
            return Err(BufferError::Exhausted {
                needed: required,
                limit: self.init.limit,
            });
        }
        let step = self.init.alloc_step.max(1);
        let mut target = required.div_ceil(step) * step;
        if self.init.limit > 0 {
            target = target.min(self.init.limit);
        }
        self.region.grow(target)?;
        self.allocated = target;
        Ok(())
    }

    fn prefix_value(&self) -> usize {
        let bytes = self.region.bytes();
        u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
    }

    fn update_prefix(&mut self) {
        if self.spec.mode == BufferMode::SizePrefix && self.used >= MSG_SIZE_PREFIX_LEN {
            #[allow(clippy::cast_possible_truncation)] // limit keeps frames < 4 GiB
            let value = (self.used as u32).to_be_bytes();
            self.region.bytes_mut()[..MSG_SIZE_PREFIX_LEN].copy_from_slice(&value);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("spec", &self.spec)
            .field("allocated", &self.allocated)
            .field("used", &self.used)
            .field("segments", &self.segments.len())
            .finish()
    }
}

/// Blocks until `fd` becomes writable again.
fn wait_writable(fd: BorrowedFd<'_>) -> Result<(), BufferError> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => {},
            Err(e) => return Err(e.into()),
        }
    }
}
