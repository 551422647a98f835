//! POSIX shared-memory frame source.
//!
//! The producer creates `/dev/shm/<name>` holding a [`ShmHeader`] followed by
//! the frame payload. The header carries a process-shared mutex and condition
//! variable; both sides lock the mutex around every access to the payload and
//! the producer broadcasts the condition after each write.

use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::ptr::{self, addr_of_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use shmcast_protocol::TimeStamp;

use crate::error::BridgeError;
use crate::source::{FrameSource, LockedFrame};

/// Fixed header at the start of the shared region.
#[repr(C)]
pub struct ShmHeader {
    mutex: libc::pthread_mutex_t,
    cond: libc::pthread_cond_t,
    /// Payload size in bytes.
    size: u64,
    /// Incremented by the producer after each frame.
    generation: AtomicU64,
    ts_seconds: i64,
    ts_microseconds: i64,
    has_timestamp: u32,
    /// Non-zero once the producer has shut down.
    closed: AtomicU32,
}

/// Bytes before the payload.
pub const HEADER_LEN: usize = size_of::<ShmHeader>();

fn object_name(name: &str) -> io::Result<CString> {
    let path = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(path).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))
}

/// A mapping of the whole shared object.
struct Mapping {
    base: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Map an open shared-memory descriptor. Closes `fd` either way.
    fn map(fd: libc::c_int, len: usize) -> io::Result<Self> {
        // SAFETY: fd is a valid shm descriptor; the mapping is checked below.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        let err = io::Error::last_os_error();
        // SAFETY: fd is owned here and no longer needed once mapped.
        unsafe { libc::close(fd) };

        if base == libc::MAP_FAILED {
            return Err(err);
        }
        NonNull::new(base.cast::<u8>())
            .map(|base| Self { base, len })
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
    }

    fn header(&self) -> *mut ShmHeader {
        self.base.as_ptr().cast::<ShmHeader>()
    }

    fn payload(&self) -> *mut u8 {
        // SAFETY: len >= HEADER_LEN is checked before a Mapping is used.
        unsafe { self.base.as_ptr().add(HEADER_LEN) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len describe a live mapping created by `map`.
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

/// Holds the header mutex; unlocks on drop.
struct HeaderLock {
    header: *mut ShmHeader,
}

impl HeaderLock {
    fn acquire(header: *mut ShmHeader) -> Self {
        // SAFETY: header points into a live mapping with an initialised mutex.
        unsafe { libc::pthread_mutex_lock(addr_of_mut!((*header).mutex)) };
        Self { header }
    }
}

impl Drop for HeaderLock {
    fn drop(&mut self) {
        // SAFETY: the mutex is held by this guard.
        unsafe { libc::pthread_mutex_unlock(addr_of_mut!((*self.header).mutex)) };
    }
}

/// Reader side of a shared-memory frame region.
pub struct ShmFrameSource {
    name: String,
    mapping: Mapping,
    size: usize,
    consumed: AtomicU64,
    /// Set by [`ShmFrameSource::interrupt`]; local to this reader.
    interrupted: AtomicBool,
}

// SAFETY: all access to the shared region goes through the process-shared
// mutex in the header, or through atomics.
unsafe impl Send for ShmFrameSource {}
unsafe impl Sync for ShmFrameSource {}

impl ShmFrameSource {
    /// Attach to an existing region created by a producer.
    pub fn attach(name: &str) -> Result<Self, BridgeError> {
        let attach_failed = |source: io::Error| BridgeError::SourceAttachFailed {
            name: name.to_string(),
            source,
        };

        let path = object_name(name).map_err(attach_failed)?;
        // SAFETY: path is a valid C string.
        let fd = unsafe { libc::shm_open(path.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(attach_failed(io::Error::last_os_error()));
        }

        // SAFETY: stat is plain data and fully written by fstat on success.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(attach_failed(err));
        }
        let len = stat.st_size as usize;
        if len < HEADER_LEN {
            unsafe { libc::close(fd) };
            return Err(attach_failed(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("region of {len} bytes is smaller than its header"),
            )));
        }

        let mapping = Mapping::map(fd, len).map_err(attach_failed)?;
        // SAFETY: the header lies within the mapping.
        let announced = unsafe { (*mapping.header()).size };
        let available = len - HEADER_LEN;
        let size = usize::try_from(announced)
            .ok()
            .filter(|&size| size <= available)
            .ok_or_else(|| {
                attach_failed(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("header announces {announced} payload bytes but only {available} are mapped"),
                ))
            })?;

        // SAFETY: generation is an atomic inside the mapping.
        let generation = unsafe { (*mapping.header()).generation.load(Ordering::Acquire) };
        tracing::info!(name, size, "attached to shared memory");

        Ok(Self {
            name: name.to_string(),
            mapping,
            size,
            consumed: AtomicU64::new(generation),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake a blocked [`FrameSource::wait`] and report this reader invalid
    /// from now on. The producer and other readers are unaffected.
    pub fn interrupt(&self) {
        let header = self.mapping.header();
        {
            let _lock = HeaderLock::acquire(header);
            self.interrupted.store(true, Ordering::Release);
        }
        // SAFETY: the condition variable lives in the mapping; other waiters
        // re-check their predicate and go back to sleep.
        unsafe { libc::pthread_cond_broadcast(addr_of_mut!((*header).cond)) };
        tracing::debug!(name = %self.name, "shared memory reader interrupted");
    }

    fn header(&self) -> &ShmHeader {
        // SAFETY: the header lives as long as the mapping.
        unsafe { &*self.mapping.header() }
    }
}

impl FrameSource for ShmFrameSource {
    fn is_valid(&self) -> bool {
        !self.interrupted.load(Ordering::Acquire) && self.header().closed.load(Ordering::Acquire) == 0
    }

    fn size(&self) -> usize {
        self.size
    }

    fn wait(&self) {
        let header = self.mapping.header();
        let seen = self.consumed.load(Ordering::Acquire);

        let _lock = HeaderLock::acquire(header);
        loop {
            let h = self.header();
            if h.generation.load(Ordering::Acquire) != seen
                || h.closed.load(Ordering::Acquire) != 0
                || self.interrupted.load(Ordering::Acquire)
            {
                break;
            }
            // SAFETY: the mutex is held by `_lock`.
            unsafe {
                libc::pthread_cond_wait(addr_of_mut!((*header).cond), addr_of_mut!((*header).mutex));
            }
        }
        self.consumed
            .store(self.header().generation.load(Ordering::Acquire), Ordering::Release);
    }

    fn with_locked<R>(&self, f: impl FnOnce(LockedFrame<'_>) -> R) -> R {
        let header = self.mapping.header();
        let _lock = HeaderLock::acquire(header);

        // SAFETY: the lock is held, so the producer is not writing; the slice
        // cannot escape `f`.
        let (data, timestamp) = unsafe {
            let h = &*header;
            let timestamp =
                (h.has_timestamp != 0).then(|| TimeStamp::new(h.ts_seconds, h.ts_microseconds));
            (std::slice::from_raw_parts(self.mapping.payload(), self.size), timestamp)
        };
        f(LockedFrame { data, timestamp })
    }
}

impl Drop for ShmFrameSource {
    fn drop(&mut self) {
        tracing::debug!(name = %self.name, "detached from shared memory");
    }
}

/// Writer side of a shared-memory frame region.
///
/// Creates the object on construction and unlinks it on drop.
pub struct ShmProducer {
    path: CString,
    mapping: Mapping,
    size: usize,
}

// SAFETY: see ShmFrameSource.
unsafe impl Send for ShmProducer {}
unsafe impl Sync for ShmProducer {}

impl ShmProducer {
    /// Create `/dev/shm/<name>` with room for `size` payload bytes.
    pub fn create(name: &str, size: usize) -> io::Result<Self> {
        let path = object_name(name)?;
        // SAFETY: path is a valid C string.
        let fd = unsafe {
            libc::shm_open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let len = HEADER_LEN + size;
        // SAFETY: fd is a fresh shm descriptor.
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(path.as_ptr());
            }
            return Err(err);
        }

        let mapping = match Mapping::map(fd, len) {
            Ok(mapping) => mapping,
            Err(err) => {
                unsafe { libc::shm_unlink(path.as_ptr()) };
                return Err(err);
            }
        };

        let header = mapping.header();
        // SAFETY: the region is freshly truncated (zeroed) and not yet shared
        // with a reader, so initialising the primitives in place is sound.
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut mattr);
            libc::pthread_mutexattr_setpshared(&mut mattr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(addr_of_mut!((*header).mutex), &mattr);
            libc::pthread_mutexattr_destroy(&mut mattr);

            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            libc::pthread_condattr_init(&mut cattr);
            libc::pthread_condattr_setpshared(&mut cattr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_cond_init(addr_of_mut!((*header).cond), &cattr);
            libc::pthread_condattr_destroy(&mut cattr);

            (*header).size = size as u64;
        }

        tracing::debug!(name, size, "created shared memory");
        Ok(Self { path, mapping, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Copy `frame` into the region and wake readers.
    pub fn write(&self, frame: &[u8], timestamp: Option<TimeStamp>) -> io::Result<()> {
        if frame.len() != self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes does not fit region of {} bytes", frame.len(), self.size),
            ));
        }

        let header = self.mapping.header();
        {
            let _lock = HeaderLock::acquire(header);
            // SAFETY: the lock is held; payload has `size` bytes.
            unsafe {
                ptr::copy_nonoverlapping(frame.as_ptr(), self.mapping.payload(), self.size);
                match timestamp {
                    Some(ts) => {
                        (*header).ts_seconds = ts.seconds;
                        (*header).ts_microseconds = i64::from(ts.microseconds);
                        (*header).has_timestamp = 1;
                    }
                    None => (*header).has_timestamp = 0,
                }
                (*header).generation.fetch_add(1, Ordering::AcqRel);
            }
        }
        // SAFETY: the condition variable was initialised in `create`.
        unsafe { libc::pthread_cond_broadcast(addr_of_mut!((*header).cond)) };
        Ok(())
    }

    /// Mark the region closed and wake readers.
    pub fn close(&self) {
        let header = self.mapping.header();
        {
            let _lock = HeaderLock::acquire(header);
            // SAFETY: closed is an atomic inside the mapping.
            unsafe { (*header).closed.store(1, Ordering::Release) };
        }
        // SAFETY: initialised in `create`.
        unsafe { libc::pthread_cond_broadcast(addr_of_mut!((*header).cond)) };
    }
}

impl Drop for ShmProducer {
    fn drop(&mut self) {
        self.close();
        // SAFETY: path names the object created in `create`.
        unsafe { libc::shm_unlink(self.path.as_ptr()) };
    }
}
