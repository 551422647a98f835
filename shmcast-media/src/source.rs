//! Frame sources: a fixed-size region holding the most recent raw frame.
//!
//! A source is written by a single producer and read by the encode loop. Both
//! sides hold the same lock while touching the region; the producer wakes the
//! reader through a notification after every write. There is no queue: a
//! reader that falls behind sees only the latest frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use shmcast_protocol::TimeStamp;

/// The frame region as seen while the source lock is held.
#[derive(Debug, Clone, Copy)]
pub struct LockedFrame<'a> {
    pub data: &'a [u8],
    /// Capture time of the most recent write, if the producer supplied one.
    pub timestamp: Option<TimeStamp>,
}

/// A lockable, waitable frame region.
pub trait FrameSource {
    /// Whether the source is still attached and producing.
    fn is_valid(&self) -> bool;

    /// Size of the frame region in bytes.
    fn size(&self) -> usize;

    /// Block until a frame newer than the last one waited for is available,
    /// or the source becomes invalid.
    fn wait(&self);

    /// Run `f` with the source locked.
    ///
    /// The region borrow handed to `f` cannot outlive the call, so no view of
    /// the frame survives the unlock.
    fn with_locked<R>(&self, f: impl FnOnce(LockedFrame<'_>) -> R) -> R;
}

impl<S: FrameSource + ?Sized> FrameSource for &S {
    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn wait(&self) {
        (**self).wait()
    }

    fn with_locked<R>(&self, f: impl FnOnce(LockedFrame<'_>) -> R) -> R {
        (**self).with_locked(f)
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Arc<S> {
    fn is_valid(&self) -> bool {
        (**self).is_valid()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn wait(&self) {
        (**self).wait()
    }

    fn with_locked<R>(&self, f: impl FnOnce(LockedFrame<'_>) -> R) -> R {
        (**self).with_locked(f)
    }
}

struct Slot {
    frame: Vec<u8>,
    timestamp: Option<TimeStamp>,
    generation: u64,
    closed: bool,
}

/// In-process frame source.
///
/// Used to feed the encode loop from another thread of the same process, and
/// as the source in tests.
pub struct MemoryFrameSource {
    slot: Mutex<Slot>,
    ready: Condvar,
    size: usize,
    consumed: AtomicU64,
}

impl MemoryFrameSource {
    /// Create a zero-filled region of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                frame: vec![0; size],
                timestamp: None,
                generation: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            size,
            consumed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite the region with `frame` and wake the reader.
    pub fn publish(&self, frame: &[u8], timestamp: Option<TimeStamp>) -> Result<()> {
        if frame.len() != self.size {
            bail!(
                "frame of {} bytes does not fit region of {} bytes",
                frame.len(),
                self.size
            );
        }

        let mut slot = self.lock();
        if slot.closed {
            bail!("frame source is closed");
        }
        slot.frame.copy_from_slice(frame);
        slot.timestamp = timestamp;
        slot.generation += 1;
        drop(slot);

        self.ready.notify_all();
        Ok(())
    }

    /// Invalidate the source and release a blocked reader.
    pub fn close(&self) {
        let mut slot = self.lock();
        if !slot.closed {
            slot.closed = true;
            tracing::debug!(generation = slot.generation, "frame source closed");
        }
        drop(slot);
        self.ready.notify_all();
    }

    /// Number of frames written so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }
}

impl FrameSource for MemoryFrameSource {
    fn is_valid(&self) -> bool {
        !self.lock().closed
    }

    fn size(&self) -> usize {
        self.size
    }

    fn wait(&self) {
        let seen = self.consumed.load(Ordering::Acquire);
        let slot = self
            .ready
            .wait_while(self.lock(), |slot| slot.generation == seen && !slot.closed)
            .unwrap_or_else(PoisonError::into_inner);

        let skipped = slot.generation.saturating_sub(seen + 1);
        if skipped > 0 {
            tracing::trace!(skipped, "reader fell behind, taking latest frame");
        }
        self.consumed.store(slot.generation, Ordering::Release);
    }

    fn with_locked<R>(&self, f: impl FnOnce(LockedFrame<'_>) -> R) -> R {
        let slot = self.lock();
        f(LockedFrame {
            data: &slot.frame,
            timestamp: slot.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn wait_returns_after_publish() {
        let source = Arc::new(MemoryFrameSource::new(4));
        let producer = Arc::clone(&source);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer
                .publish(&[1, 2, 3, 4], Some(TimeStamp::new(5, 0)))
                .unwrap();
        });

        source.wait();
        source.with_locked(|frame| {
            assert_eq!(frame.data, &[1, 2, 3, 4]);
            assert_eq!(frame.timestamp, Some(TimeStamp::new(5, 0)));
        });
        handle.join().unwrap();
    }

    #[test]
    fn latest_frame_wins_when_reader_is_slow() {
        let source = MemoryFrameSource::new(1);
        source.publish(&[1], Some(TimeStamp::new(1, 0))).unwrap();
        source.publish(&[2], Some(TimeStamp::new(2, 0))).unwrap();
        source.publish(&[3], None).unwrap();

        // One wake covers all three writes.
        source.wait();
        source.with_locked(|frame| {
            assert_eq!(frame.data, &[3]);
            assert_eq!(frame.timestamp, None);
        });

        // The next wait blocks until something new arrives.
        source.publish(&[4], None).unwrap();
        source.wait();
        source.with_locked(|frame| assert_eq!(frame.data, &[4]));
    }

    #[test]
    fn close_releases_a_blocked_reader() {
        let source = Arc::new(MemoryFrameSource::new(2));
        let closer = Arc::clone(&source);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            closer.close();
        });

        source.wait();
        assert!(!source.is_valid());
        handle.join().unwrap();
    }

    #[test]
    fn publish_checks_size_and_state() {
        let source = MemoryFrameSource::new(3);
        assert!(source.publish(&[0; 2], None).is_err());
        assert_eq!(source.generation(), 0);

        source.close();
        assert!(source.publish(&[0; 3], None).is_err());
    }

    #[test]
    fn region_starts_zeroed_without_timestamp() {
        let source = MemoryFrameSource::new(6);
        assert_eq!(source.size(), 6);
        assert!(source.is_valid());
        source.with_locked(|frame| {
            assert_eq!(frame.data, &[0; 6]);
            assert!(frame.timestamp.is_none());
        });
    }
}
