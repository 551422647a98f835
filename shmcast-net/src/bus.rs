//! The `Bus` abstraction and its shared liveness flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use shmcast_protocol::media::{BusMessage, Envelope};
use shmcast_protocol::TimeStamp;

/// A publish/subscribe session.
///
/// Implementations report their own liveness; callers never retry a failed
/// send and instead observe `is_running()` on their next cycle.
pub trait Bus {
    /// Whether the session is still usable.
    fn is_running(&self) -> bool;

    /// Hand one envelope to the session.
    fn send_envelope(&self, envelope: Envelope) -> Result<()>;

    /// Wrap `message` in an envelope stamped with `sample_time` and send it.
    fn send<M: BusMessage>(&self, message: &M, sample_time: TimeStamp, sender_stamp: u32) -> Result<()>
    where
        Self: Sized,
    {
        let envelope = Envelope::wrap(message, sample_time, sender_stamp)?;
        self.send_envelope(envelope)
    }
}

impl<B: Bus + ?Sized> Bus for &B {
    fn is_running(&self) -> bool {
        (**self).is_running()
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        (**self).send_envelope(envelope)
    }
}

/// Cloneable handle that can end a session from another thread.
#[derive(Debug, Clone)]
pub struct BusHandle {
    running: Arc<AtomicBool>,
}

impl BusHandle {
    pub(crate) fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the session as no longer running.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("bus session stopping");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
