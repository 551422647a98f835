//! Wraps access units into `ImageReading` messages and hands them to the bus.

use shmcast_net::Bus;
use shmcast_protocol::media::ImageReading;
use shmcast_protocol::TimeStamp;

use crate::video_codec::AccessUnit;

/// Fixed per-stream message fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishBridge {
    pub width: u32,
    pub height: u32,
    /// Sender stamp identifying this stream on the bus.
    pub sender_id: u32,
}

/// What happened to one access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Nothing to send.
    Empty,
    /// The bus refused the message; it is not retried.
    Failed,
}

impl PublishBridge {
    pub fn new(width: u32, height: u32, sender_id: u32) -> Self {
        Self {
            width,
            height,
            sender_id,
        }
    }

    /// Publish `unit` stamped with the capture time of the frame it encodes.
    pub fn publish<B: Bus>(&self, bus: &B, unit: &AccessUnit, sample_time: TimeStamp) -> PublishOutcome {
        if unit.data.is_empty() {
            return PublishOutcome::Empty;
        }

        let message = ImageReading::h264(self.width, self.height, unit.data.clone());
        match bus.send(&message, sample_time, self.sender_id) {
            Ok(()) => PublishOutcome::Sent,
            Err(e) => {
                tracing::warn!(
                    pts = unit.pts,
                    bytes = unit.data.len(),
                    error = %e,
                    "failed to publish access unit"
                );
                PublishOutcome::Failed
            }
        }
    }
}
