//! Shared test utilities for shmcast tests.
//!
//! Available behind the `test-util` feature or in `#[cfg(test)]` within shmcast-net.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use shmcast_protocol::media::{BusMessage, Envelope};

use crate::bus::Bus;

/// Initialise a tracing subscriber for tests.
///
/// Respects the `RUST_LOG` environment variable, defaults to `debug`.
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// In-memory bus that records every envelope it is given.
///
/// Can be told to stop reporting liveness after a number of sends, or to fail
/// every send, to drive loop shutdown and failure paths.
#[derive(Default)]
pub struct RecordingBus {
    envelopes: Mutex<Vec<Envelope>>,
    stop_after: Option<usize>,
    fail_sends: AtomicBool,
    stopped: AtomicBool,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `is_running() == false` once `sends` envelopes were recorded.
    pub fn stop_after(sends: usize) -> Self {
        Self {
            stop_after: Some(sends),
            ..Self::default()
        }
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Relaxed);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }

    /// Decode every recorded envelope as `M`.
    pub fn messages<M: BusMessage>(&self) -> Vec<M> {
        self.envelopes
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.open::<M>().expect("recorded envelope should decode"))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Bus for RecordingBus {
    fn is_running(&self) -> bool {
        if self.stopped.load(Ordering::Relaxed) {
            return false;
        }
        match self.stop_after {
            Some(limit) => self.len() < limit,
            None => true,
        }
    }

    fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        anyhow::ensure!(!self.fail_sends.load(Ordering::Relaxed), "recording bus send failure");
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use shmcast_protocol::{ImageReading, TimeStamp};

    #[test]
    fn stop_after_limits_liveness() {
        let bus = RecordingBus::stop_after(2);
        let reading = ImageReading::h264(4, 4, Bytes::from_static(b"x"));
        assert!(bus.is_running());
        bus.send(&reading, TimeStamp::new(1, 0), 0).unwrap();
        assert!(bus.is_running());
        bus.send(&reading, TimeStamp::new(2, 0), 0).unwrap();
        assert!(!bus.is_running());
        assert_eq!(bus.messages::<ImageReading>().len(), 2);
    }

    #[test]
    fn failing_sends_record_nothing() {
        let bus = RecordingBus::new();
        bus.set_fail_sends(true);
        let reading = ImageReading::h264(4, 4, Bytes::new());
        assert!(bus.send(&reading, TimeStamp::default(), 3).is_err());
        assert!(bus.is_empty());
        assert!(bus.is_running());
    }
}
