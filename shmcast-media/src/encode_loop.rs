//! The steady-state cycle: wait for a frame, encode it under the source lock,
//! publish the result with the frame's capture time.

use std::time::{Duration, Instant};

use shmcast_net::Bus;
use shmcast_protocol::TimeStamp;

use crate::error::BridgeError;
use crate::publish::{PublishBridge, PublishOutcome};
use crate::source::FrameSource;
use crate::video_codec::{EncoderEngine, FrameEncoder};

/// Why [`EncodeLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    SourceInvalid,
    BusStopped,
}

/// Result of a single [`EncodeLoop::run_once`] cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Published,
    /// The engine kept the frame without emitting output.
    Buffered,
    EncodeFailed,
    PublishFailed,
    /// The source became invalid while waiting; nothing was encoded.
    SourceInvalid,
}

/// Counters accumulated across cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub frames_woken: u64,
    pub frames_encoded: u64,
    pub units_published: u64,
    pub units_buffered: u64,
    pub encode_failures: u64,
    pub publish_failures: u64,
}

/// Summary returned when the loop stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopReport {
    pub stats: LoopStats,
    pub exit: ExitReason,
}

/// Drives frames from a source through an encoder onto a bus.
pub struct EncodeLoop<S, E, B>
where
    S: FrameSource,
    E: EncoderEngine,
    B: Bus,
{
    source: S,
    encoder: FrameEncoder<E>,
    bridge: PublishBridge,
    bus: B,
    verbose: bool,
    stats: LoopStats,
}

impl<S, E, B> EncodeLoop<S, E, B>
where
    S: FrameSource,
    E: EncoderEngine,
    B: Bus,
{
    /// Assemble a loop. Fails if the source region cannot hold one frame of
    /// the encoder's geometry.
    pub fn new(
        source: S,
        encoder: FrameEncoder<E>,
        bridge: PublishBridge,
        bus: B,
        verbose: bool,
    ) -> Result<Self, BridgeError> {
        let view = encoder.view();
        let expected = view.frame_len();
        if source.size() < expected {
            return Err(BridgeError::FrameSizeMismatch {
                width: view.width,
                height: view.height,
                expected,
                actual: source.size(),
            });
        }

        Ok(Self {
            source,
            encoder,
            bridge,
            bus,
            verbose,
            stats: LoopStats::default(),
        })
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Run one wait → lock → encode → unlock → publish cycle.
    pub fn run_once(&mut self) -> CycleOutcome {
        self.source.wait();
        let woke_at = TimeStamp::now();
        self.stats.frames_woken += 1;

        if !self.source.is_valid() {
            return CycleOutcome::SourceInvalid;
        }

        let verbose = self.verbose;
        let encoder = &mut self.encoder;
        let (sample_time, result, encode_time) = self.source.with_locked(|frame| {
            let sample_time = frame.timestamp.unwrap_or(woke_at);
            let started = verbose.then(Instant::now);
            let result = encoder.submit(frame.data);
            (sample_time, result, started.map(|t| t.elapsed()))
        });
        self.stats.frames_encoded += 1;

        let unit = match result {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                self.stats.units_buffered += 1;
                return CycleOutcome::Buffered;
            }
            Err(e) => {
                self.stats.encode_failures += 1;
                tracing::warn!(error = %e, "dropping frame");
                return CycleOutcome::EncodeFailed;
            }
        };

        match self.bridge.publish(&self.bus, &unit, sample_time) {
            PublishOutcome::Sent => {
                self.stats.units_published += 1;
                if self.verbose {
                    tracing::info!(
                        bytes = unit.data.len(),
                        keyframe = unit.keyframe,
                        sample_time_us = sample_time.to_micros(),
                        encode_us = encode_time.unwrap_or(Duration::ZERO).as_micros() as u64,
                        "frame encoded"
                    );
                }
                CycleOutcome::Published
            }
            PublishOutcome::Empty => {
                self.stats.units_buffered += 1;
                CycleOutcome::Buffered
            }
            PublishOutcome::Failed => {
                self.stats.publish_failures += 1;
                CycleOutcome::PublishFailed
            }
        }
    }

    /// Cycle until the source becomes invalid or the bus stops, then release
    /// everything in reverse order of acquisition.
    pub fn run(mut self) -> LoopReport {
        tracing::info!(
            width = self.bridge.width,
            height = self.bridge.height,
            sender_id = self.bridge.sender_id,
            "encode loop started"
        );

        let exit = loop {
            if !self.bus.is_running() {
                break ExitReason::BusStopped;
            }
            if !self.source.is_valid() {
                break ExitReason::SourceInvalid;
            }
            self.run_once();
        };

        let Self {
            source,
            encoder,
            bus,
            stats,
            ..
        } = self;
        drop(bus);
        encoder.close();
        drop(source);

        tracing::info!(
            ?exit,
            frames = stats.frames_encoded,
            published = stats.units_published,
            buffered = stats.units_buffered,
            encode_failures = stats.encode_failures,
            publish_failures = stats.publish_failures,
            "encode loop stopped"
        );
        LoopReport { stats, exit }
    }
}
