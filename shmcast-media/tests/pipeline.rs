//! End-to-end: raw I420 frames through OpenH264 onto a recording bus.

#![cfg(feature = "video-codec")]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use openh264::decoder::{Decoder, DecoderConfig};
use openh264::OpenH264API;
use shmcast_media::encode_loop::ExitReason;
use shmcast_media::video_codec::{contains_idr_nal, starts_with_start_code};
use shmcast_media::{
    BridgeError, EncodeLoop, EncoderOptions, EncoderSettings, FrameEncoder, FrameSource,
    MemoryFrameSource, PlaneView, PublishBridge,
};
use shmcast_net::testing::{init_test_tracing, RecordingBus};
use shmcast_protocol::{ImageReading, TimeStamp};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn settings(options: EncoderOptions) -> Result<EncoderSettings, BridgeError> {
    EncoderSettings::build(&EncoderOptions {
        width: Some(WIDTH),
        height: Some(HEIGHT),
        ..options
    })
}

/// Moving diagonal bars so consecutive frames differ.
fn test_pattern(index: u32) -> Vec<u8> {
    let view = PlaneView::new(WIDTH, HEIGHT);
    let mut frame = vec![128u8; view.frame_len()];
    for row in 0..HEIGHT as usize {
        for col in 0..WIDTH as usize {
            frame[row * WIDTH as usize + col] = if (col + row + index as usize * 8) % 64 < 32 {
                40
            } else {
                210
            };
        }
    }
    frame
}

#[test]
fn vga_stream_is_published_with_capture_times() {
    init_test_tracing();

    let settings = settings(EncoderOptions {
        gop: Some(10),
        ..EncoderOptions::default()
    })
    .unwrap();
    let view = PlaneView::new(WIDTH, HEIGHT);
    let source = Arc::new(MemoryFrameSource::new(view.frame_len()));
    let bus = RecordingBus::stop_after(12);

    let producer = Arc::clone(&source);
    let feeder = thread::spawn(move || {
        let mut sent = Vec::new();
        let mut i = 0;
        while producer.is_valid() && i < 500 {
            let ts = TimeStamp::new(1_000 + i64::from(i), 0);
            if producer.publish(&test_pattern(i), Some(ts)).is_ok() {
                sent.push(ts);
            }
            i += 1;
            thread::sleep(Duration::from_millis(10));
        }
        sent
    });

    let encoder = FrameEncoder::open(&settings).unwrap();
    let lp = EncodeLoop::new(
        Arc::clone(&source),
        encoder,
        PublishBridge::new(WIDTH, HEIGHT, 0),
        &bus,
        true,
    )
    .unwrap();
    let report = lp.run();

    source.close();
    let sent = feeder.join().unwrap();

    assert_eq!(report.exit, ExitReason::BusStopped);
    assert_eq!(report.stats.units_published, 12);

    let envelopes = bus.envelopes();
    let readings = bus.messages::<ImageReading>();
    assert_eq!(readings.len(), 12);

    // Every published unit carries one of the producer's capture times, in order.
    let mut last = TimeStamp::default();
    for env in &envelopes {
        assert!(sent.contains(&env.sample_time), "{:?} was never produced", env.sample_time);
        assert!(env.sample_time > last);
        last = env.sample_time;
    }

    for reading in &readings {
        assert_eq!(reading.fourcc, "h264");
        assert_eq!((reading.width, reading.height), (WIDTH, HEIGHT));
        assert!(starts_with_start_code(&reading.data));
    }
    assert!(contains_idr_nal(&readings[0].data), "first unit must be a keyframe");

    // The published stream is decodable from the first unit on.
    let mut decoder = Decoder::with_api_config(OpenH264API::from_source(), DecoderConfig::new()).unwrap();
    let mut decoded = 0;
    for reading in &readings {
        if decoder.decode(&reading.data).unwrap().is_some() {
            decoded += 1;
        }
    }
    assert!(decoded >= 10, "only {decoded} of 12 units decoded");
}

#[test]
fn invalid_preset_fails_before_anything_is_opened() {
    let err = settings(EncoderOptions {
        preset: Some("invalid-name".into()),
        ..EncoderOptions::default()
    })
    .unwrap_err();
    assert!(matches!(err, BridgeError::EngineRejectedPreset { .. }));
    assert!(err.is_fatal());
}

#[test]
fn frame_too_small_for_geometry_is_fatal() {
    let settings = settings(EncoderOptions::default()).unwrap();
    let source = MemoryFrameSource::new(1024);
    let bus = RecordingBus::new();
    let err = EncodeLoop::new(
        &source,
        FrameEncoder::open(&settings).unwrap(),
        PublishBridge::new(WIDTH, HEIGHT, 0),
        &bus,
        false,
    )
    .err()
    .unwrap();
    assert!(matches!(err, BridgeError::FrameSizeMismatch { .. }));
    assert!(bus.is_empty());
}
