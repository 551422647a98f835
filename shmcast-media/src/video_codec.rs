//! H.264 encoding of I420 frames borrowed straight out of the frame buffer.
//!
//! [`FrameEncoder`] owns exactly one engine for its whole life. Frames are
//! handed over as borrowed plane slices (no copy); the engine reports either a
//! complete Annex-B access unit or nothing while it is still buffering.

use bytes::Bytes;

use crate::error::BridgeError;
use crate::plane::{PlaneView, Planes};
#[cfg(feature = "video-codec")]
use crate::settings::EncoderSettings;

/// NAL unit type of an IDR slice.
const NAL_TYPE_IDR: u8 = 5;
/// NAL unit type of a sequence parameter set.
pub const NAL_TYPE_SPS: u8 = 7;
/// NAL unit type of a picture parameter set.
pub const NAL_TYPE_PPS: u8 = 8;

/// Check if encoded H.264 data contains an IDR (keyframe) NAL unit.
pub fn contains_idr_nal(data: &[u8]) -> bool {
    contains_nal_type(data, NAL_TYPE_IDR)
}

/// Check if any NAL unit in Annex-B `data` has type `nal_type`.
pub fn contains_nal_type(data: &[u8], nal_type: u8) -> bool {
    let mut i = 0;
    while i + 3 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            let nal_start = if data[i + 2] == 1 {
                i + 3
            } else if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                i + 4
            } else {
                i += 1;
                continue;
            };
            if nal_start < data.len() && data[nal_start] & 0x1F == nal_type {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Whether `data` opens with a 3- or 4-byte Annex-B start code.
pub fn starts_with_start_code(data: &[u8]) -> bool {
    data.starts_with(&[0, 0, 1]) || data.starts_with(&[0, 0, 0, 1])
}

/// One compressed frame as emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Presentation index of the frame this unit encodes.
    pub pts: u64,
    /// Annex-B bitstream, start codes included.
    pub data: Bytes,
    pub keyframe: bool,
}

/// An H.264 engine instance.
pub trait EncoderEngine {
    /// Encode one picture stamped with `pts`.
    ///
    /// Returns the emitted bitstream together with the pts of the picture it
    /// encodes, which lags `pts` while the engine holds frames back. Returns
    /// `Ok(None)` when the engine consumed the picture without emitting
    /// output on this call.
    fn encode(&mut self, planes: &Planes<'_>, pts: u64) -> Result<Option<(u64, Bytes)>, BridgeError>;

    /// Make the next emitted frame an IDR.
    fn force_keyframe(&mut self) {}
}

/// Owns an engine and feeds it frames.
pub struct FrameEncoder<E: EncoderEngine> {
    engine: E,
    view: PlaneView,
    next_pts: u64,
    units_emitted: u64,
}

#[cfg(feature = "video-codec")]
impl FrameEncoder<OpenH264Engine> {
    /// Open an OpenH264 engine for `settings`.
    pub fn open(settings: &EncoderSettings) -> Result<Self, BridgeError> {
        let engine = OpenH264Engine::open(settings)?;
        Ok(Self::with_engine(
            engine,
            PlaneView::new(settings.width, settings.height),
        ))
    }
}

impl<E: EncoderEngine> FrameEncoder<E> {
    /// Wrap an already-open engine.
    pub fn with_engine(engine: E, view: PlaneView) -> Self {
        Self {
            engine,
            view,
            next_pts: 0,
            units_emitted: 0,
        }
    }

    pub fn view(&self) -> &PlaneView {
        &self.view
    }

    /// Number of frames submitted so far.
    pub fn frames_submitted(&self) -> u64 {
        self.next_pts
    }

    /// Submit the frame held in `frame` and collect whatever the engine emits.
    ///
    /// Each call consumes one presentation index, starting at 0, whether or
    /// not output is produced. An emitted unit carries the index of the frame
    /// it encodes, not of the submission that flushed it.
    pub fn submit(&mut self, frame: &[u8]) -> Result<Option<AccessUnit>, BridgeError> {
        let submitted = self.next_pts;
        self.next_pts += 1;

        let planes = self.view.planes(frame).ok_or_else(|| {
            BridgeError::Encode(format!(
                "frame of {} bytes is shorter than {}",
                frame.len(),
                self.view.frame_len()
            ))
        })?;

        let Some((pts, data)) = self.engine.encode(&planes, submitted)? else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }

        self.units_emitted += 1;
        let keyframe = contains_idr_nal(&data);
        tracing::trace!(pts, submitted, bytes = data.len(), keyframe, "access unit emitted");
        Ok(Some(AccessUnit {
            pts,
            data,
            keyframe,
        }))
    }

    pub fn force_keyframe(&mut self) {
        self.engine.force_keyframe();
        tracing::debug!("forced keyframe");
    }

    /// Release the engine. Consumes the encoder so it cannot be used again.
    pub fn close(self) {
        drop(self);
    }
}

impl<E: EncoderEngine> Drop for FrameEncoder<E> {
    fn drop(&mut self) {
        tracing::info!(
            frames = self.next_pts,
            units = self.units_emitted,
            "encoder closed"
        );
    }
}

#[cfg(feature = "video-codec")]
pub use openh264_engine::OpenH264Engine;

#[cfg(feature = "video-codec")]
mod openh264_engine {
    use bytes::Bytes;
    use openh264::encoder::{
        BitRate, Complexity, Encoder, EncoderConfig, FrameRate, IntraFramePeriod, Profile,
        QpRange, RateControlMode, UsageType,
    };
    use openh264::formats::YUVSlices;
    use openh264::OpenH264API;

    use super::EncoderEngine;
    use crate::error::BridgeError;
    use crate::plane::Planes;
    use crate::settings::{AdaptiveQuantization, EncoderSettings, MotionEstimation, RateControl};

    /// H.264 engine wrapping OpenH264.
    pub struct OpenH264Engine {
        encoder: Encoder,
    }

    impl OpenH264Engine {
        /// Create an engine configured from `settings`.
        ///
        /// `width` and `height` must be positive and even.
        pub fn open(settings: &EncoderSettings) -> Result<Self, BridgeError> {
            let (w, h) = (settings.width, settings.height);
            if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
                return Err(BridgeError::EngineInitFailed(format!(
                    "I420 input needs positive even dimensions, got {w}x{h}"
                )));
            }

            let config = engine_config(settings);
            let api = OpenH264API::from_source();
            let encoder = Encoder::with_api_config(api, config)
                .map_err(|e| BridgeError::EngineInitFailed(e.to_string()))?;

            tracing::info!(
                width = w,
                height = h,
                preset = %settings.preset,
                tune = %settings.tune,
                profile = %settings.profile,
                gop = settings.gop,
                bitrate = settings.bitrate,
                rate_control = ?settings.rate_control,
                threads = settings.threads,
                "video encoder created"
            );
            tracing::debug!(
                bframes = settings.bframes,
                b_adapt = ?settings.b_adapt,
                me = ?settings.me,
                me_range = settings.me_range,
                trellis = settings.trellis,
                nr = settings.noise_reduction,
                ip_ratio = settings.ip_ratio,
                pb_ratio = settings.pb_ratio,
                aq_strength = settings.aq_strength,
                qp_step = settings.qp_step,
                intra_refresh = settings.intra_refresh,
                "settings without an OpenH264 equivalent are not applied"
            );
            if settings.rate_control == RateControl::ConstantRateFactor {
                tracing::debug!(
                    crf = settings.crf,
                    qp = crf_qp(settings),
                    "crf approximated by a fixed quantizer"
                );
            }

            Ok(Self { encoder })
        }
    }

    /// Quantizer that stands in for `crf`, kept inside `[qp_min, qp_max]`.
    ///
    /// OpenH264 has no rate factor, so the nearest whole quantizer is pinned.
    pub(super) fn crf_qp(s: &EncoderSettings) -> u8 {
        let qp = s.crf.round().max(0.0) as u32;
        qp.max(s.qp_min).min(s.qp_max).min(51) as u8
    }

    /// Translate resolved settings into an OpenH264 configuration.
    ///
    /// OpenH264's rate-control-off mode ignores the QP range, so the two
    /// constant-quality modes run its quality controller with the range
    /// pinned to a single quantizer.
    fn engine_config(s: &EncoderSettings) -> EncoderConfig {
        let (mode, qp) = match s.rate_control {
            RateControl::ConstantQp => {
                let qp = s.qp.min(51) as u8;
                (RateControlMode::Quality, QpRange::new(qp, qp))
            }
            RateControl::ConstantRateFactor => {
                let qp = crf_qp(s);
                (RateControlMode::Quality, QpRange::new(qp, qp))
            }
            RateControl::AverageBitrate => (
                RateControlMode::Bitrate,
                QpRange::new(s.qp_min.min(51) as u8, s.qp_max.min(51) as u8),
            ),
        };

        EncoderConfig::new()
            .usage_type(UsageType::CameraVideoRealTime)
            .profile(Profile::Baseline)
            .bitrate(BitRate::from_bps(s.bitrate))
            .max_frame_rate(FrameRate::from_hz(s.fps as f32))
            .rate_control_mode(mode)
            .qp(qp)
            .intra_frame_period(IntraFramePeriod::from_num_frames(s.gop))
            .num_threads(s.threads as u16)
            .complexity(complexity(s))
            .scene_change_detect(s.scenecut > 0)
            .adaptive_quantization(s.aq_mode != AdaptiveQuantization::Off)
            .skip_frames(false)
            .debug(s.verbose)
    }

    /// Map motion-search effort onto OpenH264's three complexity levels.
    fn complexity(s: &EncoderSettings) -> Complexity {
        if s.subme >= 7 || s.me >= MotionEstimation::UnevenMultiHexagon {
            Complexity::High
        } else if s.subme >= 4 {
            Complexity::Medium
        } else {
            Complexity::Low
        }
    }

    impl EncoderEngine for OpenH264Engine {
        /// Baseline output has no B-frames or lookahead, so each call emits
        /// the picture it was given.
        fn encode(&mut self, planes: &Planes<'_>, pts: u64) -> Result<Option<(u64, Bytes)>, BridgeError> {
            let view = planes.view;
            let yuv = YUVSlices::new(
                (planes.y, planes.u, planes.v),
                (view.width as usize, view.height as usize),
                (view.y.stride, view.u.stride, view.v.stride),
            );

            let bitstream = self
                .encoder
                .encode(&yuv)
                .map_err(|e| BridgeError::Encode(e.to_string()))?;

            let data = bitstream.to_vec();
            if data.is_empty() {
                return Ok(None);
            }
            Ok(Some((pts, Bytes::from(data))))
        }

        fn force_keyframe(&mut self) {
            self.encoder.force_intra_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Engine that emits each frame's first luma byte after `delay` submissions.
    struct DelayEngine {
        delay: usize,
        pending: Vec<(u64, u8)>,
        dropped: Arc<AtomicUsize>,
    }

    impl EncoderEngine for DelayEngine {
        fn encode(&mut self, planes: &Planes<'_>, pts: u64) -> Result<Option<(u64, Bytes)>, BridgeError> {
            self.pending.push((pts, planes.y[0]));
            if self.pending.len() <= self.delay {
                return Ok(None);
            }
            let (pts, marker) = self.pending.remove(0);
            Ok(Some((pts, Bytes::from(vec![0, 0, 0, 1, 0x65, pts as u8, marker]))))
        }
    }

    impl Drop for DelayEngine {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn encoder(delay: usize) -> (FrameEncoder<DelayEngine>, Arc<AtomicUsize>) {
        let dropped = Arc::new(AtomicUsize::new(0));
        let engine = DelayEngine {
            delay,
            pending: Vec::new(),
            dropped: Arc::clone(&dropped),
        };
        (FrameEncoder::with_engine(engine, PlaneView::new(4, 4)), dropped)
    }

    #[test]
    fn contains_idr_nal_detects_keyframe() {
        assert!(contains_idr_nal(&[0x00, 0x00, 0x00, 0x01, 0x65, 0xFF, 0xFF]));
        assert!(!contains_idr_nal(&[0x00, 0x00, 0x00, 0x01, 0x41, 0xFF, 0xFF]));
        assert!(contains_idr_nal(&[0x00, 0x00, 0x01, 0x65, 0xFF]));
        // SPS + PPS + IDR
        assert!(contains_idr_nal(&[0, 0, 0, 1, 0x67, 0x42, 0, 0, 0, 1, 0x68, 0xCE, 0, 0, 1, 0x65, 0x88]));
        assert!(!contains_idr_nal(&[]));
    }

    #[test]
    fn start_code_detection() {
        assert!(starts_with_start_code(&[0, 0, 0, 1, 0x67]));
        assert!(starts_with_start_code(&[0, 0, 1, 0x67]));
        assert!(!starts_with_start_code(&[0, 1, 0x67]));
        assert!(!starts_with_start_code(&[]));
    }

    #[test]
    fn pts_advances_once_per_submission() {
        let (mut enc, _) = encoder(2);
        let frame = vec![7u8; 24];

        assert_eq!(enc.submit(&frame).unwrap(), None);
        assert_eq!(enc.submit(&frame).unwrap(), None);
        let unit = enc.submit(&frame).unwrap().expect("lookahead settled");
        assert_eq!(unit.pts, 0);
        assert!(unit.keyframe);
        assert_eq!(enc.frames_submitted(), 3);
    }

    #[test]
    fn short_frame_is_an_encode_error() {
        let (mut enc, _) = encoder(0);
        let err = enc.submit(&[0u8; 5]).unwrap_err();
        assert!(!err.is_fatal());
        // The index is still consumed.
        assert_eq!(enc.frames_submitted(), 1);
    }

    #[test]
    fn close_releases_engine_exactly_once() {
        let (mut enc, dropped) = encoder(0);
        enc.submit(&[1u8; 24]).unwrap();
        enc.close();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_without_close_still_releases() {
        let (enc, dropped) = encoder(0);
        drop(enc);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}

#[cfg(all(test, feature = "video-codec"))]
mod openh264_tests {
    use openh264::decoder::{Decoder, DecoderConfig};
    use openh264::OpenH264API;
    use shmcast_net::testing::init_test_tracing;

    use super::*;
    use crate::settings::{EncoderOptions, EncoderSettings};

    fn settings(width: u32, height: u32, extra: EncoderOptions) -> EncoderSettings {
        EncoderSettings::build(&EncoderOptions {
            width: Some(width),
            height: Some(height),
            ..extra
        })
        .unwrap()
    }

    /// Gradient I420 frame that shifts with `index`.
    fn gradient_frame(width: u32, height: u32, index: u32) -> Vec<u8> {
        let view = PlaneView::new(width, height);
        let mut frame = vec![128u8; view.frame_len()];
        for row in 0..height as usize {
            for col in 0..width as usize {
                frame[row * width as usize + col] = (col + row + index as usize * 3) as u8;
            }
        }
        frame
    }

    #[test]
    fn first_unit_is_an_annexb_keyframe() {
        init_test_tracing();

        let mut enc = FrameEncoder::open(&settings(640, 480, EncoderOptions {
            gop: Some(10),
            ..EncoderOptions::default()
        }))
        .unwrap();

        let mut first = None;
        for i in 0..5 {
            if let Some(unit) = enc.submit(&gradient_frame(640, 480, i)).unwrap() {
                first = Some(unit);
                break;
            }
        }
        let unit = first.expect("engine should emit within a few frames");
        assert!(starts_with_start_code(&unit.data));
        assert!(unit.keyframe);

        let mut decoder = Decoder::with_api_config(OpenH264API::from_source(), DecoderConfig::new()).unwrap();
        let decoded = decoder.decode(&unit.data).unwrap();
        assert!(decoded.is_some(), "keyframe should decode on its own");
    }

    #[test]
    fn keyframes_repeat_every_gop() {
        init_test_tracing();

        let mut enc = FrameEncoder::open(&settings(160, 120, EncoderOptions {
            gop: Some(5),
            ..EncoderOptions::default()
        }))
        .unwrap();

        let keyframes: Vec<AccessUnit> = (0..12)
            .filter_map(|i| enc.submit(&gradient_frame(160, 120, i)).unwrap())
            .filter(|u| u.keyframe)
            .collect();
        let pts: Vec<u64> = keyframes.iter().map(|u| u.pts).collect();
        assert!(pts.len() >= 2, "expected repeated IDRs, got {pts:?}");
        assert_eq!(pts[0], 0);

        // A receiver joining mid-stream needs the parameter sets with every IDR.
        for unit in &keyframes {
            assert!(contains_nal_type(&unit.data, NAL_TYPE_SPS), "no SPS with keyframe {}", unit.pts);
            assert!(contains_nal_type(&unit.data, NAL_TYPE_PPS), "no PPS with keyframe {}", unit.pts);
        }
    }

    fn encoded_bytes(crf: f64) -> usize {
        let mut enc = FrameEncoder::open(&settings(320, 240, EncoderOptions {
            rc_mode: Some(1),
            crf: Some(crf),
            ..EncoderOptions::default()
        }))
        .unwrap();
        let frame = gradient_frame(320, 240, 0);
        (0..30)
            .filter_map(|_| enc.submit(&frame).unwrap())
            .map(|u| u.data.len())
            .sum()
    }

    #[test]
    fn lower_crf_spends_more_bits() {
        init_test_tracing();

        let fine = encoded_bytes(10.0);
        let coarse = encoded_bytes(45.0);
        assert!(fine > coarse, "crf 10 gave {fine} bytes, crf 45 gave {coarse}");
    }

    #[test]
    fn crf_quantizer_stays_inside_qp_range() {
        let mut s = settings(64, 64, EncoderOptions {
            rc_mode: Some(1),
            crf: Some(22.6),
            ..EncoderOptions::default()
        });
        assert_eq!(openh264_engine::crf_qp(&s), 23);

        s.qp_min = 30;
        s.qp_max = 40;
        assert_eq!(openh264_engine::crf_qp(&s), 30);
        s.crf = 50.0;
        assert_eq!(openh264_engine::crf_qp(&s), 40);
    }

    #[test]
    fn odd_dimensions_fail_to_open() {
        let err = FrameEncoder::open(&settings(641, 480, EncoderOptions::default())).err().unwrap();
        assert!(matches!(err, BridgeError::EngineInitFailed(_)));
    }

    #[test]
    fn forced_keyframe_is_idr() {
        init_test_tracing();

        let mut enc = FrameEncoder::open(&settings(160, 120, EncoderOptions {
            gop: Some(100),
            ..EncoderOptions::default()
        }))
        .unwrap();
        for i in 0..4 {
            enc.submit(&gradient_frame(160, 120, i)).unwrap();
        }
        enc.force_keyframe();
        let unit = enc.submit(&gradient_frame(160, 120, 4)).unwrap().unwrap();
        assert!(unit.keyframe);
    }

    #[test]
    fn constant_qp_and_crf_modes_open() {
        for rc in [0, 1, 2] {
            let mut enc = FrameEncoder::open(&settings(64, 64, EncoderOptions {
                rc_mode: Some(rc),
                ..EncoderOptions::default()
            }))
            .unwrap();
            assert!(enc.submit(&gradient_frame(64, 64, 0)).unwrap().is_some());
        }
    }
}
