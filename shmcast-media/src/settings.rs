//! Encoder tuning options and the immutable settings record built from them.
//!
//! [`EncoderOptions`] is the flat, all-optional input as it arrives from the
//! command line or a config file. [`EncoderSettings::build`] turns it into a
//! fully-populated record in a fixed order:
//!
//! 1. bridge defaults,
//! 2. the named preset, then the named tune(s),
//! 3. explicitly given options, each clamped through [`CLAMP_TABLE`],
//! 4. the baseline profile.
//!
//! The profile runs last because it may override options the user gave
//! (B-frames, CABAC, weighted prediction).

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::preset::{apply_preset, apply_profile, apply_tune, BASELINE};

pub const DEFAULT_GOP: u32 = 10;
pub const DEFAULT_PRESET: &str = "veryfast";
pub const DEFAULT_TUNE: &str = "zerolatency";
/// Nominal input rate; the producer's notifications set the real pace.
pub const DEFAULT_FPS: u32 = 20;
pub const DEFAULT_BITRATE: u32 = 1_500_000;
pub const DEFAULT_QP: u32 = 23;
pub const DEFAULT_ME_RANGE: u32 = 16;
pub const DEFAULT_THREADS: u32 = 1;

/// Raw tuning input. Every field is optional; `None` means "not given".
///
/// Integer knobs are read as `i64` and real knobs as `f64` so that
/// out-of-range values survive parsing and are clamped, not rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EncoderOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<i64>,
    pub gop: Option<i64>,
    pub preset: Option<String>,
    pub tune: Option<String>,
    pub verbose: Option<bool>,
    pub scenecut: Option<i64>,
    pub intra_refresh: Option<bool>,
    pub bframe: Option<i64>,
    pub badapt: Option<i64>,
    pub cabac: Option<i64>,
    pub threads: Option<i64>,
    pub rc_mode: Option<i64>,
    /// Older spelling of `rc_mode`. Honoured only when `rc_mode` is absent.
    pub rc_method: Option<i64>,
    pub qp: Option<i64>,
    pub qpmin: Option<i64>,
    pub qpmax: Option<i64>,
    pub qpstep: Option<i64>,
    pub bitrate: Option<i64>,
    pub crf: Option<f64>,
    pub ipratio: Option<f64>,
    pub pbratio: Option<f64>,
    pub aq_mode: Option<i64>,
    pub aq_strength: Option<f64>,
    pub weightp: Option<i64>,
    pub me: Option<i64>,
    pub merange: Option<i64>,
    pub subme: Option<i64>,
    pub trellis: Option<i64>,
    pub nr: Option<i64>,
}

impl EncoderOptions {
    /// Fill every field that is `None` here from `fallback`.
    pub fn or(self, fallback: EncoderOptions) -> Self {
        macro_rules! merge {
            ($($field:ident),* $(,)?) => {
                Self { $($field: self.$field.or(fallback.$field)),* }
            };
        }
        merge!(
            width, height, fps, gop, preset, tune, verbose, scenecut, intra_refresh, bframe,
            badapt, cabac, threads, rc_mode, rc_method, qp, qpmin, qpmax, qpstep, bitrate, crf,
            ipratio, pbratio, aq_mode, aq_strength, weightp, me, merange, subme, trellis, nr,
        )
    }
}

/// Valid range of one option. Either bound may be open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bounds {
    const fn range(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    const fn at_most(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
        }
    }

    const fn at_least(min: f64) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    pub fn clamp(&self, value: f64) -> f64 {
        let value = self.min.map_or(value, |min| value.max(min));
        self.max.map_or(value, |max| value.min(max))
    }
}

/// Option name → valid range. Options absent from the table are not clamped.
pub const CLAMP_TABLE: &[(&str, Bounds)] = &[
    ("threads", Bounds::range(0.0, 4.0)),
    ("badapt", Bounds::range(0.0, 2.0)),
    ("cabac", Bounds::range(0.0, 1.0)),
    ("qp", Bounds::range(1.0, 51.0)),
    ("qpmin", Bounds::range(0.0, 51.0)),
    ("qpmax", Bounds::range(0.0, 51.0)),
    ("bitrate", Bounds::range(100_000.0, 5_000_000.0)),
    ("aq-mode", Bounds::range(0.0, 2.0)),
    ("aq-strength", Bounds::at_most(2.0)),
    ("weightp", Bounds::range(0.0, 2.0)),
    ("me", Bounds::range(0.0, 4.0)),
    ("merange", Bounds::range(4.0, 16.0)),
    ("subme", Bounds::range(2.0, 10.0)),
    ("trellis", Bounds::range(0.0, 2.0)),
    ("nr", Bounds::range(0.0, 1000.0)),
    ("rc-mode", Bounds::range(0.0, 2.0)),
    ("bframe", Bounds::range(0.0, 16.0)),
    ("qpstep", Bounds::range(1.0, 51.0)),
    ("crf", Bounds::range(0.0, 51.0)),
    ("gop", Bounds::at_least(1.0)),
    ("fps", Bounds::range(1.0, 240.0)),
    ("scenecut", Bounds::at_least(0.0)),
    ("ipratio", Bounds::at_least(1.0)),
    ("pbratio", Bounds::at_least(1.0)),
];

/// Look up the valid range of an option.
pub fn bounds(option: &str) -> Option<Bounds> {
    CLAMP_TABLE
        .iter()
        .find(|(name, _)| *name == option)
        .map(|(_, bounds)| *bounds)
}

/// Clamp `value` into the range registered for `option`.
pub fn clamp(option: &str, value: f64) -> f64 {
    let clamped = bounds(option).map_or(value, |b| b.clamp(value));
    if clamped != value {
        tracing::warn!(option, requested = value, applied = clamped, "option clamped to valid range");
    }
    clamped
}

fn clamp_u32(option: &str, value: i64) -> u32 {
    // Saturating float-to-int cast; every integer option has a lower bound >= 0.
    clamp(option, value as f64) as u32
}

fn clamp_f32(option: &str, value: f64) -> f32 {
    clamp(option, value) as f32
}

/// How the engine spends bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateControl {
    /// Fixed quantizer (`qp`).
    ConstantQp,
    /// Constant quality (`crf`).
    ConstantRateFactor,
    /// Target bitrate (`bitrate`).
    AverageBitrate,
}

impl RateControl {
    fn from_index(index: u32) -> Self {
        match index {
            0 => Self::ConstantQp,
            1 => Self::ConstantRateFactor,
            _ => Self::AverageBitrate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BFrameAdaptive {
    Off,
    Fast,
    Trellis,
}

impl BFrameAdaptive {
    fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Off,
            1 => Self::Fast,
            _ => Self::Trellis,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdaptiveQuantization {
    Off,
    Variance,
    AutoVariance,
}

impl AdaptiveQuantization {
    fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Off,
            1 => Self::Variance,
            _ => Self::AutoVariance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightedPrediction {
    Off,
    Simple,
    Smart,
}

impl WeightedPrediction {
    fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Off,
            1 => Self::Simple,
            _ => Self::Smart,
        }
    }
}

/// Motion-estimation search method, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MotionEstimation {
    Diamond,
    Hexagon,
    UnevenMultiHexagon,
    Exhaustive,
    TransformedExhaustive,
}

impl MotionEstimation {
    fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Diamond,
            1 => Self::Hexagon,
            2 => Self::UnevenMultiHexagon,
            3 => Self::Exhaustive,
            _ => Self::TransformedExhaustive,
        }
    }
}

/// Fully-resolved encoder configuration.
///
/// Built once by [`EncoderSettings::build`]; every numeric field is already
/// inside its valid range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub preset: String,
    pub tune: String,
    pub profile: String,
    /// Keyframe interval (min and max).
    pub gop: u32,
    /// Engine worker threads; 0 lets the engine decide.
    pub threads: u32,
    pub sliced_threads: bool,
    pub scenecut: u32,
    pub intra_refresh: bool,
    pub bframes: u32,
    pub b_adapt: BFrameAdaptive,
    pub cabac: bool,
    pub refs: u32,
    pub rate_control: RateControl,
    pub qp: u32,
    pub qp_min: u32,
    pub qp_max: u32,
    pub qp_step: u32,
    /// Target bitrate in bits per second.
    pub bitrate: u32,
    pub crf: f32,
    pub ip_ratio: f32,
    pub pb_ratio: f32,
    pub aq_mode: AdaptiveQuantization,
    pub aq_strength: f32,
    pub weightp: WeightedPrediction,
    pub me: MotionEstimation,
    pub me_range: u32,
    pub subme: u32,
    pub trellis: u32,
    pub noise_reduction: u32,
    pub transform_8x8: bool,
    pub deblock_enabled: bool,
    /// Deblocking (alpha, beta) offsets.
    pub deblock: (i32, i32),
    /// Frames of rate-control lookahead.
    pub lookahead: u32,
    pub verbose: bool,
}

impl EncoderSettings {
    /// Engine defaults before any preset, tune or option is applied.
    pub fn defaults(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            fps: DEFAULT_FPS,
            preset: "medium".to_string(),
            tune: String::new(),
            profile: BASELINE.to_string(),
            gop: 250,
            threads: DEFAULT_THREADS,
            sliced_threads: false,
            scenecut: 40,
            intra_refresh: false,
            bframes: 3,
            b_adapt: BFrameAdaptive::Fast,
            cabac: true,
            refs: 3,
            rate_control: RateControl::AverageBitrate,
            qp: DEFAULT_QP,
            qp_min: 0,
            qp_max: 51,
            qp_step: 4,
            bitrate: DEFAULT_BITRATE,
            crf: 23.0,
            ip_ratio: 1.4,
            pb_ratio: 1.3,
            aq_mode: AdaptiveQuantization::Variance,
            aq_strength: 1.0,
            weightp: WeightedPrediction::Smart,
            me: MotionEstimation::Hexagon,
            me_range: DEFAULT_ME_RANGE,
            subme: 7,
            trellis: 1,
            noise_reduction: 0,
            transform_8x8: true,
            deblock_enabled: true,
            deblock: (0, 0),
            lookahead: 40,
            verbose: false,
        }
    }

    /// Build the settings record from raw options.
    ///
    /// Fails with `Configuration` if width or height is missing, with
    /// `EngineRejectedPreset` on an unknown preset or tune, and with
    /// `EngineRejectedProfile` if the result cannot be made baseline.
    pub fn build(options: &EncoderOptions) -> Result<Self, BridgeError> {
        let width = options.width.ok_or(BridgeError::Configuration("width"))?;
        let height = options.height.ok_or(BridgeError::Configuration("height"))?;

        let preset = options.preset.clone().unwrap_or_else(|| DEFAULT_PRESET.to_string());
        let tune = options.tune.clone().unwrap_or_else(|| DEFAULT_TUNE.to_string());

        let mut settings = Self::defaults(width, height);
        apply_preset(&mut settings, &preset)
            .and_then(|()| apply_tune(&mut settings, &tune))
            .map_err(|reason| BridgeError::EngineRejectedPreset {
                preset: preset.clone(),
                tune: tune.clone(),
                reason,
            })?;
        settings.preset = preset;
        settings.tune = tune;

        settings.overlay(options);

        apply_profile(&mut settings, BASELINE).map_err(|reason| {
            BridgeError::EngineRejectedProfile {
                profile: BASELINE,
                reason,
            }
        })?;

        tracing::debug!(?settings, "encoder settings resolved");
        Ok(settings)
    }

    /// Overwrite fields with the options that were explicitly given.
    fn overlay(&mut self, o: &EncoderOptions) {
        self.gop = o.gop.map_or(DEFAULT_GOP, |v| clamp_u32("gop", v));
        self.fps = o.fps.map_or(DEFAULT_FPS, |v| clamp_u32("fps", v));
        self.verbose = o.verbose.unwrap_or(false);

        if let Some(v) = o.threads {
            self.threads = clamp_u32("threads", v);
        }
        if let Some(v) = o.scenecut {
            self.scenecut = clamp_u32("scenecut", v);
        }
        if let Some(v) = o.intra_refresh {
            self.intra_refresh = v;
        }
        if let Some(v) = o.bframe {
            self.bframes = clamp_u32("bframe", v);
        }
        if let Some(v) = o.badapt {
            self.b_adapt = BFrameAdaptive::from_index(clamp_u32("badapt", v));
        }
        if let Some(v) = o.cabac {
            self.cabac = clamp_u32("cabac", v) == 1;
        }

        let rc = match (o.rc_mode, o.rc_method) {
            (Some(v), _) => Some(v),
            (None, Some(v)) => {
                tracing::warn!("'rc-method' is deprecated, use 'rc-mode'");
                Some(v)
            }
            (None, None) => None,
        };
        if let Some(v) = rc {
            self.rate_control = RateControl::from_index(clamp_u32("rc-mode", v));
        }

        if let Some(v) = o.qp {
            self.qp = clamp_u32("qp", v);
        }
        if let Some(v) = o.qpmin {
            self.qp_min = clamp_u32("qpmin", v);
        }
        if let Some(v) = o.qpmax {
            self.qp_max = clamp_u32("qpmax", v);
        }
        if let Some(v) = o.qpstep {
            self.qp_step = clamp_u32("qpstep", v);
        }
        if let Some(v) = o.bitrate {
            self.bitrate = clamp_u32("bitrate", v);
        }
        if let Some(v) = o.crf {
            self.crf = clamp_f32("crf", v);
        }
        if let Some(v) = o.ipratio {
            self.ip_ratio = clamp_f32("ipratio", v);
        }
        if let Some(v) = o.pbratio {
            self.pb_ratio = clamp_f32("pbratio", v);
        }
        if let Some(v) = o.aq_mode {
            self.aq_mode = AdaptiveQuantization::from_index(clamp_u32("aq-mode", v));
        }
        if let Some(v) = o.aq_strength {
            self.aq_strength = clamp_f32("aq-strength", v);
        }
        if let Some(v) = o.weightp {
            self.weightp = WeightedPrediction::from_index(clamp_u32("weightp", v));
        }
        if let Some(v) = o.me {
            self.me = MotionEstimation::from_index(clamp_u32("me", v));
        }
        if let Some(v) = o.merange {
            self.me_range = clamp_u32("merange", v);
        }
        if let Some(v) = o.subme {
            self.subme = clamp_u32("subme", v);
        }
        if let Some(v) = o.trellis {
            self.trellis = clamp_u32("trellis", v);
        }
        if let Some(v) = o.nr {
            self.noise_reduction = clamp_u32("nr", v);
        }

        if self.qp_min > self.qp_max {
            tracing::warn!(qp_min = self.qp_min, qp_max = self.qp_max, "qpmin above qpmax, swapping");
            std::mem::swap(&mut self.qp_min, &mut self.qp_max);
        }
    }
}
