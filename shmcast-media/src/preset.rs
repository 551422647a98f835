//! Named presets, tunes and profiles resolved against [`EncoderSettings`].
//!
//! A preset trades speed for compression by setting the analysis knobs; a
//! tune adjusts them for a content type or latency target; the profile runs
//! last and strips whatever the target decoder class cannot handle.

use crate::settings::{
    AdaptiveQuantization, BFrameAdaptive, EncoderSettings, MotionEstimation, RateControl,
    WeightedPrediction,
};

/// Preset names from fastest to slowest.
pub const PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
    "placebo",
];

/// Tunes that change psychovisual decisions. At most one may be combined.
pub const PSY_TUNES: &[&str] = &["film", "animation", "grain", "stillimage", "psnr", "ssim"];

/// Tunes that can be combined with anything.
pub const EXTRA_TUNES: &[&str] = &["fastdecode", "zerolatency"];

/// The only profile the bridge emits.
pub const BASELINE: &str = "baseline";

/// Apply a preset by name.
///
/// Returns a human-readable reason on an unknown name.
pub fn apply_preset(settings: &mut EncoderSettings, preset: &str) -> Result<(), String> {
    let s = settings;
    match preset.to_ascii_lowercase().as_str() {
        "ultrafast" => {
            s.refs = 1;
            s.scenecut = 0;
            s.cabac = false;
            s.bframes = 0;
            s.transform_8x8 = false;
            s.me = MotionEstimation::Diamond;
            s.subme = 0;
            s.aq_mode = AdaptiveQuantization::Off;
            s.weightp = WeightedPrediction::Off;
            s.trellis = 0;
            s.lookahead = 0;
        }
        "superfast" => {
            s.me = MotionEstimation::Diamond;
            s.subme = 1;
            s.refs = 1;
            s.weightp = WeightedPrediction::Simple;
            s.trellis = 0;
            s.lookahead = 0;
        }
        "veryfast" => {
            s.subme = 2;
            s.refs = 1;
            s.weightp = WeightedPrediction::Simple;
            s.trellis = 0;
            s.lookahead = 10;
        }
        "faster" => {
            s.refs = 2;
            s.subme = 4;
            s.weightp = WeightedPrediction::Simple;
            s.lookahead = 20;
        }
        "fast" => {
            s.refs = 2;
            s.subme = 6;
            s.lookahead = 30;
        }
        "medium" => {}
        "slow" => {
            s.me = MotionEstimation::UnevenMultiHexagon;
            s.subme = 8;
            s.refs = 5;
            s.b_adapt = BFrameAdaptive::Trellis;
            s.lookahead = 50;
        }
        "slower" => {
            s.me = MotionEstimation::UnevenMultiHexagon;
            s.subme = 9;
            s.refs = 8;
            s.b_adapt = BFrameAdaptive::Trellis;
            s.trellis = 2;
            s.lookahead = 60;
        }
        "veryslow" => {
            s.me = MotionEstimation::UnevenMultiHexagon;
            s.subme = 10;
            s.me_range = 24;
            s.refs = 16;
            s.b_adapt = BFrameAdaptive::Trellis;
            s.trellis = 2;
            s.bframes = 8;
            s.lookahead = 60;
        }
        "placebo" => {
            s.me = MotionEstimation::TransformedExhaustive;
            s.subme = 11;
            s.me_range = 24;
            s.refs = 16;
            s.b_adapt = BFrameAdaptive::Trellis;
            s.trellis = 2;
            s.bframes = 16;
            s.lookahead = 60;
        }
        other => return Err(format!("unknown preset '{other}'")),
    }
    Ok(())
}

/// Apply a comma-separated list of tunes.
///
/// An empty string applies nothing.
pub fn apply_tune(settings: &mut EncoderSettings, tune: &str) -> Result<(), String> {
    let mut psy_tune: Option<&str> = None;

    for name in tune.split(|c: char| c == ',' || c == '.').map(str::trim).filter(|t| !t.is_empty()) {
        let lower = name.to_ascii_lowercase();
        if PSY_TUNES.contains(&lower.as_str()) {
            if let Some(previous) = psy_tune {
                return Err(format!("only one psy tuning may be used, got '{previous}' and '{name}'"));
            }
            psy_tune = Some(name);
        }

        let s = &mut *settings;
        match lower.as_str() {
            "film" => {
                s.deblock = (-1, -1);
            }
            "animation" => {
                if s.refs > 1 {
                    s.refs *= 2;
                }
                s.deblock = (1, 1);
                s.aq_strength = 0.6;
                s.bframes += 2;
            }
            "grain" => {
                s.deblock = (-2, -2);
                s.ip_ratio = 1.1;
                s.pb_ratio = 1.1;
                s.aq_strength = 0.5;
            }
            "stillimage" => {
                s.deblock = (-3, -3);
                s.aq_strength = 1.2;
            }
            "psnr" => {
                s.aq_mode = AdaptiveQuantization::Off;
            }
            "ssim" => {
                s.aq_mode = AdaptiveQuantization::AutoVariance;
            }
            "fastdecode" => {
                s.deblock_enabled = false;
                s.cabac = false;
                s.weightp = WeightedPrediction::Off;
            }
            "zerolatency" => {
                s.lookahead = 0;
                s.bframes = 0;
                s.sliced_threads = true;
            }
            _ => return Err(format!("unknown tune '{name}'")),
        }
    }
    Ok(())
}

/// Restrict settings to what a profile allows.
///
/// Only [`BASELINE`] is supported. Lossless rate control is rejected rather
/// than silently changed.
pub fn apply_profile(settings: &mut EncoderSettings, profile: &str) -> Result<(), String> {
    if !profile.eq_ignore_ascii_case(BASELINE) {
        return Err(format!("unsupported profile '{profile}'"));
    }

    let lossless = match settings.rate_control {
        RateControl::ConstantQp => settings.qp == 0,
        RateControl::ConstantRateFactor => settings.crf <= 0.0,
        RateControl::AverageBitrate => false,
    };
    if lossless {
        return Err("baseline profile doesn't support lossless".to_string());
    }

    settings.transform_8x8 = false;
    settings.cabac = false;
    settings.bframes = 0;
    settings.weightp = WeightedPrediction::Off;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> EncoderSettings {
        EncoderSettings::defaults(640, 480)
    }

    #[test]
    fn every_listed_preset_resolves() {
        for preset in PRESETS {
            let mut s = base();
            apply_preset(&mut s, preset).unwrap();
        }
    }

    #[test]
    fn preset_names_are_case_insensitive() {
        let mut a = base();
        let mut b = base();
        apply_preset(&mut a, "VeryFast").unwrap();
        apply_preset(&mut b, "veryfast").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        let mut s = base();
        let err = apply_preset(&mut s, "invalid-name").unwrap_err();
        assert!(err.contains("invalid-name"));
    }

    #[test]
    fn veryfast_lowers_subpel_refinement() {
        let mut s = base();
        apply_preset(&mut s, "veryfast").unwrap();
        assert_eq!(s.subme, 2);
        assert_eq!(s.refs, 1);
        assert_eq!(s.trellis, 0);
        assert_eq!(s.me_range, 16);
    }

    #[test]
    fn zerolatency_removes_lookahead_and_bframes() {
        let mut s = base();
        apply_tune(&mut s, "zerolatency").unwrap();
        assert_eq!(s.lookahead, 0);
        assert_eq!(s.bframes, 0);
        assert!(s.sliced_threads);
    }

    #[test]
    fn tunes_combine_with_one_psy_tune() {
        let mut s = base();
        apply_tune(&mut s, "film,zerolatency,fastdecode").unwrap();
        assert_eq!(s.deblock, (-1, -1));
        assert!(!s.deblock_enabled);
        assert_eq!(s.bframes, 0);

        let mut s = base();
        let err = apply_tune(&mut s, "film,grain").unwrap_err();
        assert!(err.contains("only one psy tuning"));
    }

    #[test]
    fn unknown_tune_is_rejected() {
        let mut s = base();
        assert!(apply_tune(&mut s, "cinematic").is_err());
        // Empty tune means none.
        let mut s = base();
        apply_tune(&mut s, "").unwrap();
        assert_eq!(s, base());
    }

    #[test]
    fn baseline_strips_main_profile_tools() {
        let mut s = base();
        s.cabac = true;
        s.bframes = 3;
        s.weightp = WeightedPrediction::Smart;
        apply_profile(&mut s, BASELINE).unwrap();
        assert!(!s.cabac);
        assert_eq!(s.bframes, 0);
        assert_eq!(s.weightp, WeightedPrediction::Off);
        assert!(!s.transform_8x8);
    }

    #[test]
    fn baseline_rejects_lossless() {
        let mut s = base();
        s.rate_control = RateControl::ConstantRateFactor;
        s.crf = 0.0;
        assert!(apply_profile(&mut s, BASELINE).is_err());

        let mut s = base();
        s.rate_control = RateControl::ConstantQp;
        s.qp = 0;
        assert!(apply_profile(&mut s, BASELINE).is_err());

        // Bitrate control is never lossless.
        let mut s = base();
        s.rate_control = RateControl::AverageBitrate;
        s.crf = 0.0;
        apply_profile(&mut s, BASELINE).unwrap();
    }

    #[test]
    fn other_profiles_are_rejected() {
        let mut s = base();
        assert!(apply_profile(&mut s, "high").is_err());
    }
}
