//! Command-line options and how they combine with the config file.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use shmcast_media::EncoderOptions;

/// Shared-memory area read when `--name` is not given.
pub const DEFAULT_NAME: &str = "video0";

/// Bus session joined when `--cid` is not given.
pub const DEFAULT_CID: u8 = 111;

/// Encode I420 frames from shared memory to H.264 and publish them as
/// `ImageReading` messages on a multicast bus session.
#[derive(Debug, Default, Parser)]
#[command(name = "shmcast", version, allow_negative_numbers = true)]
pub struct Args {
    /// Name of the shared memory area to attach to
    #[arg(long)]
    pub name: Option<String>,

    /// Bus session id (multicast group 225.0.0.<cid>)
    #[arg(long)]
    pub cid: Option<u8>,

    /// Sender stamp for published messages
    #[arg(long)]
    pub id: Option<u32>,

    /// TOML file with the same keys as the long options
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Frame width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Frame height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Nominal input frame rate used for rate control (default 20)
    #[arg(long)]
    pub fps: Option<i64>,

    /// Keyframe interval in frames (default 10)
    #[arg(long)]
    pub gop: Option<i64>,

    /// Encoder preset: ultrafast .. placebo (default veryfast)
    #[arg(long)]
    pub preset: Option<String>,

    /// Encoder tune, comma separated (default zerolatency)
    #[arg(long)]
    pub tune: Option<String>,

    /// Log per-frame size, sample time and encode duration
    #[arg(long)]
    pub verbose: bool,

    /// Scene-cut threshold; 0 disables scene-cut keyframes
    #[arg(long)]
    pub scenecut: Option<i64>,

    /// Use periodic intra refresh instead of keyframes
    #[arg(long)]
    pub intra_refresh: bool,

    /// Maximum consecutive B-frames
    #[arg(long)]
    pub bframe: Option<i64>,

    /// Adaptive B-frame decision: 0 off, 1 fast, 2 trellis
    #[arg(long)]
    pub badapt: Option<i64>,

    /// CABAC entropy coding: 0 off, 1 on
    #[arg(long)]
    pub cabac: Option<i64>,

    /// Encoder threads, 0 for auto (at most 4)
    #[arg(long)]
    pub threads: Option<i64>,

    /// Rate control: 0 constant QP, 1 CRF, 2 average bitrate
    #[arg(long)]
    pub rc_mode: Option<i64>,

    #[arg(long, hide = true)]
    pub rc_method: Option<i64>,

    /// Quantizer for constant-QP mode (1-51)
    #[arg(long)]
    pub qp: Option<i64>,

    #[arg(long)]
    pub qpmin: Option<i64>,

    #[arg(long)]
    pub qpmax: Option<i64>,

    /// Maximum quantizer change between frames
    #[arg(long)]
    pub qpstep: Option<i64>,

    /// Target bitrate in bit/s (100000-5000000, default 1500000)
    #[arg(long)]
    pub bitrate: Option<i64>,

    /// Constant rate factor for CRF mode
    #[arg(long)]
    pub crf: Option<f64>,

    #[arg(long)]
    pub ipratio: Option<f64>,

    #[arg(long)]
    pub pbratio: Option<f64>,

    /// Adaptive quantization: 0 off, 1 variance, 2 auto-variance
    #[arg(long)]
    pub aq_mode: Option<i64>,

    /// Adaptive quantization strength (at most 2.0)
    #[arg(long)]
    pub aq_strength: Option<f64>,

    /// Weighted P prediction: 0 off, 1 simple, 2 smart
    #[arg(long)]
    pub weightp: Option<i64>,

    /// Motion estimation: 0 dia, 1 hex, 2 umh, 3 esa, 4 tesa
    #[arg(long)]
    pub me: Option<i64>,

    /// Motion search range (4-16)
    #[arg(long)]
    pub merange: Option<i64>,

    /// Sub-pixel refinement level (2-10)
    #[arg(long)]
    pub subme: Option<i64>,

    /// Trellis quantization: 0 off, 1 final macroblock, 2 always
    #[arg(long)]
    pub trellis: Option<i64>,

    /// Noise reduction strength (0-1000)
    #[arg(long)]
    pub nr: Option<i64>,
}

/// Contents of a `--config` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FileConfig {
    pub name: Option<String>,
    pub cid: Option<u8>,
    pub id: Option<u32>,
    #[serde(flatten)]
    pub encoder: EncoderOptions,
}

/// Everything the bridge needs to start.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub name: String,
    pub cid: u8,
    pub sender_id: u32,
    pub encoder: EncoderOptions,
}

impl Args {
    /// Encoder options given on the command line only.
    fn encoder_options(&self) -> EncoderOptions {
        EncoderOptions {
            width: self.width,
            height: self.height,
            fps: self.fps,
            gop: self.gop,
            preset: self.preset.clone(),
            tune: self.tune.clone(),
            verbose: self.verbose.then_some(true),
            scenecut: self.scenecut,
            intra_refresh: self.intra_refresh.then_some(true),
            bframe: self.bframe,
            badapt: self.badapt,
            cabac: self.cabac,
            threads: self.threads,
            rc_mode: self.rc_mode,
            rc_method: self.rc_method,
            qp: self.qp,
            qpmin: self.qpmin,
            qpmax: self.qpmax,
            qpstep: self.qpstep,
            bitrate: self.bitrate,
            crf: self.crf,
            ipratio: self.ipratio,
            pbratio: self.pbratio,
            aq_mode: self.aq_mode,
            aq_strength: self.aq_strength,
            weightp: self.weightp,
            me: self.me,
            merange: self.merange,
            subme: self.subme,
            trellis: self.trellis,
            nr: self.nr,
        }
    }

    /// Combine with a config file. Command-line values win.
    pub fn resolve(&self, file: FileConfig) -> RunConfig {
        RunConfig {
            name: self
                .name
                .clone()
                .or(file.name)
                .unwrap_or_else(|| DEFAULT_NAME.to_string()),
            cid: self.cid.or(file.cid).unwrap_or(DEFAULT_CID),
            sender_id: self.id.or(file.id).unwrap_or(0),
            encoder: self.encoder_options().or(file.encoder),
        }
    }
}
