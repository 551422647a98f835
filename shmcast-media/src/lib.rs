//! Frame acquisition, I420 plane mapping, H.264 encoding and publishing.

pub mod encode_loop;
pub mod error;
pub mod plane;
pub mod preset;
pub mod publish;
pub mod settings;
#[cfg(target_os = "linux")]
pub mod shm;
pub mod source;
pub mod video_codec;

pub use encode_loop::{EncodeLoop, ExitReason, LoopReport};
pub use error::BridgeError;
pub use plane::{PlaneView, Planes};
pub use publish::PublishBridge;
pub use settings::{EncoderOptions, EncoderSettings};
#[cfg(target_os = "linux")]
pub use shm::{ShmFrameSource, ShmProducer};
pub use source::{FrameSource, LockedFrame, MemoryFrameSource};
#[cfg(feature = "video-codec")]
pub use video_codec::OpenH264Engine;
pub use video_codec::{AccessUnit, EncoderEngine, FrameEncoder};
