//! Error taxonomy for bridge startup and steady-state operation.

use thiserror::Error;

/// Errors raised while building, opening, or running the bridge.
///
/// Everything except `Encode` is fatal at startup. `Encode` only drops the
/// output of the frame being encoded.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("missing required option '{0}'")]
    Configuration(&'static str),
    #[error("encoder rejected preset '{preset}' / tune '{tune}': {reason}")]
    EngineRejectedPreset {
        preset: String,
        tune: String,
        reason: String,
    },
    #[error("encoder rejected profile '{profile}': {reason}")]
    EngineRejectedProfile {
        profile: &'static str,
        reason: String,
    },
    #[error("failed to attach to frame source '{name}': {source}")]
    SourceAttachFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("frame source holds {actual} bytes, a {width}x{height} I420 frame needs {expected}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
    #[error("failed to open encoder: {0}")]
    EngineInitFailed(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

impl BridgeError {
    /// Whether this error must stop the process before the encode loop runs.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Encode(_))
    }
}
