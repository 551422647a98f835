//! Shared types and wire formats for shmcast.

pub mod media;
pub mod types;

pub use media::{Envelope, ImageReading, ProtocolError};
pub use types::TimeStamp;
