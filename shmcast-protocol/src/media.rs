//! Bus message types: compressed image readings and the envelope that carries them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TimeStamp;

/// FourCC tag for H.264 Annex-B payloads.
pub const FOURCC_H264: &str = "h264";

/// Errors when encoding or decoding bus messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message data: {0}")]
    Codec(#[from] postcard::Error),
    #[error("envelope carries message type {actual}, expected {expected}")]
    UnexpectedType { expected: u32, actual: u32 },
}

/// A message that can be published on the bus.
pub trait BusMessage: Serialize + for<'de> Deserialize<'de> {
    /// Numeric message type carried in the envelope.
    const ID: u32;
}

/// One compressed video frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReading {
    /// Codec tag, e.g. `"h264"`.
    pub fourcc: String,
    pub width: u32,
    pub height: u32,
    /// One Annex-B access unit including start codes.
    pub data: Bytes,
}

impl ImageReading {
    pub fn h264(width: u32, height: u32, data: Bytes) -> Self {
        Self {
            fourcc: FOURCC_H264.to_string(),
            width,
            height,
            data,
        }
    }
}

impl BusMessage for ImageReading {
    const ID: u32 = 1055;
}

/// Container for any bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// `BusMessage::ID` of the serialized payload.
    pub data_type: u32,
    /// Time the envelope was handed to the bus.
    pub sent: TimeStamp,
    /// Time the payload's source data was captured.
    pub sample_time: TimeStamp,
    /// Distinguishes concurrent senders on one session.
    pub sender_stamp: u32,
    /// postcard-encoded message.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a message, stamping `sent` with the current time.
    pub fn wrap<M: BusMessage>(
        message: &M,
        sample_time: TimeStamp,
        sender_stamp: u32,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            data_type: M::ID,
            sent: TimeStamp::now(),
            sample_time,
            sender_stamp,
            payload: postcard::to_allocvec(message)?,
        })
    }

    /// Decode the payload as `M`, checking the message type first.
    pub fn open<M: BusMessage>(&self) -> Result<M, ProtocolError> {
        if self.data_type != M::ID {
            return Err(ProtocolError::UnexpectedType {
                expected: M::ID,
                actual: self.data_type,
            });
        }
        Ok(postcard::from_bytes(&self.payload)?)
    }
}

/// Serialize an `Envelope` to compact binary via postcard.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    Ok(postcard::to_allocvec(envelope)?)
}

/// Deserialize an `Envelope` from postcard bytes.
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, ProtocolError> {
    Ok(postcard::from_bytes(data)?)
}
