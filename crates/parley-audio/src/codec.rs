//! Binary Protocol V3 framing for gateway-bound audio.
//!
//! ```text
//! byte 0    message type (0x00 = audio)
//! byte 1    reserved (0x00)
//! bytes 2-3 payload length, big-endian u16
//! ```
//!
//! followed by exactly `length` bytes of Opus data.

use crate::error::AudioError;
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed header.
pub const HEADER_LEN: usize = 4;

/// Largest payload the length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Audio = 0x00,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Audio),
            _ => None,
        }
    }
}

/// Wraps one audio packet in a gateway header.
///
/// # Errors
///
/// Returns [`AudioError::FrameTooLarge`] when the packet is longer than
/// [`MAX_PAYLOAD_LEN`]. Oversized packets are rejected, never truncated.
pub fn encode(frame: &[u8]) -> Result<Bytes, AudioError> {
    let len = u16::try_from(frame.len()).map_err(|_| AudioError::FrameTooLarge {
        len: frame.len(),
        max: MAX_PAYLOAD_LEN,
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.len());
    buf.put_u8(MessageType::Audio as u8);
    buf.put_u8(0);
    buf.put_u16(len);
    buf.put_slice(frame);
    Ok(buf.freeze())
}

/// Unwraps a gateway frame and returns its audio payload.
///
/// # Errors
///
/// Returns [`AudioError::FrameCorrupt`] if the buffer is shorter than the
/// header, carries an unknown message type, or its declared length differs
/// from the number of bytes that follow the header.
pub fn decode(buf: &[u8]) -> Result<Bytes, AudioError> {
    if buf.len() < HEADER_LEN {
        return Err(AudioError::FrameCorrupt(format!(
            "buffer of {} bytes is shorter than the {HEADER_LEN}-byte header",
            buf.len()
        )));
    }

    if MessageType::from_u8(buf[0]).is_none() {
        return Err(AudioError::FrameCorrupt(format!(
            "unknown message type 0x{:02x}",
            buf[0]
        )));
    }

    let declared = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let remaining = buf.len() - HEADER_LEN;
    if declared != remaining {
        return Err(AudioError::FrameCorrupt(format!(
            "header declares {declared} payload bytes but {remaining} follow"
        )));
    }

    Ok(Bytes::copy_from_slice(&buf[HEADER_LEN..]))
}
