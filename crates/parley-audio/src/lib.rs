//! Outbound audio for Parley: gateway framing and real-time pacing.
//!
//! Opus packets are opaque here. [`codec`] wraps a packet in the 4-byte
//! Binary Protocol V3 header used on the MQTT gateway path, and [`pacing`]
//! emits a stream of fixed-duration packets at playback cadence, correcting
//! for scheduler drift without bursting.

pub mod codec;
pub mod error;
pub mod pacing;

pub use codec::{decode, encode, MessageType, HEADER_LEN, MAX_PAYLOAD_LEN};
pub use error::AudioError;
pub use pacing::{
    wire_timestamp_ms, AbortFlag, AudioPacer, FrameSink, PaceOutcome, PacingConfig, PacketMeta,
};
