//! Outbound WebSocket envelope.
//!
//! A spoken utterance is delimited by `tts` envelopes moving through
//! `start → sentence_start → stop`; the binary audio frames travel between
//! `sentence_start` and `stop`.

use serde::{Deserialize, Serialize};

/// Envelope category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsEnvelopeKind {
    Tts,
    Stt,
}

/// Utterance state carried by a `tts` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: WsEnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TtsState>,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl WsEnvelope {
    pub fn tts(session_id: impl Into<String>, state: TtsState, text: Option<String>) -> Self {
        Self {
            kind: WsEnvelopeKind::Tts,
            state: Some(state),
            session_id: session_id.into(),
            text,
        }
    }

    /// Echo of recognised speech back to the device.
    pub fn stt(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: WsEnvelopeKind::Stt,
            state: None,
            session_id: session_id.into(),
            text: Some(text.into()),
        }
    }
}
