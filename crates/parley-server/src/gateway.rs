//! Gateway audio path: paced Opus frames framed with the Binary Protocol V3
//! header and published over MQTT.

use crate::registry::Outbound;
use crate::AppState;
use async_trait::async_trait;
use bytes::Bytes;
use parley_audio::{codec, AbortFlag, AudioError, AudioPacer, FrameSink, PaceOutcome, PacketMeta};
use parley_mqtt::{Publisher, QoS};
use parley_types::DeliveryTarget;
use std::sync::Arc;

pub fn audio_topic(prefix: &str, mac_address: &str) -> String {
    format!("{}/{mac_address}", prefix.trim_end_matches('/'))
}

/// Publishes each frame to a device's gateway audio topic.
pub struct MqttFrameSink {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl MqttFrameSink {
    pub fn new(publisher: Arc<dyn Publisher>, topic: String) -> Self {
        Self { publisher, topic }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl FrameSink for MqttFrameSink {
    async fn send_frame(&mut self, frame: Bytes, meta: PacketMeta) -> Result<(), AudioError> {
        let framed = codec::encode(&frame)?;
        if self
            .publisher
            .publish_bytes(&self.topic, framed, QoS::AtMostOnce, false)
            .await
        {
            Ok(())
        } else {
            Err(AudioError::Sink(format!(
                "gateway publish failed at sequence {}",
                meta.sequence
            )))
        }
    }
}

/// Where an utterance went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechRoute {
    /// Queued on the device's WebSocket session, which paces it.
    WebSocket,
    /// Paced to the MQTT gateway.
    Gateway(PaceOutcome),
}

/// Plays an utterance on a device: through its WebSocket session when it has
/// one, else through the MQTT gateway.
///
/// # Errors
///
/// Returns `AudioError::Sink` when neither transport can take the audio, and
/// propagates frame errors from the gateway path.
pub async fn deliver_speech(
    state: &AppState,
    target: &DeliveryTarget,
    text: Option<String>,
    frames: Vec<Bytes>,
    abort: AbortFlag,
) -> Result<SpeechRoute, AudioError> {
    let pending = match state.registry.get(&target.device_id) {
        Some(session) => match session.sender.try_send(Outbound::Speech { text, frames }) {
            Ok(()) => return Ok(SpeechRoute::WebSocket),
            Err(e) => {
                tracing::warn!(
                    device_id = %target.device_id,
                    error = %e,
                    "speech handoff to websocket failed, trying gateway"
                );
                match e.into_inner() {
                    Outbound::Speech { frames, .. } => frames,
                    _ => Vec::new(),
                }
            }
        },
        None => frames,
    };

    if !state.mqtt.is_available() {
        return Err(AudioError::Sink(
            "no websocket session and MQTT not available".to_string(),
        ));
    }

    let topic = audio_topic(&state.config.mqtt.audio_topic_prefix, &target.mac_address);
    let mut sink = MqttFrameSink::new(state.mqtt.clone(), topic);
    let mut pacer = AudioPacer::new(state.config.audio.pacing(), abort);
    let outcome = pacer.send_all(pending, &mut sink).await?;
    tracing::info!(
        device_id = %target.device_id,
        topic = %sink.topic(),
        sent = outcome.sent,
        aborted = outcome.aborted,
        "gateway utterance finished"
    );
    Ok(SpeechRoute::Gateway(outcome))
}
