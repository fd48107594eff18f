//! Device WebSocket sessions.
//!
//! Each session owns a bounded outbound queue registered in the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry). A dedicated
//! writer task drains the queue; paced speech runs inside that task so a
//! session's frames are strictly ordered.

use crate::registry::Outbound;
use crate::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parley_audio::{AbortFlag, AudioError, AudioPacer, FrameSink, PacketMeta};
use parley_types::{TtsState, WsEnvelope};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Header carrying the device id when it is not in the query string.
pub const DEVICE_ID_HEADER: &str = "device-id";

#[derive(Debug, Deserialize)]
pub struct WsConnectParams {
    pub device_id: Option<String>,
    pub mac: Option<String>,
}

/// Control messages a device may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IncomingMessage {
    /// Stop the utterance currently playing.
    Abort,
    /// Keep-alive; refreshes presence.
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Pong,
}

/// `GET /ws?device_id=...&mac=...` or with a `Device-Id` header.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
    Query(params): Query<WsConnectParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let device_id = params
        .device_id
        .or_else(|| {
            headers
                .get(DEVICE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let Some(device_id) = device_id else {
        tracing::warn!("websocket connect missing device id");
        return StatusCode::BAD_REQUEST.into_response();
    };

    tracing::info!(device_id = %device_id, mac = ?params.mac, "device websocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, device_id: String) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(state.config.webhook.session_queue);

    let guard = state.registry.register(device_id.clone(), tx.clone());
    let session_id = guard.session_id().to_string();
    state
        .presence
        .mark_online(&device_id, Some(&session_id), None)
        .await;

    let abort = AbortFlag::new();
    let mut send_task = tokio::spawn(run_writer(
        sender,
        rx,
        AudioPacer::new(state.config.audio.pacing(), abort.clone()),
        session_id.clone(),
    ));

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<IncomingMessage>(text.as_str()) {
                            Ok(IncomingMessage::Abort) => {
                                tracing::debug!(device_id = %device_id, "device requested abort");
                                abort.abort();
                            }
                            Ok(IncomingMessage::Ping) => {
                                state.presence.refresh(&device_id, None).await;
                                send_reply(&tx, &Reply::Pong);
                            }
                            Err(_) => {
                                tracing::debug!(device_id = %device_id, "ignoring unrecognised text frame");
                            }
                        }
                    }
                    Message::Binary(audio) => {
                        // Inbound audio belongs to the voice pipeline.
                        tracing::trace!(device_id = %device_id, bytes = audio.len(), "inbound audio frame");
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    abort.abort();
    send_task.abort();
    drop(guard);
    // A reconnect may already own the key; only this session's entry goes.
    state
        .presence
        .mark_offline_if_session(&device_id, &session_id)
        .await;
    tracing::info!(device_id = %device_id, session_id = %session_id, "device session closed");
}

fn send_reply(tx: &mpsc::Sender<Outbound>, reply: &Reply) {
    match serde_json::to_value(reply) {
        Ok(value) => {
            if let Err(e) = tx.try_send(Outbound::Text(value.to_string())) {
                tracing::warn!("failed to queue websocket reply: {}", e);
            }
        }
        Err(e) => tracing::error!("failed to serialize websocket reply: {}", e),
    }
}

type WsSender = SplitSink<WebSocket, Message>;

async fn run_writer(
    mut sender: WsSender,
    mut rx: mpsc::Receiver<Outbound>,
    mut pacer: AudioPacer,
    session_id: String,
) {
    while let Some(outbound) = rx.recv().await {
        let sent = match outbound {
            Outbound::Notification(payload) => send_json(&mut sender, &payload).await,
            Outbound::Text(text) => sender.send(Message::Text(text.into())).await.is_ok(),
            Outbound::Speech { text, frames } => {
                speak(&mut sender, &mut pacer, &session_id, text, frames).await
            }
            Outbound::Close => {
                let _ = sender.send(Message::Close(None)).await;
                false
            }
        };
        if !sent {
            break;
        }
    }
}

async fn send_json<T: Serialize>(sender: &mut WsSender, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("failed to serialize outbound websocket message: {}", e);
            true
        }
    }
}

/// Plays one utterance: `start`, `sentence_start`, paced frames, `stop`.
///
/// Returns `false` once the socket is unusable.
async fn speak(
    sender: &mut WsSender,
    pacer: &mut AudioPacer,
    session_id: &str,
    text: Option<String>,
    frames: Vec<Bytes>,
) -> bool {
    pacer.abort_flag().clear();

    if !send_json(sender, &WsEnvelope::tts(session_id, TtsState::Start, None)).await {
        return false;
    }
    if !send_json(
        sender,
        &WsEnvelope::tts(session_id, TtsState::SentenceStart, text),
    )
    .await
    {
        return false;
    }

    let mut sink = WsFrameSink { sender: &mut *sender };
    let alive = match pacer.send_all(frames, &mut sink).await {
        Ok(outcome) => {
            tracing::debug!(session_id, sent = outcome.sent, aborted = outcome.aborted, "utterance finished");
            true
        }
        Err(e) => {
            tracing::warn!(session_id, error = %e, "utterance interrupted");
            false
        }
    };
    pacer.reset();

    alive && send_json(sender, &WsEnvelope::tts(session_id, TtsState::Stop, None)).await
}

/// Writes paced frames as binary WebSocket messages.
pub struct WsFrameSink<'a> {
    sender: &'a mut WsSender,
}

#[async_trait]
impl<'a> FrameSink for WsFrameSink<'a> {
    async fn send_frame(&mut self, frame: Bytes, _meta: PacketMeta) -> Result<(), AudioError> {
        self.sender
            .send(Message::Binary(frame))
            .await
            .map_err(|e| AudioError::Sink(e.to_string()))
    }
}
