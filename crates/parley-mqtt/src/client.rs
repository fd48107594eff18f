//! Persistent, auto-reconnecting publish-only client.
//!
//! States: `Disconnected → Connecting → Connected`, back to `Connecting` on
//! any connection loss, and `Closed` only after [`MqttClient::shutdown`].
//! The network task owns the `rumqttc` event loop and reports state through
//! a `watch` channel; nothing else observes or mutates the connection.

use crate::backoff::Backoff;
use crate::error::MqttError;
use crate::settings::{BrokerAddress, MqttSettings};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown lets the event loop flush the DISCONNECT packet.
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Publishing seam used by the dispatcher and the gateway audio sink.
///
/// Implementations report failure as `false`, never as an error.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Whether a broker is configured and the transport has not been closed.
    fn is_available(&self) -> bool;

    async fn publish_json(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> bool;

    async fn publish_bytes(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> bool;
}

struct Running {
    client: AsyncClient,
    task: JoinHandle<()>,
}

pub struct MqttClient {
    settings: MqttSettings,
    state: watch::Sender<TransportState>,
    cancel: CancellationToken,
    running: Mutex<Option<Running>>,
}

impl MqttClient {
    pub fn new(settings: MqttSettings) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            settings,
            state,
            cancel: CancellationToken::new(),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.state.subscribe()
    }

    /// Starts the background connection task.
    ///
    /// Idempotent. Without a configured broker this is a no-op and the client
    /// stays `Disconnected` for good. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::InvalidUrl`] when the configured broker URL
    /// cannot be used.
    pub fn start(&self) -> Result<(), MqttError> {
        if !self.settings.is_configured() {
            tracing::info!("MQTT broker not configured, transport disabled");
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            tracing::debug!("MQTT client already shut down, not restarting");
            return Ok(());
        }

        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(());
        }

        let raw_url = self.settings.broker_url.as_deref().unwrap_or_default();
        let address = BrokerAddress::parse(raw_url)?;

        let mut options = MqttOptions::new(
            self.settings.client_id.clone(),
            address.host.clone(),
            address.port,
        );
        options.set_keep_alive(self.settings.effective_keep_alive());
        let username = address.username.or_else(|| self.settings.username.clone());
        let password = address.password.or_else(|| self.settings.password.clone());
        if let Some(username) = username {
            options.set_credentials(username, password.unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, self.settings.request_capacity.max(1));

        tracing::info!(
            host = %address.host,
            port = address.port,
            client_id = %self.settings.client_id,
            "starting MQTT transport"
        );

        let policy = ReconnectPolicy {
            connect_retry_delay: self.settings.connect_retry_delay,
            backoff: Backoff::new(
                self.settings.reconnect_min_delay,
                self.settings.reconnect_max_delay,
            ),
        };
        let task = tokio::spawn(run_event_loop(
            eventloop,
            self.state.clone(),
            self.cancel.clone(),
            policy,
        ));

        *running = Some(Running { client, task });
        Ok(())
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn client(&self) -> Option<AsyncClient> {
        self.lock_running().as_ref().map(|r| r.client.clone())
    }

    /// Whether a broker is configured and the transport is running.
    pub fn is_available(&self) -> bool {
        self.state() != TransportState::Closed && self.lock_running().is_some()
    }

    /// Waits up to `timeout` for the connection to come up.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, TransportState::Connected | TransportState::Closed)),
        )
        .await;
        matches!(waited, Ok(Ok(state)) if *state == TransportState::Connected)
    }

    /// Serializes `payload` as JSON and publishes it.
    ///
    /// Returns `true` only when the message was handed to the transport.
    pub async fn publish<T>(&self, topic: &str, payload: &T, qos: QoS, retain: bool) -> bool
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.publish_raw(topic, bytes, qos, retain).await,
            Err(e) => {
                tracing::error!(topic, error = %e, "failed to serialize MQTT payload");
                false
            }
        }
    }

    async fn publish_raw(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        let Some(client) = self.client() else {
            tracing::debug!(topic, "MQTT unavailable, publish skipped");
            return false;
        };
        if !self.wait_connected(self.settings.connect_wait).await {
            tracing::warn!(
                topic,
                wait_ms = self.settings.connect_wait.as_millis() as u64,
                "MQTT not connected, publish skipped"
            );
            return false;
        }

        let len = payload.len();
        match client.publish(topic, qos, retain, payload).await {
            Ok(()) => {
                tracing::debug!(topic, bytes = len, "MQTT message published");
                true
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "MQTT publish failed");
                false
            }
        }
    }

    /// Stops the network task and disconnects from the broker.
    ///
    /// Idempotent; safe to call on a client that was never started.
    pub async fn shutdown(&self) {
        let running = self.lock_running().take();
        self.cancel.cancel();

        if let Some(Running { client, task }) = running {
            if let Err(e) = client.try_disconnect() {
                tracing::debug!(error = %e, "MQTT disconnect request not queued");
            }
            if let Err(e) = task.await {
                tracing::error!(error = %e, "MQTT network task panicked");
            }
            tracing::info!("MQTT transport shut down");
        }

        self.state.send_replace(TransportState::Closed);
    }
}

#[async_trait]
impl Publisher for MqttClient {
    fn is_available(&self) -> bool {
        MqttClient::is_available(self)
    }

    async fn publish_json(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        qos: QoS,
        retain: bool,
    ) -> bool {
        self.publish(topic, payload, qos, retain).await
    }

    async fn publish_bytes(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> bool {
        self.publish_raw(topic, payload.to_vec(), qos, retain).await
    }
}

#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    connect_retry_delay: Duration,
    backoff: Backoff,
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    state: watch::Sender<TransportState>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
) {
    let mut ever_connected = false;
    let mut attempt: u32 = 0;
    state.send_replace(TransportState::Connecting);

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                ever_connected = true;
                state.send_replace(TransportState::Connected);
                tracing::info!("MQTT connected");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                state.send_replace(TransportState::Connecting);
                tracing::warn!("MQTT broker sent disconnect, reconnecting");
            }
            Ok(_) => {}
            Err(e) => {
                state.send_replace(TransportState::Connecting);
                let delay = if ever_connected {
                    attempt = attempt.saturating_add(1);
                    policy.backoff.delay_for_attempt(attempt)
                } else {
                    policy.connect_retry_delay
                };
                log_connection_error(&e, delay, attempt);

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    flush_disconnect(&mut eventloop).await;
    tracing::debug!("MQTT network task stopped");
}

fn log_connection_error(error: &ConnectionError, delay: Duration, attempt: u32) {
    tracing::warn!(
        error = %error,
        attempt,
        retry_in_ms = delay.as_millis() as u64,
        "MQTT connection error"
    );
}

/// Drives the event loop just long enough to send a queued DISCONNECT.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flush = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    if tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, flush).await.is_err() {
        tracing::debug!("MQTT disconnect flush timed out");
    }
}
