//! Chooses a transport for a notification.
//!
//! A device with live presence gets the payload handed to its WebSocket
//! session; anything else goes out over MQTT. WebSocket delivery means the
//! session accepted the payload, not that the device displayed it.

use crate::registry::{ConnectionRegistry, Outbound};
use async_trait::async_trait;
use parley_mqtt::{Publisher, QoS};
use parley_presence::PresenceTracker;
use parley_reminder::Notifier;
use parley_types::{DeliveryMethod, DeliveryResult, DeliveryTarget, NotificationPayload};
use std::sync::Arc;

pub const OFFLINE_NO_MQTT: &str = "device offline, MQTT not available";
pub const HANDOFF_FAILED_NO_MQTT: &str = "websocket handoff failed, MQTT not available";

/// Topic namespace for the MQTT fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    /// `device/{mac}`
    Webhook,
    /// `{topic_base}/{mac}`
    Reminder,
}

pub struct DeliveryDispatcher {
    presence: Arc<PresenceTracker>,
    registry: ConnectionRegistry,
    mqtt: Arc<dyn Publisher>,
    reminder_topic_base: String,
}

impl DeliveryDispatcher {
    pub fn new(
        presence: Arc<PresenceTracker>,
        registry: ConnectionRegistry,
        mqtt: Arc<dyn Publisher>,
        reminder_topic_base: impl Into<String>,
    ) -> Self {
        Self {
            presence,
            registry,
            mqtt,
            reminder_topic_base: reminder_topic_base.into(),
        }
    }

    pub fn topic_for(&self, route: DeliveryRoute, mac_address: &str) -> String {
        match route {
            DeliveryRoute::Webhook => format!("device/{mac_address}"),
            DeliveryRoute::Reminder => format!(
                "{}/{mac_address}",
                self.reminder_topic_base.trim_end_matches('/')
            ),
        }
    }

    /// Delivers `payload` over WebSocket if possible, else MQTT.
    ///
    /// Never fails: an undeliverable payload yields `delivered == false` with
    /// the reason in `error`.
    pub async fn dispatch(
        &self,
        target: &DeliveryTarget,
        route: DeliveryRoute,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        let device_id = target.device_id.as_str();
        let online = self.presence.is_online(device_id).await;

        let fallback_error = if online {
            if self.hand_off(device_id, payload) {
                tracing::info!(device_id, method = "WS", "notification delivered");
                return DeliveryResult::delivered(DeliveryMethod::WebSocket);
            }
            HANDOFF_FAILED_NO_MQTT
        } else {
            OFFLINE_NO_MQTT
        };

        if !self.mqtt.is_available() {
            tracing::warn!(device_id, online, "notification undeliverable: {fallback_error}");
            return DeliveryResult::failed(fallback_error);
        }

        let topic = self.topic_for(route, &target.mac_address);
        let body = match serde_json::to_value(payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(device_id, error = %e, "failed to serialize notification");
                return DeliveryResult::failed(format!("serialization failed: {e}"));
            }
        };

        if self
            .mqtt
            .publish_json(&topic, &body, QoS::AtLeastOnce, false)
            .await
        {
            tracing::info!(device_id, topic = %topic, method = "MQTT", "notification delivered");
            DeliveryResult::delivered(DeliveryMethod::Mqtt)
        } else {
            tracing::warn!(device_id, topic = %topic, "MQTT publish failed: {fallback_error}");
            DeliveryResult::failed(fallback_error)
        }
    }

    fn hand_off(&self, device_id: &str, payload: &NotificationPayload) -> bool {
        let Some(session) = self.registry.get(device_id) else {
            tracing::warn!(device_id, "device marked online but has no local session");
            return false;
        };
        match session
            .sender
            .try_send(Outbound::Notification(payload.clone()))
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    device_id,
                    session_id = %session.session_id,
                    error = %e,
                    "websocket handoff failed, falling back to MQTT"
                );
                false
            }
        }
    }
}

#[async_trait]
impl Notifier for DeliveryDispatcher {
    async fn notify(
        &self,
        target: &DeliveryTarget,
        payload: &NotificationPayload,
    ) -> DeliveryResult {
        self.dispatch(target, DeliveryRoute::Reminder, payload).await
    }
}
