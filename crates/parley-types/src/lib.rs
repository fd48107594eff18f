//! Shared types for the Parley delivery engine.
//!
//! This crate holds the wire-level and status types that more than one
//! Parley crate needs: the notification payload pushed to devices, the
//! outcome of a dispatch attempt, reminder status codes, and the presence
//! status blob. It has no runtime dependencies beyond `serde`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod ws;
pub use ws::{TtsState, WsEnvelope, WsEnvelopeKind};

/// Lifecycle status of a reminder.
///
/// Transitions are one-directional: `Pending` moves to `Delivered` or
/// `Failed` when the scheduler fires it, and `Delivered` moves to `Received`
/// when the device acknowledges it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReminderStatus {
    /// Scheduled and waiting for its fire time.
    Pending,
    /// Handed to a transport successfully.
    Delivered,
    /// Acknowledged by the device.
    Received,
    /// Delivery failed, or the fire time was missed.
    Failed,
}

impl ReminderStatus {
    /// Returns the database label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivered => "DELIVERED",
            Self::Received => "RECEIVED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ReminderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown reminder status label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown reminder status: {0}")]
pub struct ParseReminderStatusError(pub String);

impl FromStr for ReminderStatus {
    type Err = ParseReminderStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DELIVERED" => Ok(Self::Delivered),
            "RECEIVED" => Ok(Self::Received),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseReminderStatusError(other.to_string())),
        }
    }
}

/// Transport that carried a successful delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMethod {
    #[serde(rename = "WS")]
    WebSocket,
    #[serde(rename = "MQTT")]
    Mqtt,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "WS",
            Self::Mqtt => "MQTT",
        }
    }
}

/// Outcome of one dispatch attempt.
///
/// `delivered == true` always carries a method; `delivered == false` never
/// does. Use the constructors to keep that pairing intact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub delivered: bool,
    pub method: Option<DeliveryMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(method: DeliveryMethod) -> Self {
        Self {
            delivered: true,
            method: Some(method),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            delivered: false,
            method: None,
            error: Some(error.into()),
        }
    }
}

/// Device identity used to address a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTarget {
    /// Identifier the device presents on its WebSocket session.
    pub device_id: String,
    /// MAC address, used to build MQTT topics.
    pub mac_address: String,
}

impl DeliveryTarget {
    pub fn new(device_id: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            mac_address: mac_address.into(),
        }
    }
}

/// Notification pushed to a device over WebSocket or MQTT.
///
/// Serializes as `{"type":"notification","useLLM":bool,"title":..,"content":..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "notification")]
pub struct NotificationPayload {
    #[serde(rename = "useLLM", default)]
    pub use_llm: bool,
    #[serde(default)]
    pub title: String,
    pub content: String,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, content: impl Into<String>, use_llm: bool) -> Self {
        Self {
            use_llm,
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Presence status blob stored under a device's presence key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Always `"online"` for records written by the tracker.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// RFC 3339 timestamp of when the session was registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<String>,
}

impl DeviceStatus {
    pub fn online(session_id: Option<String>, connected_at: Option<String>) -> Self {
        Self {
            status: "online".to_string(),
            session_id,
            connected_at,
        }
    }
}
