//! Publish-only MQTT transport for Parley.
//!
//! [`MqttClient`] keeps one persistent broker connection alive in a
//! background task, reconnecting with bounded exponential backoff. When no
//! broker is configured it stays disconnected and every publish returns
//! `false`; nothing in this crate raises into the delivery path.

mod backoff;
mod client;
mod error;
mod settings;

pub use backoff::Backoff;
pub use client::{MqttClient, Publisher, TransportState};
pub use error::MqttError;
pub use rumqttc::QoS;
pub use settings::{redact_url, BrokerAddress, MqttSettings};
