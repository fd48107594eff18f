use thiserror::Error;

#[derive(Error, Debug)]
pub enum MqttError {
    #[error("invalid MQTT broker URL: {0}")]
    InvalidUrl(String),
}
