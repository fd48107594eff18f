//! Server configuration loading from file and environment variables.

use chrono_tz::Tz;
use parley_audio::PacingConfig;
use parley_db::PoolSettings;
use parley_mqtt::{redact_url, BrokerAddress, MqttSettings};
use parley_reminder::SchedulerConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub reminder: ReminderConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// MQTT broker connection.
#[derive(Clone, Deserialize)]
pub struct MqttConfig {
    /// `mqtt://host:port`. Leave unset to run without MQTT.
    #[serde(default)]
    pub broker_url: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default = "default_connect_wait_ms")]
    pub connect_wait_ms: u64,
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    /// Gateway audio is published to `{audio_topic_prefix}/{mac}`.
    #[serde(default = "default_audio_topic_prefix")]
    pub audio_topic_prefix: String,
}

/// Reminder scheduling.
#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Reminders are published to `{topic_base}/{mac}` over MQTT.
    #[serde(default = "default_topic_base")]
    pub topic_base: String,
    /// IANA zone used for reminder times given without an offset.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    /// `kv_entries` table in the server database.
    #[default]
    Sqlite,
    /// Process-local map; presence does not survive a restart.
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresenceConfig {
    #[serde(default)]
    pub backend: PresenceBackend,
    /// TTL for presence keys in seconds. 0 stores them without expiry.
    #[serde(default)]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u64,
    #[serde(default = "default_prebuffer_frames")]
    pub prebuffer_frames: u32,
}

#[derive(Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret expected in the `Authorization: Bearer` header of
    /// webhook and reminder requests. Unset disables the check.
    #[serde(default)]
    pub secret: Option<String>,
    /// Outbound queue depth per device session.
    #[serde(default = "default_session_queue")]
    pub session_queue: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> String {
    "parley.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_client_id() -> String {
    "parley-server".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_connect_retry_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_min_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_connect_wait_ms() -> u64 {
    2_000
}

fn default_request_capacity() -> usize {
    64
}

fn default_audio_topic_prefix() -> String {
    "audio".to_string()
}

fn default_topic_base() -> String {
    "reminder".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_misfire_grace_secs() -> u64 {
    60
}

fn default_max_idle_secs() -> u64 {
    30
}

fn default_frame_duration_ms() -> u64 {
    60
}

fn default_prebuffer_frames() -> u32 {
    3
}

fn default_session_queue() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl DatabaseConfig {
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_size: self.pool_max_size,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            client_id: default_client_id(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive_secs(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            connect_wait_ms: default_connect_wait_ms(),
            request_capacity: default_request_capacity(),
            audio_topic_prefix: default_audio_topic_prefix(),
        }
    }
}

impl std::fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttConfig")
            .field("broker_url", &self.broker_url.as_deref().map(redact_url))
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("audio_topic_prefix", &self.audio_topic_prefix)
            .finish_non_exhaustive()
    }
}

impl MqttConfig {
    pub fn settings(&self) -> MqttSettings {
        MqttSettings {
            broker_url: self.broker_url.clone(),
            client_id: self.client_id.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            reconnect_min_delay: Duration::from_millis(self.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            connect_wait: Duration::from_millis(self.connect_wait_ms),
            request_capacity: self.request_capacity,
        }
    }
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            topic_base: default_topic_base(),
            timezone: default_timezone(),
            misfire_grace_secs: default_misfire_grace_secs(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

impl ReminderConfig {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            misfire_grace: Duration::from_secs(self.misfire_grace_secs),
            max_idle: Duration::from_secs(self.max_idle_secs.max(1)),
        }
    }

    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for an unknown IANA zone name.
    pub fn time_zone(&self) -> Result<Tz, ConfigError> {
        Tz::from_str(self.timezone.trim()).map_err(|_| {
            ConfigError::Invalid(format!("reminder.timezone: unknown zone '{}'", self.timezone))
        })
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: default_frame_duration_ms(),
            prebuffer_frames: default_prebuffer_frames(),
        }
    }
}

impl AudioConfig {
    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            frame_duration: Duration::from_millis(self.frame_duration_ms),
            prebuffer_frames: self.prebuffer_frames,
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            session_queue: default_session_queue(),
        }
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("session_queue", &self.session_queue)
            .finish()
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Rejects settings the runtime cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.frame_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "audio.frame_duration_ms must be greater than 0".into(),
            ));
        }
        if self.mqtt.reconnect_min_delay_ms > self.mqtt.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid(
                "mqtt.reconnect_min_delay_ms must not exceed mqtt.reconnect_max_delay_ms".into(),
            ));
        }
        if self.webhook.session_queue == 0 {
            return Err(ConfigError::Invalid(
                "webhook.session_queue must be greater than 0".into(),
            ));
        }
        if self.database.pool_max_size == 0 {
            return Err(ConfigError::Invalid(
                "database.pool_max_size must be greater than 0".into(),
            ));
        }
        if self.reminder.topic_base.trim().is_empty() {
            return Err(ConfigError::Invalid("reminder.topic_base must not be empty".into()));
        }
        if self.mqtt.settings().is_configured() {
            let url = self.mqtt.broker_url.as_deref().unwrap_or_default();
            BrokerAddress::parse(url).map_err(|e| ConfigError::Invalid(format!("mqtt.broker_url: {e}")))?;
        }
        self.reminder.time_zone()?;
        Ok(())
    }
}

/// File read when neither a CLI argument nor `PARLEY_CONFIG_PATH` names one.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    CliArg,
    EnvVar,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::CliArg => "cli-arg",
            ConfigSource::EnvVar => "env-var",
            ConfigSource::Default => "default",
        }
    }
}

/// Picks the config file: first CLI argument, then `PARLEY_CONFIG_PATH`,
/// then [`DEFAULT_CONFIG_PATH`]. Blank values are skipped.
pub fn resolve_config_path(
    cli_arg: Option<String>,
    env_var: Option<String>,
) -> (String, ConfigSource) {
    let non_blank = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
    if let Some(path) = non_blank(cli_arg) {
        return (path, ConfigSource::CliArg);
    }
    if let Some(path) = non_blank(env_var) {
        return (path, ConfigSource::EnvVar);
    }
    (DEFAULT_CONFIG_PATH.to_string(), ConfigSource::Default)
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides and validates the result.
///
/// Environment variable overrides:
/// - `PARLEY_HOST`, `PARLEY_PORT`
/// - `PARLEY_DB_PATH`
/// - `PARLEY_LOG_LEVEL`, `PARLEY_LOG_JSON` ("true" or "1")
/// - `PARLEY_MQTT_BROKER_URL`, `PARLEY_MQTT_USERNAME`, `PARLEY_MQTT_PASSWORD`
/// - `PARLEY_WEBHOOK_SECRET`
/// - `PARLEY_REMINDER_TIMEZONE`
/// - `PARLEY_PRESENCE_BACKEND` ("sqlite" or "memory")
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the merged configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Applies `PARLEY_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = lookup("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(db_path) = lookup("PARLEY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = lookup("PARLEY_MQTT_BROKER_URL") {
        config.mqtt.broker_url = Some(url).filter(|u| !u.trim().is_empty());
    }
    if let Some(username) = lookup("PARLEY_MQTT_USERNAME") {
        config.mqtt.username = Some(username);
    }
    if let Some(password) = lookup("PARLEY_MQTT_PASSWORD") {
        config.mqtt.password = Some(password);
    }
    if let Some(secret) = lookup("PARLEY_WEBHOOK_SECRET") {
        config.webhook.secret = Some(secret).filter(|s| !s.is_empty());
    }
    if let Some(tz) = lookup("PARLEY_REMINDER_TIMEZONE") {
        config.reminder.timezone = tz;
    }
    if let Some(backend) = lookup("PARLEY_PRESENCE_BACKEND") {
        match backend.to_ascii_lowercase().as_str() {
            "sqlite" => config.presence.backend = PresenceBackend::Sqlite,
            "memory" => config.presence.backend = PresenceBackend::Memory,
            other => tracing::warn!(value = other, "ignoring unknown PARLEY_PRESENCE_BACKEND"),
        }
    }
}
