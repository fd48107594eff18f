use crate::error::MqttError;
use percent_encoding::percent_decode_str;
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 1883;

const REDACTED: &str = "REDACTED";

/// Broker keep-alive floor accepted by the transport.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Resolved MQTT client settings.
#[derive(Clone)]
pub struct MqttSettings {
    /// `mqtt://[user:pass@]host[:port]`. `None` disables the transport.
    pub broker_url: Option<String>,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Fixed wait between attempts until the first connection succeeds.
    pub connect_retry_delay: Duration,
    /// Backoff bounds for reconnects after a connection was established.
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// How long a publish waits for the connection before giving up.
    pub connect_wait: Duration,
    /// Capacity of the client's outbound request queue.
    pub request_capacity: usize,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_url: None,
            client_id: "parley-server".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            connect_retry_delay: Duration::from_secs(5),
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            connect_wait: Duration::from_secs(2),
            request_capacity: 64,
        }
    }
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("broker_url", &self.broker_url.as_deref().map(redact_url))
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("keep_alive", &self.keep_alive)
            .field("connect_retry_delay", &self.connect_retry_delay)
            .field("reconnect_min_delay", &self.reconnect_min_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .field("connect_wait", &self.connect_wait)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

impl MqttSettings {
    pub fn is_configured(&self) -> bool {
        self.broker_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }

    pub(crate) fn effective_keep_alive(&self) -> Duration {
        self.keep_alive.max(MIN_KEEP_ALIVE)
    }
}

/// Host, port and credentials extracted from a broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerAddress {
    /// Parses `mqtt://` or `tcp://` URLs. Credentials embedded in the URL
    /// win over separately configured ones.
    ///
    /// # Errors
    ///
    /// Returns [`MqttError::InvalidUrl`] for unparseable URLs, unsupported
    /// schemes, or a missing host.
    pub fn parse(raw: &str) -> Result<Self, MqttError> {
        let url = Url::parse(raw.trim())
            .map_err(|e| MqttError::InvalidUrl(format!("{}: {e}", redact_url(raw))))?;

        match url.scheme() {
            "mqtt" | "tcp" => {}
            other => {
                return Err(MqttError::InvalidUrl(format!(
                    "unsupported scheme '{other}' (expected mqtt:// or tcp://)"
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| MqttError::InvalidUrl(format!("{}: missing host", redact_url(raw))))?
            .to_string();

        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(decode_userinfo)
            .transpose()?;
        let password = url.password().map(decode_userinfo).transpose()?;

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            username,
            password,
        })
    }
}

/// `url` keeps userinfo percent-encoded; the broker expects the raw bytes.
fn decode_userinfo(encoded: &str) -> Result<String, MqttError> {
    percent_decode_str(encoded)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| MqttError::InvalidUrl("credentials are not valid UTF-8".to_string()))
}

/// Renders a broker URL with any password masked, for logs and `Debug`.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            if url.password().is_some() && url.set_password(Some(REDACTED)).is_err() {
                return "[unprintable broker URL]".to_string();
            }
            url.to_string()
        }
        // Cannot tell credentials apart from the rest.
        Err(_) => "[unparseable broker URL]".to_string(),
    }
}
