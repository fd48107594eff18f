//! Presence tracker over a [`KvStore`].

use crate::kv::KvStore;
use parley_types::DeviceStatus;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const STATUS_KEY_PREFIX: &str = "device:";
const STATUS_KEY_SUFFIX: &str = ":status";
const LEGACY_KEY_PREFIX: &str = "config:device:";

/// Scan pattern matching every canonical presence key.
pub const STATUS_KEY_PATTERN: &str = "device:*:status";

pub fn status_key(device_id: &str) -> String {
    format!("{STATUS_KEY_PREFIX}{device_id}{STATUS_KEY_SUFFIX}")
}

pub fn legacy_status_key(device_id: &str) -> String {
    format!("{LEGACY_KEY_PREFIX}{device_id}{STATUS_KEY_SUFFIX}")
}

fn device_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(STATUS_KEY_PREFIX)?
        .strip_suffix(STATUS_KEY_SUFFIX)
        .filter(|id| !id.is_empty())
}

/// Answers "does device X hold a live WebSocket session right now".
///
/// The store may lag reality; callers treat the answer as a routing hint.
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn KvStore>,
    default_ttl: Option<Duration>,
}

impl PresenceTracker {
    /// Creates a tracker whose keys never expire unless a TTL is passed
    /// explicitly.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            default_ttl: None,
        }
    }

    /// Applies `ttl` to every [`mark_online`](Self::mark_online) call that
    /// does not pass its own.
    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Writes the presence key. Returns whether the write reached the store.
    ///
    /// Presence is cleared explicitly on disconnect, so by default the key
    /// carries no TTL.
    pub async fn mark_online(
        &self,
        device_id: &str,
        session_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> bool {
        let status = DeviceStatus::online(
            session_id.map(str::to_string),
            Some(chrono::Utc::now().to_rfc3339()),
        );
        self.write_status(device_id, &status, ttl.or(self.default_ttl))
            .await
    }

    /// Re-writes the presence key with a fresh TTL, keeping the stored
    /// session details when present.
    pub async fn refresh(&self, device_id: &str, ttl: Option<Duration>) -> bool {
        let status = match self.canonical_status(device_id).await {
            Some(status) => status,
            None => DeviceStatus::online(None, Some(chrono::Utc::now().to_rfc3339())),
        };
        self.write_status(device_id, &status, ttl.or(self.default_ttl))
            .await
    }

    async fn write_status(&self, device_id: &str, status: &DeviceStatus, ttl: Option<Duration>) -> bool {
        let value = match serde_json::to_string(status) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(device_id, error = %e, "failed to serialize device status");
                return false;
            }
        };

        match self.store.set(&status_key(device_id), &value, ttl).await {
            Ok(()) => {
                tracing::debug!(device_id, ttl_secs = ttl.map(|t| t.as_secs()), "device marked online");
                true
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "failed to write device presence");
                false
            }
        }
    }

    /// Deletes the presence key. Failures are logged and swallowed; deleting
    /// an absent key is a no-op.
    pub async fn mark_offline(&self, device_id: &str) {
        match self.store.delete(&status_key(device_id)).await {
            Ok(existed) => {
                tracing::debug!(device_id, existed, "device marked offline");
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "failed to clear device presence");
            }
        }
    }

    /// Deletes the presence key only while it still belongs to
    /// `session_id`. Returns whether the key was removed.
    ///
    /// A newer session that re-registered the device keeps its key even if
    /// it wrote between this call's read and its delete.
    pub async fn mark_offline_if_session(&self, device_id: &str, session_id: &str) -> bool {
        let key = status_key(device_id);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return false,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "failed to read device presence");
                return false;
            }
        };
        let owner = serde_json::from_str::<DeviceStatus>(&raw)
            .ok()
            .and_then(|status| status.session_id);
        if owner.as_deref() != Some(session_id) {
            tracing::debug!(device_id, session_id, "presence owned by another session, keeping it");
            return false;
        }

        match self.store.delete_if_value(&key, &raw).await {
            Ok(removed) => {
                tracing::debug!(device_id, session_id, removed, "device marked offline");
                removed
            }
            Err(e) => {
                tracing::warn!(device_id, error = %e, "failed to clear device presence");
                false
            }
        }
    }

    /// Forces a device offline regardless of its session state.
    pub async fn evict(&self, device_id: &str) {
        tracing::warn!(device_id, "evicting device presence");
        self.mark_offline(device_id).await;
    }

    /// Checks the canonical key, then the legacy key.
    pub async fn is_online(&self, device_id: &str) -> bool {
        for key in [status_key(device_id), legacy_status_key(device_id)] {
            match self.store.get(&key).await {
                Ok(Some(_)) => return true,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(device_id, key = %key, error = %e, "presence lookup failed, assuming offline");
                    return false;
                }
            }
        }
        false
    }

    /// Returns the stored status blob, canonical key first.
    ///
    /// A legacy value that is not a JSON status blob is reported as a bare
    /// `online` status.
    pub async fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        if let Some(status) = self.canonical_status(device_id).await {
            return Some(status);
        }
        match self.store.get(&legacy_status_key(device_id)).await {
            Ok(Some(raw)) => Some(
                serde_json::from_str(&raw).unwrap_or_else(|_| DeviceStatus::online(None, None)),
            ),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "legacy presence lookup failed");
                None
            }
        }
    }

    async fn canonical_status(&self, device_id: &str) -> Option<DeviceStatus> {
        match self.store.get(&status_key(device_id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(device_id, error = %e, "unreadable device status blob");
                    Some(DeviceStatus::online(None, None))
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "presence lookup failed");
                None
            }
        }
    }

    /// Lists devices with a canonical presence key, sorted.
    ///
    /// Intended for operational visibility rather than routing decisions.
    pub async fn list_online(&self) -> Vec<String> {
        match self.store.scan(STATUS_KEY_PATTERN).await {
            Ok(keys) => keys
                .iter()
                .filter_map(|key| device_id_from_key(key))
                .map(str::to_string)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "presence scan failed");
                Vec::new()
            }
        }
    }
}
