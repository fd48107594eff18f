//! Live device sessions, keyed by device id.
//!
//! Uses `std::sync::RwLock`: every acquisition is a brief HashMap operation
//! that never spans an `.await`.

use bytes::Bytes;
use parley_types::NotificationPayload;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Work queued for a device session's task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// JSON notification pushed as a text frame.
    Notification(NotificationPayload),
    /// Pre-serialized text frame.
    Text(String),
    /// One paced utterance: `start`, `sentence_start`, frames, `stop`.
    Speech { text: Option<String>, frames: Vec<Bytes> },
    /// Closes the session; sent to a session that has been replaced.
    Close,
}

/// Snapshot of a registered session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub sender: mpsc::Sender<Outbound>,
}

type SessionMap = HashMap<String, SessionHandle>;

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a session for `device_id`, replacing any previous one.
    ///
    /// The returned guard removes the entry when dropped, unless a newer
    /// session has replaced it in the meantime.
    pub fn register(
        &self,
        device_id: impl Into<String>,
        sender: mpsc::Sender<Outbound>,
    ) -> SessionGuard {
        let device_id = device_id.into();
        let session_id = Uuid::new_v4();
        let previous = self.write().insert(
            device_id.clone(),
            SessionHandle { session_id, sender },
        );

        if let Some(previous) = previous {
            tracing::info!(
                device_id = %device_id,
                old_session = %previous.session_id,
                new_session = %session_id,
                "replaced existing device session"
            );
            if previous.sender.try_send(Outbound::Close).is_err() {
                tracing::debug!(device_id = %device_id, "replaced session already gone");
            }
        }

        SessionGuard {
            registry: self.clone(),
            device_id,
            session_id,
        }
    }

    /// Removes the entry if it still belongs to `session_id`.
    pub fn remove(&self, device_id: &str, session_id: Uuid) -> bool {
        let mut sessions = self.write();
        match sessions.get(device_id) {
            Some(current) if current.session_id == session_id => {
                sessions.remove(device_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<SessionHandle> {
        self.read().get(device_id).cloned()
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.read().contains_key(device_id)
    }

    /// Sorted snapshot of connected device ids.
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Keeps a session registered for as long as it lives.
pub struct SessionGuard {
    registry: ConnectionRegistry,
    device_id: String,
    session_id: Uuid,
}

impl SessionGuard {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.remove(&self.device_id, self.session_id) {
            tracing::debug!(
                device_id = %self.device_id,
                session_id = %self.session_id,
                "device session unregistered"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> (mpsc::Sender<Outbound>, mpsc::Receiver<Outbound>) {
        mpsc::channel(4)
    }

    #[test]
    fn guard_drop_unregisters() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = sender();
        let guard = registry.register("dev-1", tx);
        assert!(registry.contains("dev-1"));
        assert_eq!(
            registry.get("dev-1").unwrap().session_id,
            guard.session_id()
        );
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_guard_leaves_replacement_in_place() {
        let registry = ConnectionRegistry::new();
        let (old_tx, mut old_rx) = sender();
        let (new_tx, _new_rx) = sender();

        let old = registry.register("dev-1", old_tx);
        let new = registry.register("dev-1", new_tx);
        assert_ne!(registry.get("dev-1").unwrap().session_id, old.session_id());
        assert!(matches!(old_rx.try_recv(), Ok(Outbound::Close)));

        drop(old);
        assert_eq!(registry.get("dev-1").unwrap().session_id, new.session_id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn device_ids_are_sorted() {
        let registry = ConnectionRegistry::new();
        let mut guards = Vec::new();
        for id in ["c", "a", "b"] {
            let (tx, _rx) = sender();
            guards.push(registry.register(id, tx));
        }
        assert_eq!(registry.device_ids(), ["a", "b", "c"]);
    }
}
