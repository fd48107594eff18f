#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parley_mqtt::{Publisher, QoS};
use parley_presence::MemoryKvStore;
use parley_server::config::Config;
use parley_server::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-process stand-in for the MQTT transport.
#[derive(Default)]
pub struct FakePublisher {
    available: AtomicBool,
    reject: AtomicBool,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakePublisher {
    pub fn available() -> Arc<Self> {
        let publisher = Self::default();
        publisher.available.store(true, Ordering::SeqCst);
        Arc::new(publisher)
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Available, but every publish fails.
    pub fn rejecting() -> Arc<Self> {
        let publisher = Self::available();
        publisher.reject.store(true, Ordering::SeqCst);
        publisher
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    fn record(&self, topic: &str, payload: Vec<u8>) -> bool {
        if !self.available.load(Ordering::SeqCst) || self.reject.load(Ordering::SeqCst) {
            return false;
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        true
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn publish_json(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        _qos: QoS,
        _retain: bool,
    ) -> bool {
        self.record(topic, serde_json::to_vec(payload).unwrap())
    }

    async fn publish_bytes(&self, topic: &str, payload: Bytes, _qos: QoS, _retain: bool) -> bool {
        self.record(topic, payload.to_vec())
    }
}

pub struct TestApp {
    pub state: AppState,
    pub publisher: Arc<FakePublisher>,
    _dir: tempfile::TempDir,
}

pub fn test_app(config: Config, publisher: Arc<FakePublisher>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("parley.db");
    let pool = parley_db::create_pool(
        path.to_str().unwrap(),
        parley_db::PoolSettings::default(),
    )
    .unwrap();
    parley_db::run_migrations(&pool.get().unwrap()).unwrap();

    let state = AppState::new(
        pool,
        config,
        Arc::new(MemoryKvStore::new()),
        publisher.clone(),
    )
    .unwrap();

    TestApp {
        state,
        publisher,
        _dir: dir,
    }
}
