//! Parley server library logic.

pub mod api;
pub mod api_presence;
pub mod api_reminders;
pub mod api_webhook;
pub mod api_ws;
pub mod background;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod middleware;
pub mod registry;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::{Config, ConfigError};
use dispatcher::DeliveryDispatcher;
use parley_db::DbPool;
use parley_mqtt::Publisher;
use parley_presence::{KvStore, PresenceTracker};
use parley_reminder::{ReminderScheduler, ReminderService};
use registry::ConnectionRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Maximum request body size (256 KiB).
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<Config>,
    pub presence: Arc<PresenceTracker>,
    /// Live WebSocket sessions.
    pub registry: ConnectionRegistry,
    pub mqtt: Arc<dyn Publisher>,
    pub dispatcher: Arc<DeliveryDispatcher>,
    pub reminders: Arc<ReminderService>,
}

impl AppState {
    /// Wires the delivery components together.
    ///
    /// The scheduler fires into the dispatcher directly; nothing is looked up
    /// through a global.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the reminder time zone is unknown.
    pub fn new(
        pool: DbPool,
        config: Config,
        kv: Arc<dyn KvStore>,
        mqtt: Arc<dyn Publisher>,
    ) -> Result<Self, ConfigError> {
        let time_zone = config.reminder.time_zone()?;
        let presence =
            Arc::new(PresenceTracker::new(kv).with_default_ttl(config.presence.ttl()));
        let registry = ConnectionRegistry::new();
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            presence.clone(),
            registry.clone(),
            mqtt.clone(),
            config.reminder.topic_base.clone(),
        ));
        let scheduler = Arc::new(ReminderScheduler::new(
            pool.clone(),
            dispatcher.clone(),
            config.reminder.scheduler_config(),
        ));
        let reminders = Arc::new(ReminderService::new(pool.clone(), scheduler, time_zone));

        Ok(Self {
            pool,
            config: Arc::new(config),
            presence,
            registry,
            mqtt,
            dispatcher,
            reminders,
        })
    }

    pub fn scheduler(&self) -> &Arc<ReminderScheduler> {
        self.reminders.scheduler()
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/api/devices/{device_id}/notify",
            post(api_webhook::notify_handler),
        )
        .route(
            "/api/devices/{device_id}/reminders",
            get(api_reminders::list_device_reminders_handler),
        )
        .route("/api/reminders", post(api_reminders::create_reminder_handler))
        .route(
            "/api/reminders/{id}",
            get(api_reminders::get_reminder_handler)
                .delete(api_reminders::delete_reminder_handler),
        )
        .route(
            "/api/reminders/{id}/received",
            post(api_reminders::mark_received_handler),
        )
        .route("/api/presence", get(api_presence::list_online_handler))
        .route(
            "/api/presence/{device_id}",
            get(api_presence::device_status_handler),
        )
        .layer(axum::middleware::from_fn(middleware::secret_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(api_ws::ws_handler))
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
