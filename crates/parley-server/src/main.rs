//! Parley server binary.
//!
//! Starts the axum HTTP server, the MQTT transport and the reminder
//! scheduler, and shuts all three down on SIGTERM/SIGINT.

use parley_mqtt::{MqttClient, Publisher};
use parley_presence::{KvStore, MemoryKvStore, SqliteKvStore};
use parley_server::config::{self, PresenceBackend};
use parley_server::{app, background, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for the scheduler to finish its current pass.
const SCHEDULER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    let (config_path, config_source) = config::resolve_config_path(
        std::env::args().nth(1),
        std::env::var("PARLEY_CONFIG_PATH").ok(),
    );
    let config = config::load_config(Some(&config_path))
        .expect("failed to load configuration; the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source.as_str(),
        path = %config_path,
        "configuration loaded"
    );

    let pool = parley_db::create_pool(&config.database.path, config.database.pool_settings())
        .expect("failed to create database pool; check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied = parley_db::run_migrations(&conn).expect("failed to run database migrations");
        if !applied.is_empty() {
            tracing::info!(count = applied.len(), "applied database migrations");
        }
    }

    let kv: Arc<dyn KvStore> = match config.presence.backend {
        PresenceBackend::Sqlite => Arc::new(SqliteKvStore::new(pool.clone())),
        PresenceBackend::Memory => Arc::new(MemoryKvStore::new()),
    };
    tracing::info!(backend = ?config.presence.backend, "presence store selected");

    let mqtt = Arc::new(MqttClient::new(config.mqtt.settings()));
    mqtt.start()
        .expect("failed to start MQTT transport; check mqtt.broker_url in config");

    let addr = SocketAddr::new(config.server.host, config.server.port);
    let publisher: Arc<dyn Publisher> = mqtt.clone();
    let state = AppState::new(pool, config, kv, publisher)
        .expect("failed to initialise application state");

    let shutdown = CancellationToken::new();
    let scheduler_task = background::start_reminder_scheduler(&state, shutdown.clone());

    let app = app(state);
    tracing::info!(%addr, "starting parley server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await
        .expect("server error");

    shutdown.cancel();
    match tokio::time::timeout(SCHEDULER_STOP_TIMEOUT, scheduler_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "reminder scheduler task failed"),
        Err(_) => tracing::warn!("reminder scheduler did not stop in time"),
    }
    mqtt.shutdown().await;

    tracing::info!("parley server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
