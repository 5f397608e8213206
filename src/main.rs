//! Series Scope Back binary entrypoint wiring REST, WebSocket, and storage layers.

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod dao;
mod dto;
mod error;
mod routes;
mod services;
mod state;
mod upstream;

#[cfg(feature = "couch-store")]
use dao::kv_store::couchdb::{CouchConfig, CouchKvStore};
#[cfg(not(feature = "couch-store"))]
use dao::kv_store::memory::MemoryKvStore;

use config::AppConfig;
use dao::kv_store::{KvStore, SharedKv};
use dao::messenger::{HttpMessenger, Messenger, NullMessenger};
use dao::storage::StorageError;
use dao::write_coalescer::WriteCoalescer;
use state::AppState;
use upstream::breaker::BreakerBoard;
use upstream::client::StatsClient;
use upstream::rate_limit::RateLimiter;
use upstream::resilient::{Fetcher, HttpFetcher, ResilientFetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();

    let kv = SharedKv::new();
    let writes = WriteCoalescer::spawn(kv.clone(), &config.coalescer);

    let breaker = Arc::new(BreakerBoard::new(writes.clone(), config.breaker.clone()));
    let transport: Arc<dyn Fetcher> =
        Arc::new(HttpFetcher::new().context("building upstream HTTP client")?);
    let fetcher = Arc::new(ResilientFetcher::new(transport, breaker, &config));
    let limiter = Arc::new(RateLimiter::new(&config.limiter));
    let client = Arc::new(StatsClient::new(fetcher, limiter));

    let messenger: Arc<dyn Messenger> = match &config.messenger {
        Some(messenger_config) => {
            Arc::new(HttpMessenger::new(messenger_config).context("building chat relay client")?)
        }
        None => {
            warn!("no messenger configured; live score messages stay local");
            Arc::new(NullMessenger)
        }
    };

    let app_state = AppState::new(config, kv, writes, client, messenger);

    tokio::spawn(services::storage_supervisor::run(
        app_state.clone(),
        connect_store,
    ));
    // Sessions stored before the last shutdown come back once storage is up.
    tokio::spawn(services::tracker_service::restore_on_storage_ready(
        app_state.clone(),
    ));

    let app = build_router(app_state.clone());

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    let flushed = app_state.writes().flush_now().await;
    if flushed > 0 {
        info!(flushed, "flushed pending writes on shutdown");
    }

    Ok(())
}

/// Connect the configured key-value backend for the storage supervisor.
#[cfg(feature = "couch-store")]
async fn connect_store() -> Result<Arc<dyn KvStore>, StorageError> {
    let couch_config = CouchConfig::from_env()
        .unwrap_or_else(|_| CouchConfig::new("http://localhost:5984", "series-scope"));
    let store = CouchKvStore::connect(couch_config).await?;
    Ok(Arc::new(store) as Arc<dyn KvStore>)
}

/// Hand the supervisor an in-memory store when no backend is compiled in.
#[cfg(not(feature = "couch-store"))]
async fn connect_store() -> Result<Arc<dyn KvStore>, StorageError> {
    Ok(Arc::new(MemoryKvStore::new()) as Arc<dyn KvStore>)
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: state::SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
