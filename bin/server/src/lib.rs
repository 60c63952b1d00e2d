//! botwright server.
//!
//! Wires the runtime to its production collaborators (NATS for state and
//! transport, the bot store's HTTP API for definitions) and exposes the
//! management API.

pub mod api;
pub mod config;
pub mod error;
pub mod source;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::error::StartupError;
use crate::source::HttpDefinitionSource;
use botwright_runtime::{NatsStateStore, NatsTransport, Supervisor};
use std::sync::Arc;

/// Runs the server until Ctrl-C, then stops every bot.
///
/// # Errors
///
/// Returns an error if a collaborator cannot be reached at startup, the
/// listen address cannot be bound, or the HTTP server fails.
pub async fn run(config: ServerConfig) -> botwright_core::Result<(), StartupError> {
    let client = config.nats.connect().await.map_err(StartupError::Nats)?;
    tracing::info!(url = %config.nats.url, "connected to NATS");

    let store = NatsStateStore::new(client.clone(), &config.nats)
        .await
        .map_err(StartupError::StateStore)?;
    let transport = NatsTransport::new(client, config.nats.clone());
    let source = HttpDefinitionSource::new(config.definition_source_url.clone())?;

    let supervisor = Supervisor::new(
        Arc::new(source),
        Arc::new(store),
        Arc::new(transport),
        config.runtime,
    );

    // Recovery runs beside the listener so the API is reachable while bots
    // reconnect.
    let recovering = Arc::clone(&supervisor);
    tokio::spawn(async move {
        match recovering.recover().await {
            Ok(report) => {
                for (bot_id, error) in &report.failed {
                    tracing::warn!(%bot_id, error = %error, "bot not recovered");
                }
            }
            Err(error) => tracing::error!(error = %error, "could not list active bots"),
        }
    });

    let app = api::router(AppState {
        supervisor: Arc::clone(&supervisor),
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: config.listen_addr.clone(),
            details: e.to_string(),
        })?;
    tracing::info!("listening on http://{}", config.listen_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.shutdown().await;
    served.map_err(|e| StartupError::Serve {
        details: e.to_string(),
    })?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
