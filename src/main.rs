//! API Key Rotation Service - Main Application Entry Point
//!
//! A REST API server that issues API keys, rotates them automatically on a per-key cadence, and lets owners rotate, reschedule or deactivate their keys.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Storage**: one JSON document on disk, mirrored in memory
//! - **Scheduling**: one tokio timer per active key
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Load the key document
//! 3. Build the notifier (log or webhook)
//! 4. Initialize the rotation service (restore timers)
//! 5. Build HTTP router and start server on configured port

mod config;
mod error;
mod handlers;
mod middleware;
mod models;
mod notifier;
mod routes;
mod scheduler;
mod services;
mod store;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use notifier::{LogNotifier, Notifier, WebhookNotifier};
use services::rotation_service::{RotationService, RotationSettings};
use store::KeyStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = config::Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Falls back to an empty store on any read problem
    let store = KeyStore::load(config.store_path()).await;
    tracing::info!("Key store ready at {}", store.path().display());

    let notifier: Arc<dyn Notifier> = match config.rotation_webhook_url.clone() {
        Some(url) => {
            let secret = config
                .rotation_webhook_secret
                .clone()
                .context("ROTATION_WEBHOOK_SECRET is required when ROTATION_WEBHOOK_URL is set")?;
            tracing::info!("Rotation webhooks enabled");
            Arc::new(WebhookNotifier::new(url, secret)?)
        }
        None => Arc::new(LogNotifier),
    };

    let service = RotationService::new(
        store,
        notifier,
        RotationSettings {
            history_retention: config.history_retention,
        },
    );

    // Timers must be armed before the first request can touch a key
    service.init().await;

    let app = routes::build_router(service.clone());

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown();
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
