//! Beach Party: a real-time session broker connecting one admin console, one
//! projector and any number of mobile devices, with at most one application
//! driving each session.

pub mod app;
pub mod apps;
pub mod auth;
pub mod broker;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod protocol;
pub mod registry;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::AppRegistry;
use crate::auth::JwtTokenVerifier;
use crate::broker::Broker;
use crate::config::ServerConfig;

/// Shared state handed to every HTTP and websocket handler.
pub struct AppState {
    pub broker: Broker,
    pub handshake_timeout: Duration,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(config: &ServerConfig, apps: AppRegistry, metrics: PrometheusHandle) -> Self {
        let verifier = JwtTokenVerifier::new(config.token_secret.as_bytes());
        Self {
            broker: Broker::new(apps, Arc::new(verifier), config.first_session_id),
            handshake_timeout: config.handshake_timeout,
            metrics,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sessions/:id", get(handlers::session_status))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the broker on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(
        listen_addr = %addr,
        apps = ?state.broker.apps().names(),
        "beach-party listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")
}
