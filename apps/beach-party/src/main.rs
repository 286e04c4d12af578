use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use beach_party::{
    apps,
    cli::{self, Cli, Commands},
    config::ServerConfig,
    telemetry::Telemetry,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Token {
            user,
            secret,
            ttl_secs,
        }) => cli::print_token(&user, &secret, ttl_secs),
        Some(Commands::Console { url, token, launch }) => {
            let _telemetry = Telemetry::init()?;
            cli::run_console_client(url, token, launch).await
        }
        None => {
            let telemetry = Telemetry::init()?;
            let config = ServerConfig::try_from(cli.serve)?;
            run(config, telemetry).await
        }
    }
}

async fn run(config: ServerConfig, telemetry: Telemetry) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        first_session_id = config.first_session_id,
        handshake_timeout_secs = config.handshake_timeout.as_secs(),
        "starting beach-party"
    );

    let state = Arc::new(AppState::new(
        &config,
        apps::default_registry(),
        telemetry.metrics_handle(),
    ));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    beach_party::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
