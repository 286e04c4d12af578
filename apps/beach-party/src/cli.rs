use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::auth::{JwtTokenVerifier, PrincipalId};
use crate::protocol::{Envelope, SOURCE_DEVICE};

#[derive(Parser, Debug)]
#[command(name = "beach-party", version)]
#[command(about = "Beach Party session broker and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

/// Server options; used when no subcommand is given.
#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_PARTY_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Shared HS256 secret used to verify console access tokens.
    #[arg(long, env = "BEACH_PARTY_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Seconds a fresh socket has to complete its handshake.
    #[arg(long, env = "BEACH_PARTY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// First session id handed out.
    #[arg(long, env = "BEACH_PARTY_FIRST_SESSION_ID", default_value_t = 1001)]
    pub first_session_id: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PARTY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a signed console access token
    Token {
        /// Principal the token is issued for
        #[arg(short, long)]
        user: String,

        /// Shared HS256 secret
        #[arg(long, env = "BEACH_PARTY_TOKEN_SECRET", hide_env_values = true)]
        secret: String,

        /// Expiry in seconds; tokens never expire when omitted
        #[arg(long)]
        ttl_secs: Option<i64>,
    },

    /// Connect as an admin console and print every event received
    Console {
        /// Broker websocket URL
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
        url: String,

        /// Console access token
        #[arg(short, long)]
        token: String,

        /// Application to launch once the session is granted
        #[arg(long)]
        launch: Option<String>,
    },
}

pub fn print_token(user: &str, secret: &str, ttl_secs: Option<i64>) -> Result<()> {
    let mut verifier = JwtTokenVerifier::new(secret.as_bytes());
    if let Some(ttl) = ttl_secs {
        verifier = verifier.with_ttl(chrono::Duration::seconds(ttl));
    }
    let token = verifier
        .issue(&PrincipalId::new(user))
        .context("failed to sign token")?;
    println!("{token}");
    Ok(())
}

pub async fn run_console_client(url: String, token: String, launch: Option<String>) -> Result<()> {
    debug!(url = %url, "connecting console");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", url, e);
            return Err(anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow!("Connection timeout - is the broker running?"));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let handshake = Envelope::new(
        SOURCE_DEVICE,
        "handshake",
        Some(json!({ "deviceType": "admin_console", "accessToken": token })),
    );
    write
        .send(Message::Text(serde_json::to_string(&handshake)?.into()))
        .await?;

    let mut launch = launch;
    loop {
        let frame = tokio::select! {
            frame = read.next() => frame,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; closing console");
                let _ = write.close().await;
                return Ok(());
            }
        };
        let Some(frame) = frame else {
            break;
        };
        match frame? {
            Message::Text(text) => {
                println!("{}", text.as_str());
                let Ok(envelope) = serde_json::from_str::<Envelope>(text.as_str()) else {
                    continue;
                };
                match envelope.event.as_str() {
                    "access_granted" => {
                        if let Some(name) = launch.take() {
                            let request = Envelope::new(
                                SOURCE_DEVICE,
                                "app_launched",
                                Some(json!({ "name": name })),
                            );
                            write
                                .send(Message::Text(serde_json::to_string(&request)?.into()))
                                .await?;
                        }
                    }
                    "access_denied" => {
                        return Err(anyhow!(
                            "access denied: {}",
                            envelope.payload.unwrap_or_default()
                        ));
                    }
                    _ => {}
                }
            }
            Message::Close(frame) => {
                debug!(?frame, "broker closed the connection");
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
