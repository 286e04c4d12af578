use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::cli::ServeArgs;

/// Validated runtime configuration for the broker server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub token_secret: String,
    pub handshake_timeout: Duration,
    pub first_session_id: u64,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid listen address {value:?}: {source}")]
    InvalidListenAddr {
        value: String,
        #[source]
        source: AddrParseError,
    },
    #[error("a token secret is required (--token-secret or BEACH_PARTY_TOKEN_SECRET)")]
    MissingTokenSecret,
    #[error("handshake timeout must be at least one second")]
    ZeroHandshakeTimeout,
    #[error("session ids must start above zero")]
    ZeroFirstSessionId,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = ConfigError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr = args
            .listen_addr
            .parse()
            .map_err(|source| ConfigError::InvalidListenAddr {
                value: args.listen_addr.clone(),
                source,
            })?;
        let token_secret = args
            .token_secret
            .filter(|secret| !secret.trim().is_empty())
            .ok_or(ConfigError::MissingTokenSecret)?;
        if args.handshake_timeout_secs == 0 {
            return Err(ConfigError::ZeroHandshakeTimeout);
        }
        if args.first_session_id == 0 {
            return Err(ConfigError::ZeroFirstSessionId);
        }

        Ok(ServerConfig {
            listen_addr,
            token_secret,
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            first_session_id: args.first_session_id,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
