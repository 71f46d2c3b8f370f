//! `TaskSync` relay: the shared remote document server.
//!
//! Keeps one opaque document per account in memory and serves it over REST
//! (polling clients) and a WebSocket subscription (push clients). The relay
//! never merges; it stamps each write with a version and the writing
//! device.
//!
//! ```bash
//! tasksync-relay                         # listen on 0.0.0.0:8080
//! tasksync-relay --listen 127.0.0.1:9000
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tasksync_relay::config::{RelayCliArgs, RelayConfig};
use tasksync_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = RelayCliArgs::parse();
    let config = match RelayConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tasksync-relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let state = Arc::new(RelayState::with_config(
        config.max_payload_size,
        config.tokens,
    ));
    let addr = config.bind_addr.to_string();
    match relay::start_server_with_state(&addr, state).await {
        Ok((bound, server)) => {
            tracing::info!(
                addr = %bound,
                max_payload_size = config.max_payload_size,
                "relay listening"
            );
            if let Err(e) = server.await {
                tracing::error!(error = %e, "relay server task failed");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to start relay server");
            ExitCode::FAILURE
        }
    }
}
