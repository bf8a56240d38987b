//! `DuoChat` relay server.
//!
//! An axum server that persists direct messages, tracks which users are
//! online, and pushes live events over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:5000
//! cargo run --bin duochat-relay
//!
//! # Run on custom address with a shorter reconnect grace period
//! cargo run --bin duochat-relay -- --bind 127.0.0.1:8080 --grace-period-ms 2000
//!
//! # Or via environment variable
//! DUOCHAT_ADDR=127.0.0.1:8080 cargo run --bin duochat-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use duochat_relay::config::{RelayCliArgs, RelayConfig};
use duochat_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing with the resolved log level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        grace_ms = config.grace_period.as_millis(),
        preloaded_users = config.users.len(),
        "starting duochat relay server"
    );

    let state = Arc::new(RelayState::from_config(&config));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested, closing sockets");
                    state.presence.close_all().await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
