// src/server/initialization.rs

//! Handles server initialization, from state setup to binding the listener.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::state::GatewayState;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};

/// Initializes all gateway components before starting the main loop.
pub async fn setup(
    config: Config,
    log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let state = GatewayState::initialize(config, log_reload_handle)?;
    info!(instance = %state.instance_id, "Gateway state initialized.");

    let listener = TcpListener::bind((state.config.host.as_str(), state.config.port)).await?;
    info!(
        "Nexus gateway listening on {}:{}",
        state.config.host, state.config.port
    );

    Ok(ServerContext {
        state,
        listener,
        shutdown_tx,
        background_tasks: JoinSet::new(),
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Connection limit: {} clients. Correlation timeout: {:?}.",
        config.max_clients, config.correlation.timeout
    );
    if config.durable.enabled {
        info!(
            "Durable delivery: group '{}', batch {}, claim after {:?}.",
            config.durable.group, config.durable.batch_size, config.durable.claim_min_idle
        );
    } else {
        info!("Durable delivery disabled; events are dispatched to live workers.");
    }
}
