// src/server/spawner.rs

//! Spawns all of the gateway's long-running background tasks.

use super::context::ServerContext;
use super::metrics_server;
use crate::core::registry::PeerRole;
use crate::core::stream::StreamConsumer;
use crate::core::tasks::health::HealthMonitor;
use anyhow::Result;
use tracing::info;

/// Spawns all background tasks into the provided JoinSet.
pub fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;
    let config = &state.config;

    // --- Metrics Server ---
    if config.metrics.enabled {
        let metrics_state = state.clone();
        let shutdown_rx_metrics = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(metrics_state, shutdown_rx_metrics).await;
            Ok(())
        });
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    // --- Health Sweeps ---
    let bot_monitor = HealthMonitor::new(
        state.registry.clone(),
        state.stats.clone(),
        PeerRole::Bot,
        config.heartbeat.bot_sweep_interval,
        config.heartbeat.bot_timeout,
    );
    let shutdown_rx_bots = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        bot_monitor.run(shutdown_rx_bots).await;
        Ok(())
    });

    let worker_monitor = HealthMonitor::new(
        state.registry.clone(),
        state.stats.clone(),
        PeerRole::Worker,
        config.heartbeat.worker_sweep_interval,
        config.heartbeat.worker_timeout,
    );
    let shutdown_rx_workers = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        worker_monitor.run(shutdown_rx_workers).await;
        Ok(())
    });

    // --- Durable Consumers ---
    if config.durable.enabled {
        // Pinned routing rules publish to per-worker streams, so every worker
        // named by a rule needs a consumer too.
        for stream in config.consumer_streams() {
            let consumer = StreamConsumer::new(
                state.streams.clone(),
                stream.clone(),
                config.durable.group.clone(),
                state.consumer_name(),
                state.router.clone(),
                config.durable.batch_size,
                config.durable.block_timeout,
                config.durable.claim_min_idle,
                config.durable.claim_interval,
            );
            let shutdown_rx_consumer = shutdown_tx.subscribe();
            background_tasks.spawn(async move {
                consumer.run(shutdown_rx_consumer).await;
                Ok(())
            });
            info!(stream = %stream, "Durable consumer spawned.");
        }
    }

    info!("All background tasks have been spawned.");
    Ok(())
}
