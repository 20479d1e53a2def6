// src/server/connection_loop.rs

//! Contains the main serve loop and graceful shutdown handling.

use super::context::ServerContext;
use super::ws;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Serves websocket upgrades until a signal or a failed background task
/// stops the gateway, then drains connections and tasks.
pub async fn run(ctx: ServerContext) {
    let ServerContext {
        state,
        listener,
        shutdown_tx,
        mut background_tasks,
    } = ctx;

    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    let app = ws::router(state, shutdown_tx.clone());
    let mut drain_rx = shutdown_tx.subscribe();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        drain_rx.recv().await.ok();
    })
    .into_future();
    tokio::pin!(server);
    let mut server_done = false;

    loop {
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                info!("SIGINT received, initiating graceful shutdown.");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, initiating graceful shutdown.");
                break;
            }

            Some(res) = background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => warn!("A background task finished unexpectedly without an error."),
                    Ok(Err(e)) => { error!("CRITICAL: Background task failed: {}. Shutting down.", e); break; }
                    Err(e) => { error!("CRITICAL: Background task panicked: {e:?}. Shutting down."); break; }
                }
            },

            res = &mut server => {
                server_done = true;
                match res {
                    Ok(()) => info!("Listener closed."),
                    Err(e) => error!("Server error: {}", e),
                }
                break;
            },
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    if shutdown_tx.send(()).is_err() {
        error!("Failed to send shutdown signal. Some tasks may not terminate gracefully.");
    }

    if !server_done {
        match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
            Ok(Ok(())) => info!("All connections closed."),
            Ok(Err(e)) => error!("Server error during drain: {}", e),
            Err(_) => warn!("Timed out waiting for connections to drain."),
        }
    }

    info!("Waiting for background tasks to finish...");
    if tokio::time::timeout(Duration::from_secs(10), async {
        while background_tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("Timed out waiting for background tasks to finish cleanly.");
    };
    info!("Gateway shutdown complete.");
}
