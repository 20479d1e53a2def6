// src/connection/writer.rs

//! The writer half of a connection: drains the peer's outbound queue into the
//! websocket sink, and for bot connections originates the server-side pings.

use crate::core::registry::{PeerHandle, PeerRole};
use axum::extract::ws::{Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Runs until the outbound queue is closed, the socket rejects a write, or
/// the peer's kill switch fires. The reader task observes the closed queue
/// (or the kill switch) and unwinds the registry entry.
pub async fn run_writer(
    handle: Arc<PeerHandle>,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
    ping_interval: Duration,
) {
    let mut kill = handle.kill_signal();
    // Pings are a bot-side concern; workers and subscribers are expected to
    // send their own traffic or heartbeats.
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = kill.recv() => break,
            maybe = outbound.recv() => {
                let Some(msg) = maybe else { break };
                if sink.send(msg).await.is_err() {
                    debug!(id = %handle.id(), "Socket write failed; stopping writer.");
                    break;
                }
            }
            _ = ping.tick(), if handle.role == PeerRole::Bot => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}
