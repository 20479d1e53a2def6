// src/connection/handler.rs

//! Drives one upgraded websocket from registration to teardown.
//!
//! The socket is split in two: a writer task drains the peer's outbound queue
//! (see `writer`), while this function runs the read loop inline. All frame
//! interpretation beyond gateway control frames is delegated to the router.

use crate::connection::guard::ConnectionGuard;
use crate::connection::writer;
use crate::core::metrics;
use crate::core::protocol::Envelope;
use crate::core::registry::{
    OUTBOUND_QUEUE_CAPACITY, PeerHandle, PeerRole, SubscriberScope, WorkerCapabilities,
};
use crate::core::state::GatewayState;
use crate::core::state::stats::DisconnectReason;
use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Runs a connection to completion. Returns once the peer is gone and its
/// registry entry (if still ours) has been settled.
pub async fn serve_peer(
    state: Arc<GatewayState>,
    socket: WebSocket,
    role: PeerRole,
    id: String,
    scope: SubscriberScope,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (sink, mut ws_rx) = socket.split();
    let (tx, outbound) = mpsc::channel::<Message>(OUTBOUND_QUEUE_CAPACITY);
    let handle = Arc::new(PeerHandle::with_scope(
        state.next_session_id(),
        role,
        id,
        tx,
        scope,
    ));

    // Registration replaces any existing connection with the same id. The
    // replaced peer's own guard will find its entry gone, so the accounting
    // for it happens here.
    if let Some(old) = state.registry.register(handle.clone()) {
        warn!(role = %role, id = %handle.id(), "Duplicate id; replacing the previous connection.");
        state.stats.record_disconnect(
            role,
            &old.id(),
            DisconnectReason::Replaced,
            old.connected_for(),
        );
        metrics::CONNECTED_PEERS
            .with_label_values(&[&role.to_string()])
            .dec();
        old.kill();
    }
    state.stats.record_connect();
    metrics::CONNECTED_PEERS
        .with_label_values(&[&role.to_string()])
        .inc();
    metrics::CONNECTIONS_RECEIVED_TOTAL
        .with_label_values(&[&role.to_string()])
        .inc();
    info!(role = %role, id = %handle.id(), session = handle.session_id, "Peer connected.");

    let guard = ConnectionGuard::new(state.registry.clone(), state.stats.clone(), handle.clone());

    let writer_task = tokio::spawn(writer::run_writer(
        handle.clone(),
        sink,
        outbound,
        state.config.heartbeat.bot_ping_interval,
    ));

    let mut kill = handle.kill_signal();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                guard.set_reason(DisconnectReason::ServerShutdown);
                break;
            }
            _ = kill.recv() => {
                // Eviction or replacement already settled the registry entry.
                break;
            }
            maybe = ws_rx.next() => {
                match maybe {
                    Some(Ok(Message::Text(text))) => {
                        handle.touch_heartbeat();
                        handle.received.fetch_add(1, Ordering::Relaxed);
                        state.stats.record_activity(role, &handle.id());
                        handle_text(&state, &handle, text.as_str());
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        handle.touch_heartbeat();
                        let _ = handle.send_raw(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        handle.touch_heartbeat();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary frames are not part of the protocol.
                        debug!(id = %handle.id(), "Ignoring non-text frame.");
                    }
                    Some(Err(e)) => {
                        debug!(id = %handle.id(), "Socket read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    handle.kill();
    drop(guard);
    let _ = writer_task.await;
}

fn handle_text(state: &Arc<GatewayState>, handle: &Arc<PeerHandle>, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(id = %handle.id(), "Dropping malformed frame: {e}");
            return;
        }
    };
    match handle.role {
        PeerRole::Bot => handle_bot_text(state, handle, envelope),
        PeerRole::Worker => handle_worker_text(state, handle, envelope),
        PeerRole::Subscriber => {
            // Subscribers are a one-way audience; inbound frames only serve
            // as liveness signals.
            debug!(id = %handle.id(), "Ignoring inbound frame from subscriber.");
        }
    }
}

fn handle_bot_text(state: &Arc<GatewayState>, handle: &Arc<PeerHandle>, envelope: Envelope) {
    // A bot that announced a provisional id (or reconnected under a new
    // account) is re-keyed the moment a frame carries its real identity.
    if let Some(self_id) = envelope.self_id() {
        let current = handle.id();
        if self_id != current && state.registry.rename(PeerRole::Bot, &current, &self_id) {
            info!(old = %current, new = %self_id, "Bot identified; registry key updated.");
        }
    }
    state.router.handle_bot_frame(envelope);
}

fn handle_worker_text(state: &Arc<GatewayState>, handle: &Arc<PeerHandle>, envelope: Envelope) {
    match envelope.meta() {
        Some("register") => {
            let caps = envelope
                .get("capabilities")
                .and_then(|v| serde_json::from_value::<WorkerCapabilities>(v.clone()).ok())
                .unwrap_or_default();
            debug!(id = %handle.id(), skills = ?caps.skills, "Worker registered capabilities.");
            handle.set_capabilities(caps);
        }
        Some("heartbeat") => {
            // Liveness was already refreshed by the read loop.
        }
        Some(other) => {
            debug!(id = %handle.id(), meta = %other, "Ignoring unknown control frame.");
        }
        None => state.router.handle_worker_frame(handle, envelope),
    }
}
