use axum::extract::ws::Message;
use nexus::core::metrics::{CONNECTED_PEERS, gather_metrics, refresh_connection_gauges};
use nexus::core::registry::{ConnectionRegistry, PeerHandle, PeerRole};
use std::sync::Arc;
use tokio::sync::mpsc;

fn peer(session_id: u64, role: PeerRole, id: &str) -> (Arc<PeerHandle>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(8);
    (
        Arc::new(PeerHandle::new(session_id, role, id.to_string(), tx)),
        rx,
    )
}

#[tokio::test]
async fn test_refresh_sets_gauges_from_the_registry() {
    let registry = ConnectionRegistry::new();
    let (bot, _bot_rx) = peer(1, PeerRole::Bot, "100");
    let (w1, _w1_rx) = peer(2, PeerRole::Worker, "w1");
    let (w2, _w2_rx) = peer(3, PeerRole::Worker, "w2");
    registry.register(bot);
    registry.register(w1);
    registry.register(w2);

    // A gauge gone stale after churn must be overwritten, not adjusted.
    CONNECTED_PEERS.with_label_values(&["worker"]).set(99.0);

    refresh_connection_gauges(&registry);
    assert_eq!(CONNECTED_PEERS.with_label_values(&["bot"]).get(), 1.0);
    assert_eq!(CONNECTED_PEERS.with_label_values(&["worker"]).get(), 2.0);
    assert_eq!(CONNECTED_PEERS.with_label_values(&["subscriber"]).get(), 0.0);

    let body = gather_metrics();
    assert!(body.contains(r#"nexus_connected_peers{role="worker"} 2"#));
}
