use axum::extract::ws::Message;
use nexus::core::registry::{ConnectionRegistry, PeerHandle, PeerRole};
use nexus::core::state::{ConnectionStats, DisconnectReason};
use nexus::core::tasks::health::HealthMonitor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::advance;

const CEILING: Duration = Duration::from_secs(120);

fn setup() -> (HealthMonitor, Arc<ConnectionRegistry>, Arc<ConnectionStats>) {
    let registry = Arc::new(ConnectionRegistry::new());
    let stats = Arc::new(ConnectionStats::new());
    let monitor = HealthMonitor::new(
        registry.clone(),
        stats.clone(),
        PeerRole::Worker,
        Duration::from_secs(30),
        CEILING,
    );
    (monitor, registry, stats)
}

fn worker(session_id: u64, id: &str) -> (Arc<PeerHandle>, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(8);
    (
        Arc::new(PeerHandle::new(
            session_id,
            PeerRole::Worker,
            id.to_string(),
            tx,
        )),
        rx,
    )
}

#[tokio::test(start_paused = true)]
async fn test_eviction_is_never_early() {
    let (monitor, registry, _stats) = setup();
    let (w, _rx) = worker(1, "w1");
    registry.register(w);

    // Exactly at the ceiling is still alive; only strictly past it evicts.
    advance(CEILING).await;
    assert_eq!(monitor.sweep_once(), 0);
    assert_eq!(registry.len(PeerRole::Worker), 1);

    advance(Duration::from_secs(1)).await;
    assert_eq!(monitor.sweep_once(), 1);
    assert!(registry.is_empty(PeerRole::Worker));
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_resets_the_clock() {
    let (monitor, registry, _stats) = setup();
    let (w, _rx) = worker(1, "w1");
    registry.register(w.clone());

    advance(Duration::from_secs(100)).await;
    w.touch_heartbeat();
    advance(Duration::from_secs(100)).await;

    // 100 seconds of silence since the last heartbeat, well under the ceiling.
    assert_eq!(monitor.sweep_once(), 0);
    assert_eq!(registry.len(PeerRole::Worker), 1);
}

#[tokio::test(start_paused = true)]
async fn test_silent_from_connect_still_ages_out() {
    let (monitor, registry, _stats) = setup();
    let (w, _rx) = worker(1, "w1");
    registry.register(w);

    // The peer never sent a single frame; the connect time starts the clock.
    advance(CEILING + Duration::from_secs(1)).await;
    assert_eq!(monitor.sweep_once(), 1);
    assert!(registry.is_empty(PeerRole::Worker));
}

#[tokio::test(start_paused = true)]
async fn test_eviction_records_reason_and_signals_kill() {
    let (monitor, registry, stats) = setup();
    let (w, _rx) = worker(1, "w1");
    registry.register(w.clone());
    let mut kill = w.kill_signal();

    advance(CEILING + Duration::from_secs(1)).await;
    assert_eq!(monitor.sweep_once(), 1);
    assert_eq!(
        stats.disconnect_count(PeerRole::Worker, DisconnectReason::HeartbeatTimeout),
        1
    );
    assert!(kill.try_recv().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_sweep_only_touches_its_own_role() {
    let (monitor, registry, _stats) = setup();
    let (w, _rx1) = worker(1, "w1");
    let (tx, _rx2) = mpsc::channel(8);
    let bot = Arc::new(PeerHandle::new(2, PeerRole::Bot, "100".to_string(), tx));
    registry.register(w);
    registry.register(bot);

    advance(CEILING + Duration::from_secs(1)).await;
    // The worker monitor evicts the worker but leaves the stale bot to the
    // bot-side sweep.
    assert_eq!(monitor.sweep_once(), 1);
    assert!(registry.is_empty(PeerRole::Worker));
    assert_eq!(registry.len(PeerRole::Bot), 1);
}
