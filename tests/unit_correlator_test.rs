use axum::extract::ws::Message;
use nexus::core::correlator::Correlator;
use nexus::core::registry::{PeerHandle, PeerRole};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn waiter(session_id: u64, id: &str) -> (Arc<PeerHandle>, mpsc::Receiver<Message>) {
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

fn frame_text(msg: Message) -> String {
    match msg {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_resolve_delivers_to_waiter_exactly_once() {
    let correlator = Arc::new(Correlator::new());
    let (worker, mut rx) = waiter(1, "w1");

    correlator.open("tok1", worker);
    assert_eq!(correlator.outstanding(), 1);

    assert!(correlator.resolve("tok1", r#"{"status":"ok","echo":"tok1"}"#.to_string()));
    assert_eq!(correlator.outstanding(), 0);
    let delivered = frame_text(rx.recv().await.unwrap());
    assert!(delivered.contains("tok1"));

    // The second response for the same token finds nothing.
    assert!(!correlator.resolve("tok1", r#"{"status":"ok","echo":"tok1"}"#.to_string()));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_resolve_unknown_token_is_noop() {
    let correlator = Arc::new(Correlator::new());
    assert!(!correlator.resolve("ghost", "{}".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_delivers_synthetic_failure() {
    let correlator = Arc::new(Correlator::new());
    let (worker, mut rx) = waiter(1, "w1");

    correlator.open("tok1", worker);
    correlator.expire_after("tok1", Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(6)).await;

    let delivered = frame_text(rx.recv().await.unwrap());
    let value: serde_json::Value = serde_json::from_str(&delivered).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["retcode"], 1408);
    assert_eq!(value["echo"], "tok1");
    assert_eq!(correlator.outstanding(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_real_response_beats_timeout() {
    let correlator = Arc::new(Correlator::new());
    let (worker, mut rx) = waiter(1, "w1");

    correlator.open("tok1", worker);
    correlator.expire_after("tok1", Duration::from_secs(5));

    assert!(correlator.resolve("tok1", r#"{"status":"ok","echo":"tok1"}"#.to_string()));
    let delivered = frame_text(rx.recv().await.unwrap());
    assert!(delivered.contains(r#""status":"ok""#));

    // The timer firing later must not produce a second frame.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_duplicate_token_fails_the_old_waiter() {
    let correlator = Arc::new(Correlator::new());
    let (first, mut rx1) = waiter(1, "w1");
    let (second, mut rx2) = waiter(2, "w2");

    correlator.open("tok1", first);
    correlator.open("tok1", second);
    assert_eq!(correlator.outstanding(), 1);

    // The displaced waiter got a synthetic failure immediately.
    let displaced = frame_text(rx1.recv().await.unwrap());
    let value: serde_json::Value = serde_json::from_str(&displaced).unwrap();
    assert_eq!(value["status"], "failed");

    // The real response goes to the newer waiter.
    assert!(correlator.resolve("tok1", r#"{"status":"ok","echo":"tok1"}"#.to_string()));
    assert!(frame_text(rx2.recv().await.unwrap()).contains(r#""status":"ok""#));
}

#[tokio::test]
async fn test_resolve_records_rtt_sample() {
    let correlator = Arc::new(Correlator::new());
    let (worker, _rx) = waiter(1, "w1");

    correlator.open("tok1", worker.clone());
    correlator.resolve("tok1", "{}".to_string());
    assert_eq!(worker.rtt_samples().len(), 1);
}
