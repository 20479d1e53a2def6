use bytes::Bytes;
use nexus::core::NexusError;
use nexus::core::stream::{StreamHub, StreamId};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const STREAM: &str = "queue:default";
const GROUP: &str = "nexus";

#[tokio::test]
async fn test_stream_id_parse_and_display() {
    let id = StreamId::from_str("123-4").unwrap();
    assert_eq!(id, StreamId::new(123, 4));
    assert_eq!(id.to_string(), "123-4");

    assert_eq!(StreamId::from_str("123").unwrap(), StreamId::new(123, 0));
    assert_eq!(StreamId::from_str("0").unwrap(), StreamId::default());
    assert!(StreamId::from_str("1-2-3").is_err());
    assert!(StreamId::from_str("abc").is_err());
}

#[tokio::test]
async fn test_append_generates_monotonic_ids() {
    let hub = StreamHub::new(None);
    let first = hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    let second = hub.append(STREAM, Bytes::from_static(b"b")).unwrap();
    assert!(second > first);
    assert_eq!(hub.len(STREAM), 2);
}

#[tokio::test]
async fn test_read_group_delivers_each_entry_to_one_member() {
    let hub = StreamHub::new(None);
    hub.ensure_group(STREAM, GROUP).unwrap();
    hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    hub.append(STREAM, Bytes::from_static(b"b")).unwrap();

    let batch_one = hub.read_group(STREAM, GROUP, "c1", 1).unwrap();
    let batch_two = hub.read_group(STREAM, GROUP, "c2", 10).unwrap();
    assert_eq!(batch_one.len(), 1);
    assert_eq!(batch_two.len(), 1);
    assert_ne!(batch_one[0].id, batch_two[0].id);

    // Everything is delivered; another read finds nothing new.
    assert!(hub.read_group(STREAM, GROUP, "c1", 10).unwrap().is_empty());
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 2);
}

#[tokio::test]
async fn test_ack_clears_pending() {
    let hub = StreamHub::new(None);
    hub.ensure_group(STREAM, GROUP).unwrap();
    let id = hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    hub.read_group(STREAM, GROUP, "c1", 10).unwrap();

    assert_eq!(hub.ack(STREAM, GROUP, &[id]).unwrap(), 1);
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 0);
    // Acking again counts nothing.
    assert_eq!(hub.ack(STREAM, GROUP, &[id]).unwrap(), 0);
}

#[tokio::test]
async fn test_group_sees_entries_appended_before_creation() {
    let hub = StreamHub::new(None);
    hub.append(STREAM, Bytes::from_static(b"early")).unwrap();
    hub.ensure_group(STREAM, GROUP).unwrap();

    let batch = hub.read_group(STREAM, GROUP, "c1", 10).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload().unwrap().as_ref(), b"early");
}

#[tokio::test]
async fn test_claim_idle_reassigns_a_dead_members_backlog() {
    let hub = StreamHub::new(None);
    hub.ensure_group(STREAM, GROUP).unwrap();
    hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    hub.read_group(STREAM, GROUP, "dead", 10).unwrap();

    // Not idle long enough yet.
    let claimed = hub
        .claim_idle(STREAM, GROUP, "live", Duration::from_secs(60), 10)
        .unwrap();
    assert!(claimed.is_empty());

    // With a zero threshold the entry is immediately claimable.
    let claimed = hub
        .claim_idle(STREAM, GROUP, "live", Duration::ZERO, 10)
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload().unwrap().as_ref(), b"a");
    // Still pending, now owned by the survivor.
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 1);

    assert_eq!(hub.ack(STREAM, GROUP, &[claimed[0].id]).unwrap(), 1);
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 0);
}

#[tokio::test]
async fn test_claim_drops_references_to_trimmed_entries() {
    let hub = StreamHub::new(Some(1));
    hub.ensure_group(STREAM, GROUP).unwrap();
    hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    hub.read_group(STREAM, GROUP, "c1", 10).unwrap();

    // The second append trims the first entry out of the log while its
    // pending reference still exists.
    hub.append(STREAM, Bytes::from_static(b"b")).unwrap();
    assert_eq!(hub.len(STREAM), 1);
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 1);

    let claimed = hub
        .claim_idle(STREAM, GROUP, "c2", Duration::ZERO, 10)
        .unwrap();
    assert!(claimed.is_empty());
    assert_eq!(hub.pending_count(STREAM, GROUP).unwrap(), 0);
}

#[tokio::test]
async fn test_legacy_queue_is_migrated_in_order() {
    let hub = StreamHub::new(None);
    hub.seed_legacy(
        STREAM,
        vec![
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
            Bytes::from_static(b"three"),
        ],
    );
    assert_eq!(hub.len(STREAM), 3);

    // Creating a group triggers the migration; existing payloads are
    // delivered oldest first.
    hub.ensure_group(STREAM, GROUP).unwrap();
    let batch = hub.read_group(STREAM, GROUP, "c1", 10).unwrap();
    let payloads: Vec<&[u8]> = batch.iter().map(|e| e.payload().unwrap().as_ref()).collect();
    assert_eq!(payloads, vec![b"one".as_ref(), b"two".as_ref(), b"three".as_ref()]);
}

#[tokio::test]
async fn test_append_also_migrates_legacy() {
    let hub = StreamHub::new(None);
    hub.seed_legacy(STREAM, vec![Bytes::from_static(b"old")]);
    hub.append(STREAM, Bytes::from_static(b"new")).unwrap();
    assert_eq!(hub.len(STREAM), 2);
}

#[tokio::test]
async fn test_missing_stream_and_group_errors() {
    let hub = StreamHub::new(None);
    let err = hub.read_group("nope", GROUP, "c1", 1).unwrap_err();
    assert!(matches!(err, NexusError::StreamNotFound(_)));

    hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    let err = hub.read_group(STREAM, "nope", "c1", 1).unwrap_err();
    assert!(matches!(err, NexusError::ConsumerGroupNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn test_blocking_read_wakes_on_append() {
    let hub = Arc::new(StreamHub::new(None));
    hub.ensure_group(STREAM, GROUP).unwrap();

    let reader_hub = hub.clone();
    let reader = tokio::spawn(async move {
        reader_hub
            .read_group_blocking(STREAM, GROUP, "c1", 10, Duration::from_secs(30))
            .await
            .unwrap()
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    hub.append(STREAM, Bytes::from_static(b"wake")).unwrap();

    let batch = reader.await.unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].payload().unwrap().as_ref(), b"wake");
}

#[tokio::test(start_paused = true)]
async fn test_blocking_read_times_out_empty() {
    let hub = StreamHub::new(None);
    hub.ensure_group(STREAM, GROUP).unwrap();
    let batch = hub
        .read_group_blocking(STREAM, GROUP, "c1", 10, Duration::from_secs(2))
        .await
        .unwrap();
    assert!(batch.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_blocking_reads_leave_no_waiters() {
    let hub = StreamHub::new(None);
    hub.ensure_group(STREAM, GROUP).unwrap();

    // An idle stream polled on a cadence must not accumulate dead wakers.
    for _ in 0..5 {
        let batch = hub
            .read_group_blocking(STREAM, GROUP, "c1", 10, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(batch.is_empty());
    }
    assert_eq!(hub.blocked_readers(STREAM), 0);

    // A notified read consumes its waker too.
    hub.append(STREAM, Bytes::from_static(b"a")).unwrap();
    hub.read_group_blocking(STREAM, GROUP, "c1", 10, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(hub.blocked_readers(STREAM), 0);
}
