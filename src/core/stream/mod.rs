// src/core/stream/mod.rs

//! The durable delivery path: partitioned append-only logs with consumer
//! groups, plus the background consumer that drains them.

pub mod consumer;
pub mod hub;
pub mod log;

pub use consumer::{EventSink, StreamConsumer};
pub use hub::StreamHub;
pub use log::{StreamEntry, StreamId};

/// The stream every un-pinned event lands on.
pub const DEFAULT_STREAM: &str = "queue:default";

/// The stream a pinned event lands on when durable delivery is enabled.
pub fn worker_stream(worker_id: &str) -> String {
    format!("queue:worker:{worker_id}")
}
