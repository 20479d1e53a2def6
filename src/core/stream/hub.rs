// src/core/stream/hub.rs

//! The named-stream store and its consumer-group operations.
//!
//! Streams are logical partitions (`queue:default`, `queue:worker:<id>`).
//! Within a consumer group each entry is delivered to exactly one member;
//! unacknowledged entries from a dead member become re-claimable by the rest
//! of the group. Blocked readers register a waker *before* re-checking the
//! log, which closes the lost-wakeup race between an append and the wait.

use crate::core::NexusError;
use crate::core::metrics;
use crate::core::stream::log::{
    Consumer, ConsumerGroup, PendingEntryInfo, StreamEntry, StreamId, StreamLog, now_ms,
};
use bytes::Bytes;
use dashmap::DashMap;
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};
use tracing::{debug, info};

/// A stored queue value. Older deployments used a flat payload list; it is
/// detected by introspection on first touch and migrated to the stream
/// layout before any group is created.
#[derive(Debug)]
pub enum QueueValue {
    Legacy(VecDeque<Bytes>),
    Stream(StreamLog),
}

/// The shared store of all named streams plus the wakers of blocked readers.
#[derive(Debug, Default)]
pub struct StreamHub {
    streams: DashMap<String, QueueValue>,
    waiters: DashMap<String, VecDeque<oneshot::Sender<()>>>,
    maxlen: Option<usize>,
}

impl StreamHub {
    pub fn new(maxlen: Option<usize>) -> Self {
        Self {
            streams: DashMap::new(),
            waiters: DashMap::new(),
            maxlen,
        }
    }

    /// Seeds a stream with legacy-layout payloads. Test/recovery hook for the
    /// migration path.
    pub fn seed_legacy(&self, stream: &str, payloads: Vec<Bytes>) {
        self.streams
            .insert(stream.to_string(), QueueValue::Legacy(payloads.into()));
    }

    /// Appends a payload to the stream, creating it if absent, and wakes any
    /// blocked readers. Returns the generated entry id.
    pub fn append(&self, stream: &str, payload: Bytes) -> Result<StreamId, NexusError> {
        let id = {
            let mut value = self
                .streams
                .entry(stream.to_string())
                .or_insert_with(|| QueueValue::Stream(StreamLog::new(self.maxlen)));
            migrate_if_legacy(value.value_mut(), self.maxlen);
            let QueueValue::Stream(log) = value.value_mut() else {
                return Err(NexusError::WrongType);
            };
            let mut fields = IndexMap::new();
            fields.insert(Bytes::from_static(b"payload"), payload);
            log.add_entry(fields)
        };
        metrics::STREAM_ENTRIES_APPENDED_TOTAL.inc();
        self.notify(stream);
        Ok(id)
    }

    /// Creates the stream (if needed) and the consumer group (if needed). The
    /// group's cursor starts at 0-0 so entries already in the log, including
    /// migrated legacy payloads, are delivered to the group.
    pub fn ensure_group(&self, stream: &str, group: &str) -> Result<(), NexusError> {
        let mut value = self
            .streams
            .entry(stream.to_string())
            .or_insert_with(|| QueueValue::Stream(StreamLog::new(self.maxlen)));
        migrate_if_legacy(value.value_mut(), self.maxlen);
        let QueueValue::Stream(log) = value.value_mut() else {
            return Err(NexusError::WrongType);
        };
        let group_key = Bytes::copy_from_slice(group.as_bytes());
        if !log.groups.contains_key(&group_key) {
            info!("Creating consumer group '{}' on stream '{}'.", group, stream);
            log.groups.insert(
                group_key.clone(),
                ConsumerGroup::new(group_key, StreamId::default()),
            );
        }
        Ok(())
    }

    /// Reads up to `count` entries not yet delivered to the group (`>`
    /// semantics), assigns them to `consumer`, and records them in the
    /// pending entry list.
    pub fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, NexusError> {
        let mut value = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| NexusError::StreamNotFound(stream.to_string()))?;
        let QueueValue::Stream(log) = value.value_mut() else {
            return Err(NexusError::WrongType);
        };
        let group_state = log
            .groups
            .get(group.as_bytes())
            .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))?;

        let entries = log.entries_after(group_state.last_delivered_id, count);
        if entries.is_empty() {
            return Ok(entries);
        }

        let now = now_ms();
        let consumer_key = Bytes::copy_from_slice(consumer.as_bytes());
        let group_state = log
            .groups
            .get_mut(group.as_bytes())
            .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))?;
        let consumer_state = group_state
            .consumers
            .entry(consumer_key.clone())
            .or_insert_with(|| Consumer {
                name: consumer_key.clone(),
                ..Default::default()
            });
        consumer_state.seen_time_ms = now;

        for entry in &entries {
            consumer_state.pending_ids.insert(entry.id);
            group_state.pending_entries.insert(
                entry.id,
                PendingEntryInfo {
                    consumer_name: consumer_key.clone(),
                    delivery_count: 1,
                    delivery_time_ms: now,
                },
            );
            group_state.last_delivered_id = entry.id;
        }
        Ok(entries)
    }

    /// Blocking batched read: returns as soon as entries are available, or an
    /// empty batch once `wait` has elapsed.
    pub async fn read_group_blocking(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        wait: Duration,
    ) -> Result<Vec<StreamEntry>, NexusError> {
        let deadline = Instant::now() + wait;
        loop {
            let entries = self.read_group(stream, group, consumer, count)?;
            if !entries.is_empty() {
                return Ok(entries);
            }

            let (tx, rx) = oneshot::channel();
            self.waiters
                .entry(stream.to_string())
                .or_default()
                .push_back(tx);

            // Re-check after registering: an append between the first read and
            // the registration must not be missed.
            let entries = self.read_group(stream, group, consumer, count)?;
            if !entries.is_empty() {
                drop(rx);
                self.prune_waiters(stream);
                return Ok(entries);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                drop(rx);
                self.prune_waiters(stream);
                return Ok(Vec::new());
            }
            if timeout(remaining, rx).await.is_err() {
                debug!(
                    "Blocked read on '{}' for group '{}' timed out after {:?}.",
                    stream, group, wait
                );
                // The receiver was dropped by the timeout; the sender must not
                // stay registered, or an idle stream polled on a cadence grows
                // its waiter queue without bound.
                self.prune_waiters(stream);
                return Ok(Vec::new());
            }
        }
    }

    /// Acknowledges entries, removing them from the group's pending list.
    /// Returns how many ids were actually pending. An acknowledged id is
    /// never redelivered to the group.
    pub fn ack(&self, stream: &str, group: &str, ids: &[StreamId]) -> Result<usize, NexusError> {
        let mut value = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| NexusError::StreamNotFound(stream.to_string()))?;
        let QueueValue::Stream(log) = value.value_mut() else {
            return Err(NexusError::WrongType);
        };
        let group_state = log
            .groups
            .get_mut(group.as_bytes())
            .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))?;

        let mut acked = 0;
        for id in ids {
            if let Some(pel_info) = group_state.pending_entries.remove(id) {
                acked += 1;
                if let Some(consumer) = group_state.consumers.get_mut(&pel_info.consumer_name) {
                    consumer.pending_ids.remove(id);
                }
            }
        }
        if acked > 0 {
            metrics::STREAM_ENTRIES_ACKED_TOTAL.inc_by(acked as f64);
        }
        Ok(acked)
    }

    /// Re-claims entries that have been pending longer than `min_idle` and
    /// reassigns them to `new_consumer`, bumping their delivery count. Pending
    /// references whose entries were trimmed out of the log are dropped.
    /// This is the crash-redelivery path: any surviving group member may call
    /// it and take over a dead member's backlog.
    pub fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, NexusError> {
        let mut value = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| NexusError::StreamNotFound(stream.to_string()))?;
        let QueueValue::Stream(log) = value.value_mut() else {
            return Err(NexusError::WrongType);
        };

        let now = now_ms();
        let min_idle_ms = min_idle.as_millis() as u64;
        let consumer_key = Bytes::copy_from_slice(new_consumer.as_bytes());

        // Collect candidates with their current owner, then split them by
        // whether the underlying entry still exists in the log.
        let candidates: Vec<(StreamId, Bytes)> = {
            let group_state = log
                .groups
                .get(group.as_bytes())
                .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))?;
            group_state
                .pending_entries
                .iter()
                .filter(|(_, info)| now.saturating_sub(info.delivery_time_ms) >= min_idle_ms)
                .map(|(id, info)| (*id, info.consumer_name.clone()))
                .take(count)
                .collect()
        };
        let (claimed, dropped): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|(id, _)| log.entries.contains_key(id));

        {
            let group_state = log
                .groups
                .get_mut(group.as_bytes())
                .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))?;
            for (id, owner) in &dropped {
                group_state.pending_entries.remove(id);
                if let Some(consumer) = group_state.consumers.get_mut(owner) {
                    consumer.pending_ids.remove(id);
                }
            }
            for (id, owner) in &claimed {
                if let Some(consumer) = group_state.consumers.get_mut(owner) {
                    consumer.pending_ids.remove(id);
                }
                if let Some(info) = group_state.pending_entries.get_mut(id) {
                    info.consumer_name = consumer_key.clone();
                    info.delivery_count += 1;
                    info.delivery_time_ms = now;
                }
            }
            let consumer_state = group_state
                .consumers
                .entry(consumer_key.clone())
                .or_insert_with(|| Consumer {
                    name: consumer_key.clone(),
                    ..Default::default()
                });
            consumer_state.seen_time_ms = now;
            for (id, _) in &claimed {
                consumer_state.pending_ids.insert(*id);
            }
        }

        let entries: Vec<StreamEntry> = claimed
            .iter()
            .filter_map(|(id, _)| log.entries.get(id).cloned())
            .collect();
        if !entries.is_empty() {
            metrics::STREAM_ENTRIES_CLAIMED_TOTAL.inc_by(entries.len() as f64);
        }
        Ok(entries)
    }

    /// The number of entries currently pending (delivered, unacknowledged)
    /// for the group.
    pub fn pending_count(&self, stream: &str, group: &str) -> Result<usize, NexusError> {
        let value = self
            .streams
            .get(stream)
            .ok_or_else(|| NexusError::StreamNotFound(stream.to_string()))?;
        let QueueValue::Stream(log) = value.value() else {
            return Err(NexusError::WrongType);
        };
        log.groups
            .get(group.as_bytes())
            .map(|g| g.pending_entries.len())
            .ok_or_else(|| NexusError::ConsumerGroupNotFound(group.to_string()))
    }

    /// The current length of the stream's log.
    pub fn len(&self, stream: &str) -> usize {
        match self.streams.get(stream) {
            Some(value) => match value.value() {
                QueueValue::Stream(log) => log.len() as usize,
                QueueValue::Legacy(items) => items.len(),
            },
            None => 0,
        }
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// The number of blocked readers currently registered on the stream.
    pub fn blocked_readers(&self, stream: &str) -> usize {
        self.waiters.get(stream).map_or(0, |w| w.len())
    }

    /// Drops waiters whose receiving side is gone. A blocked read that
    /// returns without being notified must call this, otherwise its sender
    /// stays queued forever.
    fn prune_waiters(&self, stream: &str) {
        if let Some(mut waiters) = self.waiters.get_mut(stream) {
            waiters.retain(|waker| !waker.is_closed());
        }
    }

    fn notify(&self, stream: &str) {
        if let Some(mut waiters) = self.waiters.get_mut(stream) {
            while let Some(waker) = waiters.pop_front() {
                let _ = waker.send(());
            }
        }
    }
}

/// Converts a legacy payload queue into the stream layout, preserving order.
fn migrate_if_legacy(value: &mut QueueValue, maxlen: Option<usize>) {
    if let QueueValue::Legacy(items) = value {
        info!("Migrating legacy queue with {} entries to stream layout.", items.len());
        let mut log = StreamLog::new(maxlen);
        for payload in items.drain(..) {
            let mut fields = IndexMap::new();
            fields.insert(Bytes::from_static(b"payload"), payload);
            log.add_entry(fields);
        }
        *value = QueueValue::Stream(log);
    }
}
