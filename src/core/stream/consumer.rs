// src/core/stream/consumer.rs

//! The durable-path consumer: a background task competing for entries within
//! a consumer group, processing them through the same pipeline the live path
//! uses, and acknowledging them.
//!
//! Entries are acknowledged after the processing *attempt*, success or not.
//! A handler error loses the error signal, never the message it had already
//! received; redelivery only covers the crash-before-ack window, so handlers
//! must be idempotent.

use crate::core::NexusError;
use crate::core::protocol::Envelope;
use crate::core::stream::hub::StreamHub;
use crate::core::stream::log::{StreamEntry, StreamId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// The processing side of the consumer. The live worker-dispatch pipeline
/// implements this, so both ingestion paths share one handler.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, envelope: Envelope) -> Result<(), NexusError>;
}

/// One member of a consumer group, bound to a single stream.
pub struct StreamConsumer {
    hub: Arc<StreamHub>,
    stream: String,
    group: String,
    consumer: String,
    sink: Arc<dyn EventSink>,
    batch_size: usize,
    block_timeout: Duration,
    claim_min_idle: Duration,
    claim_interval: Duration,
}

impl StreamConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<StreamHub>,
        stream: String,
        group: String,
        consumer: String,
        sink: Arc<dyn EventSink>,
        batch_size: usize,
        block_timeout: Duration,
        claim_min_idle: Duration,
        claim_interval: Duration,
    ) -> Self {
        Self {
            hub,
            stream,
            group,
            consumer,
            sink,
            batch_size,
            block_timeout,
            claim_min_idle,
            claim_interval,
        }
    }

    /// The main consumer loop. Alternates between blocked batched reads of
    /// new entries and a periodic sweep reclaiming entries left pending by
    /// crashed group members.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Err(e) = self.hub.ensure_group(&self.stream, &self.group) {
            warn!(
                "Consumer '{}' could not join group '{}' on '{}': {}",
                self.consumer, self.group, self.stream, e
            );
            return;
        }
        info!(
            "Stream consumer '{}' joined group '{}' on '{}'.",
            self.consumer, self.group, self.stream
        );

        let mut claim_tick = tokio::time::interval(self.claim_interval);
        claim_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup does not race
        // a healthy peer's in-flight batch.
        claim_tick.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Stream consumer '{}' shutting down.", self.consumer);
                    return;
                }

                _ = claim_tick.tick() => {
                    match self.hub.claim_idle(
                        &self.stream,
                        &self.group,
                        &self.consumer,
                        self.claim_min_idle,
                        self.batch_size,
                    ) {
                        Ok(reclaimed) if !reclaimed.is_empty() => {
                            info!(
                                "Consumer '{}' reclaimed {} idle entries on '{}'.",
                                self.consumer, reclaimed.len(), self.stream
                            );
                            self.process_batch(reclaimed).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Idle-claim sweep on '{}' failed: {}", self.stream, e),
                    }
                }

                read = self.hub.read_group_blocking(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.batch_size,
                    self.block_timeout,
                ) => {
                    match read {
                        Ok(batch) if !batch.is_empty() => self.process_batch(batch).await,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Read on stream '{}' failed: {}", self.stream, e);
                            tokio::time::sleep(self.block_timeout).await;
                        }
                    }
                }
            }
        }
    }

    /// Processes a batch of entries and acknowledges every one of them,
    /// whether or not the handler succeeded.
    async fn process_batch(&self, batch: Vec<StreamEntry>) {
        let ids: Vec<StreamId> = batch.iter().map(|e| e.id).collect();
        for entry in batch {
            self.process_entry(&entry).await;
        }
        match self.hub.ack(&self.stream, &self.group, &ids) {
            Ok(acked) => debug!(
                "Consumer '{}' acknowledged {}/{} entries on '{}'.",
                self.consumer, acked, ids.len(), self.stream
            ),
            Err(e) => warn!("Ack on stream '{}' failed: {}", self.stream, e),
        }
    }

    async fn process_entry(&self, entry: &StreamEntry) {
        let Some(payload) = entry.payload() else {
            warn!(
                "Entry {} on '{}' has no payload field; skipping.",
                entry.id, self.stream
            );
            return;
        };
        let envelope = match std::str::from_utf8(payload)
            .map_err(|e| NexusError::InvalidFrame(e.to_string()))
            .and_then(Envelope::parse)
        {
            Ok(env) => env,
            Err(e) => {
                warn!("Entry {} on '{}' is not a valid envelope: {}", entry.id, self.stream, e);
                return;
            }
        };
        if let Err(e) = self.sink.deliver(envelope).await {
            warn!(
                "Handler failed for entry {} on '{}': {}. Acknowledging anyway.",
                entry.id, self.stream, e
            );
        }
    }
}
