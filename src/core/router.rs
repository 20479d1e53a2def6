// src/core/router.rs

//! The dispatch decision logic: which worker receives an inbound bot event,
//! which bot receives an outbound worker action, and which subscribers see a
//! copy of any event.
//!
//! Locking policy: selection always works on a registry snapshot taken under
//! the read lock; sends happen after release. A dead peer discovered by a
//! failed send is removed on a spawned task, never inline, so one bad
//! connection cannot head-of-line block the dispatcher.

use crate::core::NexusError;
use crate::core::correlator::Correlator;
use crate::core::metrics;
use crate::core::protocol::{self, Envelope, RETCODE_NO_TARGET};
use crate::core::registry::{ConnectionRegistry, PeerHandle, PeerRole};
use crate::core::state::stats::{ConnectionStats, DisconnectReason};
use crate::core::stream::{self, EventSink, StreamHub};
use async_trait::async_trait;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, warn};
use wildmatch::WildMatch;

/// The connection-and-routing hub's dispatcher.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    correlator: Arc<Correlator>,
    stats: Arc<ConnectionStats>,
    /// Pinned routing rules, glob pattern -> worker id. Insertion order is
    /// the match order; re-inserting a pattern updates in place (last write
    /// wins).
    rules: RwLock<IndexMap<String, String>>,
    /// Round-robin cursor. Guarded independently from the registry so cursor
    /// advancement never blocks on connection churn.
    robin: Mutex<usize>,
    /// When set, inbound events are appended here instead of being pushed to
    /// a live worker connection.
    durable: Option<Arc<StreamHub>>,
    correlation_timeout: Duration,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlator: Arc<Correlator>,
        stats: Arc<ConnectionStats>,
        correlation_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlator,
            stats,
            rules: RwLock::new(IndexMap::new()),
            robin: Mutex::new(0),
            durable: None,
            correlation_timeout,
        }
    }

    /// Switches the inbound event path to durable stream publication.
    pub fn with_durable(mut self, hub: Arc<StreamHub>) -> Self {
        self.durable = Some(hub);
        self
    }

    // --- Routing rules ---

    pub fn set_rule(&self, pattern: &str, worker_id: &str) {
        self.rules
            .write()
            .insert(pattern.to_string(), worker_id.to_string());
    }

    pub fn remove_rule(&self, pattern: &str) -> bool {
        self.rules.write().shift_remove(pattern).is_some()
    }

    pub fn rules(&self) -> Vec<(String, String)> {
        self.rules
            .read()
            .iter()
            .map(|(p, w)| (p.clone(), w.clone()))
            .collect()
    }

    /// The pinned worker for the event, if any rule matches its group, bot,
    /// or user identifier.
    fn match_rule(&self, envelope: &Envelope) -> Option<String> {
        let candidates = [
            envelope.group_id(),
            envelope.self_id(),
            envelope.user_id(),
        ];
        let rules = self.rules.read();
        for key in candidates.iter().flatten() {
            for (pattern, worker_id) in rules.iter() {
                if WildMatch::new(pattern).matches(key) {
                    return Some(worker_id.clone());
                }
            }
        }
        None
    }

    // --- Bot side ---

    /// Entry point for a frame read from a bot connection.
    pub fn handle_bot_frame(&self, envelope: Envelope) {
        if envelope.is_api_response() {
            // Unwrap is safe: is_api_response implies the token exists.
            let token = envelope.echo().unwrap_or_default();
            if !self.correlator.resolve(&token, envelope.to_frame()) {
                debug!("Dropping unmatched response for token '{}'.", token);
            }
            return;
        }
        self.route_event(&envelope);
    }

    /// Routes an inbound event: subscribers always get their filtered copy;
    /// the worker-side delivery goes durable or live depending on config.
    pub fn route_event(&self, envelope: &Envelope) {
        self.broadcast_subscribers(envelope);

        if let Some(hub) = &self.durable {
            let stream = match self.match_rule(envelope) {
                Some(worker_id) => stream::worker_stream(&worker_id),
                None => stream::DEFAULT_STREAM.to_string(),
            };
            match hub.append(&stream, Bytes::from(envelope.to_frame())) {
                Ok(id) => {
                    self.stats.record_dispatch();
                    debug!("Event appended to '{}' as {}.", stream, id);
                }
                Err(e) => {
                    self.stats.record_drop();
                    warn!("Failed to append event to '{}': {}", stream, e);
                }
            }
            return;
        }

        if let Err(e) = self.dispatch_to_worker(envelope) {
            debug!("Live dispatch failed: {}", e);
        }
    }

    /// Delivers an event to one worker: the pinned worker when a rule
    /// matches, otherwise round-robin. A failed send schedules the dead
    /// worker's removal and retries exactly once against a different worker;
    /// a second failure drops the event (redelivery is the durable path's
    /// job, not this one's).
    pub fn dispatch_to_worker(&self, envelope: &Envelope) -> Result<(), NexusError> {
        let snapshot = self.registry.snapshot(PeerRole::Worker);
        if snapshot.is_empty() {
            self.stats.record_drop();
            metrics::EVENTS_DROPPED_TOTAL.inc();
            return Err(NexusError::NoWorkerAvailable);
        }

        if let Some(pinned_id) = self.match_rule(envelope) {
            if let Some(pinned) = snapshot.iter().find(|w| w.id() == pinned_id) {
                match self.try_deliver(pinned, envelope) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        debug!("Pinned worker '{}' rejected the event: {}", pinned_id, e);
                        self.schedule_removal(pinned.clone(), DisconnectReason::WriteFailed);
                    }
                }
            }
            // Pinned worker absent or dead: fall back to the remainder.
            let rest: Vec<Arc<PeerHandle>> = snapshot
                .iter()
                .filter(|w| w.id() != pinned_id)
                .cloned()
                .collect();
            return self.robin_dispatch(&rest, envelope);
        }

        self.robin_dispatch(&snapshot, envelope)
    }

    fn robin_dispatch(
        &self,
        snapshot: &[Arc<PeerHandle>],
        envelope: &Envelope,
    ) -> Result<(), NexusError> {
        if snapshot.is_empty() {
            self.stats.record_drop();
            metrics::EVENTS_DROPPED_TOTAL.inc();
            return Err(NexusError::NoWorkerAvailable);
        }

        let cursor = {
            let mut robin = self.robin.lock();
            let current = *robin;
            *robin = robin.wrapping_add(1);
            current
        };
        let first = cursor % snapshot.len();

        match self.try_deliver(&snapshot[first], envelope) {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!(
                    "Worker '{}' rejected the event: {}",
                    snapshot[first].id(),
                    e
                );
                self.schedule_removal(snapshot[first].clone(), DisconnectReason::WriteFailed);
            }
        }

        // One retry against a different snapshot index.
        if snapshot.len() > 1 {
            let second = (first + 1) % snapshot.len();
            match self.try_deliver(&snapshot[second], envelope) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        "Retry worker '{}' rejected the event: {}",
                        snapshot[second].id(),
                        e
                    );
                    self.schedule_removal(snapshot[second].clone(), DisconnectReason::WriteFailed);
                }
            }
        }

        self.stats.record_drop();
        metrics::EVENTS_DROPPED_TOTAL.inc();
        warn!("Event dropped: no worker accepted delivery.");
        Err(NexusError::NoWorkerAvailable)
    }

    fn try_deliver(&self, worker: &Arc<PeerHandle>, envelope: &Envelope) -> Result<(), NexusError> {
        worker.send(envelope.to_frame())?;
        worker.handled.fetch_add(1, Ordering::Relaxed);
        self.stats.record_dispatch();
        metrics::EVENTS_DISPATCHED_TOTAL.inc();
        Ok(())
    }

    // --- Worker side ---

    /// Entry point for a frame read from a worker connection.
    pub fn handle_worker_frame(&self, worker: &Arc<PeerHandle>, envelope: Envelope) {
        if envelope.is_api_request() {
            self.dispatch_action(worker, &envelope);
        } else {
            debug!(
                "Ignoring non-action frame from worker '{}'.",
                worker.id()
            );
        }
    }

    /// Forwards an outbound API call to its bot. The correlator entry is
    /// opened, and its expiry scheduled, before the frame is written, so an
    /// immediate reply can never race registration.
    pub fn dispatch_action(&self, worker: &Arc<PeerHandle>, envelope: &Envelope) {
        self.broadcast_subscribers(envelope);

        let echo = envelope.echo();
        if let Some(token) = &echo {
            self.correlator.open(token, worker.clone());
            self.correlator.expire_after(token, self.correlation_timeout);
        }

        let target = envelope
            .self_id()
            .and_then(|id| self.registry.get(PeerRole::Bot, &id))
            .or_else(|| self.registry.snapshot(PeerRole::Bot).into_iter().next());

        let Some(bot) = target else {
            metrics::SYNTHETIC_FAILURES_TOTAL
                .with_label_values(&["no_bot"])
                .inc();
            self.fail_request(echo.as_deref(), "no live bot for action");
            return;
        };

        match bot.send(envelope.to_frame()) {
            Ok(()) => {
                self.stats.record_action();
                metrics::ACTIONS_FORWARDED_TOTAL.inc();
            }
            Err(e) => {
                warn!("Write to bot '{}' failed: {}", bot.id(), e);
                metrics::SYNTHETIC_FAILURES_TOTAL
                    .with_label_values(&["bot_write_failed"])
                    .inc();
                self.schedule_removal(bot, DisconnectReason::WriteFailed);
                self.fail_request(echo.as_deref(), "bot write failed");
            }
        }
    }

    /// Resolves a correlated request with a synthetic failure, or just logs
    /// when the action was fire-and-forget.
    fn fail_request(&self, echo: Option<&str>, message: &str) {
        match echo {
            Some(token) => {
                let frame =
                    protocol::failed_response(token, RETCODE_NO_TARGET, message).to_frame();
                self.correlator.resolve(token, frame);
            }
            None => warn!("Dropping fire-and-forget action: {}", message),
        }
    }

    // --- Subscriber side ---

    /// Offers the event to every subscriber that passes the ownership filter.
    /// A failed write schedules that subscriber's removal and never blocks
    /// delivery to the rest.
    pub fn broadcast_subscribers(&self, envelope: &Envelope) {
        let subscribers = self.registry.snapshot(PeerRole::Subscriber);
        if subscribers.is_empty() {
            return;
        }
        let self_id = envelope.self_id();
        let frame = envelope.to_frame();
        for subscriber in subscribers {
            if !subscriber.scope.allows(self_id.as_deref()) {
                continue;
            }
            if let Err(e) = subscriber.send(frame.clone()) {
                debug!("Subscriber '{}' write failed: {}", subscriber.id(), e);
                self.schedule_removal(subscriber, DisconnectReason::WriteFailed);
            }
        }
    }

    // --- Cleanup ---

    /// Removes a dead peer on an independent task. The inline path only
    /// schedules; it never touches the registry write lock itself.
    fn schedule_removal(&self, handle: Arc<PeerHandle>, reason: DisconnectReason) {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let id = handle.id();
            if registry
                .remove_if_same(handle.role, &id, handle.session_id)
                .is_some()
            {
                stats.record_disconnect(handle.role, &id, reason, handle.connected_for());
                metrics::CONNECTED_PEERS
                    .with_label_values(&[&handle.role.to_string()])
                    .dec();
            }
            handle.kill();
        });
    }
}

#[async_trait]
impl EventSink for Router {
    /// The durable consumer funnels entries back through the same live
    /// worker-dispatch pipeline.
    async fn deliver(&self, envelope: Envelope) -> Result<(), NexusError> {
        self.dispatch_to_worker(&envelope)
    }
}
