// src/core/state/stats.rs

//! Connection statistics: aggregate counters plus per-id maps for both bot
//! and worker populations. Purely observational; never consulted by routing.

use crate::core::registry::PeerRole;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strum_macros::Display;

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DisconnectReason {
    PeerClosed,
    WriteFailed,
    HeartbeatTimeout,
    Replaced,
    ServerShutdown,
}

/// Holds all state and logic related to gateway-wide statistics.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    total_connections: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    actions_forwarded: AtomicU64,
    /// Connected duration recorded at disconnect, keyed by "role:id".
    durations: DashMap<String, Duration>,
    /// Histogram of disconnect reasons, keyed by "role:reason".
    disconnect_reasons: DashMap<String, u64>,
    /// Last inbound activity, keyed by "role:id".
    last_activity: DashMap<String, DateTime<Utc>>,
}

/// A serializable point-in-time copy of the stats, exposed on `/stats`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub actions_forwarded: u64,
    pub disconnect_reasons: HashMap<String, u64>,
    pub connected_durations_ms: HashMap<String, u64>,
    pub last_activity: HashMap<String, DateTime<Utc>>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(role: PeerRole, id: &str) -> String {
        format!("{role}:{id}")
    }

    pub fn record_connect(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_activity(&self, role: PeerRole, id: &str) {
        self.last_activity.insert(Self::key(role, id), Utc::now());
    }

    pub fn record_disconnect(
        &self,
        role: PeerRole,
        id: &str,
        reason: DisconnectReason,
        connected_for: Duration,
    ) {
        self.durations.insert(Self::key(role, id), connected_for);
        *self
            .disconnect_reasons
            .entry(format!("{role}:{reason}"))
            .or_insert(0) += 1;
        self.last_activity.remove(&Self::key(role, id));
    }

    pub fn record_dispatch(&self) {
        self.events_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_action(&self) {
        self.actions_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn disconnect_count(&self, role: PeerRole, reason: DisconnectReason) -> u64 {
        self.disconnect_reasons
            .get(&format!("{role}:{reason}"))
            .map(|v| *v)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            actions_forwarded: self.actions_forwarded.load(Ordering::Relaxed),
            disconnect_reasons: self
                .disconnect_reasons
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            connected_durations_ms: self
                .durations
                .iter()
                .map(|e| (e.key().clone(), e.value().as_millis() as u64))
                .collect(),
            last_activity: self
                .last_activity
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}
