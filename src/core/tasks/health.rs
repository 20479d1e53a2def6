// src/core/tasks/health.rs

//! The health monitor: periodic sweeps that evict connections silent past
//! their role's heartbeat ceiling.
//!
//! Bots and workers run on independent cadences because bots use a longer
//! heartbeat period. The sweep holds the role table's write lock only for
//! the collect-and-remove step, with O(1) work per connection; the kills and
//! stats updates happen after release.

use crate::core::metrics;
use crate::core::registry::{ConnectionRegistry, PeerHandle, PeerRole};
use crate::core::state::stats::{ConnectionStats, DisconnectReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A periodic eviction sweep for one role.
pub struct HealthMonitor {
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ConnectionStats>,
    role: PeerRole,
    sweep_interval: Duration,
    ceiling: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ConnectionStats>,
        role: PeerRole,
        sweep_interval: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            registry,
            stats,
            role,
            sweep_interval,
            ceiling,
        }
    }

    /// Runs the sweep loop until shutdown.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Health monitor for {}s started (sweep every {:?}, ceiling {:?}).",
            self.role, self.sweep_interval, self.ceiling
        );
        let mut interval = tokio::time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick; a sweep right at startup can
        // never evict anything anyway.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.sweep_once();
                    if evicted > 0 {
                        warn!("Evicted {} silent {} connection(s).", evicted, self.role);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Health monitor for {}s shutting down.", self.role);
                    return;
                }
            }
        }
    }

    /// Performs one sweep and returns how many connections were evicted.
    /// A connection is evicted only when its silence strictly exceeds the
    /// ceiling; eviction is never early.
    pub fn sweep_once(&self) -> usize {
        let expired: Vec<Arc<PeerHandle>> = self
            .registry
            .snapshot(self.role)
            .into_iter()
            .filter(|handle| handle.idle_for() > self.ceiling)
            .collect();

        let mut evicted = 0;
        for handle in expired {
            let id = handle.id();
            // Re-check ownership under the write lock: the entry may have
            // been replaced or removed since the snapshot.
            if self
                .registry
                .remove_if_same(self.role, &id, handle.session_id)
                .is_none()
            {
                continue;
            }
            evicted += 1;
            handle.kill();
            self.stats.record_disconnect(
                self.role,
                &id,
                DisconnectReason::HeartbeatTimeout,
                handle.connected_for(),
            );
            metrics::HEARTBEAT_EVICTIONS_TOTAL
                .with_label_values(&[&self.role.to_string()])
                .inc();
            metrics::CONNECTED_PEERS
                .with_label_values(&[&self.role.to_string()])
                .dec();
            warn!(
                "{} '{}' evicted for heartbeat timeout after {:?} connected.",
                self.role,
                id,
                handle.connected_for()
            );
        }
        evicted
    }
}
