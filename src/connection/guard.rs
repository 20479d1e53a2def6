// src/connection/guard.rs

//! RAII teardown for a registered connection.

use crate::core::metrics;
use crate::core::registry::{ConnectionRegistry, PeerHandle};
use crate::core::state::stats::{ConnectionStats, DisconnectReason};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

/// Settles a connection's registry entry when its handler exits, no matter
/// which path the exit took.
///
/// Removal is keyed by session id, so a guard for a connection that was
/// replaced by a newer one with the same id does not tear the newer one down.
/// The gauge and disconnect stats are only touched when this guard is the one
/// that actually removed the entry; the replacing or evicting path already
/// accounted for it otherwise.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ConnectionStats>,
    handle: Arc<PeerHandle>,
    reason: Mutex<DisconnectReason>,
}

impl ConnectionGuard {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ConnectionStats>,
        handle: Arc<PeerHandle>,
    ) -> Self {
        Self {
            registry,
            stats,
            handle,
            reason: Mutex::new(DisconnectReason::PeerClosed),
        }
    }

    /// Records why the handler is exiting. The last reason set before drop
    /// wins.
    pub fn set_reason(&self, reason: DisconnectReason) {
        *self.reason.lock() = reason;
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let id = self.handle.id();
        let removed =
            self.registry
                .remove_if_same(self.handle.role, &id, self.handle.session_id);
        if removed.is_some() {
            let reason = *self.reason.lock();
            self.stats.record_disconnect(
                self.handle.role,
                &id,
                reason,
                self.handle.connected_for(),
            );
            metrics::CONNECTED_PEERS
                .with_label_values(&[&self.handle.role.to_string()])
                .dec();
            info!(
                role = %self.handle.role,
                id = %id,
                %reason,
                connected_for = ?self.handle.connected_for(),
                "Connection closed."
            );
        }
    }
}
