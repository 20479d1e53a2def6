// src/core/correlator.rs

//! Maps outstanding correlation tokens ("echo") to their waiting callers.
//!
//! A token is removed exactly once, either by a matching response or by
//! timeout expiry. Whichever side loses the race finds the table entry gone
//! and becomes a no-op; `DashMap::remove` is the arbiter.

use crate::core::metrics;
use crate::core::protocol::{self, RETCODE_TIMEOUT};
use crate::core::registry::PeerHandle;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A registered request waiting for its response.
#[derive(Debug)]
struct PendingRequest {
    waiter: Arc<PeerHandle>,
    sent_at: Instant,
}

/// The pending-request table.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: DashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request. Must be called before the request is
    /// written to its target, to close the race between an immediate reply
    /// and registration.
    ///
    /// A duplicate token replaces the old entry; the displaced waiter gets a
    /// synthetic failure so it is never left hanging.
    pub fn open(&self, token: &str, waiter: Arc<PeerHandle>) {
        let previous = self.pending.insert(
            token.to_string(),
            PendingRequest {
                waiter,
                sent_at: Instant::now(),
            },
        );
        if let Some(old) = previous {
            warn!(
                "Correlation token '{}' re-used while still outstanding; failing the old waiter.",
                token
            );
            let frame =
                protocol::failed_response(token, RETCODE_TIMEOUT, "superseded by a newer request")
                    .to_frame();
            let _ = old.waiter.send(frame);
        }
    }

    /// Looks up and removes the waiter, delivers the response frame, and
    /// returns whether a waiter existed. `false` means a late, duplicate, or
    /// unknown token; the frame is silently dropped.
    pub fn resolve(&self, token: &str, frame: String) -> bool {
        let Some((_, pending)) = self.pending.remove(token) else {
            return false;
        };
        pending.waiter.record_rtt(pending.sent_at.elapsed());
        metrics::BOT_API_RTT_SECONDS.observe(pending.sent_at.elapsed().as_secs_f64());
        if let Err(e) = pending.waiter.send(frame) {
            // The caller vanished between the request and its response.
            debug!("Dropping response for token '{}': {}", token, e);
        }
        true
    }

    /// Schedules a timeout for the token. If the real response has already
    /// resolved it when the timer fires, the expiry is a no-op.
    pub fn expire_after(self: &Arc<Self>, token: &str, timeout: Duration) {
        let correlator = self.clone();
        let token = token.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let frame =
                protocol::failed_response(&token, RETCODE_TIMEOUT, "bot response timed out")
                    .to_frame();
            if correlator.resolve(&token, frame) {
                metrics::CORRELATION_TIMEOUTS_TOTAL.inc();
                debug!("Correlation token '{}' expired after {:?}.", token, timeout);
            }
        });
    }

    /// The number of currently outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
