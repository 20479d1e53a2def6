// src/core/registry.rs

//! Thread-safe bookkeeping of all live connections, keyed by role then by id.
//!
//! Each role has its own table behind its own lock so that churn on one role
//! never serializes the others. Callers must never perform a send while
//! holding a table lock; the pattern is snapshot-under-lock, then iterate.

use crate::core::NexusError;
use axum::extract::ws::Message;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// The role a connection declared at upgrade time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum PeerRole {
    Bot,
    Worker,
    Subscriber,
}

/// The capacity of a peer's outbound frame queue. A peer that cannot drain
/// this many frames is treated the same as one whose write failed.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// How many round-trip samples are retained per peer.
const TIMING_WINDOW_CAPACITY: usize = 64;

/// Capabilities a worker declares on registration: skill names plus free-form
/// routing hints. Currently informational; retained for adaptive routing.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WorkerCapabilities {
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub routing_hints: Vec<String>,
}

/// A bounded ring of API round-trip samples.
#[derive(Debug, Default)]
pub struct TimingWindow {
    rtt: VecDeque<Duration>,
}

impl TimingWindow {
    pub fn record_rtt(&mut self, sample: Duration) {
        if self.rtt.len() == TIMING_WINDOW_CAPACITY {
            self.rtt.pop_front();
        }
        self.rtt.push_back(sample);
    }

    pub fn rtt_samples(&self) -> Vec<Duration> {
        self.rtt.iter().copied().collect()
    }
}

/// The visibility scope of a subscriber connection.
#[derive(Debug, Clone, Default)]
pub struct SubscriberScope {
    pub admin: bool,
    pub owned_bots: HashSet<String>,
}

impl SubscriberScope {
    /// The filter is a whitelist that fails open for untagged events: an
    /// event with no bot identity is visible to every subscriber.
    pub fn allows(&self, self_id: Option<&str>) -> bool {
        if self.admin {
            return true;
        }
        match self_id {
            None => true,
            Some(id) => self.owned_bots.contains(id),
        }
    }
}

/// One live connection of any role.
///
/// The handle owns the outbound half of the connection (an mpsc sender
/// drained by the socket's writer task); the reader task owns the inbound
/// half. Shared mutable bits sit behind their own small locks.
#[derive(Debug)]
pub struct PeerHandle {
    pub session_id: u64,
    pub role: PeerRole,
    id: RwLock<String>,
    tx: mpsc::Sender<Message>,
    pub connected_at: Instant,
    last_heartbeat: Mutex<Instant>,
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub handled: AtomicU64,
    kill_tx: broadcast::Sender<()>,
    capabilities: RwLock<Option<WorkerCapabilities>>,
    timings: Mutex<TimingWindow>,
    pub scope: SubscriberScope,
}

impl PeerHandle {
    pub fn new(session_id: u64, role: PeerRole, id: String, tx: mpsc::Sender<Message>) -> Self {
        Self::with_scope(session_id, role, id, tx, SubscriberScope::default())
    }

    pub fn with_scope(
        session_id: u64,
        role: PeerRole,
        id: String,
        tx: mpsc::Sender<Message>,
        scope: SubscriberScope,
    ) -> Self {
        let now = Instant::now();
        let (kill_tx, _) = broadcast::channel(1);
        Self {
            session_id,
            role,
            id: RwLock::new(id),
            tx,
            connected_at: now,
            last_heartbeat: Mutex::new(now),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            handled: AtomicU64::new(0),
            kill_tx,
            capabilities: RwLock::new(None),
            timings: Mutex::new(TimingWindow::default()),
            scope,
        }
    }

    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    pub(crate) fn set_id(&self, id: String) {
        *self.id.write() = id;
    }

    /// Queues a text frame for the peer's writer task. Never blocks: a closed
    /// or saturated queue is reported as a delivery failure, exactly like a
    /// failed socket write.
    pub fn send(&self, frame: String) -> Result<(), NexusError> {
        use tokio::sync::mpsc::error::TrySendError;
        match self.tx.try_send(Message::Text(frame.into())) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(NexusError::PeerGone(self.id())),
            Err(TrySendError::Full(_)) => Err(NexusError::QueueFull(self.id())),
        }
    }

    /// Queues a raw websocket message (pongs, close frames).
    pub fn send_raw(&self, msg: Message) -> Result<(), NexusError> {
        self.tx
            .try_send(msg)
            .map_err(|_| NexusError::PeerGone(self.id()))
    }

    /// Refreshes the heartbeat timestamp. Called on every inbound frame and
    /// on pong receipt.
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// How long the peer has been silent. Starts at the connect time, so a
    /// peer that never sent anything still ages toward eviction.
    pub fn idle_for(&self) -> Duration {
        self.last_heartbeat.lock().elapsed()
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Signals the connection's tasks to tear the socket down.
    pub fn kill(&self) {
        let _ = self.kill_tx.send(());
    }

    /// A receiver for the targeted kill switch, used by the socket tasks.
    pub fn kill_signal(&self) -> broadcast::Receiver<()> {
        self.kill_tx.subscribe()
    }

    pub fn set_capabilities(&self, caps: WorkerCapabilities) {
        *self.capabilities.write() = Some(caps);
    }

    pub fn capabilities(&self) -> Option<WorkerCapabilities> {
        self.capabilities.read().clone()
    }

    pub fn record_rtt(&self, sample: Duration) {
        self.timings.lock().record_rtt(sample);
    }

    pub fn rtt_samples(&self) -> Vec<Duration> {
        self.timings.lock().rtt_samples()
    }
}

/// The live sets of bot, worker, and subscriber connections.
///
/// Invariant: a connection id is unique within its role's table at any
/// instant. Rename is an atomic delete-old/insert-new under the table's
/// write lock, so in-flight `Arc<PeerHandle>` references stay valid.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    bots: RwLock<HashMap<String, Arc<PeerHandle>>>,
    workers: RwLock<HashMap<String, Arc<PeerHandle>>>,
    subscribers: RwLock<HashMap<String, Arc<PeerHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, role: PeerRole) -> &RwLock<HashMap<String, Arc<PeerHandle>>> {
        match role {
            PeerRole::Bot => &self.bots,
            PeerRole::Worker => &self.workers,
            PeerRole::Subscriber => &self.subscribers,
        }
    }

    /// Registers a connection. A duplicate id silently replaces the previous
    /// entry; the replaced handle is returned so the caller can kill it (the
    /// stale connection would otherwise fail its own health check or write).
    pub fn register(&self, handle: Arc<PeerHandle>) -> Option<Arc<PeerHandle>> {
        let id = handle.id();
        self.table(handle.role).write().insert(id, handle)
    }

    /// Atomically re-keys a connection, preserving its handle. Returns false
    /// if `old` is not present (or `new` equals `old`).
    pub fn rename(&self, role: PeerRole, old: &str, new: &str) -> bool {
        if old == new {
            return false;
        }
        let mut table = self.table(role).write();
        match table.remove(old) {
            Some(handle) => {
                handle.set_id(new.to_string());
                table.insert(new.to_string(), handle);
                true
            }
            None => false,
        }
    }

    /// Idempotent removal; a second concurrent caller observes `None`.
    pub fn remove(&self, role: PeerRole, id: &str) -> Option<Arc<PeerHandle>> {
        self.table(role).write().remove(id)
    }

    /// Removes the entry only if it is still owned by `session_id`, so a
    /// teardown racing a duplicate-id replacement never evicts the
    /// replacement connection.
    pub fn remove_if_same(
        &self,
        role: PeerRole,
        id: &str,
        session_id: u64,
    ) -> Option<Arc<PeerHandle>> {
        let mut table = self.table(role).write();
        match table.get(id) {
            Some(handle) if handle.session_id == session_id => table.remove(id),
            _ => None,
        }
    }

    pub fn get(&self, role: PeerRole, id: &str) -> Option<Arc<PeerHandle>> {
        self.table(role).read().get(id).cloned()
    }

    /// A shallow copy of the role's connections, for iteration outside the
    /// lock. Any send happens after the lock is released.
    pub fn snapshot(&self, role: PeerRole) -> Vec<Arc<PeerHandle>> {
        self.table(role).read().values().cloned().collect()
    }

    pub fn len(&self, role: PeerRole) -> usize {
        self.table(role).read().len()
    }

    pub fn is_empty(&self, role: PeerRole) -> bool {
        self.len(role) == 0
    }

    pub fn total(&self) -> usize {
        self.len(PeerRole::Bot) + self.len(PeerRole::Worker) + self.len(PeerRole::Subscriber)
    }
}
