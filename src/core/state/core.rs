// src/core/state/core.rs

//! Defines the central `GatewayState` struct, holding all shared state.

use crate::core::NexusError;
use crate::core::correlator::Correlator;
use crate::core::registry::ConnectionRegistry;
use crate::core::router::Router;
use crate::core::state::stats::ConnectionStats;
use crate::core::stream::StreamHub;
use crate::config::Config;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, reload};
use uuid::Uuid;

/// The central struct holding all shared state. Wrapped in an `Arc` and
/// passed to every task and connection handler. Each logical table inside is
/// independently lockable; there is no coarse gateway-wide lock.
pub struct GatewayState {
    /// The runtime configuration, immutable after startup.
    pub config: Config,
    /// The live connection tables, keyed by role then id.
    pub registry: Arc<ConnectionRegistry>,
    /// The pending-request table for API correlation.
    pub correlator: Arc<Correlator>,
    /// The dispatch decision logic.
    pub router: Arc<Router>,
    /// The durable stream store.
    pub streams: Arc<StreamHub>,
    /// Gateway-wide statistics for `/stats`.
    pub stats: Arc<ConnectionStats>,
    /// A short unique id for this gateway process, used for default consumer
    /// naming so redelivery attribution stays meaningful.
    pub instance_id: String,
    /// A handle to the logging filter, allowing dynamic log level changes.
    pub log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    session_counter: AtomicU64,
}

impl GatewayState {
    /// Initializes the entire gateway state from the given configuration.
    /// This is the main factory function for the shared context.
    pub fn initialize(
        config: Config,
        log_reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
    ) -> Result<Arc<Self>, NexusError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let correlator = Arc::new(Correlator::new());
        let stats = Arc::new(ConnectionStats::new());
        let maxlen = if config.durable.maxlen == 0 {
            None
        } else {
            Some(config.durable.maxlen)
        };
        let streams = Arc::new(StreamHub::new(maxlen));

        let mut router = Router::new(
            registry.clone(),
            correlator.clone(),
            stats.clone(),
            config.correlation.timeout,
        );
        if config.durable.enabled {
            info!("Durable delivery enabled; inbound events go to the stream store.");
            router = router.with_durable(streams.clone());
        }
        for rule in &config.routing.rules {
            router.set_rule(&rule.pattern, &rule.worker);
        }
        let router = Arc::new(router);

        let instance_id = Uuid::new_v4().simple().to_string()[..8].to_string();

        Ok(Arc::new(Self {
            config,
            registry,
            correlator,
            router,
            streams,
            stats,
            instance_id,
            log_reload_handle,
            session_counter: AtomicU64::new(0),
        }))
    }

    /// Allocates a process-unique session id for a new connection.
    pub fn next_session_id(&self) -> u64 {
        self.session_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The consumer name this process uses when no explicit worker identity
    /// is configured.
    pub fn consumer_name(&self) -> String {
        self.config
            .durable
            .consumer
            .clone()
            .unwrap_or_else(|| format!("nexus-{}", self.instance_id))
    }
}
