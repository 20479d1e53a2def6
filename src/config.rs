// src/config.rs

//! Manages gateway configuration: loading, defaults, and validation.

use crate::core::stream::{DEFAULT_STREAM, worker_stream};
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;
use tracing::warn;

/// Heartbeat and eviction settings. Bots and workers sweep on independent
/// cadences; bots additionally get server-initiated pings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HeartbeatConfig {
    /// How often the gateway pings each bot connection.
    #[serde(with = "humantime_serde", default = "default_bot_ping_interval")]
    pub bot_ping_interval: Duration,
    /// How often the bot table is swept for silent connections.
    #[serde(with = "humantime_serde", default = "default_bot_sweep_interval")]
    pub bot_sweep_interval: Duration,
    /// How often the worker table is swept for silent connections.
    #[serde(with = "humantime_serde", default = "default_worker_sweep_interval")]
    pub worker_sweep_interval: Duration,
    /// Silence ceiling after which a bot is evicted.
    #[serde(with = "humantime_serde", default = "default_heartbeat_ceiling")]
    pub bot_timeout: Duration,
    /// Silence ceiling after which a worker is evicted.
    #[serde(with = "humantime_serde", default = "default_heartbeat_ceiling")]
    pub worker_timeout: Duration,
}

fn default_bot_ping_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_bot_sweep_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_worker_sweep_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_heartbeat_ceiling() -> Duration {
    Duration::from_secs(120)
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            bot_ping_interval: default_bot_ping_interval(),
            bot_sweep_interval: default_bot_sweep_interval(),
            worker_sweep_interval: default_worker_sweep_interval(),
            bot_timeout: default_heartbeat_ceiling(),
            worker_timeout: default_heartbeat_ceiling(),
        }
    }
}

/// Request/response correlation settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CorrelationConfig {
    /// Fixed window from send time after which an unanswered API call fails.
    #[serde(with = "humantime_serde", default = "default_correlation_timeout")]
    pub timeout: Duration,
}

fn default_correlation_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            timeout: default_correlation_timeout(),
        }
    }
}

/// Durable stream delivery settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DurableConfig {
    /// When true, inbound events are appended to the stream store instead of
    /// being pushed to a live worker connection.
    #[serde(default)]
    pub enabled: bool,
    /// The consumer group name, fixed per deployment.
    #[serde(default = "default_group")]
    pub group: String,
    /// The consumer name; defaults to a per-process `nexus-<id>`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub consumer: Option<String>,
    /// Extra worker streams (`queue:worker:<id>`) this process consumes, in
    /// addition to the default stream.
    #[serde(default)]
    pub worker_streams: Vec<String>,
    /// Maximum entries retained per stream. `0` means unbounded.
    #[serde(default = "default_maxlen")]
    pub maxlen: usize,
    /// Maximum entries read per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a blocked read waits before coming back empty.
    #[serde(with = "humantime_serde", default = "default_block_timeout")]
    pub block_timeout: Duration,
    /// Pending entries idle past this are re-claimable by other group members.
    #[serde(with = "humantime_serde", default = "default_claim_min_idle")]
    pub claim_min_idle: Duration,
    /// How often a consumer sweeps for claimable entries.
    #[serde(with = "humantime_serde", default = "default_claim_interval")]
    pub claim_interval: Duration,
}

fn default_group() -> String {
    "nexus".to_string()
}
fn default_maxlen() -> usize {
    16384
}
fn default_batch_size() -> usize {
    32
}
fn default_block_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_claim_min_idle() -> Duration {
    Duration::from_secs(60)
}
fn default_claim_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: default_group(),
            consumer: None,
            worker_streams: Vec::new(),
            maxlen: default_maxlen(),
            batch_size: default_batch_size(),
            block_timeout: default_block_timeout(),
            claim_min_idle: default_claim_min_idle(),
            claim_interval: default_claim_interval(),
        }
    }
}

/// Prometheus metrics listener settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    9644
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// A pinned routing rule loaded at startup.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleEntry {
    /// Glob pattern matched against group, bot, and user identifiers.
    pub pattern: String,
    /// The worker id the matching events are pinned to.
    pub worker: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
}

/// The final, validated gateway configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Upgrades are rejected once this many connections are live.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub durable: DurableConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    6700
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_clients() -> usize {
    10000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            max_clients: default_max_clients(),
            heartbeat: HeartbeatConfig::default(),
            correlation: CorrelationConfig::default(),
            durable: DurableConfig::default(),
            metrics: MetricsConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// The full set of streams a durable consumer process must read: the
    /// default stream, the explicitly configured worker streams, and the
    /// per-worker streams that pinned routing rules publish to. Deduplicated,
    /// order preserved.
    pub fn consumer_streams(&self) -> Vec<String> {
        let mut streams = vec![DEFAULT_STREAM.to_string()];
        let pinned = self
            .durable
            .worker_streams
            .iter()
            .chain(self.routing.rules.iter().map(|rule| &rule.worker));
        for id in pinned {
            let stream = worker_stream(id);
            if !streams.contains(&stream) {
                streams.push(stream);
            }
        }
        streams
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.max_clients == 0 {
            return Err(anyhow!("max_clients cannot be 0"));
        }
        if self.correlation.timeout.is_zero() {
            return Err(anyhow!("correlation.timeout cannot be 0"));
        }
        if self.heartbeat.bot_timeout.is_zero() || self.heartbeat.worker_timeout.is_zero() {
            return Err(anyhow!("heartbeat ceilings cannot be 0"));
        }
        if self.heartbeat.bot_timeout <= self.heartbeat.bot_ping_interval {
            warn!(
                "bot_timeout ({:?}) is not larger than bot_ping_interval ({:?}); bots may be evicted between pings.",
                self.heartbeat.bot_timeout, self.heartbeat.bot_ping_interval
            );
        }
        if self.durable.enabled && self.durable.batch_size == 0 {
            return Err(anyhow!("durable.batch_size cannot be 0"));
        }
        if self.durable.enabled && self.durable.group.trim().is_empty() {
            return Err(anyhow!("durable.group cannot be empty"));
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main gateway port"
                ));
            }
        }
        Ok(())
    }
}
