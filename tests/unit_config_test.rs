use nexus::config::Config;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn load(contents: &str) -> anyhow::Result<Config> {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    Config::from_file(file.path().to_str().unwrap())
}

#[test]
fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 6700);
    assert_eq!(config.max_clients, 10000);
    assert_eq!(config.heartbeat.bot_ping_interval, Duration::from_secs(30));
    assert_eq!(config.heartbeat.bot_sweep_interval, Duration::from_secs(60));
    assert_eq!(config.heartbeat.worker_sweep_interval, Duration::from_secs(30));
    assert_eq!(config.heartbeat.bot_timeout, Duration::from_secs(120));
    assert_eq!(config.heartbeat.worker_timeout, Duration::from_secs(120));
    assert_eq!(config.correlation.timeout, Duration::from_secs(30));
    assert!(!config.durable.enabled);
    assert_eq!(config.durable.group, "nexus");
    assert_eq!(config.durable.maxlen, 16384);
    assert!(!config.metrics.enabled);
    assert!(config.routing.rules.is_empty());
    config.validate().unwrap();
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = load("").unwrap();
    assert_eq!(config.port, 6700);
}

#[test]
fn test_full_file_parses() {
    let config = load(
        r#"
host = "0.0.0.0"
port = 8080
log_level = "debug"
max_clients = 500

[heartbeat]
bot_ping_interval = "15s"
bot_timeout = "2m"

[correlation]
timeout = "10s"

[durable]
enabled = true
group = "gateway"
batch_size = 16
block_timeout = "1s"
claim_min_idle = "30s"
worker_streams = ["w1", "w2"]

[metrics]
enabled = true
port = 9700

[[routing.rules]]
pattern = "grp-*"
worker = "w1"

[[routing.rules]]
pattern = "300"
worker = "w2"
"#,
    )
    .unwrap();

    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 8080);
    assert_eq!(config.heartbeat.bot_ping_interval, Duration::from_secs(15));
    assert_eq!(config.heartbeat.bot_timeout, Duration::from_secs(120));
    // Unspecified heartbeat fields keep their defaults.
    assert_eq!(config.heartbeat.worker_timeout, Duration::from_secs(120));
    assert_eq!(config.correlation.timeout, Duration::from_secs(10));
    assert!(config.durable.enabled);
    assert_eq!(config.durable.group, "gateway");
    assert_eq!(config.durable.worker_streams, vec!["w1", "w2"]);
    assert_eq!(config.metrics.port, 9700);
    assert_eq!(config.routing.rules.len(), 2);
    assert_eq!(config.routing.rules[0].pattern, "grp-*");
}

#[test]
fn test_consumer_streams_cover_pinned_rule_workers() {
    let config = load(
        r#"
[durable]
enabled = true
worker_streams = ["w1"]

[[routing.rules]]
pattern = "grp-*"
worker = "w2"

[[routing.rules]]
pattern = "300"
worker = "w1"
"#,
    )
    .unwrap();

    // Events pinned by a rule land on that worker's stream, so the rule's
    // worker must be consumed even when it is not listed in worker_streams.
    assert_eq!(
        config.consumer_streams(),
        vec!["queue:default", "queue:worker:w1", "queue:worker:w2"]
    );
}

#[test]
fn test_consumer_streams_default_only() {
    let config = Config::default();
    assert_eq!(config.consumer_streams(), vec!["queue:default"]);
}

#[test]
fn test_invalid_toml_is_rejected() {
    assert!(load("this is not toml ][").is_err());
}

#[test]
fn test_missing_file_is_rejected() {
    assert!(Config::from_file("/nonexistent/nexus.toml").is_err());
}

#[test]
fn test_validate_rejects_zero_port() {
    let mut config = Config::default();
    config.port = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_empty_host() {
    let mut config = Config::default();
    config.host = "  ".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_correlation_timeout() {
    assert!(load("[correlation]\ntimeout = \"0s\"").is_err());
}

#[test]
fn test_validate_rejects_zero_batch_when_durable() {
    let err = load("[durable]\nenabled = true\nbatch_size = 0").unwrap_err();
    assert!(format!("{err:#}").contains("batch_size"));
}

#[test]
fn test_validate_rejects_metrics_port_clash() {
    let mut config = Config::default();
    config.metrics.enabled = true;
    config.metrics.port = config.port;
    assert!(config.validate().is_err());
}
