use std::{collections::BTreeSet, env, net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// The fixed vocabulary of capability tags a node declaration may use.
/// `Registry::load` rejects any node naming a tag outside this set.
pub(crate) const KNOWN_CAPABILITIES: &[&str] = &[
    "sd15",
    "sdxl",
    "sd3",
    "flux",
    "pony",
    "upscale",
    "img2img",
    "controlnet",
    "lora",
    "inpaint",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid node inventory: {0}")]
    NodeInventory(String),
}

/// One node entry as declared in the YAML inventory file (§6.3).
#[derive(Debug, Clone, Deserialize)]
pub struct NodeDecl {
    pub id: String,
    pub display_name: String,
    pub tier: crate::model::Tier,
    #[serde(default)]
    pub vram_gb: u32,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default = "default_max_resolution")]
    pub max_resolution: u32,
    #[serde(default = "default_max_batch")]
    pub max_batch: u32,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
}

fn default_max_resolution() -> u32 {
    1024
}
fn default_max_batch() -> u32 {
    8
}
fn default_max_concurrent_jobs() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInventoryFile {
    pub nodes: Vec<NodeDecl>,
}

/// Validates a raw inventory against the data model's required-fields and
/// known-capability-tag rules, turning it into `Node` runtime records.
pub fn validate_inventory(file: NodeInventoryFile) -> Result<Vec<crate::model::Node>, ConfigError> {
    let mut nodes = Vec::with_capacity(file.nodes.len());
    for decl in file.nodes {
        if decl.id.trim().is_empty() {
            return Err(ConfigError::NodeInventory("node id must not be empty".into()));
        }
        if decl.host.trim().is_empty() {
            return Err(ConfigError::NodeInventory(format!(
                "node {} missing host",
                decl.id
            )));
        }
        for tag in &decl.capabilities {
            if !KNOWN_CAPABILITIES.contains(&tag.as_str()) {
                return Err(ConfigError::NodeInventory(format!(
                    "node {} declares unknown capability tag: {tag}",
                    decl.id
                )));
            }
        }
        nodes.push(crate::model::Node {
            id: decl.id,
            display_name: decl.display_name,
            tier: decl.tier,
            vram_gb: decl.vram_gb,
            max_concurrent_jobs: decl.max_concurrent_jobs,
            max_resolution: decl.max_resolution,
            max_batch: decl.max_batch,
            capabilities: decl.capabilities,
            host: decl.host,
            port: decl.port,
            runtime: crate::model::NodeRuntimeState::default(),
        });
    }
    Ok(nodes)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    node_inventory_path: PathBuf,
    database_url: Option<String>,
    probe_interval: Duration,
    probe_timeout: Duration,
    submit_timeout: Duration,
    poll_interval: Duration,
    job_deadline: Duration,
    history_poll_timeout: Duration,
    artifact_fetch_timeout: Duration,
    overflow_queue_threshold: i64,
    ws_backoff_base_ms: u64,
    ws_backoff_cap_ms: u64,
    ws_keepalive: Duration,
    subscriber_channel_capacity: usize,
    template_manifest_path: PathBuf,
    total_stages: u32,
}

impl Config {
    /// Loads orchestrator configuration from the environment, applying the
    /// defaults named throughout spec §5/§6.3.
    ///
    /// # Errors
    /// Returns `ConfigError` when a required variable is missing or a value
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let http_bind = parse_socket_addr("ORCHESTRATOR_HTTP_BIND", "0.0.0.0:8080")?;
        let node_inventory_path = env::var("ORCHESTRATOR_NODE_INVENTORY")
            .unwrap_or_else(|_| "nodes.yaml".to_string())
            .into();
        let database_url = env::var("ORCHESTRATOR_DATABASE_URL").ok();

        let probe_interval = parse_duration_secs("ORCHESTRATOR_PROBE_INTERVAL_SECS", 10)?;
        let probe_timeout = parse_duration_secs("ORCHESTRATOR_PROBE_TIMEOUT_SECS", 3)?;
        let submit_timeout = parse_duration_secs("ORCHESTRATOR_SUBMIT_TIMEOUT_SECS", 30)?;
        let poll_interval = parse_duration_secs("ORCHESTRATOR_POLL_INTERVAL_SECS", 1)?;
        let job_deadline = parse_duration_secs("ORCHESTRATOR_JOB_DEADLINE_SECS", 300)?;
        let history_poll_timeout = parse_duration_secs("ORCHESTRATOR_HISTORY_POLL_TIMEOUT_SECS", 5)?;
        let artifact_fetch_timeout =
            parse_duration_secs("ORCHESTRATOR_ARTIFACT_FETCH_TIMEOUT_SECS", 60)?;
        let overflow_queue_threshold = parse_i64("ORCHESTRATOR_OVERFLOW_QUEUE_THRESHOLD", 3)?;
        let ws_backoff_base_ms = parse_u64("ORCHESTRATOR_WS_BACKOFF_BASE_MS", 1000)?;
        let ws_backoff_cap_ms = parse_u64("ORCHESTRATOR_WS_BACKOFF_CAP_MS", 30_000)?;
        let ws_keepalive = parse_duration_secs("ORCHESTRATOR_WS_KEEPALIVE_SECS", 30)?;
        let subscriber_channel_capacity =
            parse_usize("ORCHESTRATOR_SUBSCRIBER_CHANNEL_CAPACITY", 64)?;
        let template_manifest_path = env::var("ORCHESTRATOR_TEMPLATE_MANIFEST")
            .unwrap_or_else(|_| "templates.yaml".to_string())
            .into();
        let total_stages = u32::try_from(parse_usize("ORCHESTRATOR_TOTAL_STAGES", 4)?)
            .unwrap_or(u32::MAX);

        Ok(Self {
            http_bind,
            node_inventory_path,
            database_url,
            probe_interval,
            probe_timeout,
            submit_timeout,
            poll_interval,
            job_deadline,
            history_poll_timeout,
            artifact_fetch_timeout,
            overflow_queue_threshold,
            ws_backoff_base_ms,
            ws_backoff_cap_ms,
            ws_keepalive,
            subscriber_channel_capacity,
            template_manifest_path,
            total_stages,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn node_inventory_path(&self) -> &std::path::Path {
        &self.node_inventory_path
    }

    #[must_use]
    pub fn database_url(&self) -> Option<&str> {
        self.database_url.as_deref()
    }

    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        self.probe_interval
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        self.submit_timeout
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn job_deadline(&self) -> Duration {
        self.job_deadline
    }

    #[must_use]
    pub fn history_poll_timeout(&self) -> Duration {
        self.history_poll_timeout
    }

    #[must_use]
    pub fn artifact_fetch_timeout(&self) -> Duration {
        self.artifact_fetch_timeout
    }

    #[must_use]
    pub fn overflow_queue_threshold(&self) -> i64 {
        self.overflow_queue_threshold
    }

    #[must_use]
    pub fn ws_backoff_base_ms(&self) -> u64 {
        self.ws_backoff_base_ms
    }

    #[must_use]
    pub fn ws_backoff_cap_ms(&self) -> u64 {
        self.ws_backoff_cap_ms
    }

    #[must_use]
    pub fn ws_keepalive(&self) -> Duration {
        self.ws_keepalive
    }

    #[must_use]
    pub fn subscriber_channel_capacity(&self) -> usize {
        self.subscriber_channel_capacity
    }

    #[must_use]
    pub fn template_manifest_path(&self) -> &std::path::Path {
        &self.template_manifest_path
    }

    #[must_use]
    pub fn total_stages(&self) -> u32 {
        self.total_stages
    }
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_u64(name, default_secs)?))
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_i64(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<i64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_env(name: &str, value: &str) {
        // SAFETY: tests run sequentially under ENV_MUTEX and assign valid UTF-8 values.
        unsafe {
            env::set_var(name, value);
        }
    }

    fn remove_env(name: &str) {
        // SAFETY: tests run sequentially under ENV_MUTEX.
        unsafe {
            env::remove_var(name);
        }
    }

    fn reset_env() {
        for name in [
            "ORCHESTRATOR_HTTP_BIND",
            "ORCHESTRATOR_NODE_INVENTORY",
            "ORCHESTRATOR_DATABASE_URL",
            "ORCHESTRATOR_PROBE_INTERVAL_SECS",
            "ORCHESTRATOR_PROBE_TIMEOUT_SECS",
            "ORCHESTRATOR_SUBMIT_TIMEOUT_SECS",
            "ORCHESTRATOR_POLL_INTERVAL_SECS",
            "ORCHESTRATOR_JOB_DEADLINE_SECS",
            "ORCHESTRATOR_OVERFLOW_QUEUE_THRESHOLD",
            "ORCHESTRATOR_WS_BACKOFF_BASE_MS",
        ] {
            remove_env(name);
        }
    }

    #[test]
    fn from_env_uses_defaults() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.http_bind(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
        assert_eq!(config.submit_timeout(), Duration::from_secs(30));
        assert_eq!(config.job_deadline(), Duration::from_secs(300));
        assert_eq!(config.overflow_queue_threshold(), 3);
        assert_eq!(config.ws_backoff_base_ms(), 1000);
        assert_eq!(config.ws_backoff_cap_ms(), 30_000);
        assert!(config.database_url().is_none());
        assert_eq!(config.template_manifest_path(), std::path::Path::new("templates.yaml"));
        assert_eq!(config.total_stages(), 4);
    }

    #[test]
    fn from_env_overrides_values() {
        let _lock = ENV_MUTEX.lock().expect("env mutex");
        reset_env();
        set_env("ORCHESTRATOR_HTTP_BIND", "127.0.0.1:9090");
        set_env("ORCHESTRATOR_PROBE_INTERVAL_SECS", "5");
        set_env("ORCHESTRATOR_DATABASE_URL", "postgres://u:p@localhost/db");

        let config = Config::from_env().expect("config should load");

        assert_eq!(config.http_bind(), "127.0.0.1:9090".parse().unwrap());
        assert_eq!(config.probe_interval(), Duration::from_secs(5));
        assert_eq!(config.database_url(), Some("postgres://u:p@localhost/db"));
    }

    #[test]
    fn validate_inventory_rejects_unknown_capability() {
        let file = NodeInventoryFile {
            nodes: vec![NodeDecl {
                id: "n1".into(),
                display_name: "Node 1".into(),
                tier: crate::model::Tier::Draft,
                vram_gb: 24,
                host: "10.0.0.1".into(),
                port: 8188,
                capabilities: BTreeSet::from(["not_a_real_tag".to_string()]),
                max_resolution: 1024,
                max_batch: 8,
                max_concurrent_jobs: 4,
            }],
        };
        let error = validate_inventory(file).expect_err("unknown tag should fail");
        assert!(matches!(error, ConfigError::NodeInventory(_)));
    }

    #[test]
    fn validate_inventory_accepts_known_capabilities() {
        let file = NodeInventoryFile {
            nodes: vec![NodeDecl {
                id: "n1".into(),
                display_name: "Node 1".into(),
                tier: crate::model::Tier::Quality,
                vram_gb: 24,
                host: "10.0.0.1".into(),
                port: 8188,
                capabilities: BTreeSet::from(["sdxl".to_string(), "lora".to_string()]),
                max_resolution: 1536,
                max_batch: 8,
                max_concurrent_jobs: 4,
            }],
        };
        let nodes = validate_inventory(file).expect("known tags should pass");
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].tier, crate::model::Tier::Quality);
    }
}
