use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::time::Duration;

use crate::resolver::ResourceEntry;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub xline_config: XlineConfig,
    #[serde(default)]
    pub gc: GcConfig,
    /// Where the Prometheus exporter listens; `null` turns it off.
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: Option<SocketAddr>,
}

fn default_metrics_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 9090)))
}

#[derive(Debug, Clone, Deserialize)]
pub struct XlineConfig {
    pub endpoints: Vec<String>,
    /// Key prefix objects live under.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

fn default_prefix() -> String {
    "/registry".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Workers per queue.
    pub workers: usize,
    pub resync_period_secs: u64,
    pub absent_owner_cache_size: usize,
    /// Immediate re-read/re-update attempts when removing a finalizer hits
    /// a conflict.
    pub finalizer_update_retries: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Resource names (e.g. `events`) that are never monitored.
    pub ignored_resources: Vec<String>,
    /// Extra kinds to resolve and monitor.
    pub resources: Vec<ResourceEntry>,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            workers: 5,
            resync_period_secs: 30,
            absent_owner_cache_size: 500,
            finalizer_update_retries: 5,
            retry_base_delay_ms: 5,
            retry_max_delay_ms: 60_000,
            ignored_resources: Vec::new(),
            resources: Vec::new(),
        }
    }
}

impl GcConfig {
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}
