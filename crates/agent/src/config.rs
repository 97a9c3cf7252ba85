//! Agent configuration
//!
//! Sources, lowest precedence first: built-in defaults (some read from the
//! Kubernetes downward-API environment), an optional file named by
//! `CRIC_CONFIG`, then `CRIC_*` environment variables.

use anyhow::{Context, Result};
use cric_core::engine::docker::EngineFlavor;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Where the local node's pods come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PodSourceMode {
    /// API server watch restricted to this node
    Informer,
    /// Kubelet `/pods` polling
    Kubelet,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    #[serde(default = "default_node_ip")]
    pub node_ip: String,

    #[serde(default = "default_pod_name")]
    pub pod_name: String,

    #[serde(default = "default_pod_namespace")]
    pub pod_namespace: String,

    /// Host root filesystem as mounted in the agent container
    #[serde(default = "default_hostfs")]
    pub hostfs: PathBuf,

    #[serde(default = "default_engine")]
    pub engine: EngineFlavor,

    /// Engine socket; the flavor's default under hostfs when unset
    #[serde(default)]
    pub engine_socket: Option<PathBuf>,

    #[serde(default = "default_pod_source")]
    pub pod_source: PodSourceMode,

    #[serde(default = "default_kubelet_port")]
    pub kubelet_port: u16,

    /// Directory holding the helper and busybox binaries
    #[serde(default = "default_helper_dir")]
    pub helper_dir: PathBuf,

    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    #[serde(default = "default_exec_max_in_flight")]
    pub exec_max_in_flight: usize,

    #[serde(default = "default_netproxy_enabled")]
    pub netproxy_enabled: bool,

    #[serde(default = "default_http_proxy_addr")]
    pub http_proxy_addr: String,

    #[serde(default = "default_socks5_addr")]
    pub socks5_addr: String,

    /// API server port for the admin API, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_portforward_survival")]
    pub portforward_survival_secs: u64,

    #[serde(default = "default_reconcile_period")]
    pub reconcile_period_secs: u64,

    #[serde(default = "default_reconcile_offset")]
    pub reconcile_offset_secs: u64,

    #[serde(default = "default_gateway_capacity")]
    pub gateway_capacity: usize,

    #[serde(default = "default_gateway_batch")]
    pub gateway_batch_size: usize,
}

fn env_or(keys: &[&str], fallback: &str) -> String {
    keys.iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| fallback.to_string())
}

fn default_node_name() -> String {
    env_or(&["NODE_NAME"], "unknown")
}

fn default_node_ip() -> String {
    env_or(&["NODE_IP", "HOST_IP"], "127.0.0.1")
}

fn default_pod_name() -> String {
    env_or(&["POD_NAME"], "")
}

fn default_pod_namespace() -> String {
    env_or(&["POD_NAMESPACE"], "")
}

fn default_hostfs() -> PathBuf {
    PathBuf::from(env_or(&["HOSTFS"], "/"))
}

fn default_engine() -> EngineFlavor {
    EngineFlavor::Docker
}

fn default_pod_source() -> PodSourceMode {
    PodSourceMode::Informer
}

fn default_kubelet_port() -> u16 {
    10250
}

fn default_helper_dir() -> PathBuf {
    PathBuf::from("/usr/local/holoinsight/agent/bin")
}

fn default_exec_timeout() -> u64 {
    std::env::var("CRI_EXEC_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(180)
}

fn default_exec_max_in_flight() -> usize {
    64
}

fn default_netproxy_enabled() -> bool {
    std::env::var("NETPROXY_ENABLED")
        .map(|v| v == "true")
        .unwrap_or(false)
}

fn default_http_proxy_addr() -> String {
    "127.0.0.1:9118".to_string()
}

fn default_socks5_addr() -> String {
    "127.0.0.1:9119".to_string()
}

fn default_api_port() -> u16 {
    9117
}

fn default_portforward_survival() -> u64 {
    600
}

fn default_reconcile_period() -> u64 {
    60
}

fn default_reconcile_offset() -> u64 {
    40
}

fn default_gateway_capacity() -> usize {
    10_000
}

fn default_gateway_batch() -> usize {
    500
}

impl AgentConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("CRIC_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("CRIC"))
            .build()
            .context("Failed to read configuration")?;

        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn portforward_survival(&self) -> Duration {
        Duration::from_secs(self.portforward_survival_secs)
    }

    pub fn reconcile_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_period_secs)
    }

    pub fn reconcile_offset(&self) -> Duration {
        Duration::from_secs(self.reconcile_offset_secs)
    }
}
