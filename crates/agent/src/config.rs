//! Agent configuration
//!
//! Loaded from an optional `agent` config file with `AGENT_`-prefixed
//! environment overrides. A malformed configuration is fatal at startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// One entry of the container slot pool.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotEntry {
    pub name: String,
    pub address: Ipv4Addr,
}

/// Agent configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Node name, from the NODE_NAME environment variable by default.
    pub node_name: String,

    /// Region this node belongs to.
    pub region: String,

    /// Port for the health/readiness HTTP endpoints.
    pub api_port: u16,

    /// Resource polling and report generation interval in milliseconds.
    pub poll_interval_ms: u64,

    /// Short (load balancing) estimation window in seconds.
    pub short_window_secs: u64,

    /// Long (placement) estimation window in seconds.
    pub long_window_secs: u64,

    /// Skip traffic sampling entirely; fail-safe for hosts without packet
    /// capture privileges.
    pub skip_network_data: bool,

    /// Docker daemon socket path.
    pub docker_socket: String,

    /// Host running the image registry.
    pub registry_host: String,
    pub registry_port: u16,

    /// Image pull retry policy.
    pub max_pull_attempts: u32,
    pub pull_min_backoff_secs: u64,
    pub pull_max_backoff_secs: u64,

    /// Path to the JSON node-to-service map; the agent runs without flow
    /// classification to managed services when unset.
    pub service_map_path: Option<PathBuf>,

    /// Path to the subnet-to-region map (`subnet=region` lines).
    pub region_map_path: Option<PathBuf>,

    /// Container name/address pool for this node.
    pub container_slots: Vec<SlotEntry>,

    /// Cap on simultaneously running service containers.
    pub max_service_containers: Option<usize>,

    /// Base directories for container instance and shared service data.
    pub data_root: PathBuf,
    pub service_data_root: PathBuf,

    /// Control subnets excluded from traffic monitoring, CIDR notation.
    pub excluded_subnets: Vec<String>,

    /// Fold failed client requests into compute demand.
    pub use_failed_requests_in_demand: bool,

    /// Port the placement protocol communicates on, for flow
    /// classification.
    pub placement_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string()),
            region: "default".to_string(),
            api_port: 8080,
            poll_interval_ms: 3000,
            short_window_secs: 10,
            long_window_secs: 60,
            skip_network_data: false,
            docker_socket: "/var/run/docker.sock".to_string(),
            registry_host: "localhost".to_string(),
            registry_port: 5000,
            max_pull_attempts: 3,
            pull_min_backoff_secs: 1,
            pull_max_backoff_secs: 30,
            service_map_path: None,
            region_map_path: None,
            container_slots: Vec::new(),
            max_service_containers: None,
            data_root: PathBuf::from("/var/lib/agent/container_data"),
            service_data_root: PathBuf::from("/var/lib/agent/service_data"),
            excluded_subnets: Vec::new(),
            use_failed_requests_in_demand: false,
            placement_port: 20000,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional `agent` file and environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("agent").required(false))
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()
            .context("Failed to read agent configuration")?;

        config
            .try_deserialize()
            .context("Malformed agent configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.poll_interval_ms, 3000);
        assert_eq!(config.short_window_secs, 10);
        assert_eq!(config.long_window_secs, 60);
        assert!(!config.skip_network_data);
        assert!(config.container_slots.is_empty());
    }

    #[test]
    fn test_partial_override() {
        let config: AgentConfig = serde_json::from_str(
            r#"{
                "node_name": "ncp07",
                "skip_network_data": true,
                "container_slots": [{"name": "ncp07c0", "address": "172.18.0.10"}]
            }"#,
        )
        .unwrap();

        assert_eq!(config.node_name, "ncp07");
        assert!(config.skip_network_data);
        assert_eq!(config.container_slots.len(), 1);
        assert_eq!(config.container_slots[0].address, Ipv4Addr::new(172, 18, 0, 10));
        // untouched fields keep their defaults
        assert_eq!(config.registry_port, 5000);
    }
}
