//! Container runtime contract
//!
//! The agent talks to the container runtime through this narrow trait;
//! the production implementation is [`docker::DockerRuntime`]. Tests
//! inject mocks to exercise the lifecycle manager without a runtime.

pub mod docker;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Everything needed to create one service container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Virtual CPUs to allocate.
    pub cpus: f64,
    pub memory_bytes: u64,
    /// Runtime network to attach to, with an optional fixed address.
    pub network: Option<String>,
    pub ipv4_address: Option<String>,
    /// Host path to container path bind mounts.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    pub environment: HashMap<String, String>,
}

/// Status and limits read from the runtime's inspect call.
#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    /// Raw runtime status string, e.g. "running" or "exited".
    pub status: Option<String>,
    pub cpu_limit: Option<f64>,
    pub memory_limit_bytes: Option<u64>,
}

/// One sample from the runtime's per-container stats endpoint.
///
/// CPU counters are cumulative; the runtime also reports the previous
/// sample's values so a usage fraction can be computed from one response.
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatsSample {
    pub cpu_total_usage: Option<u64>,
    pub precpu_total_usage: Option<u64>,
    pub system_cpu_usage: Option<u64>,
    pub presystem_cpu_usage: Option<u64>,
    pub online_cpus: Option<u64>,
    pub memory_usage_bytes: Option<u64>,
    /// Cumulative byte counters for the requested container NIC.
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

/// Operations the agent requires from a container runtime.
///
/// Every operation maps the runtime's response onto a strict
/// success/failure result; callers decide about retries.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its runtime id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop with a grace period before the runtime kills the process.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Combined stdout/stderr logs.
    async fn container_logs(&self, name: &str) -> Result<String>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerInspect>;

    /// One stats sample for the container, scoped to `nic` for the network
    /// counters.
    async fn container_stats(&self, name: &str, nic: &str) -> Result<RuntimeStatsSample>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// All image references known to the runtime, as `repo:tag` strings.
    async fn list_images(&self) -> Result<Vec<String>>;
}
