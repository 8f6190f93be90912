//! Core data model for the node resource agent

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier for a node or container in the platform.
///
/// Flow endpoints observed on the wire are identified by their address
/// string; the sentinel [`NodeId::unknown`] marks endpoints that could not
/// be attributed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Node identifier derived from an observed network address.
    pub fn from_address(address: &str) -> Self {
        Self(address.to_string())
    }

    pub fn unknown() -> Self {
        Self("UNKNOWN".to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == "UNKNOWN"
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical region that a node or address belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// Service that network traffic or a container is attributed to.
///
/// `Service` covers managed application services; the remaining variants
/// are the fixed infrastructure services traffic can be classified to when
/// no managed service matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceId {
    Service(String),
    Dns,
    DnsUpdate,
    ImageRegistry,
    Ospf,
    Pim,
    MulticastManagement,
    SimulationDriver,
    PlacementProtocol,
    Unmanaged,
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::Service(name) => f.write_str(name),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Compute attributes reported for nodes and containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAttr {
    Cpu,
    /// Abstract task slots; one virtual CPU provides one task slot.
    TaskContainers,
    Memory,
    QueueLength,
}

impl FromStr for NodeAttr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CPU" => Ok(NodeAttr::Cpu),
            "TASK_CONTAINERS" => Ok(NodeAttr::TaskContainers),
            "MEMORY" => Ok(NodeAttr::Memory),
            "QUEUE_LENGTH" => Ok(NodeAttr::QueueLength),
            other => Err(format!("unknown node attribute '{}'", other)),
        }
    }
}

/// Link attributes reported for network interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkAttr {
    DatarateRx,
    DatarateTx,
    Delay,
}

impl FromStr for LinkAttr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DATARATE_RX" => Ok(LinkAttr::DatarateRx),
            "DATARATE_TX" => Ok(LinkAttr::DatarateTx),
            "DELAY" => Ok(LinkAttr::Delay),
            other => Err(format!("unknown link attribute '{}'", other)),
        }
    }
}

/// Averaging horizon for demand estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimationWindow {
    /// Fast-reacting window feeding load balancing.
    Short,
    /// Slow window feeding placement decisions.
    Long,
}

/// Lifecycle status of the service running in a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Unknown,
}

/// A classified network conversation.
///
/// `server` is [`NodeId::unknown`] when no managed service could be matched
/// to either endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkFlow {
    pub source: NodeId,
    pub dest: NodeId,
    pub server: NodeId,
}

impl NetworkFlow {
    pub fn new(source: NodeId, dest: NodeId, server: NodeId) -> Self {
        Self {
            source,
            dest,
            server,
        }
    }
}

/// One flow observed by the traffic summarizer during a sampling interval.
///
/// Local/remote sides are as reported by the summarizer and are not yet
/// disambiguated relative to the monitored host. Sent and received values
/// are from the perspective of the local side. Port 0 means the port could
/// not be determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub nic: String,
    pub local_ip: String,
    pub local_port: u16,
    pub remote_ip: String,
    pub remote_port: u16,
    pub bits_sent_last_2s: u64,
    pub bits_received_last_2s: u64,
}

/// Snapshot of host capacity and usage produced by the host sampler.
///
/// Immutable once published; superseded wholesale on each poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub timestamp_ms: i64,
    /// CPU usage in [0, 1]; NaN until two polls have completed.
    pub cpu_usage: f64,
    pub cpu_count: usize,
    pub memory_used_gb: f64,
    pub memory_capacity_gb: f64,
    /// Link speed per NIC in Mbit/s, read once at startup.
    pub nic_capacity_mbps: HashMap<String, f64>,
}

impl ResourceSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp_ms: 0,
            cpu_usage: f64::NAN,
            cpu_count: 0,
            memory_used_gb: 0.0,
            memory_capacity_gb: 0.0,
            nic_capacity_mbps: HashMap::new(),
        }
    }
}

/// Latest resource statistics for one container as reported by the runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    /// Busy host CPUs, Docker-style; `None` when the runtime did not
    /// provide enough information to compute it.
    pub cpu_usage: Option<f64>,
    pub memory_usage_bytes: u64,
    pub cpu_capacity: Option<f64>,
    pub memory_capacity_bytes: Option<u64>,
    /// Raw status string from the runtime, e.g. "running" or "exited".
    pub status: Option<String>,
    /// Bytes received/sent on the container NIC since the previous sample.
    pub rx_bytes_delta: Option<u64>,
    pub tx_bytes_delta: Option<u64>,
}

/// Network load attributed to one (flow, service) pair on a NIC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLoad {
    pub flow: NetworkFlow,
    pub service: ServiceId,
    pub rx_mbps: f64,
    pub tx_mbps: f64,
}

/// Per-container report for one estimation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResourceReport {
    pub container: NodeId,
    pub timestamp_ms: i64,
    pub service: ServiceId,
    pub status: ServiceStatus,
    pub window: EstimationWindow,
    pub compute_capacity: HashMap<NodeAttr, f64>,
    pub compute_load: HashMap<NodeId, HashMap<NodeAttr, f64>>,
    pub compute_demand: HashMap<NodeId, HashMap<NodeAttr, f64>>,
    /// Mean request processing time from the service's metrics file; NaN
    /// until the first value is seen.
    pub average_processing_time: f64,
}

impl ContainerResourceReport {
    /// Report with no data, used until the first real update.
    pub fn null_report(container: NodeId, service: ServiceId, window: EstimationWindow) -> Self {
        Self {
            container,
            timestamp_ms: 0,
            service,
            status: ServiceStatus::Starting,
            window,
            compute_capacity: HashMap::new(),
            compute_load: HashMap::new(),
            compute_demand: HashMap::new(),
            average_processing_time: f64::NAN,
        }
    }
}

/// Per-node report for one estimation window; the external artifact of the
/// agent. Rebuilt wholesale on every polling tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceReport {
    pub node: NodeId,
    pub timestamp_ms: i64,
    pub window: EstimationWindow,
    pub compute_capacity: HashMap<NodeAttr, f64>,
    /// Capacity per monitored NIC.
    pub network_capacity: HashMap<String, HashMap<LinkAttr, f64>>,
    /// Classified load per monitored NIC.
    pub network_load: HashMap<String, Vec<FlowLoad>>,
    /// Windowed average of the classified load per monitored NIC.
    pub network_demand: HashMap<String, Vec<FlowLoad>>,
    pub container_reports: HashMap<NodeId, ContainerResourceReport>,
    pub max_containers: usize,
    pub running_containers: usize,
}

impl ResourceReport {
    /// Report with no data, used until the first polling tick completes.
    pub fn null_report(node: NodeId, window: EstimationWindow) -> Self {
        Self {
            node,
            timestamp_ms: 0,
            window,
            compute_capacity: HashMap::new(),
            network_capacity: HashMap::new(),
            network_load: HashMap::new(),
            network_demand: HashMap::new(),
            container_reports: HashMap::new(),
            max_containers: 0,
            running_containers: 0,
        }
    }
}

/// Bits per second to megabits per second.
pub fn bits_to_mbps(bits: u64) -> f64 {
    bits as f64 / 1_000_000.0
}

/// Bytes to gigabytes (binary multipliers).
pub fn bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0 * 1024.0)
}

/// Kilobytes to gigabytes (binary multipliers).
pub fn kb_to_gb(kb: u64) -> f64 {
    kb as f64 / (1024.0 * 1024.0)
}
