//! Host-level resource observation
//!
//! Periodic sampling of the kernel's counter files into capacity/usage
//! snapshots, routing table parsing with longest-prefix lookup, bridge
//! membership discovery, and selection of the interfaces to monitor.

mod bridge;
mod nics;
mod routing;
mod sampler;

pub use bridge::BridgeInfo;
pub use nics::{discover_interfaces, interfaces_to_monitor, NicInfo};
pub use routing::{Ipv4Subnet, RoutingTable};
pub use sampler::{HostMonitorHandle, HostSampler, HostSamplerConfig};
