//! Collaborator lookups for flow classification
//!
//! The agent does not own the node-to-service assignment or the region
//! plan; both are external collaborators with narrow contracts. They are
//! injected as trait objects so tests can supply fixed tables.

use crate::models::{NodeId, RegionId, ServiceId};
use crate::host::Ipv4Subnet;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::RwLock;

/// Declared properties of the service currently assigned to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub service: ServiceId,
    /// Port the service's server side listens on.
    pub server_port: u16,
    /// Container image that runs the service, without registry prefix.
    pub image: Option<String>,
}

/// What service runs on a given node right now.
pub trait ServiceLookup: Send + Sync {
    fn service_for_node(&self, node: &NodeId) -> Option<ServiceSpec>;

    fn spec_for_service(&self, service: &ServiceId) -> Option<ServiceSpec>;
}

/// Which logical region an address belongs to.
pub trait RegionLookup: Send + Sync {
    fn region_for_ip(&self, ip: &str) -> Option<RegionId>;
}

#[derive(Debug, Deserialize)]
struct ServiceMapEntry {
    service: String,
    server_port: u16,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    nodes: Vec<String>,
}

/// Service lookup backed by an in-memory table, loadable from a JSON file
/// of `ServiceMapEntry` records. The table can be replaced at runtime when
/// the assignment changes.
#[derive(Default)]
pub struct TableServiceLookup {
    by_node: RwLock<HashMap<NodeId, ServiceSpec>>,
    by_service: RwLock<HashMap<ServiceId, ServiceSpec>>,
}

impl TableServiceLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read service map {}", path.display()))?;
        let entries: Vec<ServiceMapEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Malformed service map {}", path.display()))?;

        let lookup = Self::new();
        for entry in entries {
            let spec = ServiceSpec {
                service: ServiceId::Service(entry.service.clone()),
                server_port: entry.server_port,
                image: entry.image.clone(),
            };
            for node in &entry.nodes {
                lookup.assign(NodeId::new(node.clone()), spec.clone());
            }
            lookup
                .by_service
                .write()
                .expect("service map lock poisoned")
                .insert(spec.service.clone(), spec);
        }
        Ok(lookup)
    }

    /// Record that `node` currently runs `spec`'s service.
    pub fn assign(&self, node: NodeId, spec: ServiceSpec) {
        self.by_service
            .write()
            .expect("service map lock poisoned")
            .insert(spec.service.clone(), spec.clone());
        self.by_node
            .write()
            .expect("service map lock poisoned")
            .insert(node, spec);
    }

    pub fn unassign(&self, node: &NodeId) {
        self.by_node
            .write()
            .expect("service map lock poisoned")
            .remove(node);
    }
}

impl ServiceLookup for TableServiceLookup {
    fn service_for_node(&self, node: &NodeId) -> Option<ServiceSpec> {
        self.by_node
            .read()
            .expect("service map lock poisoned")
            .get(node)
            .cloned()
    }

    fn spec_for_service(&self, service: &ServiceId) -> Option<ServiceSpec> {
        self.by_service
            .read()
            .expect("service map lock poisoned")
            .get(service)
            .cloned()
    }
}

/// Region lookup backed by a subnet-to-region table.
#[derive(Default)]
pub struct TableRegionLookup {
    subnets: Vec<(Ipv4Subnet, RegionId)>,
}

impl TableRegionLookup {
    pub fn new(subnets: Vec<(Ipv4Subnet, RegionId)>) -> Self {
        Self { subnets }
    }

    /// Parse entries of the form `10.10.0.0/16=regionA`.
    pub fn from_entries(entries: &[String]) -> Result<Self> {
        let mut subnets = Vec::with_capacity(entries.len());
        for entry in entries {
            let (subnet, region) = entry
                .split_once('=')
                .with_context(|| format!("region entry '{}' is not subnet=region", entry))?;
            subnets.push((subnet.parse()?, RegionId::new(region)));
        }
        Ok(Self { subnets })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read region map {}", path.display()))?;
        let entries: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(String::from)
            .collect();
        Self::from_entries(&entries)
    }
}

impl RegionLookup for TableRegionLookup {
    fn region_for_ip(&self, ip: &str) -> Option<RegionId> {
        let addr: Ipv4Addr = ip.parse().ok()?;
        self.subnets
            .iter()
            .find(|(subnet, _)| subnet.contains(addr))
            .map(|(_, region)| region.clone())
    }
}
