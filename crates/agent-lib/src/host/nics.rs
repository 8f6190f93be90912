//! Network interface discovery and monitoring selection

use super::bridge::BridgeInfo;
use super::routing::Ipv4Subnet;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, trace};

/// A host network interface and its primary IPv4 address, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
}

fn is_container_peer(name: &str) -> bool {
    // TODO: find a better way to identify the container-side interfaces
    // than checking the name
    name.starts_with("veth")
}

fn is_container_bridge(name: &str) -> bool {
    name.starts_with("docker")
}

/// Enumerate the host's network interfaces with their first IPv4 address.
pub fn discover_interfaces() -> Result<Vec<NicInfo>> {
    let addrs = nix::ifaddrs::getifaddrs().context("Failed to enumerate network interfaces")?;

    let mut by_name: HashMap<String, Option<Ipv4Addr>> = HashMap::new();
    for ifaddr in addrs {
        let entry = by_name.entry(ifaddr.interface_name.clone()).or_insert(None);
        if entry.is_none() {
            if let Some(address) = ifaddr.address {
                if let Some(sin) = address.as_sockaddr_in() {
                    *entry = Some(sin.ip());
                }
            }
        }
    }

    let mut nics: Vec<NicInfo> = by_name
        .into_iter()
        .map(|(name, ipv4)| NicInfo { name, ipv4 })
        .collect();
    nics.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nics)
}

/// Select the interfaces to run traffic monitoring on.
///
/// Skips container peer interfaces, container bridges, loopback, and
/// interfaces whose address falls in an excluded subnet. The remaining
/// interfaces are kept when they carry an IPv4 address or belong to a
/// container bridge; bridge members without an address inherit the
/// bridge's address so traffic can be disambiguated.
pub fn interfaces_to_monitor(
    all: &[NicInfo],
    bridges: &BridgeInfo,
    excluded_subnets: &[Ipv4Subnet],
) -> Vec<NicInfo> {
    let by_name: HashMap<&str, &NicInfo> =
        all.iter().map(|nic| (nic.name.as_str(), nic)).collect();

    all.iter()
        .filter(|nic| !is_container_peer(&nic.name))
        .filter(|nic| !is_container_bridge(&nic.name))
        .filter(|nic| nic.ipv4.map(|ip| !ip.is_loopback()).unwrap_or(true))
        .filter(|nic| {
            let excluded = nic
                .ipv4
                .map(|ip| excluded_subnets.iter().any(|subnet| subnet.contains(ip)))
                .unwrap_or(false);
            if excluded {
                trace!(nic = %nic.name, "Skipping interface in excluded subnet");
            }
            !excluded
        })
        .filter_map(|nic| {
            if nic.ipv4.is_some() {
                return Some(nic.clone());
            }

            // address-less members of a container bridge are monitored with
            // the bridge's address
            let bridge = bridges.bridge_for(&nic.name)?;
            if !is_container_bridge(bridge) {
                return None;
            }
            let bridge_addr = by_name.get(bridge).and_then(|b| b.ipv4);
            debug!(nic = %nic.name, bridge = %bridge, "Monitoring bridge member with bridge address");
            Some(NicInfo {
                name: nic.name.clone(),
                ipv4: bridge_addr,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nic(name: &str, ipv4: Option<[u8; 4]>) -> NicInfo {
        NicInfo {
            name: name.to_string(),
            ipv4: ipv4.map(Ipv4Addr::from),
        }
    }

    #[test]
    fn test_skips_container_interfaces_and_loopback() {
        let all = vec![
            nic("lo", Some([127, 0, 0, 1])),
            nic("eth0", Some([10, 0, 0, 2])),
            nic("veth12ab", Some([172, 17, 0, 2])),
            nic("docker0", Some([172, 17, 0, 1])),
        ];
        let monitored = interfaces_to_monitor(&all, &BridgeInfo::default(), &[]);
        assert_eq!(monitored, vec![nic("eth0", Some([10, 0, 0, 2]))]);
    }

    #[test]
    fn test_skips_excluded_subnets() {
        let all = vec![
            nic("eth0", Some([10, 0, 0, 2])),
            nic("eth1", Some([192, 168, 50, 2])),
        ];
        let excluded = vec!["192.168.0.0/16".parse().unwrap()];
        let monitored = interfaces_to_monitor(&all, &BridgeInfo::default(), &excluded);
        assert_eq!(monitored, vec![nic("eth0", Some([10, 0, 0, 2]))]);
    }

    #[test]
    fn test_bridge_member_inherits_bridge_address() {
        let all = vec![
            nic("eth0", None),
            nic("docker1", Some([172, 18, 0, 1])),
        ];
        let mut members = HashMap::new();
        members.insert("docker1".to_string(), vec!["eth0".to_string()]);
        let bridges = BridgeInfo::from_members(members);

        let monitored = interfaces_to_monitor(&all, &bridges, &[]);
        assert_eq!(monitored, vec![nic("eth0", Some([172, 18, 0, 1]))]);
    }

    #[test]
    fn test_addressless_interface_without_bridge_dropped() {
        let all = vec![nic("eth3", None)];
        let monitored = interfaces_to_monitor(&all, &BridgeInfo::default(), &[]);
        assert!(monitored.is_empty());
    }
}
