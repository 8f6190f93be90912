//! Flow disambiguation and service classification
//!
//! Raw traffic samples name a "local" and "remote" side as seen by the
//! summarizer, which is not necessarily relative to the monitored host.
//! [`FlowClassifier::fix_local_remote`] flips the sides so local always
//! refers to the monitored host, then [`FlowClassifier::classify`] matches
//! the flow to the service that owns it.

use crate::lookup::{RegionLookup, ServiceLookup};
use crate::models::{NetworkFlow, NodeId, RegionId, ServiceId, TrafficSample};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const OSPF_ADDRESSES: [&str; 2] = ["224.0.0.5", "224.0.0.6"];
const PIM_ADDRESSES: [&str; 1] = ["224.0.0.13"];
const MULTICAST_MANAGEMENT_ADDRESSES: [&str; 2] = ["224.0.0.1", "224.0.0.22"];

const DNS_QUERY_PORT: u16 = 53;

/// Ports of the fixed infrastructure services that unclassified traffic is
/// matched against.
#[derive(Debug, Clone)]
pub struct WellKnownPorts {
    pub dns: u16,
    pub dns_update: u16,
    pub image_registry: u16,
    pub simulation_driver: u16,
    pub background_traffic: u16,
    /// Port the placement protocol communicates on.
    pub placement_protocol: u16,
}

impl Default for WellKnownPorts {
    fn default() -> Self {
        Self {
            dns: DNS_QUERY_PORT,
            dns_update: 5353,
            image_registry: 5000,
            simulation_driver: 64000,
            background_traffic: 64001,
            placement_protocol: 20000,
        }
    }
}

/// Classifies traffic samples for one monitored node.
pub struct FlowClassifier {
    region: RegionId,
    service_lookup: Arc<dyn ServiceLookup>,
    region_lookup: Arc<dyn RegionLookup>,
    ports: WellKnownPorts,
}

impl FlowClassifier {
    pub fn new(
        region: RegionId,
        service_lookup: Arc<dyn ServiceLookup>,
        region_lookup: Arc<dyn RegionLookup>,
        ports: WellKnownPorts,
    ) -> Self {
        Self {
            region,
            service_lookup,
            region_lookup,
            ports,
        }
    }

    /// Make sure the local side of the sample is the monitored host.
    ///
    /// When neither endpoint is the monitored address: loopback wins, then
    /// an endpoint in the monitored node's region wins, otherwise the
    /// traffic is passing through and the sample is left as-is.
    pub fn fix_local_remote(
        &self,
        nic_addr: Option<IpAddr>,
        sample: &TrafficSample,
    ) -> TrafficSample {
        let addr1: Option<IpAddr> = sample.local_ip.parse().ok();
        let addr2: Option<IpAddr> = sample.remote_ip.parse().ok();

        let flip = if addr1.map(|a| a.is_loopback()).unwrap_or(false) {
            false
        } else if addr2.map(|a| a.is_loopback()).unwrap_or(false) {
            true
        } else if nic_addr.is_some() && addr1 == nic_addr {
            false
        } else if nic_addr.is_some() && addr2 == nic_addr {
            // flip so that "local" is the host being monitored
            true
        } else {
            let region1 = self.region_lookup.region_for_ip(&sample.local_ip);
            let region2 = self.region_lookup.region_for_ip(&sample.remote_ip);

            if region1.as_ref() == Some(&self.region) {
                false
            } else if region2.as_ref() == Some(&self.region) {
                // not for this host, but anything in the same region counts
                // as local so region summaries stay correct; chances are the
                // traffic is for one of the containers on this host
                true
            } else {
                // pass-through traffic, local and remote don't matter
                false
            }
        };

        if flip {
            TrafficSample {
                nic: sample.nic.clone(),
                local_ip: sample.remote_ip.clone(),
                local_port: sample.remote_port,
                remote_ip: sample.local_ip.clone(),
                remote_port: sample.local_port,
                bits_sent_last_2s: sample.bits_received_last_2s,
                bits_received_last_2s: sample.bits_sent_last_2s,
            }
        } else {
            sample.clone()
        }
    }

    /// Determine the flow identity and owning service for a sample.
    ///
    /// Each endpoint's port is checked against the service declared for the
    /// node at that address; failing that, the well-known infrastructure
    /// ports and multicast addresses are tried. Unattributed traffic is
    /// still reported as [`ServiceId::Unmanaged`] - total accounting
    /// downstream depends on never dropping a flow.
    pub fn classify(&self, sample: &TrafficSample) -> (NetworkFlow, ServiceId) {
        let source = NodeId::from_address(&sample.local_ip);
        let source_port = sample.local_port;
        let dest = NodeId::from_address(&sample.remote_ip);
        let dest_port = sample.remote_port;

        let source_service = self.service_lookup.service_for_node(&source);
        let dest_service = self.service_lookup.service_for_node(&dest);

        if let Some(spec) = &source_service {
            if spec.server_port == source_port {
                let flow = NetworkFlow::new(source.clone(), dest, source);
                return (flow, spec.service.clone());
            }
            debug!(
                service = %spec.service,
                service_port = spec.server_port,
                source_port,
                dest_port,
                "Source service port doesn't match either endpoint"
            );
        }

        if let Some(spec) = &dest_service {
            if spec.server_port == dest_port {
                let flow = NetworkFlow::new(source, dest.clone(), dest);
                return (flow, spec.service.clone());
            }
            debug!(
                service = %spec.service,
                service_port = spec.server_port,
                source_port,
                dest_port,
                "Dest service port doesn't match either endpoint"
            );
        }

        // no managed service matched; try the fixed infrastructure table
        let server_by_port = |port: u16| {
            if port == source_port {
                source.clone()
            } else {
                dest.clone()
            }
        };
        let either_port = |port: u16| port == source_port || port == dest_port;
        let either_address = |addresses: &[&str]| {
            addresses.contains(&sample.local_ip.as_str())
                || addresses.contains(&sample.remote_ip.as_str())
        };

        let (server, service) = if either_port(self.ports.dns) {
            (server_by_port(self.ports.dns), ServiceId::Dns)
        } else if either_port(self.ports.dns_update) {
            (server_by_port(self.ports.dns_update), ServiceId::DnsUpdate)
        } else if either_port(self.ports.image_registry) {
            (
                server_by_port(self.ports.image_registry),
                ServiceId::ImageRegistry,
            )
        } else if either_address(&OSPF_ADDRESSES) {
            (NodeId::unknown(), ServiceId::Ospf)
        } else if either_port(self.ports.simulation_driver) {
            (
                server_by_port(self.ports.simulation_driver),
                ServiceId::SimulationDriver,
            )
        } else if either_port(self.ports.background_traffic) {
            (
                server_by_port(self.ports.background_traffic),
                ServiceId::SimulationDriver,
            )
        } else if either_address(&PIM_ADDRESSES) {
            (NodeId::unknown(), ServiceId::Pim)
        } else if either_address(&MULTICAST_MANAGEMENT_ADDRESSES) {
            (NodeId::unknown(), ServiceId::MulticastManagement)
        } else if either_port(self.ports.placement_protocol) {
            // there isn't a server in placement protocol communication
            (NodeId::unknown(), ServiceId::PlacementProtocol)
        } else {
            warn!(
                source = %source,
                source_port,
                dest = %dest,
                dest_port,
                "Unable to associate traffic with a service"
            );
            (NodeId::unknown(), ServiceId::Unmanaged)
        };

        (NetworkFlow::new(source, dest, server), service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::{ServiceSpec, TableRegionLookup, TableServiceLookup};

    fn sample(local: (&str, u16), remote: (&str, u16)) -> TrafficSample {
        TrafficSample {
            nic: "eth0".to_string(),
            local_ip: local.0.to_string(),
            local_port: local.1,
            remote_ip: remote.0.to_string(),
            remote_port: remote.1,
            bits_sent_last_2s: 1000,
            bits_received_last_2s: 2000,
        }
    }

    fn classifier(services: &[(&str, &str, u16)]) -> FlowClassifier {
        let lookup = TableServiceLookup::new();
        for (node, service, port) in services {
            lookup.assign(
                NodeId::new(*node),
                ServiceSpec {
                    service: ServiceId::Service(service.to_string()),
                    server_port: *port,
                    image: None,
                },
            );
        }
        let regions = TableRegionLookup::from_entries(&[
            "10.0.0.0/16=here".to_string(),
            "10.1.0.0/16=there".to_string(),
        ])
        .unwrap();

        FlowClassifier::new(
            RegionId::new("here"),
            Arc::new(lookup),
            Arc::new(regions),
            WellKnownPorts::default(),
        )
    }

    #[test]
    fn test_flip_when_remote_is_monitored_address() {
        let classifier = classifier(&[]);
        let nic_addr: IpAddr = "10.0.0.1".parse().unwrap();

        let raw = sample(("10.1.0.9", 80), ("10.0.0.1", 55000));
        let fixed = classifier.fix_local_remote(Some(nic_addr), &raw);

        assert_eq!(fixed.local_ip, "10.0.0.1");
        assert_eq!(fixed.remote_ip, "10.1.0.9");
        // sent/received follow the flip
        assert_eq!(fixed.bits_sent_last_2s, 2000);
        assert_eq!(fixed.bits_received_last_2s, 1000);
    }

    #[test]
    fn test_no_flip_when_local_is_monitored_address() {
        let classifier = classifier(&[]);
        let nic_addr: IpAddr = "10.0.0.1".parse().unwrap();

        let raw = sample(("10.0.0.1", 80), ("10.1.0.9", 55000));
        let fixed = classifier.fix_local_remote(Some(nic_addr), &raw);
        assert_eq!(fixed, raw);
    }

    #[test]
    fn test_loopback_wins_over_address_match() {
        let classifier = classifier(&[]);
        let nic_addr: IpAddr = "10.0.0.1".parse().unwrap();

        let raw = sample(("127.0.0.1", 80), ("10.0.0.1", 55000));
        let fixed = classifier.fix_local_remote(Some(nic_addr), &raw);
        assert_eq!(fixed, raw);
    }

    #[test]
    fn test_same_region_fallback_flips() {
        let classifier = classifier(&[]);
        let nic_addr: IpAddr = "10.0.0.1".parse().unwrap();

        // neither side is the monitored address; remote side is in the
        // monitored region
        let raw = sample(("10.1.0.9", 80), ("10.0.0.77", 55000));
        let fixed = classifier.fix_local_remote(Some(nic_addr), &raw);
        assert_eq!(fixed.local_ip, "10.0.0.77");
    }

    #[test]
    fn test_pass_through_left_unflipped() {
        let classifier = classifier(&[]);
        let nic_addr: IpAddr = "10.0.0.1".parse().unwrap();

        let raw = sample(("10.2.0.9", 80), ("10.3.0.7", 55000));
        let fixed = classifier.fix_local_remote(Some(nic_addr), &raw);
        assert_eq!(fixed, raw);
    }

    #[test]
    fn test_classify_by_declared_server_port() {
        let classifier = classifier(&[("10.0.0.5", "face-recognition", 8080)]);

        let (flow, service) = classifier.classify(&sample(("10.0.0.5", 8080), ("10.1.0.9", 55000)));
        assert_eq!(service, ServiceId::Service("face-recognition".to_string()));
        assert_eq!(flow.server, NodeId::new("10.0.0.5"));

        // server on the remote side
        let (flow, service) = classifier.classify(&sample(("10.1.0.9", 55000), ("10.0.0.5", 8080)));
        assert_eq!(service, ServiceId::Service("face-recognition".to_string()));
        assert_eq!(flow.server, NodeId::new("10.0.0.5"));
    }

    #[test]
    fn test_classify_well_known_ports() {
        let classifier = classifier(&[]);

        let (flow, service) = classifier.classify(&sample(("10.0.0.5", 40000), ("10.1.0.2", 53)));
        assert_eq!(service, ServiceId::Dns);
        assert_eq!(flow.server, NodeId::new("10.1.0.2"));

        let (flow, service) = classifier.classify(&sample(("10.0.0.5", 5000), ("10.1.0.2", 40000)));
        assert_eq!(service, ServiceId::ImageRegistry);
        assert_eq!(flow.server, NodeId::new("10.0.0.5"));

        let (flow, service) = classifier.classify(&sample(("224.0.0.5", 0), ("10.1.0.2", 0)));
        assert_eq!(service, ServiceId::Ospf);
        assert!(flow.server.is_unknown());
    }

    #[test]
    fn test_placement_protocol_has_no_server() {
        let classifier = classifier(&[]);
        let (flow, service) =
            classifier.classify(&sample(("10.0.0.5", 20000), ("10.1.0.2", 40000)));
        assert_eq!(service, ServiceId::PlacementProtocol);
        assert!(flow.server.is_unknown());
    }

    #[test]
    fn test_unmatched_traffic_reported_as_unmanaged() {
        let classifier = classifier(&[]);
        let (flow, service) = classifier.classify(&sample(("10.0.0.5", 1234), ("10.1.0.2", 5678)));
        assert_eq!(service, ServiceId::Unmanaged);
        assert!(flow.server.is_unknown());
        assert_eq!(flow.source, NodeId::new("10.0.0.5"));
        assert_eq!(flow.dest, NodeId::new("10.1.0.2"));
    }

    #[test]
    fn test_mismatched_service_port_falls_through() {
        // node runs a service but this flow isn't on its server port
        let classifier = classifier(&[("10.0.0.5", "face-recognition", 8080)]);
        let (_, service) = classifier.classify(&sample(("10.0.0.5", 9999), ("10.1.0.2", 7777)));
        assert_eq!(service, ServiceId::Unmanaged);
    }
}
