//! Node-level report generation
//!
//! The builder runs on a fixed-interval tick: it reads the latest host
//! snapshot, updates every container's reports, attributes the traffic
//! frames to flows and services, feeds the node demand tracker, and swaps
//! in a fresh short/long [`ResourceReport`] pair. Ticks that take longer
//! than the interval cause the next tick to be skipped, not queued.

use crate::containers::ContainerManager;
use crate::demand::DemandTracker;
use crate::host::HostMonitorHandle;
use crate::models::{
    bits_to_mbps, ContainerResourceReport, EstimationWindow, FlowLoad, LinkAttr, NetworkFlow,
    NodeAttr, NodeId, ResourceReport, ResourceSnapshot, ServiceId,
};
use crate::traffic::{FlowClassifier, TrafficSource};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

type NetDemandKey = (String, NetworkFlow, ServiceId, LinkAttr);

/// Configuration for node report generation.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub node: NodeId,
    pub poll_interval: Duration,
    pub short_window: Duration,
    pub long_window: Duration,
    /// Leave the network sections empty; fail-safe for hosts without
    /// packet capture privileges.
    pub skip_network_data: bool,
    /// Configured compute capacity caps, min'd with the detected hardware.
    pub cpu_capacity_override: Option<f64>,
    pub memory_capacity_override: Option<f64>,
    /// Configured per-NIC bandwidth (Mbit/s), min'd with the link speed.
    pub nic_bandwidth_override: HashMap<String, f64>,
    /// Configured per-NIC link delay (ms).
    pub nic_delay_override: HashMap<String, f64>,
}

impl ReportConfig {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            poll_interval: Duration::from_secs(3),
            short_window: Duration::from_secs(10),
            long_window: Duration::from_secs(60),
            skip_network_data: false,
            cpu_capacity_override: None,
            memory_capacity_override: None,
            nic_bandwidth_override: HashMap::new(),
            nic_delay_override: HashMap::new(),
        }
    }
}

/// Builds and publishes the node's short/long report pair.
pub struct ReportBuilder {
    config: ReportConfig,
    host: HostMonitorHandle,
    traffic: Vec<Arc<dyn TrafficSource>>,
    classifier: FlowClassifier,
    manager: Arc<ContainerManager>,
    network_demand: Mutex<DemandTracker<NetDemandKey>>,
    reports: RwLock<(ResourceReport, ResourceReport)>,
}

impl ReportBuilder {
    pub fn new(
        config: ReportConfig,
        host: HostMonitorHandle,
        traffic: Vec<Arc<dyn TrafficSource>>,
        classifier: FlowClassifier,
        manager: Arc<ContainerManager>,
    ) -> Self {
        let short = ResourceReport::null_report(config.node.clone(), EstimationWindow::Short);
        let long = ResourceReport::null_report(config.node.clone(), EstimationWindow::Long);
        let network_demand = Mutex::new(DemandTracker::new(
            config.short_window,
            config.long_window,
        ));

        Self {
            config,
            host,
            traffic,
            classifier,
            manager,
            network_demand,
            reports: RwLock::new((short, long)),
        }
    }

    /// The most recently published report for a window.
    pub fn current_report(&self, window: EstimationWindow) -> ResourceReport {
        let reports = self.reports.read().expect("report lock poisoned");
        match window {
            EstimationWindow::Short => reports.0.clone(),
            EstimationWindow::Long => reports.1.clone(),
        }
    }

    /// Run the report tick until shutdown. Tick work is not re-entrant;
    /// missed ticks are skipped.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(
            node = %self.config.node,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting report generation"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.update_reports().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down report generation");
                    break;
                }
            }
        }
    }

    /// One tick: rebuild both reports wholesale. The report lock is held
    /// only for the final swap, never during computation.
    pub async fn update_reports(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        self.update_reports_at(now).await;
    }

    /// Tick with an explicit timestamp; exposed for deterministic tests.
    pub async fn update_reports_at(&self, now: i64) {
        trace!(now, "Updating resource reports");
        let snapshot = self.host.snapshot().await;

        let compute_capacity = self.compute_capacity(&snapshot);
        let cpu_overload = self.manager.cpu_overload_factor(snapshot.cpu_count as f64);
        let memory_overload = self
            .manager
            .memory_overload_factor(snapshot.memory_capacity_gb);

        // container reports must be up to date before node aggregation
        // reads them
        let handles = self.manager.running();
        for handle in &handles {
            handle.update_reports(now, cpu_overload, memory_overload);
        }

        let collect = |window: EstimationWindow| -> HashMap<NodeId, ContainerResourceReport> {
            handles
                .iter()
                .map(|handle| (handle.id().clone(), handle.report(window)))
                .collect()
        };
        let short_containers = collect(EstimationWindow::Short);
        let long_containers = collect(EstimationWindow::Long);

        let (network_capacity, network_load, short_demand, long_demand) =
            if self.config.skip_network_data {
                Default::default()
            } else {
                self.compute_network(now, &snapshot)
            };

        let build = |window: EstimationWindow,
                     containers: HashMap<NodeId, ContainerResourceReport>,
                     demand: HashMap<String, Vec<FlowLoad>>| {
            ResourceReport {
                node: self.config.node.clone(),
                timestamp_ms: now,
                window,
                compute_capacity: compute_capacity.clone(),
                network_capacity: network_capacity.clone(),
                network_load: network_load.clone(),
                network_demand: demand,
                container_reports: containers,
                max_containers: self.manager.max_containers(),
                running_containers: handles.len(),
            }
        };

        let short = build(EstimationWindow::Short, short_containers, short_demand);
        let long = build(EstimationWindow::Long, long_containers, long_demand);

        *self.reports.write().expect("report lock poisoned") = (short, long);
        debug!(now, containers = handles.len(), "Published resource reports");
    }

    fn compute_capacity(&self, snapshot: &ResourceSnapshot) -> HashMap<NodeAttr, f64> {
        let mut capacity = HashMap::new();

        let cpu = match self.config.cpu_capacity_override {
            Some(limit) => (snapshot.cpu_count as f64).min(limit),
            None => snapshot.cpu_count as f64,
        };
        capacity.insert(NodeAttr::Cpu, cpu);
        // task slots track CPUs one-to-one
        capacity.insert(NodeAttr::TaskContainers, cpu);

        let memory = match self.config.memory_capacity_override {
            Some(limit) => snapshot.memory_capacity_gb.min(limit),
            None => snapshot.memory_capacity_gb,
        };
        capacity.insert(NodeAttr::Memory, memory);

        capacity
    }

    #[allow(clippy::type_complexity)]
    fn compute_network(
        &self,
        now: i64,
        snapshot: &ResourceSnapshot,
    ) -> (
        HashMap<String, HashMap<LinkAttr, f64>>,
        HashMap<String, Vec<FlowLoad>>,
        HashMap<String, Vec<FlowLoad>>,
        HashMap<String, Vec<FlowLoad>>,
    ) {
        // nic -> (flow, service) -> (rx, tx)
        let mut per_nic: HashMap<String, HashMap<(NetworkFlow, ServiceId), (f64, f64)>> =
            HashMap::new();

        for source in &self.traffic {
            // always create the per-nic entry, downstream expects it
            let nic_load = per_nic.entry(source.nic().to_string()).or_default();

            let Some(frame) = source.last_frame() else {
                trace!(nic = %source.nic(), "No traffic frame");
                continue;
            };
            for sample in frame {
                let corrected = self.classifier.fix_local_remote(source.nic_addr(), &sample);
                let (flow, service) = self.classifier.classify(&corrected);

                let rx = bits_to_mbps(corrected.bits_received_last_2s);
                let tx = bits_to_mbps(corrected.bits_sent_last_2s);

                let entry = nic_load.entry((flow, service)).or_insert((0.0, 0.0));
                entry.0 += rx;
                entry.1 += tx;
            }
        }

        let network_load: HashMap<String, Vec<FlowLoad>> = per_nic
            .iter()
            .map(|(nic, loads)| {
                let flows = loads
                    .iter()
                    .map(|((flow, service), (rx, tx))| FlowLoad {
                        flow: flow.clone(),
                        service: service.clone(),
                        rx_mbps: *rx,
                        tx_mbps: *tx,
                    })
                    .collect();
                (nic.clone(), flows)
            })
            .collect();

        let network_capacity: HashMap<String, HashMap<LinkAttr, f64>> = per_nic
            .keys()
            .map(|nic| {
                let hardware = snapshot
                    .nic_capacity_mbps
                    .get(nic)
                    .copied()
                    .unwrap_or(f64::INFINITY);
                let configured = self
                    .config
                    .nic_bandwidth_override
                    .get(nic)
                    .copied()
                    .unwrap_or(f64::INFINITY);
                let bandwidth = hardware.min(configured);
                let delay = self.config.nic_delay_override.get(nic).copied().unwrap_or(0.0);

                let attrs = HashMap::from([
                    (LinkAttr::DatarateRx, bandwidth),
                    (LinkAttr::DatarateTx, bandwidth),
                    (LinkAttr::Delay, delay),
                ]);
                (nic.clone(), attrs)
            })
            .collect();

        // flatten into the demand history and average both windows
        let flat: HashMap<NetDemandKey, f64> = per_nic
            .into_iter()
            .flat_map(|(nic, loads)| {
                loads.into_iter().flat_map(move |((flow, service), (rx, tx))| {
                    [
                        (
                            (nic.clone(), flow.clone(), service.clone(), LinkAttr::DatarateRx),
                            rx,
                        ),
                        ((nic.clone(), flow, service, LinkAttr::DatarateTx), tx),
                    ]
                })
            })
            .collect();

        let (short_demand, long_demand) = {
            let mut demand = self.network_demand.lock().expect("demand lock poisoned");
            demand.update(now, flat);
            (
                nest_demand(demand.average(now, EstimationWindow::Short)),
                nest_demand(demand.average(now, EstimationWindow::Long)),
            )
        };

        (network_capacity, network_load, short_demand, long_demand)
    }
}

fn nest_demand(flat: HashMap<NetDemandKey, f64>) -> HashMap<String, Vec<FlowLoad>> {
    let mut grouped: HashMap<String, HashMap<(NetworkFlow, ServiceId), (f64, f64)>> =
        HashMap::new();
    for ((nic, flow, service, attr), value) in flat {
        let entry = grouped
            .entry(nic)
            .or_default()
            .entry((flow, service))
            .or_insert((0.0, 0.0));
        match attr {
            LinkAttr::DatarateRx => entry.0 = value,
            LinkAttr::DatarateTx => entry.1 = value,
            LinkAttr::Delay => {}
        }
    }

    grouped
        .into_iter()
        .map(|(nic, loads)| {
            let flows = loads
                .into_iter()
                .map(|((flow, service), (rx, tx))| FlowLoad {
                    flow,
                    service,
                    rx_mbps: rx,
                    tx_mbps: tx,
                })
                .collect();
            (nic, flows)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::{ImageManager, ImagePullConfig, LifecycleConfig};
    use crate::host::RoutingTable;
    use crate::lookup::{TableRegionLookup, TableServiceLookup};
    use crate::models::{RegionId, TrafficSample};
    use crate::runtime::{ContainerInspect, ContainerRuntime, ContainerSpec, RuntimeStatsSample};
    use crate::traffic::WellKnownPorts;
    use anyhow::Result;
    use async_trait::async_trait;

    struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
            Ok("id".to_string())
        }
        async fn start_container(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn stop_container(&self, _name: &str, _grace: Duration) -> Result<()> {
            Ok(())
        }
        async fn remove_container(&self, _name: &str) -> Result<()> {
            Ok(())
        }
        async fn container_logs(&self, _name: &str) -> Result<String> {
            Ok(String::new())
        }
        async fn inspect_container(&self, _name: &str) -> Result<ContainerInspect> {
            Ok(ContainerInspect::default())
        }
        async fn container_stats(&self, _name: &str, _nic: &str) -> Result<RuntimeStatsSample> {
            Ok(RuntimeStatsSample::default())
        }
        async fn pull_image(&self, _image: &str) -> Result<()> {
            Ok(())
        }
        async fn list_images(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    struct FixedTraffic {
        nic: String,
        frame: Option<Vec<TrafficSample>>,
    }

    impl TrafficSource for FixedTraffic {
        fn nic(&self) -> &str {
            &self.nic
        }
        fn nic_addr(&self) -> Option<std::net::IpAddr> {
            Some("10.0.0.1".parse().unwrap())
        }
        fn last_frame(&self) -> Option<Vec<TrafficSample>> {
            self.frame.clone()
        }
    }

    fn builder_with(
        traffic: Vec<Arc<dyn TrafficSource>>,
        skip_network_data: bool,
    ) -> ReportBuilder {
        let runtime = Arc::new(NullRuntime);
        let images = Arc::new(ImageManager::new(runtime.clone(), ImagePullConfig::default()));
        let lookup = Arc::new(TableServiceLookup::new());
        let manager = Arc::new(ContainerManager::new(
            runtime,
            images,
            lookup.clone(),
            LifecycleConfig::default(),
        ));

        let classifier = FlowClassifier::new(
            RegionId::new("here"),
            lookup,
            Arc::new(TableRegionLookup::default()),
            WellKnownPorts::default(),
        );

        let snapshot = ResourceSnapshot {
            timestamp_ms: 0,
            cpu_usage: 0.25,
            cpu_count: 4,
            memory_used_gb: 2.0,
            memory_capacity_gb: 16.0,
            nic_capacity_mbps: HashMap::from([("eth0".to_string(), 100.0)]),
        };
        let host = HostMonitorHandle::fixed(snapshot, RoutingTable::new());

        let mut config = ReportConfig::new(NodeId::new("nodeA"));
        config.skip_network_data = skip_network_data;
        config.cpu_capacity_override = Some(2.0);

        ReportBuilder::new(config, host, traffic, classifier, manager)
    }

    #[tokio::test]
    async fn test_compute_capacity_respects_override() {
        let builder = builder_with(vec![], true);
        builder.update_reports_at(1_000).await;

        let report = builder.current_report(EstimationWindow::Short);
        // 4 hardware CPUs capped to the configured 2
        assert!((report.compute_capacity[&NodeAttr::Cpu] - 2.0).abs() < 1e-9);
        assert!((report.compute_capacity[&NodeAttr::TaskContainers] - 2.0).abs() < 1e-9);
        assert!((report.compute_capacity[&NodeAttr::Memory] - 16.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_skip_network_data_leaves_sections_empty() {
        let source = Arc::new(FixedTraffic {
            nic: "eth0".to_string(),
            frame: Some(vec![TrafficSample {
                nic: "eth0".to_string(),
                local_ip: "10.0.0.1".to_string(),
                local_port: 53,
                remote_ip: "10.1.0.2".to_string(),
                remote_port: 55000,
                bits_sent_last_2s: 1000,
                bits_received_last_2s: 1000,
            }]),
        });
        let builder = builder_with(vec![source], true);
        builder.update_reports_at(1_000).await;

        let report = builder.current_report(EstimationWindow::Long);
        assert!(report.network_load.is_empty());
        assert!(report.network_capacity.is_empty());
        assert!(report.network_demand.is_empty());
    }

    #[tokio::test]
    async fn test_network_load_and_demand_published() {
        let source = Arc::new(FixedTraffic {
            nic: "eth0".to_string(),
            frame: Some(vec![TrafficSample {
                nic: "eth0".to_string(),
                local_ip: "10.0.0.1".to_string(),
                local_port: 53,
                remote_ip: "10.1.0.2".to_string(),
                remote_port: 55000,
                bits_sent_last_2s: 2_000_000,
                bits_received_last_2s: 1_000_000,
            }]),
        });
        let builder = builder_with(vec![source], false);
        builder.update_reports_at(1_000).await;

        let report = builder.current_report(EstimationWindow::Short);
        let flows = &report.network_load["eth0"];
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].service, ServiceId::Dns);
        assert!((flows[0].tx_mbps - 2.0).abs() < 1e-9);
        assert!((flows[0].rx_mbps - 1.0).abs() < 1e-9);

        // demand equals load after a single sample
        let demand = &report.network_demand["eth0"];
        assert_eq!(demand.len(), 1);
        assert!((demand[0].tx_mbps - 2.0).abs() < 1e-9);

        let capacity = &report.network_capacity["eth0"];
        assert!((capacity[&LinkAttr::DatarateRx] - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_nic_without_frame_still_reported() {
        let source = Arc::new(FixedTraffic {
            nic: "eth1".to_string(),
            frame: None,
        });
        let builder = builder_with(vec![source], false);
        builder.update_reports_at(1_000).await;

        let report = builder.current_report(EstimationWindow::Short);
        assert!(report.network_load.contains_key("eth1"));
        assert!(report.network_load["eth1"].is_empty());
    }
}
