//! Node resource agent daemon
//!
//! Runs on every node of the placement platform: samples host and
//! container resources, attributes network traffic to services, manages
//! service containers through the Docker API, and publishes short/long
//! resource reports for the placement layers.

use agent_lib::containers::{
    ContainerManager, ContainerSlot, ImageManager, ImagePullConfig, LifecycleConfig,
};
use agent_lib::health::{components, HealthRegistry};
use agent_lib::host::{
    discover_interfaces, interfaces_to_monitor, BridgeInfo, HostSampler, HostSamplerConfig,
    Ipv4Subnet,
};
use agent_lib::lookup::{RegionLookup, ServiceLookup, TableRegionLookup, TableServiceLookup};
use agent_lib::models::{NodeId, RegionId};
use agent_lib::report::{ReportBuilder, ReportConfig};
use agent_lib::runtime::{docker::DockerRuntime, ContainerRuntime};
use agent_lib::traffic::{
    FlowClassifier, NicSamplerHandle, TrafficSamplerConfig, TrafficSource, WellKnownPorts,
};
use anyhow::Result;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting node-resource-agent");

    let config = config::AgentConfig::load()?;
    info!(node_name = %config.node_name, region = %config.region, "Agent configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::HOST_SAMPLER).await;
    health_registry.register(components::TRAFFIC).await;
    health_registry.register(components::LIFECYCLE).await;
    health_registry.register(components::REPORT).await;

    let (shutdown_tx, _) = broadcast::channel(8);

    // collaborator lookups; a configured-but-missing file is fatal
    let services = Arc::new(match &config.service_map_path {
        Some(path) => TableServiceLookup::load(path).await?,
        None => {
            warn!("No service map configured, managed services will not be classified");
            TableServiceLookup::new()
        }
    });
    let regions: Arc<dyn RegionLookup> = Arc::new(match &config.region_map_path {
        Some(path) => TableRegionLookup::load(path).await?,
        None => TableRegionLookup::default(),
    });

    // host counter sampling
    let host_sampler = HostSampler::new(HostSamplerConfig {
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        ..Default::default()
    })
    .await?;
    let host_handle = host_sampler.handle();
    tokio::spawn(host_sampler.run(shutdown_tx.subscribe()));

    // per-NIC traffic samplers
    let mut traffic: Vec<Arc<dyn TrafficSource>> = Vec::new();
    if config.skip_network_data {
        info!("Network sampling disabled by configuration");
    } else {
        let excluded: Vec<Ipv4Subnet> = config
            .excluded_subnets
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e: anyhow::Error| e.context(format!("Invalid excluded subnet '{}'", s)))
            })
            .collect::<Result<_>>()?;

        let bridges = BridgeInfo::discover(Path::new("/sys/class/net")).await;
        let all_nics = discover_interfaces()?;
        let monitored = interfaces_to_monitor(&all_nics, &bridges, &excluded);
        info!(count = monitored.len(), "Monitoring network interfaces");

        let sampler_config = TrafficSamplerConfig::default();
        for nic in monitored {
            match NicSamplerHandle::spawn(
                &sampler_config,
                &nic.name,
                nic.ipv4.map(IpAddr::V4),
                shutdown_tx.subscribe(),
            ) {
                Ok(handle) => traffic.push(Arc::new(handle)),
                Err(e) => {
                    warn!(nic = %nic.name, error = %e, "Unable to start traffic sampler");
                    health_registry
                        .set_degraded(components::TRAFFIC, format!("sampler failed: {}", e))
                        .await;
                }
            }
        }
    }

    // container runtime, image registry, lifecycle manager
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect(&config.docker_socket)?);
    let images = Arc::new(ImageManager::new(
        Arc::clone(&runtime),
        ImagePullConfig {
            max_attempts: config.max_pull_attempts,
            min_backoff: Duration::from_secs(config.pull_min_backoff_secs),
            max_backoff: Duration::from_secs(config.pull_max_backoff_secs),
        },
    ));
    images.prime().await;

    let service_lookup: Arc<dyn ServiceLookup> = services;
    let manager = Arc::new(ContainerManager::new(
        runtime,
        images,
        Arc::clone(&service_lookup),
        LifecycleConfig {
            slots: config
                .container_slots
                .iter()
                .map(|slot| ContainerSlot {
                    id: NodeId::new(slot.name.clone()),
                    address: slot.address,
                })
                .collect(),
            max_service_containers: config.max_service_containers.unwrap_or(usize::MAX),
            registry_host: config.registry_host.clone(),
            registry_port: config.registry_port,
            data_root: config.data_root.clone(),
            service_data_root: config.service_data_root.clone(),
            short_window: Duration::from_secs(config.short_window_secs),
            long_window: Duration::from_secs(config.long_window_secs),
            use_failed_requests_in_demand: config.use_failed_requests_in_demand,
            ..Default::default()
        },
    ));

    // report generation tick
    let classifier = FlowClassifier::new(
        RegionId::new(config.region.clone()),
        service_lookup,
        regions,
        WellKnownPorts {
            placement_protocol: config.placement_port,
            ..Default::default()
        },
    );
    let report_config = ReportConfig {
        poll_interval: Duration::from_millis(config.poll_interval_ms),
        short_window: Duration::from_secs(config.short_window_secs),
        long_window: Duration::from_secs(config.long_window_secs),
        skip_network_data: config.skip_network_data,
        ..ReportConfig::new(NodeId::new(config.node_name.clone()))
    };
    let report_builder = Arc::new(ReportBuilder::new(
        report_config,
        host_handle,
        traffic,
        classifier,
        Arc::clone(&manager),
    ));
    tokio::spawn(Arc::clone(&report_builder).run(shutdown_tx.subscribe()));

    health_registry.set_ready(true).await;

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    tokio::spawn(api::serve(config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(());
    // stop every known container exactly once, best effort
    manager.stop_all().await;

    info!("Shutdown complete");
    Ok(())
}
