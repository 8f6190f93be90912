//! Container lifecycle management
//!
//! Starts, stops, and tracks the service containers on this node. Start
//! goes through the image registry (blocking until the image is local),
//! allocates a (name, address) slot from the configured pool, creates and
//! starts the container with bounded retries, and rolls back the created
//! container when starting ultimately fails. Allocated capacity is
//! tracked for overload-factor computation.

use super::handle::{ContainerHandle, ContainerHandleParams};
use super::images::ImageManager;
use crate::lookup::ServiceLookup;
use crate::models::{LinkAttr, NodeAttr, NodeId, ServiceId};
use crate::runtime::{ContainerRuntime, ContainerSpec};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Failure classes surfaced by the lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("no image known for service '{0}'")]
    UnknownService(ServiceId),
    #[error("image '{0}' could not be fetched")]
    ImageUnavailable(String),
    #[error("no available container slot")]
    NoAvailableSlot,
    #[error("container '{name}' failed to start after {attempts} attempts")]
    StartFailed { name: String, attempts: u32 },
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// A (name, address) pair available for running one container.
#[derive(Debug, Clone)]
pub struct ContainerSlot {
    pub id: NodeId,
    pub address: Ipv4Addr,
}

/// Configuration for the container lifecycle manager.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Pool of container names and addresses this node may use.
    pub slots: Vec<ContainerSlot>,
    /// Cap on simultaneously running service containers; the slot pool is
    /// truncated to this.
    pub max_service_containers: usize,
    pub registry_host: String,
    pub registry_port: u16,
    pub default_cpus: f64,
    pub default_memory_gb: f64,
    /// Runtime network containers attach to.
    pub network_name: String,
    /// NIC name inside the container used for stats counters.
    pub container_nic: String,
    /// Host interface that container traffic is attributed to.
    pub container_host_nic: String,
    /// Base directory for per-instance container data on the host.
    pub data_root: PathBuf,
    /// Base directory for shared per-service data on the host.
    pub service_data_root: PathBuf,
    pub stop_grace: Duration,
    pub start_attempts: u32,
    pub start_retry_min: Duration,
    pub start_retry_max: Duration,
    pub stats_interval: Duration,
    pub short_window: Duration,
    pub long_window: Duration,
    pub use_failed_requests_in_demand: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            max_service_containers: usize::MAX,
            registry_host: "localhost".to_string(),
            registry_port: 5000,
            default_cpus: 1.0,
            default_memory_gb: 4.0,
            network_name: "shared_nw".to_string(),
            container_nic: "eth0".to_string(),
            container_host_nic: "docker0".to_string(),
            data_root: PathBuf::from("/var/lib/agent/container_data"),
            service_data_root: PathBuf::from("/var/lib/agent/service_data"),
            stop_grace: Duration::from_secs(120),
            start_attempts: 3,
            start_retry_min: Duration::from_millis(20),
            start_retry_max: Duration::from_millis(100),
            stats_interval: Duration::from_secs(2),
            short_window: Duration::from_secs(10),
            long_window: Duration::from_secs(60),
            use_failed_requests_in_demand: false,
        }
    }
}

/// Requested capacity for a new container.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerParams {
    pub compute_capacity: HashMap<NodeAttr, f64>,
    pub network_capacity: HashMap<LinkAttr, f64>,
}

/// Owner of all running containers on this node.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<ImageManager>,
    service_lookup: Arc<dyn ServiceLookup>,
    config: LifecycleConfig,
    slots: Vec<ContainerSlot>,
    containers: DashMap<NodeId, Arc<ContainerHandle>>,
    allocated: DashMap<NodeId, HashMap<NodeAttr, f64>>,
    /// Slots handed out but not yet visible in `containers`.
    reserved: Mutex<HashSet<NodeId>>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        images: Arc<ImageManager>,
        service_lookup: Arc<dyn ServiceLookup>,
        config: LifecycleConfig,
    ) -> Self {
        let mut slots = config.slots.clone();
        if slots.len() > config.max_service_containers {
            info!(
                configured = slots.len(),
                limit = config.max_service_containers,
                "Limiting container slots to the configured maximum"
            );
            slots.truncate(config.max_service_containers);
        }

        Self {
            runtime,
            images,
            service_lookup,
            config,
            slots,
            containers: DashMap::new(),
            allocated: DashMap::new(),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    pub fn max_containers(&self) -> usize {
        self.slots.len()
    }

    pub fn running_count(&self) -> usize {
        self.containers.len()
    }

    pub fn running(&self) -> Vec<Arc<ContainerHandle>> {
        self.containers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn container(&self, id: &NodeId) -> Option<Arc<ContainerHandle>> {
        self.containers.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Full registry-qualified image reference for a service.
    fn image_for_service(&self, service: &ServiceId) -> Result<String, LifecycleError> {
        let spec = self
            .service_lookup
            .spec_for_service(service)
            .ok_or_else(|| LifecycleError::UnknownService(service.clone()))?;
        let image = spec
            .image
            .filter(|image| !image.is_empty())
            .ok_or_else(|| LifecycleError::UnknownService(service.clone()))?;

        Ok(format!(
            "{}:{}/{}",
            self.config.registry_host,
            self.config.registry_port,
            image.trim_start_matches('/')
        ))
    }

    /// Schedule an image fetch for a service without waiting on it.
    pub async fn fetch_image(&self, service: &ServiceId) -> Result<(), LifecycleError> {
        let image = self.image_for_service(service)?;
        self.images.fetch(&image).await;
        Ok(())
    }

    /// Block until the image for a service is local; false when the fetch
    /// failed terminally.
    pub async fn wait_for_image(&self, service: &ServiceId) -> Result<bool, LifecycleError> {
        let image = self.image_for_service(service)?;
        Ok(self.images.wait_for(&image).await)
    }

    fn reserve_slot(&self) -> Result<ContainerSlot, LifecycleError> {
        let mut reserved = self.reserved.lock().expect("slot lock poisoned");
        let slot = self
            .slots
            .iter()
            .find(|slot| !self.containers.contains_key(&slot.id) && !reserved.contains(&slot.id))
            .cloned()
            .ok_or(LifecycleError::NoAvailableSlot)?;
        reserved.insert(slot.id.clone());
        Ok(slot)
    }

    fn release_slot(&self, id: &NodeId) {
        self.reserved
            .lock()
            .expect("slot lock poisoned")
            .remove(id);
    }

    /// Start a container running `service`.
    ///
    /// Waits for the image, allocates a slot, creates per-instance host
    /// directories, creates the container, and retries the runtime start
    /// call a bounded number of times. A container that was created but
    /// never started is removed before the failure is reported.
    pub async fn start_service(
        &self,
        service: &ServiceId,
        params: &ContainerParams,
    ) -> Result<NodeId, LifecycleError> {
        info!(service = %service, "Start service");

        let image = self.image_for_service(service)?;
        if !self.images.wait_for(&image).await {
            warn!(service = %service, image = %image, "Image fetch failed");
            return Err(LifecycleError::ImageUnavailable(image));
        }

        let slot = self.reserve_slot()?;
        let container_name = slot.id.name().to_string();
        info!(container = %container_name, address = %slot.address, "Obtained container slot");

        match self.start_in_slot(service, params, &slot, &image).await {
            Ok(handle) => {
                self.allocated
                    .insert(slot.id.clone(), allocation_for(params, &self.config));
                self.containers.insert(slot.id.clone(), Arc::clone(&handle));
                self.release_slot(&slot.id);

                handle.spawn_stats_task(
                    Arc::clone(&self.runtime),
                    self.config.container_nic.clone(),
                    self.config.stats_interval,
                );

                info!(service = %service, container = %slot.id, "Started container for service");
                Ok(slot.id)
            }
            Err(e) => {
                self.release_slot(&slot.id);
                Err(e)
            }
        }
    }

    async fn start_in_slot(
        &self,
        service: &ServiceId,
        params: &ContainerParams,
        slot: &ContainerSlot,
        image: &str,
    ) -> Result<Arc<ContainerHandle>, LifecycleError> {
        let container_name = slot.id.name();

        let cpus = params
            .compute_capacity
            .get(&NodeAttr::Cpu)
            .copied()
            .unwrap_or(self.config.default_cpus);
        let memory_gb = params
            .compute_capacity
            .get(&NodeAttr::Memory)
            .copied()
            .unwrap_or(self.config.default_memory_gb);
        let memory_bytes = (memory_gb * 1024.0 * 1024.0 * 1024.0).round() as u64;

        let service_dir_name = service.to_string().replace('/', "_");
        let service_data_dir = self.config.service_data_root.join(&service_dir_name);
        let instance_dir = self
            .config
            .data_root
            .join(&service_dir_name)
            .join(container_name)
            .join(chrono::Utc::now().format("%Y%m%d_%H%M%S%3f").to_string());
        let metrics_dir = instance_dir.join("app_metrics_data");
        let instance_data_dir = instance_dir.join("container_data");

        for dir in [&service_data_dir, &metrics_dir, &instance_data_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| LifecycleError::Runtime(e.into()))?;
        }
        write_instance_metadata(&instance_data_dir, service, params).await;

        let mounts = vec![
            (service_data_dir, PathBuf::from("/service_data")),
            (metrics_dir.clone(), PathBuf::from("/app_metrics_data")),
            (instance_data_dir, PathBuf::from("/container_data")),
        ];

        let spec = ContainerSpec {
            name: container_name.to_string(),
            image: image.to_string(),
            cpus,
            memory_bytes,
            network: Some(self.config.network_name.clone()),
            ipv4_address: Some(slot.address.to_string()),
            mounts: mounts.clone(),
            environment: HashMap::new(),
        };

        let container_id = self.runtime.create_container(&spec).await?;

        let mut started = false;
        for attempt in 0..self.config.start_attempts {
            match self.runtime.start_container(&container_id).await {
                Ok(()) => {
                    info!(container = %container_name, attempt, "Container started");
                    started = true;
                    break;
                }
                Err(e) => {
                    warn!(container = %container_name, attempt, error = %e, "Start attempt failed");
                    if attempt + 1 < self.config.start_attempts {
                        tokio::time::sleep(self.start_retry_delay()).await;
                    }
                }
            }
        }

        if !started {
            error!(
                container = %container_name,
                attempts = self.config.start_attempts,
                "All start attempts failed, removing created container"
            );
            if let Err(e) = self.runtime.remove_container(container_name).await {
                warn!(container = %container_name, error = %e, "Rollback remove failed");
            }
            return Err(LifecycleError::StartFailed {
                name: container_name.to_string(),
                attempts: self.config.start_attempts,
            });
        }

        Ok(Arc::new(ContainerHandle::new(ContainerHandleParams {
            id: slot.id.clone(),
            service: service.clone(),
            nic_name: self.config.container_host_nic.clone(),
            network_capacity: params.network_capacity.clone(),
            mounts,
            output_dir: instance_dir,
            metrics_dir,
            short_window: self.config.short_window,
            long_window: self.config.long_window,
            use_failed_requests_in_demand: self.config.use_failed_requests_in_demand,
        })))
    }

    fn start_retry_delay(&self) -> Duration {
        let min = self.config.start_retry_min.as_millis() as u64;
        let max = self.config.start_retry_max.as_millis() as u64;
        if max <= min {
            return self.config.start_retry_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Stop and remove a container. Returns whether the container is gone;
    /// a container someone else already removed counts as stopped.
    pub async fn stop_service(&self, id: &NodeId) -> bool {
        let Some(handle) = self.container(id) else {
            warn!(container = %id, "Attempting to stop a container that is not running");
            return true;
        };

        handle.begin_stop();

        if let Err(e) = self
            .runtime
            .stop_container(id.name(), self.config.stop_grace)
            .await
        {
            error!(container = %id, error = %e, "Failed to stop container");
            return false;
        }

        // grab the logs before the container is removed, best effort
        match self.runtime.container_logs(id.name()).await {
            Ok(logs) => {
                let log_path = handle.output_dir().join("logs.txt");
                if let Err(e) = tokio::fs::write(&log_path, logs).await {
                    warn!(container = %id, error = %e, "Unable to write container logs");
                } else {
                    info!(container = %id, path = %log_path.display(), "Wrote container logs");
                }
            }
            Err(e) => {
                warn!(container = %id, error = %e, "Trouble getting container logs, continuing with remove");
            }
        }

        if let Err(e) = self.runtime.remove_container(id.name()).await {
            error!(container = %id, error = %e, "Error removing container");
            return false;
        }

        self.containers.remove(id);
        self.allocated.remove(id);
        true
    }

    /// Stop every known container exactly once, best effort. One failing
    /// stop never blocks the others.
    pub async fn stop_all(&self) {
        info!("Stopping all containers");
        let ids: Vec<NodeId> = self.containers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if !self.stop_service(&id).await {
                warn!(container = %id, "Failed to stop container during shutdown");
            }
        }
        info!("Finished stopping all containers");
    }

    /// Sum of the capacity allocated to running containers.
    pub fn allocated_compute_capacity(&self) -> HashMap<NodeAttr, f64> {
        let mut total: HashMap<NodeAttr, f64> = HashMap::new();
        for entry in self.allocated.iter() {
            for (attr, value) in entry.value() {
                *total.entry(*attr).or_insert(0.0) += value;
            }
        }
        total
    }

    /// CPU overload factor given the physical CPU count.
    pub fn cpu_overload_factor(&self, physical_cpus: f64) -> f64 {
        let allocated = self
            .allocated_compute_capacity()
            .get(&NodeAttr::Cpu)
            .copied()
            .unwrap_or(0.0);
        overload_factor(allocated, physical_cpus)
    }

    /// Memory overload factor given the physical memory in GB.
    pub fn memory_overload_factor(&self, physical_memory_gb: f64) -> f64 {
        let allocated = self
            .allocated_compute_capacity()
            .get(&NodeAttr::Memory)
            .copied()
            .unwrap_or(0.0);
        overload_factor(allocated, physical_memory_gb)
    }
}

/// `allocated / physical` when allocation exceeds the physical capacity,
/// otherwise 1. Virtual capacity beyond the hardware cannot all be busy at
/// once, so raw usage is scaled up by this factor before reporting.
pub fn overload_factor(allocated: f64, physical: f64) -> f64 {
    if physical <= 0.0 || allocated <= physical {
        1.0
    } else {
        allocated / physical
    }
}

fn allocation_for(params: &ContainerParams, config: &LifecycleConfig) -> HashMap<NodeAttr, f64> {
    let mut allocation = params.compute_capacity.clone();
    allocation
        .entry(NodeAttr::Cpu)
        .or_insert(config.default_cpus);
    allocation
        .entry(NodeAttr::Memory)
        .or_insert(config.default_memory_gb);
    allocation
}

async fn write_instance_metadata(
    instance_data_dir: &std::path::Path,
    service: &ServiceId,
    params: &ContainerParams,
) {
    let service_json = serde_json::to_string_pretty(service).unwrap_or_default();
    if let Err(e) = tokio::fs::write(instance_data_dir.join("service.json"), service_json).await {
        error!(error = %e, "Error writing container service information");
    }

    let params_json = serde_json::to_string_pretty(params).unwrap_or_default();
    if let Err(e) = tokio::fs::write(instance_data_dir.join("parameters.json"), params_json).await {
        error!(error = %e, "Error writing container parameter information");
    }
}
