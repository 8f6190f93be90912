//! Per-container state and report generation
//!
//! A [`ContainerHandle`] owns everything the agent knows about one running
//! container: the latest runtime stats, the service status state machine,
//! the metrics-file tailers, the compute demand history, and the current
//! short/long report pair. The lifecycle manager owns the handles; the
//! report builder only reads them.

use crate::appmetrics::{
    ConnectionCountTailer, FailedRequest, FailedRequestTailer, LatencyTailer,
};
use crate::demand::DemandTracker;
use crate::models::{
    bytes_to_gb, ContainerResourceReport, ContainerStats, EstimationWindow, LinkAttr, NodeAttr,
    NodeId, ServiceId, ServiceStatus,
};
use crate::runtime::{ContainerRuntime, RuntimeStatsSample};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Construction parameters for a container handle.
pub struct ContainerHandleParams {
    pub id: NodeId,
    pub service: ServiceId,
    /// Host interface that this container's traffic is attributed to.
    pub nic_name: String,
    pub network_capacity: HashMap<LinkAttr, f64>,
    /// Host path to container path bind mounts.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Where container outputs (logs) are written on stop.
    pub output_dir: PathBuf,
    /// Host side of the mounted app metrics directory.
    pub metrics_dir: PathBuf,
    pub short_window: Duration,
    pub long_window: Duration,
    pub use_failed_requests_in_demand: bool,
}

struct HandleState {
    status: ServiceStatus,
    latest_stats: ContainerStats,
    demand: DemandTracker<(NodeId, NodeAttr)>,
    short_report: ContainerResourceReport,
    long_report: ContainerResourceReport,
}

/// State for one container managed by this agent.
pub struct ContainerHandle {
    id: NodeId,
    service: ServiceId,
    nic_name: String,
    network_capacity: HashMap<LinkAttr, f64>,
    mounts: Vec<(PathBuf, PathBuf)>,
    output_dir: PathBuf,
    use_failed_requests_in_demand: bool,
    state: Mutex<HandleState>,
    latency: LatencyTailer,
    connections: ConnectionCountTailer,
    failed_requests: FailedRequestTailer,
    failed_rx: Mutex<mpsc::UnboundedReceiver<FailedRequest>>,
    stats_done: Arc<AtomicBool>,
}

impl ContainerHandle {
    pub fn new(params: ContainerHandleParams) -> Self {
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();

        let latency = LatencyTailer::spawn(&params.metrics_dir);
        let connections = ConnectionCountTailer::spawn(&params.metrics_dir);
        let failed_requests = FailedRequestTailer::spawn(&params.metrics_dir, failed_tx);

        info!(container = %params.id, service = %params.service, "Constructing container handle");

        Self {
            state: Mutex::new(HandleState {
                status: ServiceStatus::Starting,
                latest_stats: ContainerStats::default(),
                demand: DemandTracker::new(params.short_window, params.long_window),
                short_report: ContainerResourceReport::null_report(
                    params.id.clone(),
                    params.service.clone(),
                    EstimationWindow::Short,
                ),
                long_report: ContainerResourceReport::null_report(
                    params.id.clone(),
                    params.service.clone(),
                    EstimationWindow::Long,
                ),
            }),
            id: params.id,
            service: params.service,
            nic_name: params.nic_name,
            network_capacity: params.network_capacity,
            mounts: params.mounts,
            output_dir: params.output_dir,
            use_failed_requests_in_demand: params.use_failed_requests_in_demand,
            latency,
            connections,
            failed_requests,
            failed_rx: Mutex::new(failed_rx),
            stats_done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn nic_name(&self) -> &str {
        &self.nic_name
    }

    pub fn network_capacity(&self) -> &HashMap<LinkAttr, f64> {
        &self.network_capacity
    }

    pub fn mounts(&self) -> &[(PathBuf, PathBuf)] {
        &self.mounts
    }

    pub fn output_dir(&self) -> &PathBuf {
        &self.output_dir
    }

    pub fn status(&self) -> ServiceStatus {
        self.state.lock().expect("state lock poisoned").status
    }

    fn set_status(&self, state: &mut HandleState, status: ServiceStatus) {
        state.status = status;
        info!(container = %self.id, ?status, "Set service status");
    }

    /// Move to STOPPING if the container was starting or running, and stop
    /// the metrics tailers.
    pub fn begin_stop(&self) {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            if matches!(state.status, ServiceStatus::Starting | ServiceStatus::Running) {
                self.set_status(&mut state, ServiceStatus::Stopping);
            }
        }
        self.latency.stop();
        self.connections.stop();
        self.failed_requests.stop();
        self.stats_done.store(true, Ordering::Relaxed);
    }

    /// Ingest a stats sample and drive the status state machine from the
    /// runtime-reported status string. Unrecognized strings move the
    /// container to UNKNOWN; they are logged, never fatal.
    pub fn apply_stats(&self, stats: ContainerStats) {
        let mut state = self.state.lock().expect("state lock poisoned");

        if let Some(status) = stats.status.as_deref() {
            match status {
                "running" => {
                    if matches!(
                        state.status,
                        ServiceStatus::Stopped | ServiceStatus::Starting | ServiceStatus::Unknown
                    ) {
                        self.set_status(&mut state, ServiceStatus::Running);
                    }
                }
                "created" | "exited" | "removing" => {
                    if matches!(
                        state.status,
                        ServiceStatus::Running | ServiceStatus::Stopping | ServiceStatus::Unknown
                    ) {
                        self.set_status(&mut state, ServiceStatus::Stopped);
                    }
                }
                other => {
                    error!(
                        container = %self.id,
                        status = %other,
                        "Unknown container status string, treating as UNKNOWN"
                    );
                    self.set_status(&mut state, ServiceStatus::Unknown);
                }
            }
        }

        state.latest_stats = stats;
    }

    /// Capacity of this container from the runtime-reported limits.
    pub fn compute_capacity(&self) -> HashMap<NodeAttr, f64> {
        let state = self.state.lock().expect("state lock poisoned");
        Self::capacity_from(&state.latest_stats)
    }

    fn capacity_from(stats: &ContainerStats) -> HashMap<NodeAttr, f64> {
        let mut capacity = HashMap::new();
        if let Some(cpus) = stats.cpu_capacity {
            capacity.insert(NodeAttr::Cpu, cpus);
            capacity.insert(NodeAttr::TaskContainers, cpus);
        }
        if let Some(memory) = stats.memory_capacity_bytes {
            capacity.insert(NodeAttr::Memory, bytes_to_gb(memory));
        }
        capacity
    }

    fn compute_load(
        &self,
        state: &HandleState,
        cpu_overload: f64,
        memory_overload: f64,
    ) -> HashMap<NodeId, HashMap<NodeAttr, f64>> {
        let mut load = HashMap::new();

        let stats = &state.latest_stats;
        if let Some(cpu) = stats.cpu_usage {
            if !cpu.is_nan() {
                let scaled = cpu_overload * cpu;
                load.insert(NodeAttr::Cpu, scaled);
                load.insert(NodeAttr::TaskContainers, scaled);
            }
        }

        load.insert(
            NodeAttr::Memory,
            memory_overload * bytes_to_gb(stats.memory_usage_bytes),
        );
        load.insert(NodeAttr::QueueLength, self.connections.current_count());

        // client attribution is not available from the runtime stats
        HashMap::from([(NodeId::unknown(), load)])
    }

    /// Rebuild the short and long reports from the latest stats. Both are
    /// built from the same snapshot so one tick is internally consistent.
    pub fn update_reports(&self, now: i64, cpu_overload: f64, memory_overload: f64) {
        let mut state = self.state.lock().expect("state lock poisoned");

        let capacity = Self::capacity_from(&state.latest_stats);
        let average_processing_time = self.latency.average_processing_time();
        let mut load = self.compute_load(&state, cpu_overload, memory_overload);

        {
            let mut failed_rx = self.failed_rx.lock().expect("failed rx lock poisoned");
            while let Ok(request) = failed_rx.try_recv() {
                if !self.use_failed_requests_in_demand {
                    continue;
                }
                debug!(container = %self.id, source = %request.source, "Folding failed request into demand");
                let unknown = load.entry(NodeId::unknown()).or_default();
                for (attr, value) in request.server_load {
                    *unknown.entry(attr).or_insert(0.0) += value;
                }
            }
        }

        let flat: HashMap<(NodeId, NodeAttr), f64> = load
            .iter()
            .flat_map(|(node, attrs)| {
                attrs
                    .iter()
                    .map(|(attr, value)| ((node.clone(), *attr), *value))
            })
            .collect();
        state.demand.update(now, flat);

        let unflatten = |flat: HashMap<(NodeId, NodeAttr), f64>| {
            let mut nested: HashMap<NodeId, HashMap<NodeAttr, f64>> = HashMap::new();
            for ((node, attr), value) in flat {
                nested.entry(node).or_default().insert(attr, value);
            }
            nested
        };
        let short_demand = unflatten(state.demand.average(now, EstimationWindow::Short));
        let long_demand = unflatten(state.demand.average(now, EstimationWindow::Long));

        state.short_report = ContainerResourceReport {
            container: self.id.clone(),
            timestamp_ms: now,
            service: self.service.clone(),
            status: state.status,
            window: EstimationWindow::Short,
            compute_capacity: capacity.clone(),
            compute_load: load.clone(),
            compute_demand: short_demand,
            average_processing_time,
        };
        state.long_report = ContainerResourceReport {
            container: self.id.clone(),
            timestamp_ms: now,
            service: self.service.clone(),
            status: state.status,
            window: EstimationWindow::Long,
            compute_capacity: capacity,
            compute_load: load,
            compute_demand: long_demand,
            average_processing_time,
        };
    }

    pub fn report(&self, window: EstimationWindow) -> ContainerResourceReport {
        let state = self.state.lock().expect("state lock poisoned");
        match window {
            EstimationWindow::Short => state.short_report.clone(),
            EstimationWindow::Long => state.long_report.clone(),
        }
    }

    /// Spawn the long-lived task that polls the runtime for this
    /// container's stats. Poll failures are transient and retried on the
    /// next tick.
    pub fn spawn_stats_task(
        self: Arc<Self>,
        runtime: Arc<dyn ContainerRuntime>,
        container_nic: String,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let done = Arc::clone(&self.stats_done);
        let handle = self;

        tokio::spawn(async move {
            // first sample after one full interval
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            let mut prev_rx_bytes: u64 = 0;
            let mut prev_tx_bytes: u64 = 0;

            loop {
                ticker.tick().await;
                if done.load(Ordering::Relaxed) {
                    debug!(container = %handle.id, "Stats task stopping");
                    break;
                }

                let name = handle.id.name();
                let sample = match runtime.container_stats(name, &container_nic).await {
                    Ok(sample) => sample,
                    Err(e) => {
                        debug!(container = %name, error = %e, "Failed to sample container stats");
                        continue;
                    }
                };
                let inspect = match runtime.inspect_container(name).await {
                    Ok(inspect) => inspect,
                    Err(e) => {
                        debug!(container = %name, error = %e, "Failed to inspect container");
                        continue;
                    }
                };

                let (rx_delta, tx_delta) = match (sample.rx_bytes, sample.tx_bytes) {
                    (Some(rx), Some(tx)) => {
                        let deltas = (
                            Some(rx.saturating_sub(prev_rx_bytes)),
                            Some(tx.saturating_sub(prev_tx_bytes)),
                        );
                        prev_rx_bytes = rx;
                        prev_tx_bytes = tx;
                        deltas
                    }
                    _ => (None, None),
                };

                handle.apply_stats(ContainerStats {
                    cpu_usage: cpu_usage_from_counters(&sample),
                    memory_usage_bytes: sample.memory_usage_bytes.unwrap_or(0),
                    cpu_capacity: inspect.cpu_limit,
                    memory_capacity_bytes: inspect.memory_limit_bytes,
                    status: inspect.status,
                    rx_bytes_delta: rx_delta,
                    tx_bytes_delta: tx_delta,
                });
            }
        })
    }
}

/// Busy host CPUs from the runtime's cumulative counters.
///
/// `(Δtotal / Δsystem) * online_cpus`: a container given 0.5 CPUs that is
/// fully busy yields 0.5, consistent with the reported CPU capacity.
/// Returns `None` when any counter is missing and 0 (with a warning) when
/// the division produced an infinity.
pub fn cpu_usage_from_counters(sample: &RuntimeStatsSample) -> Option<f64> {
    let (total, pre_total, system, pre_system, online) = match (
        sample.cpu_total_usage,
        sample.precpu_total_usage,
        sample.system_cpu_usage,
        sample.presystem_cpu_usage,
        sample.online_cpus,
    ) {
        (Some(a), Some(b), Some(c), Some(d), Some(e)) => (a, b, c, d, e),
        _ => {
            warn!("Missing counters, unable to compute CPU usage");
            return None;
        }
    };

    let cpu_delta = total as f64 - pre_total as f64;
    let system_delta = system as f64 - pre_system as f64;
    let cpus = (cpu_delta / system_delta) * online as f64;

    if cpus.is_infinite() {
        warn!(total, pre_total, system, pre_system, "Infinite CPU load computed, reporting 0");
        Some(0.0)
    } else {
        if cpus.is_nan() {
            error!(total, pre_total, system, pre_system, "NaN CPU load computed");
        }
        Some(cpus)
    }
}
