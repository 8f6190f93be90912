//! Host counter sampling
//!
//! Polls the kernel's counter files on a fixed interval and publishes
//! [`ResourceSnapshot`]s plus a freshly parsed [`RoutingTable`]. Capacity
//! values (CPU count, NIC link speeds) are read once at startup; usage
//! values are re-read every poll.

use super::routing::RoutingTable;
use crate::models::{kb_to_gb, ResourceSnapshot};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

/// Configuration for the host counter sampler.
#[derive(Debug, Clone)]
pub struct HostSamplerConfig {
    /// Root of the proc filesystem (overridable for tests).
    pub proc_root: PathBuf,
    /// Root of the sysfs network class directory.
    pub sys_class_net: PathBuf,
    /// Interval between counter polls.
    pub poll_interval: Duration,
}

impl Default for HostSamplerConfig {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sys_class_net: PathBuf::from("/sys/class/net"),
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Read-side handle to the sampler's published values.
#[derive(Clone)]
pub struct HostMonitorHandle {
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    routing: Arc<RwLock<RoutingTable>>,
}

impl HostMonitorHandle {
    /// Handle over fixed values; used in tests and wiring that runs
    /// without live host sampling.
    pub fn fixed(snapshot: ResourceSnapshot, routing: RoutingTable) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
            routing: Arc::new(RwLock::new(routing)),
        }
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.snapshot.read().await.clone()
    }

    pub async fn routing_table(&self) -> RoutingTable {
        self.routing.read().await.clone()
    }
}

/// Periodic sampler of host CPU, memory, and routing counters.
pub struct HostSampler {
    config: HostSamplerConfig,
    cpu_count: usize,
    nic_capacity_mbps: HashMap<String, f64>,
    // current and previous poll values
    cpu_running: [u64; 2],
    cpu_idle: [u64; 2],
    polls: u64,
    snapshot: Arc<RwLock<ResourceSnapshot>>,
    routing: Arc<RwLock<RoutingTable>>,
}

impl HostSampler {
    /// Create the sampler and read the one-time capacity values.
    pub async fn new(config: HostSamplerConfig) -> Result<Self> {
        let cpuinfo = fs::read_to_string(config.proc_root.join("cpuinfo"))
            .await
            .with_context(|| format!("Failed to read {}/cpuinfo", config.proc_root.display()))?;
        let cpu_count = parse_cpu_count(&cpuinfo);

        let nic_capacity_mbps = read_nic_capacities(&config.sys_class_net).await;
        info!(
            cpu_count,
            nics = nic_capacity_mbps.len(),
            "Host capacity discovered"
        );

        Ok(Self {
            config,
            cpu_count,
            nic_capacity_mbps,
            cpu_running: [0; 2],
            cpu_idle: [0; 2],
            polls: 0,
            snapshot: Arc::new(RwLock::new(ResourceSnapshot::empty())),
            routing: Arc::new(RwLock::new(RoutingTable::new())),
        })
    }

    pub fn handle(&self) -> HostMonitorHandle {
        HostMonitorHandle {
            snapshot: Arc::clone(&self.snapshot),
            routing: Arc::clone(&self.routing),
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    pub fn nic_capacity_mbps(&self) -> &HashMap<String, f64> {
        &self.nic_capacity_mbps
    }

    /// Run the polling loop until shutdown is signalled.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting host counter sampler"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down host counter sampler");
                    break;
                }
            }
        }
    }

    /// One polling pass: update usage counters and publish a new snapshot
    /// and routing table. I/O failures keep the previous published values.
    pub async fn poll_once(&mut self) {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();

        match fs::read_to_string(self.config.proc_root.join("stat")).await {
            Ok(content) => match parse_cpu_ticks(&content) {
                Some((running, idle)) => {
                    shift_into(&mut self.cpu_running, running);
                    shift_into(&mut self.cpu_idle, idle);
                    self.polls += 1;
                }
                None => error!("Unable to find cpu usage counters in stat file"),
            },
            Err(e) => error!(error = %e, "Failed to read cpu usage counters"),
        }

        let (memory_capacity_gb, memory_used_gb) =
            match fs::read_to_string(self.config.proc_root.join("meminfo")).await {
                Ok(content) => match parse_meminfo(&content) {
                    Some((total_kb, free_kb)) => {
                        (kb_to_gb(total_kb), kb_to_gb(total_kb - free_kb))
                    }
                    None => {
                        error!("Unable to find memory counters in meminfo file");
                        (0.0, 0.0)
                    }
                },
                Err(e) => {
                    error!(error = %e, "Failed to read memory counters");
                    (0.0, 0.0)
                }
            };

        let snapshot = ResourceSnapshot {
            timestamp_ms,
            cpu_usage: self.cpu_usage(),
            cpu_count: self.cpu_count,
            memory_used_gb,
            memory_capacity_gb,
            nic_capacity_mbps: self.nic_capacity_mbps.clone(),
        };
        *self.snapshot.write().await = snapshot;

        match fs::read_to_string(self.config.proc_root.join("net/route")).await {
            Ok(content) => match RoutingTable::parse(&content) {
                Ok(table) => {
                    debug!(routes = table.len(), "Updated routing table");
                    *self.routing.write().await = table;
                }
                Err(e) => error!(error = %e, "Failed to parse routing table"),
            },
            Err(e) => error!(error = %e, "Failed to read routing table"),
        }
    }

    /// CPU usage over the two most recent polls; NaN until two polls have
    /// completed or when the counters did not advance.
    fn cpu_usage(&self) -> f64 {
        if self.polls < 2 {
            return f64::NAN;
        }

        let delta_running = self.cpu_running[0].saturating_sub(self.cpu_running[1]);
        let delta_total = (self.cpu_running[0] + self.cpu_idle[0])
            .saturating_sub(self.cpu_running[1] + self.cpu_idle[1]);

        if delta_total == 0 {
            return f64::NAN;
        }
        delta_running as f64 / delta_total as f64
    }
}

/// `(running, idle)` tick counters from the aggregate cpu line of a stat
/// file. Running covers user, nice, system, iowait, irq, and softirq.
pub fn parse_cpu_ticks(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    let parse = |s: &str| s.parse::<u64>().ok();
    let user = parse(fields[1])?;
    let nice = parse(fields[2])?;
    let system = parse(fields[3])?;
    let idle = parse(fields[4])?;
    let iowait = parse(fields[5])?;
    let irq = parse(fields[6])?;
    let softirq = parse(fields[7])?;

    let running = user + nice + system + iowait + irq + softirq;
    Some((running, idle))
}

/// Count of `processor` entries in a cpuinfo file.
pub fn parse_cpu_count(content: &str) -> usize {
    content
        .lines()
        .filter(|line| line.starts_with("processor"))
        .count()
}

/// `(MemTotal, MemFree)` in kB; `None` when either line is missing or not
/// reported in kB.
pub fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let value_of = |label: &str| -> Option<u64> {
        let line = content.lines().find(|line| line.starts_with(label))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            return None;
        }
        if fields[2] != "kB" {
            error!(unit = %fields[2], "Memory units 'kB' expected");
            return None;
        }
        fields[1].parse().ok()
    };

    Some((value_of("MemTotal")?, value_of("MemFree")?))
}

/// Link speed in Mbit/s for every NIC with a readable speed file.
async fn read_nic_capacities(sys_class_net: &std::path::Path) -> HashMap<String, f64> {
    let mut capacities = HashMap::new();

    let mut entries = match fs::read_dir(sys_class_net).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %sys_class_net.display(), error = %e, "Unable to list network interfaces");
            return capacities;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let nic = entry.file_name().to_string_lossy().to_string();
        let speed_file = entry.path().join("speed");

        match fs::read_to_string(&speed_file).await {
            Ok(content) => match content.trim().parse::<i64>() {
                // virtual interfaces report -1
                Ok(speed) if speed > 0 => {
                    capacities.insert(nic, speed as f64);
                }
                Ok(_) => debug!(nic = %nic, "Interface reports no link speed"),
                Err(e) => debug!(nic = %nic, error = %e, "Unparseable speed file"),
            },
            Err(e) => debug!(nic = %nic, error = %e, "No readable speed file"),
        }
    }

    capacities
}

fn shift_into(ring: &mut [u64; 2], value: u64) {
    ring[1] = ring[0];
    ring[0] = value;
}
