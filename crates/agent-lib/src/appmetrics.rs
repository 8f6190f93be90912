//! Tailers for the per-container application metrics files
//!
//! Monitored services append CSV rows to files in their mounted metrics
//! directory. Each tailer waits for its file to appear, then follows it
//! with continuation reads (tail -f semantics), publishing the derived
//! value. Malformed rows are logged and skipped, never fatal.

use crate::models::{LinkAttr, NodeAttr, NodeId};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

pub const LATENCY_FILENAME: &str = "processing_latency.csv";
pub const ACTIVE_CONNECTIONS_FILENAME: &str = "active_connections.csv";
pub const FAILED_REQUESTS_FILENAME: &str = "failed_requests.csv";

const LATENCY_COLUMN: &str = "latency";
const ACTIVE_CONNECTION_COUNT_COLUMN: &str = "active_connection_count";
const FAILED_SOURCE_IP_COLUMN: &str = "source ip";
const FAILED_SERVER_END_TIME_COLUMN: &str = "server end time";
const FAILED_SERVER_LOAD_COLUMN: &str = "server load";
const FAILED_NETWORK_END_TIME_COLUMN: &str = "network end time";
const FAILED_NETWORK_LOAD_COLUMN: &str = "network load";

/// Rolling window of latency values that feed the average.
const LATENCY_WINDOW: usize = 20;

const WAIT_FOR_FILE_POLL: Duration = Duration::from_secs(1);

/// Follow a headered CSV file, invoking `handle_record` for every complete
/// data row. Returns when the done flag is set.
async fn tail_csv<F>(path: PathBuf, done: Arc<AtomicBool>, mut handle_record: F)
where
    F: FnMut(&HashMap<String, String>) + Send,
{
    while !done.load(Ordering::Relaxed) && !path.exists() {
        debug!(path = %path.display(), "Waiting for metrics file to appear");
        tokio::time::sleep(WAIT_FOR_FILE_POLL).await;
    }
    if done.load(Ordering::Relaxed) {
        return;
    }

    debug!(path = %path.display(), "Metrics file found, opening");
    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to open metrics file");
            return;
        }
    };
    let mut reader = BufReader::new(file);

    let mut header: Option<Vec<String>> = None;
    let mut pending = String::new();

    loop {
        match reader.read_line(&mut pending).await {
            Ok(0) => {
                if done.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(WAIT_FOR_FILE_POLL).await;
            }
            Ok(_) => {
                if !pending.ends_with('\n') {
                    // partial row; keep reading until the newline arrives
                    continue;
                }
                let line = pending.trim_end().to_string();
                pending.clear();
                if line.is_empty() {
                    continue;
                }

                let fields: Vec<String> =
                    line.split(',').map(|f| f.trim().to_string()).collect();
                match &header {
                    None => header = Some(fields),
                    Some(columns) => {
                        if fields.len() < columns.len() {
                            warn!(line = %line, "Malformed metrics row, skipping");
                            continue;
                        }
                        let record: HashMap<String, String> = columns
                            .iter()
                            .cloned()
                            .zip(fields.into_iter())
                            .collect();
                        trace!(?record, "Read metrics record");
                        handle_record(&record);
                    }
                }
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Error reading metrics file, exiting");
                return;
            }
        }
    }
}

/// Rolling average of the service's request processing times.
pub struct LatencyTailer {
    value: Arc<Mutex<f64>>,
    done: Arc<AtomicBool>,
    _task: tokio::task::JoinHandle<()>,
}

impl LatencyTailer {
    pub fn spawn(metrics_dir: &Path) -> Self {
        let path = metrics_dir.join(LATENCY_FILENAME);
        let value = Arc::new(Mutex::new(f64::NAN));
        let done = Arc::new(AtomicBool::new(false));

        let task = {
            let value = Arc::clone(&value);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let mut latencies: VecDeque<u64> = VecDeque::with_capacity(LATENCY_WINDOW);
                tail_csv(path, done, move |record| {
                    let Some(latency) = record.get(LATENCY_COLUMN) else {
                        warn!("Latency value not set in record");
                        return;
                    };
                    let Ok(latency) = latency.parse::<u64>() else {
                        warn!(value = %latency, "Failed to parse latency value");
                        return;
                    };

                    latencies.push_back(latency);
                    while latencies.len() > LATENCY_WINDOW {
                        latencies.pop_front();
                    }
                    let average =
                        latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
                    *value.lock().expect("latency lock poisoned") = average;
                })
                .await;
            })
        };

        Self {
            value,
            done,
            _task: task,
        }
    }

    /// Mean of the most recent latency values; NaN before the first value.
    pub fn average_processing_time(&self) -> f64 {
        *self.value.lock().expect("latency lock poisoned")
    }

    pub fn stop(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

/// Most recent active connection count reported by the service.
pub struct ConnectionCountTailer {
    value: Arc<Mutex<f64>>,
    done: Arc<AtomicBool>,
    _task: tokio::task::JoinHandle<()>,
}

impl ConnectionCountTailer {
    pub fn spawn(metrics_dir: &Path) -> Self {
        let path = metrics_dir.join(ACTIVE_CONNECTIONS_FILENAME);
        let value = Arc::new(Mutex::new(0.0));
        let done = Arc::new(AtomicBool::new(false));

        let task = {
            let value = Arc::clone(&value);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                tail_csv(path, done, move |record| {
                    let Some(count) = record.get(ACTIVE_CONNECTION_COUNT_COLUMN) else {
                        warn!("Active count value not set in record");
                        return;
                    };
                    match count.parse::<u64>() {
                        Ok(count) => {
                            *value.lock().expect("count lock poisoned") = count as f64;
                        }
                        Err(_) => warn!(value = %count, "Failed to parse active count value"),
                    }
                })
                .await;
            })
        };

        Self {
            value,
            done,
            _task: task,
        }
    }

    pub fn current_count(&self) -> f64 {
        *self.value.lock().expect("count lock poisoned")
    }

    pub fn stop(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

/// One failed client request reported by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedRequest {
    pub source: NodeId,
    pub server_end_time: i64,
    pub server_load: HashMap<NodeAttr, f64>,
    pub network_end_time: i64,
    pub network_load: HashMap<LinkAttr, f64>,
}

/// Parse a `;`-separated list of `attribute:value` pairs, summing values
/// for repeated attributes. Unparseable pairs are skipped.
pub fn parse_load_pairs<A>(s: &str) -> HashMap<A, f64>
where
    A: FromStr + Eq + Hash,
{
    let mut load = HashMap::new();
    for pair in s.split(';') {
        let Some((attr, value)) = pair.split_once(':') else {
            error!(pair = %pair, "Error parsing load attribute pair, ignoring");
            continue;
        };
        let Ok(attr) = attr.parse::<A>() else {
            error!(pair = %pair, "Unknown attribute in load pair, ignoring");
            continue;
        };
        match value.parse::<f64>() {
            Ok(value) => {
                *load.entry(attr).or_insert(0.0) += value;
            }
            Err(e) => error!(pair = %pair, error = %e, "Error parsing value in load pair"),
        }
    }
    load
}

/// Streams failed request records to the lifecycle layer.
pub struct FailedRequestTailer {
    done: Arc<AtomicBool>,
    _task: tokio::task::JoinHandle<()>,
}

impl FailedRequestTailer {
    pub fn spawn(metrics_dir: &Path, requests: mpsc::UnboundedSender<FailedRequest>) -> Self {
        let path = metrics_dir.join(FAILED_REQUESTS_FILENAME);
        let done = Arc::new(AtomicBool::new(false));

        let task = {
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                tail_csv(path, done, move |record| {
                    let Some(request) = parse_failed_request(record) else {
                        warn!(?record, "Malformed failed request record");
                        return;
                    };
                    let _ = requests.send(request);
                })
                .await;
            })
        };

        Self { done, _task: task }
    }

    pub fn stop(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

fn parse_failed_request(record: &HashMap<String, String>) -> Option<FailedRequest> {
    let source = record.get(FAILED_SOURCE_IP_COLUMN)?;
    let server_end_time = record.get(FAILED_SERVER_END_TIME_COLUMN)?.parse().ok()?;
    let network_end_time = record.get(FAILED_NETWORK_END_TIME_COLUMN)?.parse().ok()?;
    let server_load = parse_load_pairs(record.get(FAILED_SERVER_LOAD_COLUMN)?);
    let network_load = parse_load_pairs(record.get(FAILED_NETWORK_LOAD_COLUMN)?);

    Some(FailedRequest {
        source: NodeId::from_address(source),
        server_end_time,
        server_load,
        network_end_time,
        network_load,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_latency_rolling_average() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(LATENCY_FILENAME);
        append(&file, "timestamp,event,latency\n");
        append(&file, "1,request,100\n2,request,200\n");

        let tailer = LatencyTailer::spawn(dir.path());
        assert!(
            wait_until(|| (tailer.average_processing_time() - 150.0).abs() < 1e-9).await,
            "average never reached 150"
        );

        // appended rows are picked up by the continuation read
        append(&file, "3,request,600\n");
        assert!(
            wait_until(|| (tailer.average_processing_time() - 300.0).abs() < 1e-9).await,
            "average never reached 300"
        );

        tailer.stop();
    }

    #[tokio::test]
    async fn test_latency_skips_malformed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(LATENCY_FILENAME);
        append(&file, "timestamp,event,latency\n");
        append(&file, "1,request,notanumber\n1,request\n2,request,50\n");

        let tailer = LatencyTailer::spawn(dir.path());
        assert!(
            wait_until(|| (tailer.average_processing_time() - 50.0).abs() < 1e-9).await,
            "malformed rows were not skipped"
        );
        tailer.stop();
    }

    #[tokio::test]
    async fn test_latency_waits_for_file_to_appear() {
        let dir = tempfile::tempdir().unwrap();
        let tailer = LatencyTailer::spawn(dir.path());

        assert!(tailer.average_processing_time().is_nan());

        append(&dir.path().join(LATENCY_FILENAME), "latency\n75\n");
        assert!(
            wait_until(|| (tailer.average_processing_time() - 75.0).abs() < 1e-9).await,
            "file appearance was not noticed"
        );
        tailer.stop();
    }

    #[tokio::test]
    async fn test_connection_count_tracks_latest_value() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(ACTIVE_CONNECTIONS_FILENAME);
        append(&file, "timestamp,active_connection_count\n1,3\n2,7\n");

        let tailer = ConnectionCountTailer::spawn(dir.path());
        assert!(
            wait_until(|| (tailer.current_count() - 7.0).abs() < 1e-9).await,
            "count never reached 7"
        );
        tailer.stop();
    }

    #[test]
    fn test_parse_load_pairs() {
        let load: HashMap<NodeAttr, f64> = parse_load_pairs("CPU:0.5;MEMORY:1.25");
        assert_eq!(load.len(), 2);
        assert!((load[&NodeAttr::Cpu] - 0.5).abs() < 1e-9);
        assert!((load[&NodeAttr::Memory] - 1.25).abs() < 1e-9);

        // repeated attributes sum
        let load: HashMap<NodeAttr, f64> = parse_load_pairs("CPU:0.5;CPU:0.25");
        assert!((load[&NodeAttr::Cpu] - 0.75).abs() < 1e-9);

        // bad pairs are dropped, good ones kept
        let load: HashMap<LinkAttr, f64> = parse_load_pairs("DATARATE_TX:1.5;bogus;X:1");
        assert_eq!(load.len(), 1);
        assert!((load[&LinkAttr::DatarateTx] - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_request_tailer() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(FAILED_REQUESTS_FILENAME);
        append(
            &file,
            "source ip,server end time,server load,network end time,network load\n",
        );
        append(
            &file,
            "10.0.0.9,1000,CPU:0.5;MEMORY:0.1,2000,DATARATE_TX:1.0;DATARATE_RX:2.0\n",
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tailer = FailedRequestTailer::spawn(dir.path(), tx);

        let request = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for failed request")
            .expect("channel closed");

        assert_eq!(request.source, NodeId::from_address("10.0.0.9"));
        assert_eq!(request.server_end_time, 1000);
        assert_eq!(request.network_end_time, 2000);
        assert!((request.server_load[&NodeAttr::Cpu] - 0.5).abs() < 1e-9);
        assert!((request.network_load[&LinkAttr::DatarateRx] - 2.0).abs() < 1e-9);

        tailer.stop();
    }
}
