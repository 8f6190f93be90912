//! Per-interface traffic summarizer processes
//!
//! Spawns one external traffic-summarizing process per monitored NIC,
//! drives it with periodic refresh bytes, and publishes the most recently
//! parsed frame. On shutdown the process is asked to quit and forcibly
//! killed only if it does not exit within the stop timeout.

use super::frame;
use crate::models::TrafficSample;
use anyhow::{Context, Result};
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Placeholder in the command template replaced with the interface name.
pub const NIC_PLACEHOLDER: &str = "[nic]";

/// Configuration for the per-NIC summarizer processes.
#[derive(Debug, Clone)]
pub struct TrafficSamplerConfig {
    /// Argv template; every `[nic]` element is replaced with the interface
    /// name.
    pub command: Vec<String>,
    /// Interval between refresh control bytes.
    pub refresh_interval: Duration,
    /// How long to wait for the process to exit before killing it.
    pub stop_timeout: Duration,
}

impl Default for TrafficSamplerConfig {
    fn default() -> Self {
        Self {
            command: [
                "iftop", "-n", "-t", "-N", "-P", "-L", "1000000", "-i", NIC_PLACEHOLDER,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            refresh_interval: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Source of the latest traffic frame for one interface.
///
/// Implemented by [`NicSamplerHandle`]; tests supply fixed-frame stubs.
pub trait TrafficSource: Send + Sync {
    fn nic(&self) -> &str;

    /// The monitored interface's own address, used for local/remote
    /// disambiguation.
    fn nic_addr(&self) -> Option<IpAddr>;

    /// The most recently completed frame, if any.
    fn last_frame(&self) -> Option<Vec<TrafficSample>>;
}

/// Handle to a running summarizer process for one NIC.
pub struct NicSamplerHandle {
    nic: String,
    nic_addr: Option<IpAddr>,
    last_frame: Arc<Mutex<Option<Vec<TrafficSample>>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl TrafficSource for NicSamplerHandle {
    fn nic(&self) -> &str {
        &self.nic
    }

    fn nic_addr(&self) -> Option<IpAddr> {
        self.nic_addr
    }

    fn last_frame(&self) -> Option<Vec<TrafficSample>> {
        self.last_frame
            .lock()
            .expect("frame lock poisoned")
            .clone()
    }
}

impl NicSamplerHandle {
    /// Spawn the summarizer for `nic` and start parsing its output.
    pub fn spawn(
        config: &TrafficSamplerConfig,
        nic: &str,
        nic_addr: Option<IpAddr>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let argv: Vec<String> = config
            .command
            .iter()
            .map(|arg| {
                if arg == NIC_PLACEHOLDER {
                    nic.to_string()
                } else {
                    arg.clone()
                }
            })
            .collect();
        anyhow::ensure!(!argv.is_empty(), "summarizer command is empty");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start traffic summarizer for {}", nic))?;
        debug!(nic = %nic, command = ?argv, "Started traffic summarizer");

        let stdin = child
            .stdin
            .take()
            .context("summarizer has no stdin handle")?;
        let stdout = child
            .stdout
            .take()
            .context("summarizer has no stdout handle")?;

        let last_frame = Arc::new(Mutex::new(None));
        let task = tokio::spawn(process_output(
            child,
            stdin,
            stdout,
            nic.to_string(),
            config.refresh_interval,
            config.stop_timeout,
            Arc::clone(&last_frame),
            shutdown,
        ));

        Ok(Self {
            nic: nic.to_string(),
            nic_addr,
            last_frame,
            _task: task,
        })
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_output(
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: tokio::process::ChildStdout,
    nic: String,
    refresh_interval: Duration,
    stop_timeout: Duration,
    last_frame: Arc<Mutex<Option<Vec<TrafficSample>>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut ticker = tokio::time::interval(refresh_interval);
    let mut frame_lines: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                // ask for the next frame
                if let Err(e) = stdin.write_all(b"u").await {
                    error!(nic = %nic, error = %e, "Failed to send refresh to summarizer");
                    break;
                }
                let _ = stdin.flush().await;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if frame::is_frame_boundary(&line) {
                            let parsed = frame::parse_frame(&nic, &frame_lines);
                            debug!(nic = %nic, flows = parsed.len(), "Parsed traffic frame");
                            *last_frame.lock().expect("frame lock poisoned") = Some(parsed);
                            frame_lines.clear();
                        } else {
                            frame_lines.push(line);
                        }
                    }
                    Ok(None) => {
                        info!(nic = %nic, "Summarizer closed its output");
                        break;
                    }
                    Err(e) => {
                        error!(nic = %nic, error = %e, "Error reading from summarizer");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                info!(nic = %nic, "Shutting down traffic sampler");
                break;
            }
        }
    }

    info!(nic = %nic, "Asking summarizer to quit");
    let _ = stdin.write_all(b"q").await;
    let _ = stdin.flush().await;

    match timeout(stop_timeout, child.wait()).await {
        Ok(Ok(status)) => debug!(nic = %nic, status = %status, "Summarizer exited"),
        Ok(Err(e)) => warn!(nic = %nic, error = %e, "Error waiting for summarizer to exit"),
        Err(_) => {
            warn!(nic = %nic, "Summarizer did not exit in time, killing it");
            if let Err(e) = child.kill().await {
                error!(nic = %nic, error = %e, "Failed to kill summarizer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive the sampler with a shell script standing in for the real
    /// summarizer: it echoes one frame per refresh byte and exits on 'q'.
    const FAKE_SUMMARIZER: &str = r#"
while IFS= read -r -n1 c; do
  if [ "$c" = "q" ]; then exit 0; fi
  echo "header"
  echo "----------------------------------------"
  echo "   1 172.30.0.65:22  =>  4.44Kb 4.44Kb 4.44Kb 1.11KB"
  echo "     192.168.254.21:43210  <=  208b 208b 208b 52B"
  echo "----------------------------------------"
  echo "Total send rate: 4.44Kb"
  echo "================================================================"
done
"#;

    #[tokio::test]
    async fn test_sampler_parses_frames_and_exits_on_quit() {
        let config = TrafficSamplerConfig {
            command: vec![
                "bash".to_string(),
                "-c".to_string(),
                FAKE_SUMMARIZER.to_string(),
            ],
            refresh_interval: Duration::from_millis(20),
            stop_timeout: Duration::from_secs(2),
        };
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = NicSamplerHandle::spawn(&config, "eth0", None, shutdown_rx).unwrap();

        // wait for at least one frame to be published
        let mut frame = None;
        for _ in 0..100 {
            frame = handle.last_frame();
            if frame.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let frame = frame.expect("no frame published");
        assert_eq!(frame.len(), 1);
        assert_eq!(frame[0].local_ip, "172.30.0.65");
        assert_eq!(frame[0].bits_received_last_2s, 208);

        shutdown_tx.send(()).unwrap();
    }

    #[test]
    fn test_command_template_substitution() {
        let config = TrafficSamplerConfig::default();
        assert!(config.command.contains(&NIC_PLACEHOLDER.to_string()));
    }
}
