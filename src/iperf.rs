//! # iperf3 Adapter
//!
//! Builds command lines from test profiles, runs the binary under a
//! cancellable scope, and pulls the few numeric fields the controller cares
//! about back out of its JSON output.
//!
//! Servers are started in one-off mode (`-1`): each server process accepts a
//! single client connection and exits, which is why the topology planner
//! assigns a dedicated port per (source, destination) pair.

use crate::model::{Protocol, TestProfile};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Operation mode of a supervised iperf3 process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Server,
    Client,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

/// Outcome of one client run. A failing subprocess is a normal outcome here,
/// not an `Err`: transport of the failure to the collector is part of the
/// contract.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    /// Raw stdout when the run produced parseable JSON
    pub json_output: String,
    pub exit_code: i32,
    pub error: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Thin wrapper around the iperf3 binary
#[derive(Debug, Clone)]
pub struct Iperf {
    path: String,
}

impl Iperf {
    pub fn new(path: &str) -> Self {
        let path = if path.is_empty() { "iperf3" } else { path };
        Self {
            path: path.to_string(),
        }
    }

    /// Argv for a one-off server listening on `port`
    pub fn server_args(port: u16) -> Vec<String> {
        vec![
            "-s".into(),
            "-p".into(),
            port.to_string(),
            "-J".into(),
            "-1".into(),
        ]
    }

    /// Argv for a client run against `host:port` with the given profile.
    ///
    /// TCP-only options (`-C`, `-M`, `-N`) are suppressed when the profile
    /// selects UDP; iperf3 rejects them otherwise.
    pub fn client_args(host: &str, port: u16, profile: &TestProfile) -> Result<Vec<String>> {
        if host.is_empty() {
            bail!("host is required for client mode");
        }

        let mut args: Vec<String> = vec!["-c".into(), host.into(), "-p".into(), port.to_string()];
        let udp = profile.protocol == Protocol::Udp;

        if udp {
            args.push("-u".into());
        }
        if profile.duration > 0 {
            args.push("-t".into());
            args.push(profile.duration.to_string());
        }
        if !profile.bandwidth.is_empty() && profile.bandwidth != "0" {
            args.push("-b".into());
            args.push(profile.bandwidth.clone());
        }
        if !profile.window_size.is_empty() {
            args.push("-w".into());
            args.push(profile.window_size.clone());
        }
        if profile.parallel > 1 {
            args.push("-P".into());
            args.push(profile.parallel.to_string());
        }
        if profile.bidirectional {
            args.push("--bidir".into());
        }
        if profile.reverse {
            args.push("-R".into());
        }
        if profile.buffer_length > 0 {
            args.push("-l".into());
            args.push(profile.buffer_length.to_string());
        }
        if !udp && !profile.congestion_control.is_empty() {
            args.push("-C".into());
            args.push(profile.congestion_control.clone());
        }
        if !udp && profile.mss > 0 {
            args.push("-M".into());
            args.push(profile.mss.to_string());
        }
        if !udp && profile.no_delay {
            args.push("-N".into());
        }
        if profile.tos > 0 {
            args.push("-S".into());
            args.push(profile.tos.to_string());
        }
        if profile.zerocopy {
            args.push("-Z".into());
        }
        if profile.omit_seconds > 0 {
            args.push("-O".into());
            args.push(profile.omit_seconds.to_string());
        }

        args.push("-J".into());

        for (flag, value) in &profile.extra_flags {
            args.push(flag.clone());
            if !value.is_empty() {
                args.push(value.clone());
            }
        }

        Ok(args)
    }

    /// Spawn a server process. The caller owns the child and is responsible
    /// for supervising its exit; the child is killed if the handle is
    /// dropped.
    pub fn spawn_server(&self, port: u16) -> Result<Child> {
        let args = Self::server_args(port);
        debug!("spawning {} {}", self.path, args.join(" "));

        let child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start iperf3 server on port {port}"))?;
        Ok(child)
    }

    /// Run a client test to completion, cancellation, or deadline.
    ///
    /// Exit code 0 with parseable JSON on stdout is a completed run; anything
    /// else (non-zero exit, bad JSON, cancellation, deadline) is a failed
    /// outcome with the reason and captured stderr in `error`.
    pub async fn run_client(
        &self,
        host: &str,
        port: u16,
        profile: &TestProfile,
        cancel: &CancellationToken,
        deadline: Duration,
    ) -> Result<RunOutcome> {
        let args = Self::client_args(host, port, profile)?;
        debug!("running {} {}", self.path, args.join(" "));

        let start_time = Utc::now();
        let child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.path))?;

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        // Dropping the pinned future kills the child (kill_on_drop), covering
        // the cancellation and deadline arms.
        let outcome = tokio::select! {
            output = &mut wait => {
                let output = output.context("failed waiting for iperf3")?;
                let end_time = Utc::now();
                let exit_code = output.status.code().unwrap_or(-1);
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

                if output.status.success() {
                    match parse_result(&stdout) {
                        Ok(_) => RunOutcome {
                            success: true,
                            json_output: stdout,
                            exit_code,
                            error: String::new(),
                            start_time,
                            end_time,
                        },
                        Err(e) => RunOutcome {
                            success: false,
                            json_output: String::new(),
                            exit_code,
                            error: format!("invalid JSON output: {e}"),
                            start_time,
                            end_time,
                        },
                    }
                } else {
                    RunOutcome {
                        success: false,
                        json_output: String::new(),
                        exit_code,
                        error: format!("iperf3 exited with code {exit_code}, stderr: {}", stderr.trim()),
                        start_time,
                        end_time,
                    }
                }
            }
            _ = cancel.cancelled() => RunOutcome {
                success: false,
                json_output: String::new(),
                exit_code: -1,
                error: "cancelled by stop request".to_string(),
                start_time,
                end_time: Utc::now(),
            },
            _ = tokio::time::sleep(deadline) => RunOutcome {
                success: false,
                json_output: String::new(),
                exit_code: -1,
                error: format!("deadline exceeded after {}s", deadline.as_secs()),
                start_time,
                end_time: Utc::now(),
            },
        };

        Ok(outcome)
    }
}

/// Parse iperf3 JSON output into a generic value, requiring a top-level object
pub fn parse_result(output: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(output).context("failed to parse iperf3 JSON")?;
    if !value.is_object() {
        bail!("iperf3 output is not a JSON object");
    }
    Ok(value)
}

/// `end.sum_sent.bits_per_second`, if present
pub fn extract_throughput(result: &serde_json::Value) -> Option<f64> {
    result
        .get("end")?
        .get("sum_sent")?
        .get("bits_per_second")?
        .as_f64()
}

/// `end.sum_sent.retransmits`; missing data reads as zero
pub fn extract_retransmits(result: &serde_json::Value) -> i64 {
    result
        .get("end")
        .and_then(|e| e.get("sum_sent"))
        .and_then(|s| s.get("retransmits"))
        .and_then(|r| r.as_i64())
        .unwrap_or(0)
}

/// Scale a bits-per-second figure to a human-readable magnitude
pub fn human_throughput(bits_per_second: f64) -> (f64, &'static str) {
    if bits_per_second >= 1e9 {
        (bits_per_second / 1e9, "Gbps")
    } else if bits_per_second >= 1e6 {
        (bits_per_second / 1e6, "Mbps")
    } else if bits_per_second >= 1e3 {
        (bits_per_second / 1e3, "Kbps")
    } else {
        (bits_per_second, "bps")
    }
}
