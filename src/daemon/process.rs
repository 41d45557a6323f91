//! # Process Manager
//!
//! Owns the lifecycle of every iperf3 subprocess on a node. Two indices are
//! kept under one lock: all live processes by test id, and server processes
//! by listen port. Subprocess wait always happens off-lock in a spawned task;
//! the completion path re-acquires the lock to drop the record and then
//! returns the port and capacity slot.
//!
//! Resources are released exactly once per record: whichever path removes the
//! record from the tables (monitor exit, worker completion, or an explicit
//! stop) is the one that finalizes it.

use crate::daemon::capacity::CapacityAccountant;
use crate::daemon::collector::ResultCollector;
use crate::daemon::ports::PortAllocator;
use crate::iperf::{Iperf, Mode, RunOutcome};
use crate::model::TestProfile;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Book-keeping for one live subprocess
#[derive(Debug)]
pub struct ProcessRecord {
    pub test_id: String,
    pub pid: Option<u32>,
    pub port: u16,
    pub mode: Mode,
    pub start_time: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Tables {
    /// test id -> record, servers included under their synthetic id
    processes: HashMap<String, ProcessRecord>,
    /// listen port -> server test id
    servers: HashMap<u16, String>,
}

/// Supervisor for iperf3 server and client subprocesses
pub struct ProcessManager {
    iperf: Iperf,
    allocator: Arc<PortAllocator>,
    capacity: Arc<CapacityAccountant>,
    collector: Arc<ResultCollector>,
    tables: Mutex<Tables>,
    /// When set, raw iperf3 JSON of completed clients is also written here
    save_dir: Mutex<Option<PathBuf>>,
}

impl ProcessManager {
    pub fn new(
        iperf: Iperf,
        allocator: Arc<PortAllocator>,
        capacity: Arc<CapacityAccountant>,
        collector: Arc<ResultCollector>,
    ) -> Self {
        Self {
            iperf,
            allocator,
            capacity,
            collector,
            tables: Mutex::new(Tables::default()),
            save_dir: Mutex::new(None),
        }
    }

    /// Enable or disable saving raw client output under `dir`
    pub fn set_save_results(&self, dir: Option<PathBuf>) {
        *self.save_dir.lock().unwrap() = dir;
    }

    /// Start a one-off iperf3 server on `port` and a monitor task that cleans
    /// up when it exits.
    pub fn start_server(self: &Arc<Self>, port: u16) -> Result<()> {
        let test_id = format!("server-{port}");

        // Port, then slot, then claim. Each component takes its own lock and
        // none is called while another's lock is held.
        self.allocator.reserve(port, &test_id)?;
        if let Err(e) = self.capacity.reserve(1) {
            let _ = self.allocator.release_port(port);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.servers.contains_key(&port) {
                drop(tables);
                let _ = self.allocator.release_port(port);
                self.capacity.release(1);
                bail!("server already running on port {port}");
            }
            tables.processes.insert(
                test_id.clone(),
                ProcessRecord {
                    test_id: test_id.clone(),
                    pid: None,
                    port,
                    mode: Mode::Server,
                    start_time: Utc::now(),
                    cancel: cancel.clone(),
                },
            );
            tables.servers.insert(port, test_id.clone());
        }

        let mut child = match self.iperf.spawn_server(port) {
            Ok(child) => child,
            Err(e) => {
                if let Some(record) = self.take_record(&test_id) {
                    self.finalize_record(&record);
                }
                return Err(e.context(format!("failed to start server on port {port}")));
            }
        };

        let pid = child.id();
        if let Some(record) = self.tables.lock().unwrap().processes.get_mut(&test_id) {
            record.pid = pid;
        }
        debug!("started server on port {port} (pid {pid:?})");

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!("server on port {port} exited: {status:?}");
                }
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("failed to kill server on port {port}: {e}");
                    }
                }
            }
            if let Some(record) = manager.take_record(&test_id) {
                manager.finalize_record(&record);
            }
        });

        Ok(())
    }

    /// Start a client test against `host:port`. The worker task runs the
    /// subprocess under a deadline of `duration + 30s`, stores the outcome in
    /// the collector, and releases the record and slot.
    pub fn start_client(
        self: &Arc<Self>,
        test_id: &str,
        host: &str,
        port: u16,
        profile: TestProfile,
    ) -> Result<()> {
        self.capacity.reserve(1)?;

        let cancel = CancellationToken::new();
        let start_time = Utc::now();
        {
            let mut tables = self.tables.lock().unwrap();
            if tables.processes.contains_key(test_id) {
                drop(tables);
                self.capacity.release(1);
                bail!("test {test_id} already running");
            }
            tables.processes.insert(
                test_id.to_string(),
                ProcessRecord {
                    test_id: test_id.to_string(),
                    pid: None,
                    port,
                    mode: Mode::Client,
                    start_time,
                    cancel: cancel.clone(),
                },
            );
        }

        let deadline = Duration::from_secs(profile.duration + 30);
        let manager = Arc::clone(self);
        let test_id = test_id.to_string();
        let host = host.to_string();

        tokio::spawn(async move {
            let outcome = manager
                .iperf
                .run_client(&host, port, &profile, &cancel, deadline)
                .await
                .unwrap_or_else(|e| RunOutcome {
                    success: false,
                    json_output: String::new(),
                    exit_code: -1,
                    error: e.to_string(),
                    start_time,
                    end_time: Utc::now(),
                });

            // Every accepted client produces exactly one stored result, even
            // when it was cancelled out from under us.
            if let Err(e) = manager.collector.store_outcome(&test_id, &outcome) {
                warn!("failed to store result for {test_id}: {e}");
            }
            if outcome.success {
                manager.save_raw_output(&test_id, &outcome.json_output);
            } else {
                debug!("client test {test_id} failed: {}", outcome.error);
            }

            if let Some(record) = manager.take_record(&test_id) {
                manager.finalize_record(&record);
            }
        });

        Ok(())
    }

    /// Cancel and forget a specific process
    pub fn stop(&self, test_id: &str) -> Result<()> {
        let record = self
            .take_record(test_id)
            .ok_or_else(|| anyhow!("process {test_id} not found"))?;
        record.cancel.cancel();
        self.finalize_record(&record);
        Ok(())
    }

    pub fn stop_all_servers(&self) -> usize {
        self.stop_matching(|record| record.mode == Mode::Server)
    }

    pub fn stop_all_clients(&self) -> usize {
        self.stop_matching(|record| record.mode == Mode::Client)
    }

    /// Cancel every live process. Cancelled clients still record a failed
    /// result from their worker task.
    pub fn stop_all(&self) -> usize {
        self.stop_matching(|_| true)
    }

    fn stop_matching(&self, predicate: impl Fn(&ProcessRecord) -> bool) -> usize {
        let ids: Vec<String> = {
            let tables = self.tables.lock().unwrap();
            tables
                .processes
                .values()
                .filter(|r| predicate(r))
                .map(|r| r.test_id.clone())
                .collect()
        };

        let mut stopped = 0;
        for id in ids {
            if let Some(record) = self.take_record(&id) {
                record.cancel.cancel();
                self.finalize_record(&record);
                stopped += 1;
            }
        }
        stopped
    }

    pub fn running_count(&self) -> usize {
        self.tables.lock().unwrap().processes.len()
    }

    pub fn server_count(&self) -> usize {
        self.tables.lock().unwrap().servers.len()
    }

    pub fn is_server_running(&self, port: u16) -> bool {
        self.tables.lock().unwrap().servers.contains_key(&port)
    }

    /// Remove a record from both indices. At most one caller gets it; that
    /// caller must finalize.
    fn take_record(&self, test_id: &str) -> Option<ProcessRecord> {
        let mut tables = self.tables.lock().unwrap();
        let record = tables.processes.remove(test_id)?;
        if record.mode == Mode::Server {
            tables.servers.remove(&record.port);
        }
        Some(record)
    }

    /// Return the resources held by a removed record
    fn finalize_record(&self, record: &ProcessRecord) {
        if record.mode == Mode::Server {
            let _ = self.allocator.release_port(record.port);
        }
        self.capacity.release(1);
    }

    fn save_raw_output(&self, test_id: &str, json: &str) {
        let dir = self.save_dir.lock().unwrap().clone();
        if let Some(dir) = dir {
            let stamp = Utc::now().format("%Y%m%d_%H%M%S");
            let path = dir.join(format!("iperf3_{test_id}_{stamp}.json"));
            if let Err(e) = std::fs::create_dir_all(&dir)
                .and_then(|_| std::fs::write(&path, json))
            {
                warn!("failed to save raw output for {test_id}: {e}");
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    fn stub_binary(dir: &std::path::Path, body: &str) -> String {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("iperf3-stub");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn manager(iperf_path: &str, max_processes: usize) -> Arc<ProcessManager> {
        Arc::new(ProcessManager::new(
            Iperf::new(iperf_path),
            Arc::new(PortAllocator::new(5201, 5400).unwrap()),
            Arc::new(CapacityAccountant::new(max_processes)),
            Arc::new(ResultCollector::new()),
        ))
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        timeout(deadline, async {
            while !check() {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn failing_client_still_stores_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "echo 'connect refused' >&2; exit 1");
        let mgr = manager(&path, 4);

        mgr.start_client("test-1-a-to-b", "10.0.0.2", 5201, TestProfile::named("p", 1))
            .unwrap();

        let collector = Arc::clone(&mgr.collector);
        assert!(
            wait_until(Duration::from_secs(5), || collector.count() == 1).await,
            "result never arrived"
        );
        let result = collector.get("test-1-a-to-b").unwrap();
        assert_eq!(result.status, crate::rpc::TestStatus::Failed);
        assert!(result.error_message.contains("connect refused"));
        // Slot released once the worker finished.
        assert!(wait_until(Duration::from_secs(5), || mgr.capacity.used() == 0).await);
    }

    #[tokio::test]
    async fn duplicate_client_test_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 10");
        let mgr = manager(&path, 4);

        mgr.start_client("t", "10.0.0.2", 5201, TestProfile::named("p", 10))
            .unwrap();
        let err = mgr
            .start_client("t", "10.0.0.2", 5201, TestProfile::named("p", 10))
            .unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert_eq!(mgr.capacity.used(), 1);

        mgr.stop_all();
    }

    #[tokio::test]
    async fn capacity_exhaustion_rejects_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 10");
        let mgr = manager(&path, 1);

        mgr.start_client("t1", "10.0.0.2", 5201, TestProfile::named("p", 10))
            .unwrap();
        let err = mgr
            .start_client("t2", "10.0.0.2", 5202, TestProfile::named("p", 10))
            .unwrap_err();
        assert!(err.to_string().contains("insufficient capacity"));

        mgr.stop_all();
    }

    #[tokio::test]
    async fn stop_all_during_run_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 30");
        let mgr = manager(&path, 8);

        mgr.start_client("t1", "10.0.0.2", 5201, TestProfile::named("p", 30))
            .unwrap();
        mgr.start_client("t2", "10.0.0.3", 5201, TestProfile::named("p", 30))
            .unwrap();
        assert_eq!(mgr.running_count(), 2);

        let stopped = mgr.stop_all();
        assert_eq!(stopped, 2);
        assert_eq!(mgr.running_count(), 0);
        assert_eq!(mgr.capacity.used(), 0);

        // Both cancelled clients still produce failed results.
        let collector = Arc::clone(&mgr.collector);
        assert!(wait_until(Duration::from_secs(5), || collector.count() == 2).await);
        for id in ["t1", "t2"] {
            let result = collector.get(id).unwrap();
            assert_eq!(result.status, crate::rpc::TestStatus::Failed);
            assert!(result.error_message.contains("cancelled"));
        }
    }

    #[tokio::test]
    async fn server_lifecycle_holds_port_and_slot() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 30");
        let mgr = manager(&path, 4);

        mgr.start_server(5201).unwrap();
        assert!(mgr.is_server_running(5201));
        assert_eq!(mgr.server_count(), 1);
        assert!(mgr.allocator.is_allocated(5201));

        let err = mgr.start_server(5201).unwrap_err();
        assert!(err.to_string().contains("already in use"));
        assert_eq!(mgr.capacity.used(), 1);

        assert_eq!(mgr.stop_all_servers(), 1);
        assert!(!mgr.is_server_running(5201));
        assert!(!mgr.allocator.is_allocated(5201));
        assert_eq!(mgr.capacity.used(), 0);
    }

    #[tokio::test]
    async fn server_port_outside_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 1");
        let mgr = manager(&path, 4);

        let err = mgr.start_server(9999).unwrap_err();
        assert!(err.to_string().contains("outside configured range"));
        assert_eq!(mgr.capacity.used(), 0);
    }

    #[tokio::test]
    async fn server_exit_is_observed_by_monitor() {
        let dir = tempfile::tempdir().unwrap();
        // One-off server that exits on its own almost immediately.
        let path = stub_binary(dir.path(), "exit 0");
        let mgr = manager(&path, 4);

        mgr.start_server(5201).unwrap();
        let mgr2 = Arc::clone(&mgr);
        assert!(
            wait_until(Duration::from_secs(5), move || {
                mgr2.running_count() == 0 && !mgr2.is_server_running(5201)
            })
            .await,
            "monitor never cleaned up"
        );
        assert_eq!(mgr.capacity.used(), 0);
        assert!(!mgr.allocator.is_allocated(5201));
    }

    #[tokio::test]
    async fn completed_client_output_is_saved_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(
            dir.path(),
            r#"echo '{"end":{"sum_sent":{"bits_per_second":1.0}}}'"#,
        );
        let save_dir = tempfile::tempdir().unwrap();
        let mgr = manager(&path, 4);
        mgr.set_save_results(Some(save_dir.path().to_path_buf()));

        mgr.start_client("t1", "10.0.0.2", 5201, TestProfile::named("p", 1))
            .unwrap();

        let collector = Arc::clone(&mgr.collector);
        assert!(wait_until(Duration::from_secs(5), || collector.count() == 1).await);
        assert!(
            wait_until(Duration::from_secs(5), || {
                std::fs::read_dir(save_dir.path()).unwrap().count() == 1
            })
            .await,
            "raw output file never written"
        );
    }

    #[tokio::test]
    async fn stop_rejects_unknown_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = stub_binary(dir.path(), "sleep 1");
        let mgr = manager(&path, 4);
        assert!(mgr.stop("nope").is_err());
    }
}
