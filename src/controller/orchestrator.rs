//! # Orchestrator State Machine
//!
//! Drives every daemon through a linear sequence of phases; each phase is a
//! barrier across nodes, so no RPC of phase P+1 is issued before all RPCs of
//! phase P returned. Failures in phases 1-4 are fatal; collection failures
//! are logged and cleanup always runs, even after a fatal phase.
//!
//! Completion is deadline-based: after starting clients the controller sleeps
//! for the longest profile duration plus a buffer rather than waiting on
//! per-test notifications from the daemons.

use crate::controller::aggregate::Aggregator;
use crate::controller::pool::ConnectionPool;
use crate::controller::progress::Progress;
use crate::controller::topology::Topology;
use crate::rpc::{InitializeRequest, PrepareTestRequest, StartClientsRequest, StartServersRequest};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Settle time between starting servers and launching clients
const SERVER_SETTLE: Duration = Duration::from_secs(2);

/// Slack added on top of the longest profile duration in the wait phase
const WAIT_BUFFER: Duration = Duration::from_secs(10);

/// Execution state of one test run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Init,
    Connecting,
    Preparing,
    StartingServers,
    StartingClients,
    Running,
    Collecting,
    Complete,
    Failed,
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestState::Init => "init",
            TestState::Connecting => "connecting",
            TestState::Preparing => "preparing",
            TestState::StartingServers => "starting_servers",
            TestState::StartingClients => "starting_clients",
            TestState::Running => "running",
            TestState::Collecting => "collecting",
            TestState::Complete => "complete",
            TestState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Runs the 7-phase execution workflow against a connected pool
pub struct Orchestrator<'a> {
    pool: &'a ConnectionPool,
    progress: &'a Progress,
    state: Mutex<TestState>,
    save_daemon_results: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(pool: &'a ConnectionPool, progress: &'a Progress, save_daemon_results: bool) -> Self {
        Self {
            pool,
            progress,
            state: Mutex::new(TestState::Init),
            save_daemon_results,
        }
    }

    pub fn state(&self) -> TestState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: TestState) {
        *self.state.lock().unwrap() = state;
        self.progress.set_phase(&state.to_string());
    }

    /// Execute a complete test workflow. Cleanup runs regardless of how the
    /// earlier phases ended.
    pub async fn execute(&self, topology: &Topology, aggregator: &Aggregator) -> Result<()> {
        info!(
            "starting test execution with {} test pairs",
            topology.test_count()
        );
        self.progress.set_totals(
            self.pool.count(),
            topology.test_count(),
            topology.server_count(),
            topology.client_count(),
        );

        let outcome = self.run_phases(topology, aggregator).await;

        // Phase 7: cleanup, attempted on both paths.
        info!("phase 7: cleanup");
        match self.pool.stop_all().await {
            Ok(stopped) => info!("cleanup complete, stopped {stopped} processes"),
            Err(e) => warn!("cleanup phase had errors: {e:#}"),
        }

        match outcome {
            Ok(()) => {
                self.set_state(TestState::Complete);
                info!("test execution complete");
                Ok(())
            }
            Err(e) => {
                self.set_state(TestState::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(&self, topology: &Topology, aggregator: &Aggregator) -> Result<()> {
        self.initialize_phase()
            .await
            .context("initialization phase failed")?;
        self.prepare_phase(topology)
            .await
            .context("prepare phase failed")?;
        self.start_servers_phase(topology)
            .await
            .context("start servers phase failed")?;
        self.start_clients_phase(topology)
            .await
            .context("start clients phase failed")?;
        self.wait_phase(topology).await;
        self.collect_phase(topology, aggregator).await;
        Ok(())
    }

    /// Phase 1: broadcast Initialize to every daemon
    async fn initialize_phase(&self) -> Result<()> {
        self.set_state(TestState::Connecting);
        info!("phase 1: initializing daemons");

        self.pool
            .initialize_all(InitializeRequest {
                max_processes: None,
                log_level: Some("info".to_string()),
                save_results: self.save_daemon_results,
            })
            .await?;

        self.progress.add_connected(self.pool.count());
        info!("successfully initialized {} daemons", self.pool.count());
        if self.save_daemon_results {
            info!("daemons will save local copies of results");
        }
        Ok(())
    }

    /// Phase 2: verify every node can hold its slice of the topology
    async fn prepare_phase(&self, topology: &Topology) -> Result<()> {
        self.set_state(TestState::Preparing);
        info!("phase 2: preparing test topology");

        let mut errors = Vec::new();
        for channel in self.pool.all() {
            let node_topology = topology.node_topology(&channel.node.id);
            let servers = node_topology.server_ports.len();
            let clients = node_topology.client_targets.len();

            match channel
                .prepare_test(PrepareTestRequest {
                    topology: node_topology,
                })
                .await
            {
                Ok(resp) if resp.can_handle => {
                    info!(
                        "node {}: ready ({servers} servers, {clients} clients)",
                        channel.node.id
                    );
                    self.progress.add_prepared(1);
                }
                Ok(resp) => {
                    errors.push(format!("node {}: {}", channel.node.id, resp.message));
                }
                Err(e) => errors.push(format!("node {}: {e:#}", channel.node.id)),
            }
        }

        if !errors.is_empty() {
            for error in &errors {
                self.progress.add_error(error.clone());
            }
            bail!(
                "preparation failed on {} nodes: {}",
                errors.len(),
                errors.join("; ")
            );
        }
        info!("all nodes prepared successfully");
        Ok(())
    }

    /// Phase 3: start iperf3 servers, then give them a moment to bind
    async fn start_servers_phase(&self, topology: &Topology) -> Result<()> {
        self.set_state(TestState::StartingServers);
        info!("phase 3: starting iperf3 servers");

        let mut errors = Vec::new();
        let mut total_servers = 0;
        for channel in self.pool.all() {
            let Some(ports) = topology.server_ports.get(&channel.node.id) else {
                continue;
            };
            if ports.is_empty() {
                continue;
            }

            match channel
                .start_servers(StartServersRequest {
                    ports: ports.clone(),
                })
                .await
            {
                Ok(resp) if resp.success => {
                    info!(
                        "node {}: started {} servers on ports {:?}",
                        channel.node.id,
                        resp.started_ports.len(),
                        resp.started_ports
                    );
                    for error in resp.errors {
                        warn!("node {}: {error}", channel.node.id);
                        self.progress.add_error(error);
                    }
                    total_servers += resp.started_ports.len();
                    self.progress.add_started_servers(resp.started_ports.len());
                }
                Ok(resp) => errors.push(format!("node {}: {}", channel.node.id, resp.message)),
                Err(e) => errors.push(format!("node {}: {e:#}", channel.node.id)),
            }
        }

        if !errors.is_empty() {
            for error in &errors {
                self.progress.add_error(error.clone());
            }
            bail!(
                "server start failed on {} nodes: {}",
                errors.len(),
                errors.join("; ")
            );
        }

        info!("started {total_servers} servers across all nodes");
        sleep(SERVER_SETTLE).await;
        Ok(())
    }

    /// Phase 4: launch client tests on every source node
    async fn start_clients_phase(&self, topology: &Topology) -> Result<()> {
        self.set_state(TestState::StartingClients);
        info!("phase 4: starting iperf3 clients");

        let mut errors = Vec::new();
        let mut total_clients = 0;
        for channel in self.pool.all() {
            let targets = topology.client_targets(&channel.node.id);
            if targets.is_empty() {
                continue;
            }

            match channel.start_clients(StartClientsRequest { targets }).await {
                Ok(resp) if resp.success => {
                    info!(
                        "node {}: started {} client tests",
                        channel.node.id,
                        resp.started_test_ids.len()
                    );
                    for error in resp.errors {
                        warn!("node {}: {error}", channel.node.id);
                        self.progress.add_error(error);
                    }
                    total_clients += resp.started_test_ids.len();
                    self.progress
                        .add_started_clients(resp.started_test_ids.len());
                }
                Ok(resp) => errors.push(format!("node {}: {}", channel.node.id, resp.message)),
                Err(e) => errors.push(format!("node {}: {e:#}", channel.node.id)),
            }
        }

        if !errors.is_empty() {
            for error in &errors {
                self.progress.add_error(error.clone());
            }
            bail!(
                "client start failed on {} nodes: {}",
                errors.len(),
                errors.join("; ")
            );
        }

        info!("started {total_clients} client tests across all nodes");
        Ok(())
    }

    /// Phase 5: deadline-based wait sized by the longest profile
    async fn wait_phase(&self, topology: &Topology) {
        self.set_state(TestState::Running);
        let wait = Duration::from_secs(topology.max_duration_secs()) + WAIT_BUFFER;
        info!("phase 5: waiting {}s for tests to complete", wait.as_secs());
        sleep(wait).await;
        info!("test execution window complete");
    }

    /// Phase 6: pull results into the aggregator; never fatal
    async fn collect_phase(&self, topology: &Topology, aggregator: &Aggregator) {
        self.set_state(TestState::Collecting);
        info!("phase 6: collecting results");

        match aggregator.collect(self.pool, topology).await {
            Ok(collected) => {
                self.progress.add_collected(collected);
                info!("collected {collected} total results");
            }
            Err(e) => warn!("result collection had errors: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_as_snake_case() {
        assert_eq!(TestState::StartingServers.to_string(), "starting_servers");
        assert_eq!(TestState::Complete.to_string(), "complete");
    }

    #[test]
    fn orchestrator_starts_in_init() {
        let pool = ConnectionPool::new(Duration::from_secs(1), Duration::from_secs(1));
        let progress = Progress::new();
        let orch = Orchestrator::new(&pool, &progress, false);
        assert_eq!(orch.state(), TestState::Init);
    }
}
