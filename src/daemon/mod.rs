//! # Daemon RPC Service
//!
//! Stateless RPC wrapper over the daemon's singleton components, plus the TCP
//! serve loop. Each accepted connection gets its own handler task that reads
//! one request frame at a time, dispatches it, and writes the response back.
//!
//! Domain failures (a port in use, a full capacity budget) are reported
//! inside responses; only transport and internal faults terminate a
//! connection or surface as `Response::Error`.

pub mod capacity;
pub mod collector;
pub mod ports;
pub mod process;

use crate::config::DaemonSettings;
use crate::iperf::Iperf;
use crate::rpc::{
    self, GetResultsRequest, GetResultsResponse, GetStatusResponse, InitializeRequest,
    InitializeResponse, NodeInfo, PrepareTestRequest, PrepareTestResponse, Request, Response,
    StartClientsRequest, StartClientsResponse, StartServersRequest, StartServersResponse,
    StopAllRequest, StopAllResponse,
};
use anyhow::{Context, Result};
use capacity::CapacityAccountant;
use collector::ResultCollector;
use ports::PortAllocator;
use process::ProcessManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The daemon's component graph and RPC dispatch
pub struct DaemonService {
    allocator: Arc<PortAllocator>,
    capacity: Arc<CapacityAccountant>,
    collector: Arc<ResultCollector>,
    manager: Arc<ProcessManager>,
    hostname: String,
    listen_port: u16,
    result_dir: PathBuf,
    start_time: Instant,
}

impl DaemonService {
    /// Wire up the singleton components from validated settings
    pub fn new(settings: &DaemonSettings) -> Result<Self> {
        let allocator = Arc::new(
            PortAllocator::new(settings.port_range.start, settings.port_range.end)
                .context("failed to create port allocator")?,
        );
        let capacity = Arc::new(CapacityAccountant::new(settings.max_processes));
        let collector = Arc::new(ResultCollector::new());
        let manager = Arc::new(ProcessManager::new(
            Iperf::new(&settings.iperf_path),
            Arc::clone(&allocator),
            Arc::clone(&capacity),
            Arc::clone(&collector),
        ));

        Ok(Self {
            allocator,
            capacity,
            collector,
            manager,
            hostname: local_hostname(),
            listen_port: settings.listen_port,
            result_dir: PathBuf::from(&settings.result_dir),
            start_time: Instant::now(),
        })
    }

    /// Route one request to its handler
    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Initialize(req) => Response::Initialize(self.initialize(req)),
            Request::PrepareTest(req) => Response::PrepareTest(self.prepare_test(req)),
            Request::StartServers(req) => Response::StartServers(self.start_servers(req)),
            Request::StartClients(req) => Response::StartClients(self.start_clients(req)),
            Request::StopAll(req) => Response::StopAll(self.stop_all(req)),
            Request::GetResults(req) => Response::GetResults(self.get_results(req)),
            Request::GetStatus => Response::GetStatus(self.get_status()),
        }
    }

    fn initialize(&self, req: InitializeRequest) -> InitializeResponse {
        if let Some(max) = req.max_processes {
            if max > 0 {
                info!("adopting max_processes override: {max}");
                self.capacity.set_max_processes(max);
            }
        }
        if let Some(level) = &req.log_level {
            debug!("controller requested log level '{level}'");
        }
        self.manager.set_save_results(if req.save_results {
            Some(self.result_dir.clone())
        } else {
            None
        });

        InitializeResponse {
            success: true,
            message: "daemon initialized successfully".to_string(),
            node_info: Some(NodeInfo {
                id: self.hostname.clone(),
                hostname: self.hostname.clone(),
                port: self.listen_port,
                capacity: self.capacity.detect(),
            }),
        }
    }

    /// Pure capacity check; nothing is reserved here
    fn prepare_test(&self, req: PrepareTestRequest) -> PrepareTestResponse {
        let required = req.topology.required_slots();
        let available = self.capacity.available();
        let can_handle = available >= required;

        let message = if can_handle {
            "sufficient capacity available".to_string()
        } else {
            format!("insufficient capacity: need {required} slots, have {available} available")
        };

        PrepareTestResponse {
            can_handle,
            message,
            required_slots: required,
            available_slots: available,
        }
    }

    fn start_servers(&self, req: StartServersRequest) -> StartServersResponse {
        if req.ports.is_empty() {
            return StartServersResponse {
                success: false,
                message: "no ports specified".to_string(),
                started_ports: Vec::new(),
                errors: Vec::new(),
            };
        }

        let mut started_ports = Vec::new();
        let mut errors = Vec::new();
        for &port in &req.ports {
            match self.manager.start_server(port) {
                Ok(()) => started_ports.push(port),
                Err(e) => errors.push(format!("port {port}: {e:#}")),
            }
        }

        StartServersResponse {
            success: !started_ports.is_empty(),
            message: format!("started {}/{} servers", started_ports.len(), req.ports.len()),
            started_ports,
            errors,
        }
    }

    fn start_clients(&self, req: StartClientsRequest) -> StartClientsResponse {
        if req.targets.is_empty() {
            return StartClientsResponse {
                success: false,
                message: "no targets specified".to_string(),
                started_test_ids: Vec::new(),
                errors: Vec::new(),
            };
        }

        let mut started_test_ids = Vec::new();
        let mut errors = Vec::new();
        for target in req.targets.iter() {
            match self.manager.start_client(
                &target.test_id,
                &target.destination_ip,
                target.destination_port,
                target.profile.clone(),
            ) {
                Ok(()) => started_test_ids.push(target.test_id.clone()),
                Err(e) => errors.push(format!("test {}: {e:#}", target.test_id)),
            }
        }

        StartClientsResponse {
            success: !started_test_ids.is_empty(),
            message: format!(
                "started {}/{} clients",
                started_test_ids.len(),
                req.targets.len()
            ),
            started_test_ids,
            errors,
        }
    }

    fn stop_all(&self, _req: StopAllRequest) -> StopAllResponse {
        let stopped_count = self.manager.stop_all();
        StopAllResponse {
            stopped_count,
            message: format!("stopped {stopped_count} processes"),
        }
    }

    fn get_results(&self, req: GetResultsRequest) -> GetResultsResponse {
        let results = if req.test_ids.is_empty() {
            self.collector.all()
        } else {
            self.collector.get_many(&req.test_ids)
        };

        // Clearing flushes the whole collector, not just the filtered view.
        if req.clear_after_retrieval {
            self.collector.clear_all();
        }

        GetResultsResponse {
            total_count: results.len(),
            results,
        }
    }

    fn get_status(&self) -> GetStatusResponse {
        GetStatusResponse {
            healthy: true,
            running_processes: self.manager.running_count(),
            completed_tests: self.collector.completed_count(),
            failed_tests: self.collector.failed_count(),
            capacity: self.capacity.detect(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Port-range capacity, for startup reporting
    pub fn port_capacity(&self) -> usize {
        self.allocator.capacity()
    }
}

/// Serve the RPC service on `listener` until `shutdown` fires.
///
/// Each connection gets its own task; requests within a connection are
/// handled in arrival order, matching the controller's unary call pattern.
pub async fn serve(
    service: Arc<DaemonService>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("daemon listening on {local}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down gracefully");
                let stopped = service.manager.stop_all();
                if stopped > 0 {
                    info!("stopped {stopped} processes on shutdown");
                }
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;
                debug!("accepted controller connection from {peer}");
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("failed to set nodelay for {peer}: {e}");
                }
                let service = Arc::clone(&service);
                tokio::spawn(handle_connection(service, stream, peer));
            }
        }
    }
}

async fn handle_connection(service: Arc<DaemonService>, mut stream: TcpStream, peer: SocketAddr) {
    loop {
        let request: Request = match rpc::read_frame(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!("connection from {peer} closed: {e}");
                break;
            }
        };

        let response = service.dispatch(request);
        if let Err(e) = rpc::write_frame(&mut stream, &response).await {
            warn!("failed to write response to {peer}: {e}");
            break;
        }
    }
}

fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::rpc::{ClientTarget, NodeTopology};
    use crate::model::TestProfile;

    fn service(max_processes: usize) -> DaemonService {
        let mut config: DaemonConfig = serde_yaml::from_str("daemon: {}").unwrap();
        config.daemon.max_processes = max_processes;
        config.daemon.iperf_path = "/nonexistent/iperf3".to_string();
        DaemonService::new(&config.daemon).unwrap()
    }

    fn topology(servers: usize, clients: usize) -> NodeTopology {
        NodeTopology {
            server_ports: (0..servers).map(|i| 5201 + i as u16).collect(),
            client_targets: (0..clients)
                .map(|i| ClientTarget {
                    test_id: format!("test-{i}"),
                    destination_ip: "10.0.0.2".to_string(),
                    destination_port: 5201,
                    profile: TestProfile::named("p", 5),
                })
                .collect(),
        }
    }

    #[test]
    fn initialize_reports_node_info() {
        let svc = service(16);
        let resp = svc.initialize(InitializeRequest::default());
        assert!(resp.success);
        let info = resp.node_info.unwrap();
        assert_eq!(info.port, 50051);
        assert_eq!(info.capacity.max_processes, 16);
    }

    #[test]
    fn initialize_adopts_max_processes_override() {
        let svc = service(16);
        let resp = svc.initialize(InitializeRequest {
            max_processes: Some(4),
            ..Default::default()
        });
        assert!(resp.success);
        assert_eq!(svc.capacity.max_processes(), 4);
    }

    #[test]
    fn prepare_test_is_a_pure_check() {
        let svc = service(1);
        let resp = svc.prepare_test(PrepareTestRequest {
            topology: topology(1, 1),
        });
        assert!(!resp.can_handle);
        assert_eq!(resp.required_slots, 2);
        assert_eq!(resp.available_slots, 1);
        assert!(resp.message.contains("need 2 slots, have 1 available"));
        // Nothing was reserved by the check.
        assert_eq!(svc.capacity.used(), 0);

        let ok = svc.prepare_test(PrepareTestRequest {
            topology: topology(1, 0),
        });
        assert!(ok.can_handle);
    }

    #[test]
    fn start_servers_with_no_ports_is_a_domain_error() {
        let svc = service(4);
        let resp = svc.start_servers(StartServersRequest { ports: Vec::new() });
        assert!(!resp.success);
        assert_eq!(resp.message, "no ports specified");
    }

    #[test]
    fn get_status_reports_counters_and_version() {
        let svc = service(4);
        let status = svc.get_status();
        assert!(status.healthy);
        assert_eq!(status.running_processes, 0);
        assert_eq!(status.version, crate::VERSION);
        assert_eq!(status.capacity.available_processes, 4);
    }

    #[test]
    fn get_results_clear_flushes_entire_collector() {
        use crate::rpc::{TestResult, TestStatus};
        let svc = service(4);
        for id in ["t1", "t2"] {
            svc.collector
                .store(TestResult {
                    test_id: id.to_string(),
                    status: TestStatus::Completed,
                    iperf_json: String::new(),
                    error_message: String::new(),
                    start_time_unix: 0,
                    end_time_unix: 1,
                    exit_code: 0,
                })
                .unwrap();
        }

        // Filtered fetch with clear drops even the results it did not return.
        let resp = svc.get_results(GetResultsRequest {
            test_ids: vec!["t1".to_string()],
            clear_after_retrieval: true,
        });
        assert_eq!(resp.total_count, 1);
        assert_eq!(svc.collector.count(), 0);
    }
}
