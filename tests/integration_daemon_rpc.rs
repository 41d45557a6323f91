//! End-to-end exercise of the daemon RPC service over real TCP, using a stub
//! executable in place of iperf3 so the full lifecycle runs without network
//! measurements.

#![cfg(unix)]

use meshperf::config::DaemonConfig;
use meshperf::controller::ConnectionPool;
use meshperf::daemon::{self, DaemonService};
use meshperf::model::{Node, TestProfile};
use meshperf::rpc::{
    ClientTarget, GetResultsRequest, InitializeRequest, NodeTopology, PrepareTestRequest,
    StartClientsRequest, StartServersRequest, StopAllRequest, TestStatus,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Stub standing in for iperf3: servers (`-s`) linger, clients emit JSON.
fn stub_binary(dir: &std::path::Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("iperf3-stub");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
        f,
        "#!/bin/sh\n\
         if [ \"$1\" = \"-s\" ]; then\n\
         \x20 sleep 30\n\
         else\n\
         \x20 echo '{{\"end\":{{\"sum_sent\":{{\"bits_per_second\":1000000000.0,\"retransmits\":3}}}}}}'\n\
         fi"
    )
    .unwrap();
    let mut perms = f.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// Start a daemon with the stub binary and return a connected pool
async fn start_daemon(
    iperf_path: &str,
    max_processes: usize,
) -> (ConnectionPool, Arc<Node>, CancellationToken) {
    let mut config: DaemonConfig = serde_yaml::from_str("daemon: {}").unwrap();
    config.daemon.max_processes = max_processes;
    config.daemon.iperf_path = iperf_path.to_string();

    let service = Arc::new(DaemonService::new(&config.daemon).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(daemon::serve(service, listener, shutdown.clone()));

    let node = Arc::new(Node {
        id: "local".to_string(),
        hostname: "local".to_string(),
        ip: addr.ip().to_string(),
        port: addr.port(),
        tags: Vec::new(),
    });

    let pool = ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(10));
    pool.connect(Arc::clone(&node)).await.unwrap();

    (pool, node, shutdown)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_rpc_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let stub = stub_binary(dir.path());
    let (pool, node, shutdown) = start_daemon(&stub, 16).await;
    let channel = pool.get(&node.id).unwrap();

    // Initialize reports node info and capacity.
    let init = channel
        .initialize(InitializeRequest::default())
        .await
        .unwrap();
    assert!(init.success);
    let info = init.node_info.unwrap();
    assert_eq!(info.capacity.max_processes, 16);
    assert_eq!(info.capacity.available_processes, 16);

    // Prepare passes for a topology that fits.
    let prepare = channel
        .prepare_test(PrepareTestRequest {
            topology: NodeTopology {
                server_ports: vec![5201, 5202],
                client_targets: vec![ClientTarget {
                    test_id: "test-1-a-to-b".to_string(),
                    destination_ip: "127.0.0.1".to_string(),
                    destination_port: 5301,
                    profile: TestProfile::named("default", 1),
                }],
            },
        })
        .await
        .unwrap();
    assert!(prepare.can_handle);
    assert_eq!(prepare.required_slots, 3);

    // Servers come up on the requested ports.
    let servers = channel
        .start_servers(StartServersRequest {
            ports: vec![5201, 5202],
        })
        .await
        .unwrap();
    assert!(servers.success);
    assert_eq!(servers.started_ports, vec![5201, 5202]);
    assert!(servers.errors.is_empty());

    // A duplicate port is a per-port domain error, not a call failure.
    let dup = channel
        .start_servers(StartServersRequest { ports: vec![5201] })
        .await
        .unwrap();
    assert!(!dup.success);
    assert_eq!(dup.errors.len(), 1);
    assert!(dup.errors[0].contains("already in use"));

    // Clients run to completion against the stub.
    let clients = channel
        .start_clients(StartClientsRequest {
            targets: vec![ClientTarget {
                test_id: "test-1-a-to-b".to_string(),
                destination_ip: "127.0.0.1".to_string(),
                destination_port: 5301,
                profile: TestProfile::named("default", 1),
            }],
        })
        .await
        .unwrap();
    assert!(clients.success);
    assert_eq!(clients.started_test_ids, vec!["test-1-a-to-b"]);

    // The result lands in the collector shortly after.
    let mut results = None;
    for _ in 0..50 {
        let resp = channel
            .get_results(GetResultsRequest::default())
            .await
            .unwrap();
        if resp.total_count == 1 {
            results = Some(resp);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let results = results.expect("client result never arrived");
    assert_eq!(results.results[0].status, TestStatus::Completed);
    assert!(results.results[0].iperf_json.contains("bits_per_second"));

    // Status settles on the two lingering servers once the client record is
    // reaped, with the finished test counted.
    let mut status = channel.get_status().await.unwrap();
    for _ in 0..50 {
        if status.running_processes == 2 {
            break;
        }
        sleep(Duration::from_millis(100)).await;
        status = channel.get_status().await.unwrap();
    }
    assert!(status.healthy);
    assert_eq!(status.running_processes, 2);
    assert_eq!(status.completed_tests, 1);
    assert_eq!(status.failed_tests, 0);
    assert_eq!(status.version, meshperf::VERSION);

    // StopAll tears the servers down and frees every slot.
    let stop = channel
        .stop_all(StopAllRequest { force: true })
        .await
        .unwrap();
    assert_eq!(stop.stopped_count, 2);

    let status = channel.get_status().await.unwrap();
    assert_eq!(status.running_processes, 0);
    assert_eq!(status.capacity.available_processes, 16);

    // clear_after_retrieval flushes the collector.
    let cleared = channel
        .get_results(GetResultsRequest {
            test_ids: Vec::new(),
            clear_after_retrieval: true,
        })
        .await
        .unwrap();
    assert_eq!(cleared.total_count, 1);
    let empty = channel
        .get_results(GetResultsRequest::default())
        .await
        .unwrap();
    assert_eq!(empty.total_count, 0);

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_rejects_when_capacity_is_insufficient() {
    let dir = tempfile::tempdir().unwrap();
    let stub = stub_binary(dir.path());
    let (pool, node, shutdown) = start_daemon(&stub, 1).await;
    let channel = pool.get(&node.id).unwrap();

    let prepare = channel
        .prepare_test(PrepareTestRequest {
            topology: NodeTopology {
                server_ports: vec![5201],
                client_targets: vec![ClientTarget {
                    test_id: "test-1-a-to-b".to_string(),
                    destination_ip: "127.0.0.1".to_string(),
                    destination_port: 5301,
                    profile: TestProfile::named("default", 1),
                }],
            },
        })
        .await
        .unwrap();

    assert!(!prepare.can_handle);
    assert_eq!(prepare.required_slots, 2);
    assert_eq!(prepare.available_slots, 1);
    assert!(prepare.message.contains("need 2 slots, have 1 available"));

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_during_client_run_yields_failed_results() {
    let dir = tempfile::tempdir().unwrap();
    // Clients hang so StopAll catches them mid-flight.
    let path = dir.path().join("iperf3-stub");
    {
        use std::os::unix::fs::PermissionsExt;
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nsleep 30").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }
    let (pool, node, shutdown) = start_daemon(path.to_str().unwrap(), 8).await;
    let channel = pool.get(&node.id).unwrap();

    let clients = channel
        .start_clients(StartClientsRequest {
            targets: vec![
                ClientTarget {
                    test_id: "t1".to_string(),
                    destination_ip: "127.0.0.1".to_string(),
                    destination_port: 5301,
                    profile: TestProfile::named("default", 30),
                },
                ClientTarget {
                    test_id: "t2".to_string(),
                    destination_ip: "127.0.0.1".to_string(),
                    destination_port: 5302,
                    profile: TestProfile::named("default", 30),
                },
            ],
        })
        .await
        .unwrap();
    assert_eq!(clients.started_test_ids.len(), 2);

    let stop = channel
        .stop_all(StopAllRequest { force: true })
        .await
        .unwrap();
    assert_eq!(stop.stopped_count, 2);

    // Cancelled clients still produce failed results.
    let mut results = None;
    for _ in 0..50 {
        let resp = channel
            .get_results(GetResultsRequest::default())
            .await
            .unwrap();
        if resp.total_count == 2 {
            results = Some(resp);
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }
    let results = results.expect("cancelled results never arrived");
    for result in &results.results {
        assert_eq!(result.status, TestStatus::Failed);
        assert!(result.error_message.contains("cancelled"));
    }

    let status = channel.get_status().await.unwrap();
    assert_eq!(status.running_processes, 0);
    assert_eq!(status.capacity.available_processes, 8);

    shutdown.cancel();
}
