//! Controller-side integration: plans a 3-node mesh and drives the full
//! 7-phase workflow against three in-process daemons backed by a stub
//! executable.
//!
//! This is the slowest test in the suite: the wait phase sleeps for the
//! floored profile duration plus its buffer.

#![cfg(unix)]

use meshperf::config::DaemonConfig;
use meshperf::controller::{
    Aggregator, ConnectionPool, Orchestrator, Planner, Progress, TestState,
};
use meshperf::daemon::{self, DaemonService};
use meshperf::model::{Node, NodeRegistry, ProfileRegistry, TestProfile};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn stub_binary(dir: &std::path::Path) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("iperf3-stub");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
        f,
        "#!/bin/sh\n\
         if [ \"$1\" = \"-s\" ]; then\n\
         \x20 sleep 60\n\
         else\n\
         \x20 echo '{{\"end\":{{\"sum_sent\":{{\"bits_per_second\":2000000000.0,\"retransmits\":1}}}}}}'\n\
         fi"
    )
    .unwrap();
    let mut perms = f.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

async fn start_daemon(iperf_path: &str, id: &str) -> (Arc<Node>, CancellationToken) {
    let mut config: DaemonConfig = serde_yaml::from_str("daemon: {}").unwrap();
    config.daemon.iperf_path = iperf_path.to_string();

    let service = Arc::new(DaemonService::new(&config.daemon).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(daemon::serve(service, listener, shutdown.clone()));

    (
        Arc::new(Node {
            id: id.to_string(),
            hostname: id.to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            tags: Vec::new(),
        }),
        shutdown,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_mesh_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let stub = stub_binary(dir.path());

    let mut nodes = NodeRegistry::new();
    let mut shutdowns = Vec::new();
    for id in ["a", "b", "c"] {
        let (node, shutdown) = start_daemon(&stub, id).await;
        nodes.add((*node).clone()).unwrap();
        shutdowns.push(shutdown);
    }

    let mut profiles = ProfileRegistry::new();
    profiles.add(TestProfile::named("default", 1)).unwrap();
    let default_profile = profiles.get("default").unwrap();

    let planner = Planner::new(&nodes, &profiles, default_profile);
    let topology = planner.full_mesh().unwrap();

    // E1 shape: 6 pairs, 2 server ports per node in consecutive blocks.
    assert_eq!(topology.test_count(), 6);
    assert_eq!(topology.server_ports["a"], vec![5201, 5202]);
    assert_eq!(topology.server_ports["b"], vec![5203, 5204]);
    assert_eq!(topology.server_ports["c"], vec![5205, 5206]);

    let pool = ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(30));
    pool.connect_all(nodes.all()).await.unwrap();
    assert_eq!(pool.count(), 3);

    let progress = Progress::new();
    let aggregator = Aggregator::new();
    let orchestrator = Orchestrator::new(&pool, &progress, false);

    orchestrator.execute(&topology, &aggregator).await.unwrap();
    assert_eq!(orchestrator.state(), TestState::Complete);

    // Six completed results with attribution resolved from the topology.
    let results = aggregator.results();
    assert_eq!(results.len(), 6);
    for result in &results {
        assert_eq!(result.status, "completed", "result {}", result.test_id);
        assert!(!result.source_node.is_empty());
        assert!(!result.dest_node.is_empty());
        assert_eq!(result.throughput_bps, Some(2.0e9));
    }

    let summary = aggregator.summary();
    assert_eq!(summary.total_tests, 6);
    assert_eq!(summary.completed_tests, 6);
    assert_eq!(summary.failed_tests, 0);
    assert_eq!(summary.avg_throughput_bps, 2.0e9);
    assert_eq!(summary.total_retransmits, 6);

    // Cleanup stopped the lingering servers on every daemon.
    for channel in pool.all() {
        let status = channel.get_status().await.unwrap();
        assert_eq!(status.running_processes, 0, "node {}", channel.node.id);
    }

    assert_eq!(progress.percent_complete(), 0.0); // completion is daemon-side
    assert_eq!(progress.error_count(), 0);

    for shutdown in shutdowns {
        shutdown.cancel();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_failure_aborts_and_cleanup_still_runs() {
    let dir = tempfile::tempdir().unwrap();
    let stub = stub_binary(dir.path());

    // One daemon with a single slot cannot hold its mesh slice.
    let mut config: DaemonConfig = serde_yaml::from_str("daemon: {}").unwrap();
    config.daemon.iperf_path = stub.clone();
    config.daemon.max_processes = 1;
    let service = Arc::new(DaemonService::new(&config.daemon).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(daemon::serve(service, listener, shutdown.clone()));

    let (peer, peer_shutdown) = start_daemon(&stub, "b").await;

    let mut nodes = NodeRegistry::new();
    nodes
        .add(Node {
            id: "a".to_string(),
            hostname: "a".to_string(),
            ip: addr.ip().to_string(),
            port: addr.port(),
            tags: Vec::new(),
        })
        .unwrap();
    nodes.add((*peer).clone()).unwrap();

    let mut profiles = ProfileRegistry::new();
    profiles.add(TestProfile::named("default", 1)).unwrap();
    let planner = Planner::new(&nodes, &profiles, profiles.get("default").unwrap());
    let topology = planner.full_mesh().unwrap();

    let pool = ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(10));
    pool.connect_all(nodes.all()).await.unwrap();

    let progress = Progress::new();
    let aggregator = Aggregator::new();
    let orchestrator = Orchestrator::new(&pool, &progress, false);

    let err = orchestrator
        .execute(&topology, &aggregator)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("prepare phase failed"));
    assert_eq!(orchestrator.state(), TestState::Failed);
    assert!(progress.error_count() > 0);

    // Cleanup ran: both daemons answer and hold no processes.
    for channel in pool.all() {
        let status = channel.get_status().await.unwrap();
        assert_eq!(status.running_processes, 0);
    }

    shutdown.cancel();
    peer_shutdown.cancel();
}
