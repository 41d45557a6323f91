//! meshperf-controller: central planner and executor.
//!
//! Subcommands:
//! - `run`      execute a full test based on the configuration
//! - `validate` parse and validate the configuration, printing counts
//! - `status`   query every daemon's health and print a per-node table

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshperf::controller::{Aggregator, ConnectionPool, Orchestrator, OutputWriter, Planner, Progress};
use meshperf::{config, iperf, logging, ControllerConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "meshperf-controller",
    version = meshperf::VERSION,
    about = "meshperf controller for orchestrating distributed iperf3 tests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase diagnostic log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence user-facing output on stdout
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Path for detailed logs, or 'stderr'
    #[arg(long, global = true, value_name = "PATH | stderr")]
    log_file: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a test based on configuration
    Run {
        /// Path to the configuration file
        #[arg(short = 'c', long, default_value = "./controller.yaml")]
        config: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(short = 'c', long, default_value = "./controller.yaml")]
        config: PathBuf,
    },
    /// Check status of all configured nodes
    Status {
        /// Path to the configuration file
        #[arg(short = 'c', long, default_value = "./controller.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = logging::level_from_verbosity(cli.verbose);
    let _log_guard = logging::init(
        level,
        cli.quiet,
        cli.log_file.as_deref(),
        "meshperf-controller.log",
    )?;

    match cli.command {
        Command::Run { config } => run_test(&config).await,
        Command::Validate { config } => validate_config(&config),
        Command::Status { config } => check_status(&config).await,
    }
}

async fn run_test(config_path: &PathBuf) -> Result<()> {
    info!("meshperf-controller version {}", meshperf::VERSION);
    info!("loading configuration from {}", config_path.display());

    let cfg = config::load_controller_config(config_path).context("failed to load config")?;

    let nodes = cfg.build_node_registry()?;
    info!("loaded {} nodes from configuration", nodes.len());
    let profiles = cfg.build_profile_registry()?;
    info!("loaded {} test profiles", profiles.len());

    let default_profile = profiles.get(&cfg.controller.topology.default_profile)?;

    // Plan before touching the network; the plan is pure.
    let mut planner = Planner::new(&nodes, &profiles, default_profile);
    for override_ in &cfg.controller.topology.overrides {
        planner.add_group_override(&override_.nodes, &override_.profile);
    }
    let topology = planner.full_mesh().context("failed to generate topology")?;
    info!("generated topology: {} test pairs", topology.test_count());

    let concurrency = &cfg.controller.concurrency;
    let pool = ConnectionPool::new(
        Duration::from_secs(concurrency.connection_timeout_seconds),
        Duration::from_secs(concurrency.rpc_timeout_seconds),
    );

    info!("connecting to daemons...");
    pool.connect_all(nodes.all())
        .await
        .context("failed to connect to daemons")?;
    info!("connected to {} daemons", pool.count());

    let progress = Progress::new();
    let aggregator = Aggregator::new();
    let orchestrator = Orchestrator::new(&pool, &progress, cfg.controller.save_daemon_results);

    let execution = orchestrator.execute(&topology, &aggregator).await;
    if execution.is_err() {
        // Partial results may still have been collected before the failure.
        warn!("test execution failed in state '{}'", orchestrator.state());
    }

    let results = aggregator.results();
    let summary = aggregator.summary();
    info!("collected {} results", results.len());
    info!(
        "completed: {}, failed: {}",
        summary.completed_tests, summary.failed_tests
    );

    let writer = OutputWriter::new(
        &cfg.controller.output.json_file,
        &cfg.controller.output.csv_file,
    );
    writer
        .write_all(&summary, &results)
        .context("failed to write output")?;

    print_run_summary(&summary);
    if progress.error_count() > 0 {
        println!("{}", progress.summary());
    }

    pool.close();
    execution
}

fn print_run_summary(summary: &meshperf::controller::aggregate::Summary) {
    println!("\nTest complete!");
    println!("  Total tests: {}", summary.total_tests);
    println!("  Completed: {}", summary.completed_tests);
    println!("  Failed: {}", summary.failed_tests);
    if summary.avg_throughput_bps > 0.0 {
        let (value, unit) = iperf::human_throughput(summary.avg_throughput_bps);
        println!("  Avg throughput: {value:.2} {unit}");
    }
}

fn validate_config(config_path: &PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let cfg: ControllerConfig =
        config::load_controller_config(config_path).context("configuration invalid")?;

    println!("Configuration is valid");
    println!("  Nodes: {}", cfg.controller.nodes.len());
    println!("  Profiles: {}", cfg.controller.test_profiles.len());
    println!("  Default profile: {}", cfg.controller.topology.default_profile);
    println!("  Topology type: {}", cfg.controller.topology.topology_type);
    Ok(())
}

async fn check_status(config_path: &PathBuf) -> Result<()> {
    println!("Checking node status from {}\n", config_path.display());

    let cfg = config::load_controller_config(config_path).context("failed to load config")?;
    let nodes = cfg.build_node_registry()?;

    let pool = ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(10));
    if let Err(e) = pool.connect_all(nodes.all()).await {
        warn!("{e:#}");
    }

    let (statuses, errors) = pool.check_health().await;
    for error in &errors {
        warn!("{error}");
    }

    println!("Node Status:");
    println!("{}", "-".repeat(80));
    for node in nodes.all() {
        let Some(status) = statuses.get(&node.id) else {
            println!("{:<20}  OFFLINE", node.id);
            continue;
        };

        let health = if status.healthy { "ONLINE" } else { "UNHEALTHY" };
        println!("{:<20}  {health}", node.id);
        println!("  Running processes: {}", status.running_processes);
        println!("  Completed tests: {}", status.completed_tests);
        println!("  Failed tests: {}", status.failed_tests);
        println!(
            "  Available capacity: {}/{}",
            status.capacity.available_processes, status.capacity.max_processes
        );
        println!("  Uptime: {} seconds", status.uptime_seconds);
        println!("  Version: {}", status.version);
        println!();
    }

    pool.close();
    Ok(())
}
