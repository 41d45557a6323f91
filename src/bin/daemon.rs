//! meshperf-daemon: per-node supervisor exposing the RPC service.
//!
//! Loads its YAML configuration, wires up the daemon components, and serves
//! until SIGINT/SIGTERM. Exit code 0 on graceful shutdown, non-zero on fatal
//! startup failure.

use anyhow::{Context, Result};
use clap::Parser;
use meshperf::daemon::{self, DaemonService};
use meshperf::{config, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "meshperf-daemon",
    version = meshperf::VERSION,
    about = "meshperf daemon for managing iperf3 processes"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long, default_value = "./daemon.yaml")]
    config: PathBuf,

    /// Increase diagnostic log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Silence user-facing output on stdout
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Path for detailed logs, or 'stderr'
    #[arg(long, value_name = "PATH | stderr")]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::load_daemon_config(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    // CLI verbosity wins over the configured level.
    let level = if args.verbose > 0 {
        logging::level_from_verbosity(args.verbose)
    } else {
        logging::level_from_str(&config.daemon.log_level)
    };
    let _log_guard = logging::init(level, args.quiet, args.log_file.as_deref(), "meshperf-daemon.log")?;

    info!("meshperf-daemon version {}", meshperf::VERSION);
    info!(
        "port range: {}-{}, max processes: {}",
        config.daemon.port_range.start, config.daemon.port_range.end, config.daemon.max_processes
    );

    let service = Arc::new(DaemonService::new(&config.daemon)?);
    info!("port capacity: {} server ports", service.port_capacity());

    let listen_addr = format!("0.0.0.0:{}", config.daemon.listen_port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to listen on {listen_addr}"))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    if let Err(e) = daemon::serve(service, listener, shutdown).await {
        error!("daemon failed: {e:#}");
        return Err(e);
    }
    Ok(())
}

/// Cancel the shutdown token on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("shutdown signal received");
        shutdown.cancel();
    });
}
