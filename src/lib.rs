//! # meshperf
//!
//! A distributed command-and-control plane for full-mesh network performance
//! testing built on top of iperf3. A central controller drives one daemon per
//! test node; each daemon supervises local iperf3 processes, and the
//! controller plans the test matrix and aggregates results.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod iperf;
pub mod logging;
pub mod model;
pub mod rpc;

pub use config::{ControllerConfig, DaemonConfig};
pub use model::{Node, NodeRegistry, Protocol, ProfileRegistry, TestProfile};

/// The current version of meshperf
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default daemon RPC listen port
    pub const LISTEN_PORT: u16 = 50051;

    /// Default start of the iperf3 server port range
    pub const PORT_RANGE_START: u16 = 5201;

    /// Default end of the iperf3 server port range
    pub const PORT_RANGE_END: u16 = 5400;

    /// Default maximum concurrent iperf3 processes per daemon
    pub const MAX_PROCESSES: usize = 200;

    /// Default log level
    pub const LOG_LEVEL: &str = "info";

    /// Default daemon result directory
    pub const RESULT_DIR: &str = "./results";

    /// Default path of the iperf3 binary
    pub const IPERF_PATH: &str = "iperf3";

    /// Default per-RPC timeout in seconds
    pub const RPC_TIMEOUT_SECS: u64 = 60;

    /// Default connection timeout in seconds
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;

    /// Base port for topology server-port blocks
    pub const TOPOLOGY_BASE_PORT: u16 = 5201;
}
