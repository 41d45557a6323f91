//! # Controller
//!
//! The planning and execution side of meshperf: a connection pool holding one
//! channel per daemon, the topology planner, the phase-driven orchestrator,
//! and result aggregation and output.

pub mod aggregate;
pub mod orchestrator;
pub mod output;
pub mod pool;
pub mod progress;
pub mod topology;

pub use aggregate::Aggregator;
pub use orchestrator::{Orchestrator, TestState};
pub use output::OutputWriter;
pub use pool::ConnectionPool;
pub use progress::Progress;
pub use topology::{Planner, TestPair, Topology};
