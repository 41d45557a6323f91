//! # RPC Contract
//!
//! The controller and daemons speak a small unary request/response protocol
//! over one TCP connection per node: a 4-byte little-endian length prefix
//! followed by a bincode-encoded message, capped at 16 MiB. The controller
//! sends one `Request` at a time and reads exactly one `Response` back.
//!
//! Transport failures surface as `Err` on the calling side; domain failures
//! (a port that would not bind, a test that is already running) travel inside
//! the response payloads so that one bad port does not poison a whole phase.
//! New fields are added to the end of existing messages only.

use crate::model::{SystemCapacity, TestProfile};
use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for a single frame; anything larger is a protocol error
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// All calls the daemon service accepts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Initialize(InitializeRequest),
    PrepareTest(PrepareTestRequest),
    StartServers(StartServersRequest),
    StartClients(StartClientsRequest),
    StopAll(StopAllRequest),
    GetResults(GetResultsRequest),
    GetStatus,
}

/// Responses, one variant per request; `Error` is reserved for internal
/// daemon failures that have no domain-level representation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Initialize(InitializeResponse),
    PrepareTest(PrepareTestResponse),
    StartServers(StartServersResponse),
    StartClients(StartClientsResponse),
    StopAll(StopAllResponse),
    GetResults(GetResultsResponse),
    GetStatus(GetStatusResponse),
    Error(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// Override the daemon's configured process limit
    pub max_processes: Option<usize>,
    pub log_level: Option<String>,
    /// Keep raw iperf3 output on the daemon as well
    pub save_results: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub success: bool,
    pub message: String,
    pub node_info: Option<NodeInfo>,
}

/// Daemon self-description returned from `Initialize`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub capacity: SystemCapacity,
}

/// Per-node slice of the planned topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeTopology {
    /// Ports this node must run servers on
    pub server_ports: Vec<u16>,
    /// Tests this node must run as a client
    pub client_targets: Vec<ClientTarget>,
}

impl NodeTopology {
    /// Process slots this slice will consume
    pub fn required_slots(&self) -> usize {
        self.server_ports.len() + self.client_targets.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareTestRequest {
    pub topology: NodeTopology,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareTestResponse {
    pub can_handle: bool,
    pub message: String,
    pub required_slots: usize,
    pub available_slots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServersRequest {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartServersResponse {
    /// True when at least one server started
    pub success: bool,
    pub message: String,
    pub started_ports: Vec<u16>,
    pub errors: Vec<String>,
}

/// One client test to launch: connect to `destination_ip:destination_port`
/// and run with `profile`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTarget {
    pub test_id: String,
    pub destination_ip: String,
    pub destination_port: u16,
    pub profile: TestProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartClientsRequest {
    pub targets: Vec<ClientTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartClientsResponse {
    /// True when at least one client started
    pub success: bool,
    pub message: String,
    pub started_test_ids: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopAllRequest {
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAllResponse {
    pub stopped_count: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetResultsRequest {
    /// Empty means all results
    pub test_ids: Vec<String>,
    /// Clears the entire collector after the snapshot, regardless of any
    /// `test_ids` filter
    pub clear_after_retrieval: bool,
}

/// Terminal status of one test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Completed,
    Failed,
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Completed => write!(f, "completed"),
            TestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One stored result as shipped back to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub status: TestStatus,
    pub iperf_json: String,
    pub error_message: String,
    pub start_time_unix: i64,
    pub end_time_unix: i64,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResultsResponse {
    pub results: Vec<TestResult>,
    pub total_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatusResponse {
    pub healthy: bool,
    pub running_processes: usize,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub capacity: SystemCapacity,
    pub uptime_seconds: u64,
    pub version: String,
}

/// Write one length-prefixed bincode frame
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serialize(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {} bytes", bytes.len()));
    }
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(anyhow!("frame too large: {len} bytes"));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Ok(bincode::deserialize(&data)?)
}
