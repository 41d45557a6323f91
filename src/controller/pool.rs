//! # Connection Pool
//!
//! One RPC channel per node, established once up front and reused for every
//! phase. Calls are unary: the channel serializes write-request/read-response
//! under its own stream lock, bounded by the configured RPC timeout.

use crate::model::Node;
use crate::rpc::{
    read_frame, write_frame, GetResultsRequest, GetResultsResponse, GetStatusResponse,
    InitializeRequest, InitializeResponse, PrepareTestRequest, PrepareTestResponse, Request,
    Response, StartClientsRequest, StartClientsResponse, StartServersRequest,
    StartServersResponse, StopAllRequest, StopAllResponse,
};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// An established channel to one daemon
pub struct NodeChannel {
    pub node: Arc<Node>,
    stream: tokio::sync::Mutex<TcpStream>,
    rpc_timeout: Duration,
}

impl NodeChannel {
    /// Issue one unary call. Transport failures and timeouts are `Err`;
    /// `Response::Error` from the daemon is promoted to `Err` as well.
    async fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = self.stream.lock().await;

        let exchange = async {
            write_frame(&mut *stream, request).await?;
            read_frame::<_, Response>(&mut *stream).await
        };

        let response = timeout(self.rpc_timeout, exchange)
            .await
            .map_err(|_| {
                anyhow!(
                    "RPC to {} timed out after {}s",
                    self.node.id,
                    self.rpc_timeout.as_secs()
                )
            })?
            .with_context(|| format!("RPC to {} failed", self.node.id))?;

        if let Response::Error(message) = response {
            bail!("daemon {} error: {message}", self.node.id);
        }
        Ok(response)
    }

    pub async fn initialize(&self, req: InitializeRequest) -> Result<InitializeResponse> {
        match self.call(&Request::Initialize(req)).await? {
            Response::Initialize(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn prepare_test(&self, req: PrepareTestRequest) -> Result<PrepareTestResponse> {
        match self.call(&Request::PrepareTest(req)).await? {
            Response::PrepareTest(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn start_servers(&self, req: StartServersRequest) -> Result<StartServersResponse> {
        match self.call(&Request::StartServers(req)).await? {
            Response::StartServers(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn start_clients(&self, req: StartClientsRequest) -> Result<StartClientsResponse> {
        match self.call(&Request::StartClients(req)).await? {
            Response::StartClients(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn stop_all(&self, req: StopAllRequest) -> Result<StopAllResponse> {
        match self.call(&Request::StopAll(req)).await? {
            Response::StopAll(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn get_results(&self, req: GetResultsRequest) -> Result<GetResultsResponse> {
        match self.call(&Request::GetResults(req)).await? {
            Response::GetResults(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }

    pub async fn get_status(&self) -> Result<GetStatusResponse> {
        match self.call(&Request::GetStatus).await? {
            Response::GetStatus(resp) => Ok(resp),
            other => bail!("unexpected response from {}: {other:?}", self.node.id),
        }
    }
}

/// Channels to every daemon, keyed by node id
pub struct ConnectionPool {
    channels: Mutex<HashMap<String, Arc<NodeChannel>>>,
    connection_timeout: Duration,
    rpc_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(connection_timeout: Duration, rpc_timeout: Duration) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            connection_timeout,
            rpc_timeout,
        }
    }

    /// Connect to one node; a node that is already connected is left alone
    pub async fn connect(&self, node: Arc<Node>) -> Result<()> {
        if self.is_connected(&node.id) {
            return Ok(());
        }

        let addr = node.address();
        let stream = timeout(self.connection_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                anyhow!(
                    "connection to {addr} timed out after {}s",
                    self.connection_timeout.as_secs()
                )
            })?
            .with_context(|| format!("failed to connect to {addr}"))?;
        stream
            .set_nodelay(true)
            .with_context(|| format!("failed to set nodelay for {addr}"))?;
        debug!("connected to daemon {} at {addr}", node.id);

        let channel = Arc::new(NodeChannel {
            node: Arc::clone(&node),
            stream: tokio::sync::Mutex::new(stream),
            rpc_timeout: self.rpc_timeout,
        });
        self.channels
            .lock()
            .unwrap()
            .insert(node.id.clone(), channel);
        Ok(())
    }

    /// Connect to every node, collecting per-node failures
    pub async fn connect_all(&self, nodes: &[Arc<Node>]) -> Result<()> {
        let mut errors = Vec::new();
        for node in nodes {
            if let Err(e) = self.connect(Arc::clone(node)).await {
                errors.push(format!("node {}: {e:#}", node.id));
            }
        }
        if !errors.is_empty() {
            bail!(
                "failed to connect to {} nodes: {}",
                errors.len(),
                errors.join("; ")
            );
        }
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Result<Arc<NodeChannel>> {
        self.channels
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| anyhow!("no connection to node {node_id}"))
    }

    /// All channels, ordered by node id for stable iteration
    pub fn all(&self) -> Vec<Arc<NodeChannel>> {
        let mut channels: Vec<Arc<NodeChannel>> =
            self.channels.lock().unwrap().values().cloned().collect();
        channels.sort_by(|a, b| a.node.id.cmp(&b.node.id));
        channels
    }

    pub fn count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        self.channels.lock().unwrap().contains_key(node_id)
    }

    /// Broadcast `Initialize`, failing if any daemon errors or refuses
    pub async fn initialize_all(&self, request: InitializeRequest) -> Result<()> {
        let mut errors = Vec::new();
        for channel in self.all() {
            match channel.initialize(request.clone()).await {
                Ok(resp) if !resp.success => {
                    errors.push(format!("node {}: {}", channel.node.id, resp.message));
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("node {}: {e:#}", channel.node.id)),
            }
        }
        if !errors.is_empty() {
            bail!(
                "initialization failed on {} nodes: {}",
                errors.len(),
                errors.join("; ")
            );
        }
        Ok(())
    }

    /// Broadcast `StopAll(force)`; per-node failures are collected
    pub async fn stop_all(&self) -> Result<usize> {
        let mut errors = Vec::new();
        let mut stopped = 0;
        for channel in self.all() {
            match channel.stop_all(StopAllRequest { force: true }).await {
                Ok(resp) => stopped += resp.stopped_count,
                Err(e) => errors.push(format!("node {}: {e:#}", channel.node.id)),
            }
        }
        if !errors.is_empty() {
            bail!("stop failed on {} nodes: {}", errors.len(), errors.join("; "));
        }
        Ok(stopped)
    }

    /// Query every daemon's status. Unreachable nodes are reported in the
    /// error list rather than failing the whole sweep.
    pub async fn check_health(&self) -> (HashMap<String, GetStatusResponse>, Vec<String>) {
        let mut statuses = HashMap::new();
        let mut errors = Vec::new();
        for channel in self.all() {
            match channel.get_status().await {
                Ok(status) => {
                    statuses.insert(channel.node.id.clone(), status);
                }
                Err(e) => {
                    warn!("health check failed for {}: {e:#}", channel.node.id);
                    errors.push(format!("node {}: {e:#}", channel.node.id));
                }
            }
        }
        (statuses, errors)
    }

    /// Drop every channel
    pub fn close(&self) {
        self.channels.lock().unwrap().clear();
    }
}
