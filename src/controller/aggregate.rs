//! # Result Aggregator
//!
//! Pulls per-node results off the daemons, joins them with the topology to
//! recover source/destination attribution, derives throughput and retransmit
//! figures from the raw iperf3 JSON, and produces the run summary.
//!
//! Extraction is best-effort: a result whose JSON lacks the expected fields
//! is still stored, just without derived figures.

use crate::controller::pool::ConnectionPool;
use crate::controller::topology::Topology;
use crate::iperf;
use crate::rpc::{GetResultsRequest, TestResult};
use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// One test result with controller-side derived fields
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedResult {
    pub test_id: String,
    pub source_node: String,
    pub dest_node: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iperf_data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throughput_bps: Option<f64>,
    #[serde(skip_serializing_if = "is_zero")]
    pub retransmits: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Aggregate statistics over one run
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub total_tests: usize,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub avg_throughput_bps: f64,
    pub min_throughput_bps: f64,
    pub max_throughput_bps: f64,
    pub total_retransmits: i64,
}

/// Collects results from every node, keyed by test id
#[derive(Debug, Default)]
pub struct Aggregator {
    results: Mutex<HashMap<String, AggregatedResult>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch results from every connected daemon. Unreachable nodes are
    /// logged and skipped; collection failure on one node never discards
    /// what the others returned.
    pub async fn collect(&self, pool: &ConnectionPool, topology: &Topology) -> Result<usize> {
        let mut collected = 0;
        for channel in pool.all() {
            let response = match channel
                .get_results(GetResultsRequest {
                    test_ids: Vec::new(),
                    clear_after_retrieval: false,
                })
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!("failed to get results from node {}: {e:#}", channel.node.id);
                    continue;
                }
            };

            debug!(
                "node {}: collected {} results",
                channel.node.id, response.total_count
            );
            for result in response.results {
                // Daemon-side server records never reach the collector, so
                // everything here is a client test; unknown ids still get
                // stored, just without attribution.
                self.add(self.convert(&result, topology));
                collected += 1;
            }
        }
        Ok(collected)
    }

    /// Join one wire result with the topology and derive metrics
    fn convert(&self, result: &TestResult, topology: &Topology) -> AggregatedResult {
        let (source_node, dest_node) = match topology.pair(&result.test_id) {
            Some(pair) => (pair.source.id.clone(), pair.destination.id.clone()),
            None => (String::new(), String::new()),
        };

        let mut aggregated = AggregatedResult {
            test_id: result.test_id.clone(),
            source_node,
            dest_node,
            status: result.status.to_string(),
            start_time: result.start_time_unix,
            end_time: result.end_time_unix,
            duration: result.end_time_unix - result.start_time_unix,
            error_message: result.error_message.clone(),
            iperf_data: None,
            throughput_bps: None,
            retransmits: 0,
        };

        if !result.iperf_json.is_empty() {
            if let Ok(data) = iperf::parse_result(&result.iperf_json) {
                aggregated.throughput_bps = iperf::extract_throughput(&data);
                aggregated.retransmits = iperf::extract_retransmits(&data);
                aggregated.iperf_data = Some(data);
            }
        }

        aggregated
    }

    /// Store a result; a later result for the same test id overwrites
    pub fn add(&self, result: AggregatedResult) {
        self.results
            .lock()
            .unwrap()
            .insert(result.test_id.clone(), result);
    }

    /// All results, sorted by test id for stable output
    pub fn results(&self) -> Vec<AggregatedResult> {
        let mut results: Vec<AggregatedResult> =
            self.results.lock().unwrap().values().cloned().collect();
        results.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        results
    }

    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }

    pub fn summary(&self) -> Summary {
        let results = self.results.lock().unwrap();

        let mut summary = Summary {
            total_tests: results.len(),
            completed_tests: 0,
            failed_tests: 0,
            avg_throughput_bps: 0.0,
            min_throughput_bps: f64::INFINITY,
            max_throughput_bps: 0.0,
            total_retransmits: 0,
        };

        let mut total_throughput = 0.0;
        let mut throughput_samples = 0usize;

        for result in results.values() {
            match result.status.as_str() {
                "completed" => {
                    summary.completed_tests += 1;
                    if let Some(bps) = result.throughput_bps {
                        if bps > 0.0 {
                            total_throughput += bps;
                            throughput_samples += 1;
                            summary.min_throughput_bps = summary.min_throughput_bps.min(bps);
                            summary.max_throughput_bps = summary.max_throughput_bps.max(bps);
                        }
                    }
                    summary.total_retransmits += result.retransmits;
                }
                "failed" => summary.failed_tests += 1,
                _ => {}
            }
        }

        if throughput_samples > 0 {
            summary.avg_throughput_bps = total_throughput / throughput_samples as f64;
        }
        if !summary.min_throughput_bps.is_finite() {
            summary.min_throughput_bps = 0.0;
        }

        summary
    }
}
