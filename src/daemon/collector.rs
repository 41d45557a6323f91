//! # Result Collector
//!
//! Daemon-local store of finished test results, keyed by test id, with
//! running counters by outcome. Written by process-manager worker tasks,
//! read and cleared over RPC.

use crate::iperf::RunOutcome;
use crate::rpc::{TestResult, TestStatus};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct Store {
    results: HashMap<String, TestResult>,
    completed: usize,
    failed: usize,
}

/// Thread-safe result store
#[derive(Debug, Default)]
pub struct ResultCollector {
    store: Mutex<Store>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. Storing a second result under the same test id
    /// replaces the first and adjusts the counters.
    pub fn store(&self, result: TestResult) -> Result<()> {
        if result.test_id.is_empty() {
            bail!("test ID cannot be empty");
        }

        let mut store = self.store.lock().unwrap();
        if let Some(previous) = store.results.insert(result.test_id.clone(), result.clone()) {
            match previous.status {
                TestStatus::Completed => store.completed -= 1,
                TestStatus::Failed => store.failed -= 1,
            }
        }
        match result.status {
            TestStatus::Completed => store.completed += 1,
            TestStatus::Failed => store.failed += 1,
        }
        Ok(())
    }

    /// Store the outcome of one client run under `test_id`
    pub fn store_outcome(&self, test_id: &str, outcome: &RunOutcome) -> Result<()> {
        let status = if outcome.success {
            TestStatus::Completed
        } else {
            TestStatus::Failed
        };
        self.store(TestResult {
            test_id: test_id.to_string(),
            status,
            iperf_json: outcome.json_output.clone(),
            error_message: outcome.error.clone(),
            start_time_unix: outcome.start_time.timestamp(),
            end_time_unix: outcome.end_time.timestamp(),
            exit_code: outcome.exit_code,
        })
    }

    pub fn get(&self, test_id: &str) -> Option<TestResult> {
        self.store.lock().unwrap().results.get(test_id).cloned()
    }

    /// Results for the given ids; missing ids are skipped
    pub fn get_many(&self, test_ids: &[String]) -> Vec<TestResult> {
        let store = self.store.lock().unwrap();
        test_ids
            .iter()
            .filter_map(|id| store.results.get(id).cloned())
            .collect()
    }

    pub fn all(&self) -> Vec<TestResult> {
        self.store.lock().unwrap().results.values().cloned().collect()
    }

    pub fn has_result(&self, test_id: &str) -> bool {
        self.store.lock().unwrap().results.contains_key(test_id)
    }

    pub fn result_ids(&self) -> Vec<String> {
        self.store.lock().unwrap().results.keys().cloned().collect()
    }

    /// Remove one result, keeping the counters in step
    pub fn clear(&self, test_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap();
        let Some(result) = store.results.remove(test_id) else {
            bail!("result for test {test_id} not found");
        };
        match result.status {
            TestStatus::Completed => store.completed -= 1,
            TestStatus::Failed => store.failed -= 1,
        }
        Ok(())
    }

    pub fn clear_all(&self) {
        let mut store = self.store.lock().unwrap();
        *store = Store::default();
    }

    pub fn count(&self) -> usize {
        self.store.lock().unwrap().results.len()
    }

    pub fn completed_count(&self) -> usize {
        self.store.lock().unwrap().completed
    }

    pub fn failed_count(&self) -> usize {
        self.store.lock().unwrap().failed
    }
}
