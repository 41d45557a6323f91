//! # Progress Tracker
//!
//! Thread-safe counters covering every phase of a test run, for logging and
//! the end-of-run summary. All state sits behind one lock; readers take
//! consistent snapshots.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Counters {
    total_nodes: usize,
    total_tests: usize,
    total_servers: usize,
    total_clients: usize,

    connected_nodes: usize,
    prepared_nodes: usize,
    started_servers: usize,
    started_clients: usize,
    completed_tests: usize,
    failed_tests: usize,
    collected_results: usize,

    current_phase: String,
    phase_start: Instant,
    errors: Vec<String>,
}

/// Tracks execution progress across all orchestrator phases
#[derive(Debug)]
pub struct Progress {
    start_time: Instant,
    counters: Mutex<Counters>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Mutex::new(Counters {
                total_nodes: 0,
                total_tests: 0,
                total_servers: 0,
                total_clients: 0,
                connected_nodes: 0,
                prepared_nodes: 0,
                started_servers: 0,
                started_clients: 0,
                completed_tests: 0,
                failed_tests: 0,
                collected_results: 0,
                current_phase: "init".to_string(),
                phase_start: Instant::now(),
                errors: Vec::new(),
            }),
        }
    }

    pub fn set_totals(&self, nodes: usize, tests: usize, servers: usize, clients: usize) {
        let mut c = self.counters.lock().unwrap();
        c.total_nodes = nodes;
        c.total_tests = tests;
        c.total_servers = servers;
        c.total_clients = clients;
    }

    pub fn set_phase(&self, phase: &str) {
        let mut c = self.counters.lock().unwrap();
        c.current_phase = phase.to_string();
        c.phase_start = Instant::now();
    }

    pub fn add_connected(&self, count: usize) {
        self.counters.lock().unwrap().connected_nodes += count;
    }

    pub fn add_prepared(&self, count: usize) {
        self.counters.lock().unwrap().prepared_nodes += count;
    }

    pub fn add_started_servers(&self, count: usize) {
        self.counters.lock().unwrap().started_servers += count;
    }

    pub fn add_started_clients(&self, count: usize) {
        self.counters.lock().unwrap().started_clients += count;
    }

    pub fn add_completed(&self, count: usize) {
        self.counters.lock().unwrap().completed_tests += count;
    }

    pub fn add_failed(&self, count: usize) {
        self.counters.lock().unwrap().failed_tests += count;
    }

    pub fn add_collected(&self, count: usize) {
        self.counters.lock().unwrap().collected_results += count;
    }

    pub fn add_error(&self, error: impl Into<String>) {
        self.counters.lock().unwrap().errors.push(error.into());
    }

    pub fn error_count(&self) -> usize {
        self.counters.lock().unwrap().errors.len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.counters.lock().unwrap().errors.clone()
    }

    /// Fraction of tests finished, either way, as a percentage
    pub fn percent_complete(&self) -> f64 {
        let c = self.counters.lock().unwrap();
        if c.total_tests == 0 {
            return 0.0;
        }
        (c.completed_tests + c.failed_tests) as f64 / c.total_tests as f64 * 100.0
    }

    /// Completion percentage of the current phase
    pub fn phase_percent(&self) -> f64 {
        let c = self.counters.lock().unwrap();
        let ratio = |done: usize, total: usize| -> f64 {
            if total == 0 {
                0.0
            } else {
                done as f64 / total as f64 * 100.0
            }
        };
        match c.current_phase.as_str() {
            "connecting" => ratio(c.connected_nodes, c.total_nodes),
            "preparing" => ratio(c.prepared_nodes, c.total_nodes),
            "starting_servers" => ratio(c.started_servers, c.total_servers),
            "starting_clients" => ratio(c.started_clients, c.total_clients),
            "collecting" => ratio(c.collected_results, c.total_tests),
            _ => 0.0,
        }
    }

    /// Multi-line progress summary for the console
    pub fn summary(&self) -> String {
        let c = self.counters.lock().unwrap();
        let elapsed = self.start_time.elapsed();
        let phase_elapsed = c.phase_start.elapsed();

        format!(
            "\nTest Progress Summary\n\
             =====================\n\
             Phase: {} (elapsed: {}s)\n\
             Total Elapsed: {}s\n\
             \n\
             Nodes:\n\
             \x20 Connected: {}/{}\n\
             \x20 Prepared:  {}/{}\n\
             \n\
             Servers:\n\
             \x20 Started: {}/{}\n\
             \n\
             Clients:\n\
             \x20 Started:   {}/{}\n\
             \x20 Completed: {}/{}\n\
             \x20 Failed:    {}/{}\n\
             \n\
             Results:\n\
             \x20 Collected: {}/{}\n\
             \n\
             Errors: {}\n",
            c.current_phase,
            phase_elapsed.as_secs(),
            elapsed.as_secs(),
            c.connected_nodes,
            c.total_nodes,
            c.prepared_nodes,
            c.total_nodes,
            c.started_servers,
            c.total_servers,
            c.started_clients,
            c.total_clients,
            c.completed_tests,
            c.total_tests,
            c.failed_tests,
            c.total_tests,
            c.collected_results,
            c.total_tests,
            c.errors.len(),
        )
    }
}
