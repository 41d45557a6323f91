//! # Configuration Module
//!
//! YAML configuration for both processes. Each file has a single top-level
//! key (`daemon:` or `controller:`) so the two configs cannot be confused
//! with one another. Loading goes through `load_*` helpers which parse,
//! apply defaults, and validate in one step; the rest of the crate only ever
//! sees a validated configuration.

use crate::defaults;
use crate::model::{Node, NodeRegistry, ProfileRegistry, TestProfile};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level daemon configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
}

/// Daemon operational settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub port_range: PortRange,
    #[serde(default = "default_max_processes")]
    pub max_processes: usize,
    #[serde(default)]
    pub cpu_affinity: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_result_dir")]
    pub result_dir: String,
    #[serde(default = "default_iperf_path")]
    pub iperf_path: String,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

/// Range of ports available for iperf3 servers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: defaults::PORT_RANGE_START,
            end: defaults::PORT_RANGE_END,
        }
    }
}

/// Timeouts for daemon-side operations, in seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_process_start")]
    pub process_start_seconds: u64,
    #[serde(default = "default_process_stop")]
    pub process_stop_seconds: u64,
    #[serde(default = "default_test_execution")]
    pub test_execution_seconds: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            process_start_seconds: default_process_start(),
            process_stop_seconds: default_process_stop(),
            test_execution_seconds: default_test_execution(),
        }
    }
}

fn default_listen_port() -> u16 {
    defaults::LISTEN_PORT
}
fn default_max_processes() -> usize {
    defaults::MAX_PROCESSES
}
fn default_log_level() -> String {
    defaults::LOG_LEVEL.to_string()
}
fn default_result_dir() -> String {
    defaults::RESULT_DIR.to_string()
}
fn default_iperf_path() -> String {
    defaults::IPERF_PATH.to_string()
}
fn default_process_start() -> u64 {
    30
}
fn default_process_stop() -> u64 {
    10
}
fn default_test_execution() -> u64 {
    300
}

/// Load, default, and validate a daemon configuration file
pub fn load_daemon_config(path: &Path) -> Result<DaemonConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: DaemonConfig =
        serde_yaml::from_str(&data).context("failed to parse config file")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<()> {
        let d = &self.daemon;
        if d.listen_port < 1 {
            bail!("listen_port must be between 1 and 65535");
        }
        if d.port_range.start < 1 {
            bail!("port_range.start must be between 1 and 65535");
        }
        if d.port_range.start >= d.port_range.end {
            bail!("port_range.start must be less than port_range.end");
        }
        if d.max_processes < 1 {
            bail!("max_processes must be at least 1");
        }
        match d.log_level.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => bail!("log_level must be one of debug, info, warn, error (got '{other}')"),
        }
        if d.result_dir.is_empty() {
            bail!("result_dir cannot be empty");
        }
        Ok(())
    }
}

/// Top-level controller configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller: ControllerSettings,
}

/// Controller operational settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub nodes: Vec<NodeConfig>,
    pub test_profiles: HashMap<String, TestProfile>,
    pub topology: TopologySettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    /// Ask daemons to keep local copies of raw iperf3 output
    #[serde(default)]
    pub save_daemon_results: bool,
}

/// One node entry in the controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
    pub ip: String,
    #[serde(default = "default_listen_port")]
    pub port: u16,
    /// Optional; defaults to the hostname
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Test topology selection and profile assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySettings {
    /// "full_mesh" or "custom"
    #[serde(rename = "type")]
    pub topology_type: String,
    pub default_profile: String,
    #[serde(default)]
    pub overrides: Vec<ProfileOverride>,
}

/// Applies a profile to every ordered pair drawn from `nodes`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default)]
    pub nodes: Vec<String>,
    pub profile: String,
}

/// Result output sinks; absent paths skip that output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputSettings {
    #[serde(default)]
    pub json_file: String,
    #[serde(default)]
    pub csv_file: String,
    #[serde(default)]
    pub schema_file: String,
    #[serde(default)]
    pub compress: bool,
}

/// Parallelism and timeout knobs for the controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_max_concurrent_nodes")]
    pub max_concurrent_nodes: usize,
    #[serde(default = "default_max_concurrent_tests")]
    pub max_concurrent_tests: usize,
    #[serde(default = "default_client_start_batch")]
    pub client_start_batch_size: usize,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_seconds: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: default_max_concurrent_nodes(),
            max_concurrent_tests: default_max_concurrent_tests(),
            client_start_batch_size: default_client_start_batch(),
            connection_timeout_seconds: default_connection_timeout(),
            rpc_timeout_seconds: default_rpc_timeout(),
        }
    }
}

fn default_max_concurrent_nodes() -> usize {
    100
}
fn default_max_concurrent_tests() -> usize {
    1000
}
fn default_client_start_batch() -> usize {
    50
}
fn default_connection_timeout() -> u64 {
    defaults::CONNECTION_TIMEOUT_SECS
}
fn default_rpc_timeout() -> u64 {
    defaults::RPC_TIMEOUT_SECS
}

/// Load, default, and validate a controller configuration file
pub fn load_controller_config(path: &Path) -> Result<ControllerConfig> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: ControllerConfig =
        serde_yaml::from_str(&data).context("failed to parse config file")?;
    config.apply_defaults();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

impl ControllerConfig {
    /// Fill in derived defaults that serde cannot express: node ids default
    /// to hostnames, and profile names are taken from their map keys.
    pub fn apply_defaults(&mut self) {
        for node in &mut self.controller.nodes {
            if node.id.is_empty() {
                node.id = node.hostname.clone();
            }
        }
        for (name, profile) in &mut self.controller.test_profiles {
            if profile.name.is_empty() {
                profile.name = name.clone();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.nodes.len() < 2 {
            bail!("at least 2 nodes are required");
        }

        let mut seen = std::collections::HashSet::new();
        for (i, node) in c.nodes.iter().enumerate() {
            if node.hostname.is_empty() {
                bail!("node[{i}]: hostname cannot be empty");
            }
            if node.ip.is_empty() {
                bail!("node[{i}]: ip cannot be empty");
            }
            if node.port < 1 {
                bail!("node[{i}]: port must be between 1 and 65535");
            }
            let id = if node.id.is_empty() {
                &node.hostname
            } else {
                &node.id
            };
            if !seen.insert(id.clone()) {
                bail!("duplicate node ID: {id}");
            }
        }

        if c.test_profiles.is_empty() {
            bail!("at least one test profile is required");
        }
        for (name, profile) in &c.test_profiles {
            profile
                .validate()
                .with_context(|| format!("profile '{name}'"))?;
        }

        match c.topology.topology_type.as_str() {
            "full_mesh" | "custom" => {}
            "" => bail!("topology type cannot be empty"),
            other => bail!("topology type must be one of: full_mesh, custom (got '{other}')"),
        }
        if c.topology.default_profile.is_empty() {
            bail!("topology default_profile cannot be empty");
        }
        if !c.test_profiles.contains_key(&c.topology.default_profile) {
            bail!(
                "default_profile '{}' not found in test_profiles",
                c.topology.default_profile
            );
        }
        for override_ in &c.topology.overrides {
            if !c.test_profiles.contains_key(&override_.profile) {
                bail!(
                    "override profile '{}' not found in test_profiles",
                    override_.profile
                );
            }
        }
        Ok(())
    }

    /// Build the node registry in configuration order
    pub fn build_node_registry(&self) -> Result<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        for nc in &self.controller.nodes {
            registry.add(Node {
                id: nc.id.clone(),
                hostname: nc.hostname.clone(),
                ip: nc.ip.clone(),
                port: nc.port,
                tags: nc.tags.clone(),
            })?;
        }
        Ok(registry)
    }

    /// Build the profile registry from the configured profile map
    pub fn build_profile_registry(&self) -> Result<ProfileRegistry> {
        let mut registry = ProfileRegistry::new();
        for profile in self.controller.test_profiles.values() {
            registry.add(profile.clone())?;
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLLER_YAML: &str = r#"
controller:
  nodes:
    - hostname: node-a
      ip: 10.0.0.1
    - hostname: node-b
      ip: 10.0.0.2
      port: 50052
      id: b
  test_profiles:
    default:
      duration: 10
      parallel: 1
  topology:
    type: full_mesh
    default_profile: default
  output:
    json_file: results.json
"#;

    #[test]
    fn controller_config_parses_with_defaults() {
        let mut cfg: ControllerConfig = serde_yaml::from_str(CONTROLLER_YAML).unwrap();
        cfg.apply_defaults();
        cfg.validate().unwrap();

        assert_eq!(cfg.controller.nodes[0].id, "node-a");
        assert_eq!(cfg.controller.nodes[0].port, 50051);
        assert_eq!(cfg.controller.nodes[1].id, "b");
        assert_eq!(cfg.controller.concurrency.rpc_timeout_seconds, 60);
        assert_eq!(cfg.controller.concurrency.connection_timeout_seconds, 10);
        assert_eq!(cfg.controller.test_profiles["default"].name, "default");
    }

    #[test]
    fn controller_config_requires_two_nodes() {
        let yaml = r#"
controller:
  nodes:
    - hostname: only
      ip: 10.0.0.1
  test_profiles:
    default: { duration: 10 }
  topology: { type: full_mesh, default_profile: default }
"#;
        let mut cfg: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.apply_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least 2 nodes"));
    }

    #[test]
    fn controller_config_rejects_duplicate_ids() {
        let yaml = r#"
controller:
  nodes:
    - hostname: same
      ip: 10.0.0.1
    - hostname: same
      ip: 10.0.0.2
  test_profiles:
    default: { duration: 10 }
  topology: { type: full_mesh, default_profile: default }
"#;
        let mut cfg: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.apply_defaults();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node ID"));
    }

    #[test]
    fn controller_config_rejects_unknown_default_profile() {
        let yaml = r#"
controller:
  nodes:
    - { hostname: a, ip: 10.0.0.1 }
    - { hostname: b, ip: 10.0.0.2 }
  test_profiles:
    default: { duration: 10 }
  topology: { type: full_mesh, default_profile: missing }
"#;
        let mut cfg: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.apply_defaults();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn daemon_config_defaults_and_validation() {
        let cfg: DaemonConfig = serde_yaml::from_str("daemon: {}").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.daemon.listen_port, 50051);
        assert_eq!(cfg.daemon.port_range.start, 5201);
        assert_eq!(cfg.daemon.port_range.end, 5400);
        assert_eq!(cfg.daemon.max_processes, 200);
        assert_eq!(cfg.daemon.log_level, "info");
        assert_eq!(cfg.daemon.timeouts.process_start_seconds, 30);
    }

    #[test]
    fn daemon_config_rejects_inverted_port_range() {
        let yaml = r#"
daemon:
  port_range: { start: 6000, end: 5000 }
"#;
        let cfg: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn daemon_config_rejects_unknown_log_level() {
        let cfg: DaemonConfig = serde_yaml::from_str("daemon: { log_level: shout }").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn registries_built_from_config() {
        let mut cfg: ControllerConfig = serde_yaml::from_str(CONTROLLER_YAML).unwrap();
        cfg.apply_defaults();
        let nodes = cfg.build_node_registry().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.all()[0].id, "node-a");

        let profiles = cfg.build_profile_registry().unwrap();
        assert_eq!(profiles.get("default").unwrap().duration, 10);
    }
}
