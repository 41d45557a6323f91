//! # Cluster Data Model
//!
//! Nodes and test profiles, together with the registries the controller keeps
//! them in. Registries own the data; everything else (topology pairs, RPC
//! messages) holds `Arc` references or ids into them.
//!
//! Registry iteration order is insertion order. The topology planner depends
//! on this: port numbering is a pure function of the order nodes were added,
//! so two runs over the same configuration produce identical plans.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A node participating in the mesh, acting as both client and server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier (defaults to the hostname)
    pub id: String,
    pub hostname: String,
    pub ip: String,
    /// Daemon RPC port
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Node {
    /// The RPC endpoint address of this node's daemon
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node{{id: {}, hostname: {}, addr: {}}}",
            self.id,
            self.hostname,
            self.address()
        )
    }
}

/// Transport protocol for an iperf3 test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Named iperf3 parameter set for one measurement run.
///
/// Profiles are immutable once registered. The daemon receives a full copy
/// inside `StartClients` targets, so the two processes never need to agree on
/// a profile catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestProfile {
    #[serde(default)]
    pub name: String,
    /// Test duration in seconds
    pub duration: u64,
    #[serde(default)]
    pub protocol: Protocol,
    /// Target bandwidth, e.g. "10G" (empty = unlimited)
    #[serde(default)]
    pub bandwidth: String,
    /// TCP window size, e.g. "4M"
    #[serde(default)]
    pub window_size: String,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default)]
    pub buffer_length: u32,
    /// Congestion control algorithm (TCP only)
    #[serde(default)]
    pub congestion_control: String,
    /// Maximum segment size (TCP only)
    #[serde(default)]
    pub mss: u32,
    /// Disable Nagle's algorithm (TCP only)
    #[serde(default)]
    pub no_delay: bool,
    /// IP type-of-service byte
    #[serde(default)]
    pub tos: u32,
    #[serde(default)]
    pub zerocopy: bool,
    /// Seconds to omit from the start of the measurement
    #[serde(default)]
    pub omit_seconds: u64,
    /// Extra iperf3 flags appended verbatim (flag -> value, empty value for
    /// bare flags). Ordered map so argv construction is deterministic.
    #[serde(default)]
    pub extra_flags: BTreeMap<String, String>,
}

fn default_parallel() -> u32 {
    1
}

impl TestProfile {
    /// Minimal valid profile used as a baseline in tests and defaults
    pub fn named(name: &str, duration: u64) -> Self {
        Self {
            name: name.to_string(),
            duration,
            protocol: Protocol::Tcp,
            bandwidth: String::new(),
            window_size: String::new(),
            parallel: 1,
            bidirectional: false,
            reverse: false,
            buffer_length: 0,
            congestion_control: String::new(),
            mss: 0,
            no_delay: false,
            tos: 0,
            zerocopy: false,
            omit_seconds: 0,
            extra_flags: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.duration < 1 {
            bail!("profile '{}': duration must be at least 1 second", self.name);
        }
        if self.parallel < 1 {
            bail!("profile '{}': parallel must be at least 1", self.name);
        }
        Ok(())
    }
}

impl fmt::Display for TestProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Profile{{name: {}, duration: {}s, protocol: {}",
            self.name, self.duration, self.protocol
        )?;
        if !self.bandwidth.is_empty() {
            write!(f, ", bandwidth: {}", self.bandwidth)?;
        }
        if self.parallel > 1 {
            write!(f, ", parallel: {}", self.parallel)?;
        }
        if self.bidirectional {
            write!(f, ", bidirectional")?;
        }
        write!(f, "}}")
    }
}

/// Snapshot of a daemon's process-capacity budget and host resources.
///
/// Reported by `Initialize` and `GetStatus`; taking a snapshot never mutates
/// the accountant it was read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemCapacity {
    pub max_processes: usize,
    pub available_processes: usize,
    pub cpu_cores: usize,
    pub available_memory_bytes: u64,
    pub network_interfaces: Vec<String>,
}

/// Ordered collection of nodes with unique ids
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<Node>>,
    order: Vec<Arc<Node>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: Node) -> Result<()> {
        if node.id.is_empty() {
            bail!("node ID cannot be empty");
        }
        if self.nodes.contains_key(&node.id) {
            bail!("node with ID {} already exists", node.id);
        }
        let node = Arc::new(node);
        self.nodes.insert(node.id.clone(), Arc::clone(&node));
        self.order.push(node);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<Node>> {
        self.nodes
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node with ID {} not found", id))
    }

    /// All nodes in insertion order
    pub fn all(&self) -> &[Arc<Node>] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn by_tag(&self, tag: &str) -> Vec<Arc<Node>> {
        self.order
            .iter()
            .filter(|n| n.has_tag(tag))
            .cloned()
            .collect()
    }
}

/// Collection of test profiles with unique names
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Arc<TestProfile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, profile: TestProfile) -> Result<()> {
        if profile.name.is_empty() {
            bail!("profile name cannot be empty");
        }
        if self.profiles.contains_key(&profile.name) {
            bail!("profile {} already exists", profile.name);
        }
        self.profiles
            .insert(profile.name.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<TestProfile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("profile {} not found", name))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            hostname: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: 50051,
            tags: Vec::new(),
        }
    }

    #[test]
    fn registry_rejects_duplicate_node_ids() {
        let mut reg = NodeRegistry::new();
        reg.add(node("a")).unwrap();
        assert!(reg.add(node("a")).is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn registry_preserves_insertion_order() {
        let mut reg = NodeRegistry::new();
        for id in ["c", "a", "b"] {
            reg.add(node(id)).unwrap();
        }
        let ids: Vec<&str> = reg.all().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn registry_lookup_by_tag() {
        let mut reg = NodeRegistry::new();
        let mut tagged = node("a");
        tagged.tags = vec!["edge".to_string()];
        reg.add(tagged).unwrap();
        reg.add(node("b")).unwrap();

        let edge = reg.by_tag("edge");
        assert_eq!(edge.len(), 1);
        assert_eq!(edge[0].id, "a");
        assert!(reg.by_tag("core").is_empty());
    }

    #[test]
    fn profile_registry_rejects_duplicates() {
        let mut reg = ProfileRegistry::new();
        reg.add(TestProfile::named("fast", 5)).unwrap();
        assert!(reg.add(TestProfile::named("fast", 10)).is_err());
        assert_eq!(reg.get("fast").unwrap().duration, 5);
    }

    #[test]
    fn profile_validation_bounds() {
        let mut p = TestProfile::named("p", 0);
        assert!(p.validate().is_err());
        p.duration = 5;
        p.parallel = 0;
        assert!(p.validate().is_err());
        p.parallel = 4;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn node_address_formatting() {
        let n = node("a");
        assert_eq!(n.address(), "10.0.0.1:50051");
    }
}
