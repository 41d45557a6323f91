//! # Topology Planner
//!
//! Pure planning: given the node and profile registries, enumerate the full
//! mesh of directed test pairs and assign server ports. No allocator state is
//! involved; the plan is a function of registry insertion order, so identical
//! configurations always produce identical plans.
//!
//! Every destination of degree `k = N-1` receives a block of `k` consecutive
//! ports starting at the topology base port, indexed positionally by the
//! order its sources appear in the pair enumeration. One port per
//! (source, destination) pair: servers run in one-off mode, so sharing a port
//! across sources would collide the moment two clients connect at once.

use crate::model::{Node, NodeRegistry, ProfileRegistry, TestProfile};
use crate::rpc::{ClientTarget, NodeTopology};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One directed test: `source` runs a client against `destination`
#[derive(Debug, Clone)]
pub struct TestPair {
    pub test_id: String,
    pub source: Arc<Node>,
    pub destination: Arc<Node>,
    pub profile: Arc<TestProfile>,
}

/// The planned test matrix plus port assignments
#[derive(Debug, Default)]
pub struct Topology {
    /// All pairs in enumeration order
    pub pairs: Vec<Arc<TestPair>>,
    /// node id -> ports that node must run servers on (positional by source)
    pub server_ports: HashMap<String, Vec<u16>>,
    /// node id -> pairs where that node is the source
    pub client_tests: HashMap<String, Vec<Arc<TestPair>>>,
    /// test id -> the destination-side server port for that pair
    pair_ports: HashMap<String, u16>,
    by_test_id: HashMap<String, Arc<TestPair>>,
}

impl Topology {
    pub fn test_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn server_count(&self) -> usize {
        self.server_ports.values().map(Vec::len).sum()
    }

    pub fn client_count(&self) -> usize {
        self.client_tests.values().map(Vec::len).sum()
    }

    /// The port a client must dial for the given pair
    pub fn port_for_pair(&self, test_id: &str) -> Option<u16> {
        self.pair_ports.get(test_id).copied()
    }

    pub fn pair(&self, test_id: &str) -> Option<&Arc<TestPair>> {
        self.by_test_id.get(test_id)
    }

    /// Longest profile duration across all pairs, floored at 10 seconds
    pub fn max_duration_secs(&self) -> u64 {
        self.pairs
            .iter()
            .map(|p| p.profile.duration)
            .max()
            .unwrap_or(0)
            .max(10)
    }

    /// The slice of this topology one node must execute
    pub fn node_topology(&self, node_id: &str) -> NodeTopology {
        NodeTopology {
            server_ports: self.server_ports.get(node_id).cloned().unwrap_or_default(),
            client_targets: self.client_targets(node_id),
        }
    }

    /// Client launch orders for one source node
    pub fn client_targets(&self, node_id: &str) -> Vec<ClientTarget> {
        let Some(pairs) = self.client_tests.get(node_id) else {
            return Vec::new();
        };
        pairs
            .iter()
            .filter_map(|pair| {
                let port = self.port_for_pair(&pair.test_id)?;
                Some(ClientTarget {
                    test_id: pair.test_id.clone(),
                    destination_ip: pair.destination.ip.clone(),
                    destination_port: port,
                    profile: (*pair.profile).clone(),
                })
            })
            .collect()
    }
}

/// Full-mesh topology planner
pub struct Planner<'a> {
    nodes: &'a NodeRegistry,
    profiles: &'a ProfileRegistry,
    default_profile: Arc<TestProfile>,
    /// "src:dst" -> profile name, resolved per pair before the default
    overrides: HashMap<String, String>,
    base_port: u16,
}

impl<'a> Planner<'a> {
    pub fn new(
        nodes: &'a NodeRegistry,
        profiles: &'a ProfileRegistry,
        default_profile: Arc<TestProfile>,
    ) -> Self {
        Self {
            nodes,
            profiles,
            default_profile,
            overrides: HashMap::new(),
            base_port: crate::defaults::TOPOLOGY_BASE_PORT,
        }
    }

    pub fn with_base_port(mut self, base_port: u16) -> Self {
        self.base_port = base_port;
        self
    }

    /// Route one directed pair to a named profile
    pub fn add_override(&mut self, source_id: &str, dest_id: &str, profile_name: &str) {
        self.overrides
            .insert(format!("{source_id}:{dest_id}"), profile_name.to_string());
    }

    /// Expand a configured override: every distinct ordered pair drawn from
    /// the node list gets the override's profile.
    pub fn add_group_override(&mut self, node_ids: &[String], profile_name: &str) {
        if node_ids.len() < 2 {
            return;
        }
        for src in node_ids {
            for dst in node_ids {
                if src != dst {
                    self.add_override(src, dst, profile_name);
                }
            }
        }
    }

    /// Plan the full mesh: N·(N−1) pairs and N−1 server ports per node
    pub fn full_mesh(&self) -> Result<Topology> {
        let nodes = self.nodes.all();
        if nodes.len() < 2 {
            bail!("at least 2 nodes required for mesh topology");
        }

        let mut topology = Topology::default();
        let mut test_counter = 0usize;

        for source in nodes {
            for dest in nodes {
                if source.id == dest.id {
                    continue;
                }

                test_counter += 1;
                let test_id = format!("test-{test_counter}-{}-to-{}", source.id, dest.id);
                let profile = self.profile_for_pair(&source.id, &dest.id);

                let pair = Arc::new(TestPair {
                    test_id: test_id.clone(),
                    source: Arc::clone(source),
                    destination: Arc::clone(dest),
                    profile,
                });

                topology.pairs.push(Arc::clone(&pair));
                topology
                    .client_tests
                    .entry(source.id.clone())
                    .or_default()
                    .push(Arc::clone(&pair));
                topology.by_test_id.insert(test_id, pair);
            }
        }

        // Consecutive port blocks per destination, in registry order.
        let degree = nodes.len() - 1;
        let mut next_port = self.base_port as u32;
        for dest in nodes {
            let end = next_port + degree as u32;
            if end > u16::MAX as u32 + 1 {
                bail!(
                    "port block for node {} exceeds 65535 (base port {} too high for {} nodes)",
                    dest.id,
                    self.base_port,
                    nodes.len()
                );
            }
            let block: Vec<u16> = (next_port..end).map(|p| p as u16).collect();

            // Map each source to its positional port within the block.
            for (index, source) in nodes.iter().filter(|n| n.id != dest.id).enumerate() {
                if let Some(pair) = topology
                    .client_tests
                    .get(&source.id)
                    .and_then(|pairs| pairs.iter().find(|p| p.destination.id == dest.id))
                {
                    topology
                        .pair_ports
                        .insert(pair.test_id.clone(), block[index]);
                }
            }

            topology.server_ports.insert(dest.id.clone(), block);
            next_port = end;
        }

        debug!(
            "planned full mesh: {} pairs, {} server ports",
            topology.test_count(),
            topology.server_count()
        );
        Ok(topology)
    }

    fn profile_for_pair(&self, source_id: &str, dest_id: &str) -> Arc<TestProfile> {
        let key = format!("{source_id}:{dest_id}");
        if let Some(name) = self.overrides.get(&key) {
            if let Ok(profile) = self.profiles.get(name) {
                return profile;
            }
        }
        Arc::clone(&self.default_profile)
    }
}
