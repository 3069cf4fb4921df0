//! Fabric topology definitions
//!
//! Provides functions to create the topologies the scenarios run on:
//! - Star: every host attached to one switch (incast)
//! - Line: two hosts joined through a chain of switches
//! - Dumbbell: two host groups joined by a single bottleneck link
//! - Custom: build from a link list
//!
//! Ports are numbered per node in the order its links were added, and routes
//! are static shortest paths towards every host.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use qbb_core::{DataRate, NodeId, NodeRole, PortIndex, TopologyError};

use crate::types::PortLink;

/// One point-to-point link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: NodeId,
    pub b: NodeId,
    pub rate: DataRate,
    /// One-way propagation delay
    pub delay_ns: u64,
}

impl LinkSpec {
    pub fn delay(&self) -> Duration {
        Duration::from_nanos(self.delay_ns)
    }
}

/// Hosts, switches and the links between them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Role of every node, indexed by node id
    pub nodes: Vec<NodeRole>,
    pub links: Vec<LinkSpec>,
}

impl Topology {
    /// Create an empty topology
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&mut self) -> NodeId {
        self.add_node(NodeRole::Nic)
    }

    pub fn add_switch(&mut self) -> NodeId {
        self.add_node(NodeRole::Switch)
    }

    fn add_node(&mut self, role: NodeRole) -> NodeId {
        self.nodes.push(role);
        NodeId((self.nodes.len() - 1) as u32)
    }

    /// Add a bidirectional link between two existing nodes
    pub fn connect(
        &mut self,
        a: NodeId,
        b: NodeId,
        rate: DataRate,
        delay: Duration,
    ) -> Result<(), TopologyError> {
        for node in [a, b] {
            if self.role(node).is_none() {
                return Err(TopologyError::UnknownNode(node.0));
            }
        }
        self.links.push(LinkSpec {
            a,
            b,
            rate,
            delay_ns: u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX),
        });
        Ok(())
    }

    pub fn role(&self, node: NodeId) -> Option<NodeRole> {
        self.nodes.get(node.0 as usize).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Node ids of every host, in id order
    pub fn hosts(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&node| self.role(node) == Some(NodeRole::Nic))
            .collect()
    }

    pub fn switches(&self) -> Vec<NodeId> {
        self.node_ids()
            .filter(|&node| self.role(node) == Some(NodeRole::Switch))
            .collect()
    }

    fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(|index| NodeId(index as u32))
    }

    /// Every node's ports with the far end of each
    pub fn ports(&self) -> Vec<Vec<PortLink>> {
        let mut ports: Vec<Vec<PortLink>> = vec![Vec::new(); self.nodes.len()];
        for link in &self.links {
            let (a, b) = (link.a.0 as usize, link.b.0 as usize);
            let a_port = PortIndex(ports[a].len() as u32);
            let b_port = PortIndex(ports[b].len() as u32 + u32::from(a == b));
            ports[a].push(PortLink {
                peer: link.b,
                peer_port: b_port,
                rate: link.rate,
                delay: link.delay(),
            });
            ports[b].push(PortLink {
                peer: link.a,
                peer_port: a_port,
                rate: link.rate,
                delay: link.delay(),
            });
        }
        ports
    }

    /// Egress port each node uses towards each host
    ///
    /// Shortest path in hops; among equal paths the lowest port wins, so
    /// routes are deterministic. Unreachable hosts have no entry.
    pub fn routes(&self) -> BTreeMap<NodeId, BTreeMap<NodeId, PortIndex>> {
        let ports = self.ports();
        let mut routes: BTreeMap<NodeId, BTreeMap<NodeId, PortIndex>> =
            self.node_ids().map(|node| (node, BTreeMap::new())).collect();

        for destination in self.hosts() {
            let distance = hop_distances(&ports, destination);
            for node in self.node_ids() {
                if node == destination {
                    continue;
                }
                let Some(own) = distance[node.0 as usize] else {
                    continue;
                };
                let next = ports[node.0 as usize].iter().enumerate().find(|(_, link)| {
                    distance[link.peer.0 as usize].is_some_and(|d| d + 1 == own)
                });
                if let (Some((port, _)), Some(table)) = (next, routes.get_mut(&node)) {
                    table.insert(destination, PortIndex(port as u32));
                }
            }
        }
        routes
    }

    /// Check that every link references known nodes and every host has a port
    pub fn validate(&self) -> Result<(), TopologyError> {
        for link in &self.links {
            for node in [link.a, link.b] {
                if self.role(node).is_none() {
                    return Err(TopologyError::UnknownNode(node.0));
                }
            }
        }
        let ports = self.ports();
        for host in self.hosts() {
            if ports[host.0 as usize].is_empty() {
                return Err(TopologyError::UnknownPort {
                    node: host.0,
                    port: 0,
                });
            }
        }
        Ok(())
    }

    /// Print a simple ASCII visualization of the fabric
    pub fn visualize(&self) -> String {
        let mut output = String::new();
        output.push_str("Fabric Topology:\n");
        output.push_str(&format!("  Hosts: {}\n", self.hosts().len()));
        output.push_str(&format!("  Switches: {}\n", self.switches().len()));
        output.push_str(&format!("  Links: {}\n\n", self.link_count()));

        for (index, ports) in self.ports().iter().enumerate() {
            let node = NodeId(index as u32);
            let kind = match self.role(node) {
                Some(NodeRole::Switch) => "switch",
                _ => "host",
            };
            let peers: Vec<String> = ports
                .iter()
                .enumerate()
                .map(|(port, link)| format!("p{}->{} {}", port, link.peer, link.rate))
                .collect();
            output.push_str(&format!("  {} ({}) [{}]\n", node, kind, peers.join(", ")));
        }
        output
    }
}

/// Hops from every node to `destination`, `None` if unreachable
fn hop_distances(ports: &[Vec<PortLink>], destination: NodeId) -> Vec<Option<usize>> {
    let mut distance = vec![None; ports.len()];
    let mut frontier = VecDeque::new();
    distance[destination.0 as usize] = Some(0);
    frontier.push_back(destination);

    while let Some(node) = frontier.pop_front() {
        let hops = distance[node.0 as usize].unwrap_or(0);
        for link in &ports[node.0 as usize] {
            let slot = &mut distance[link.peer.0 as usize];
            if slot.is_none() {
                *slot = Some(hops + 1);
                frontier.push_back(link.peer);
            }
        }
    }
    distance
}

/// Builder for the standard fabric shapes
pub struct TopologyBuilder {
    rate: DataRate,
    delay: Duration,
}

impl TopologyBuilder {
    /// Links of the given rate and one-way delay
    pub fn new(rate: DataRate, delay: Duration) -> Self {
        Self { rate, delay }
    }

    /// `hosts` hosts around one switch
    ///
    /// Hosts are nodes `0..hosts`, the switch is node `hosts`.
    pub fn star(&self, hosts: usize) -> Topology {
        let mut topology = Topology::new();
        let host_ids: Vec<NodeId> = (0..hosts).map(|_| topology.add_host()).collect();
        let switch = topology.add_switch();
        for host in host_ids {
            topology.link(host, switch, self.rate, self.delay);
        }
        topology
    }

    /// Host, `switches` switches in a chain, host
    ///
    /// The hosts are nodes 0 and 1.
    pub fn line(&self, switches: usize) -> Topology {
        let mut topology = Topology::new();
        let first = topology.add_host();
        let last = topology.add_host();
        let mut previous = first;
        for _ in 0..switches {
            let switch = topology.add_switch();
            topology.link(previous, switch, self.rate, self.delay);
            previous = switch;
        }
        topology.link(previous, last, self.rate, self.delay);
        topology
    }

    /// `per_side` hosts on each of two switches joined by one link
    ///
    /// Left hosts come first, then right hosts, then the two switches.
    pub fn dumbbell(&self, per_side: usize, bottleneck: DataRate) -> Topology {
        let mut topology = Topology::new();
        let left: Vec<NodeId> = (0..per_side).map(|_| topology.add_host()).collect();
        let right: Vec<NodeId> = (0..per_side).map(|_| topology.add_host()).collect();
        let left_switch = topology.add_switch();
        let right_switch = topology.add_switch();
        for host in left {
            topology.link(host, left_switch, self.rate, self.delay);
        }
        for host in right {
            topology.link(host, right_switch, self.rate, self.delay);
        }
        topology.link(left_switch, right_switch, bottleneck, self.delay);
        topology
    }
}

impl Topology {
    /// Link two nodes this topology just created
    fn link(&mut self, a: NodeId, b: NodeId, rate: DataRate, delay: Duration) {
        self.links.push(LinkSpec {
            a,
            b,
            rate,
            delay_ns: u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX),
        });
    }
}
