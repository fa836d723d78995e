//! Cluster topology as seen by the tablet subsystem.
//!
//! The topology is an input from the membership layer: for every known host
//! it records the datacenter, rack, lifecycle state and CPU shard count.
//! Placement decisions never mutate it.

use crate::types::{HostId, ShardId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    /// Fully joined and serving.
    Normal,
    /// Joining; not yet eligible for replicas.
    Joining,
    /// Being drained; receives no new replicas and must reach zero load.
    BeingDecommissioned,
    /// Permanently removed.
    Left,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostState::Normal => write!(f, "normal"),
            HostState::Joining => write!(f, "joining"),
            HostState::BeingDecommissioned => write!(f, "being_decommissioned"),
            HostState::Left => write!(f, "left"),
        }
    }
}

/// A known host and its placement-relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Host identifier.
    pub host: HostId,
    /// Datacenter name.
    pub dc: String,
    /// Rack name within the datacenter.
    pub rack: String,
    /// Lifecycle state.
    pub state: HostState,
    /// Number of CPU shards on the host.
    pub shard_count: ShardId,
}

/// Registry of every host known to the tablet subsystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    nodes: HashMap<HostId, Node>,
}

impl Topology {
    /// Create an empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a host entry.
    pub fn update_node(
        &mut self,
        host: HostId,
        dc: impl Into<String>,
        rack: impl Into<String>,
        state: HostState,
        shard_count: ShardId,
    ) {
        self.nodes.insert(
            host,
            Node {
                host,
                dc: dc.into(),
                rack: rack.into(),
                state,
                shard_count,
            },
        );
    }

    /// Change only the lifecycle state of a host. No-op for unknown hosts.
    pub fn update_state(&mut self, host: HostId, state: HostState) {
        if let Some(node) = self.nodes.get_mut(&host) {
            node.state = state;
        }
    }

    /// Look up a host.
    pub fn get(&self, host: HostId) -> Option<&Node> {
        self.nodes.get(&host)
    }

    /// Datacenter of a host.
    pub fn dc_of(&self, host: HostId) -> Option<&str> {
        self.nodes.get(&host).map(|n| n.dc.as_str())
    }

    /// Rack of a host.
    pub fn rack_of(&self, host: HostId) -> Option<&str> {
        self.nodes.get(&host).map(|n| n.rack.as_str())
    }

    /// Shard count of a host.
    pub fn shard_count(&self, host: HostId) -> Option<ShardId> {
        self.nodes.get(&host).map(|n| n.shard_count)
    }

    /// Iterate over all known hosts.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of known hosts.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no hosts are known.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hosts in a datacenter, regardless of state.
    pub fn hosts_in_dc<'a>(&'a self, dc: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.values().filter(move |n| n.dc == dc)
    }

    /// Hosts in a datacenter that are in `Normal` state.
    pub fn live_hosts_in_dc<'a>(&'a self, dc: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.hosts_in_dc(dc)
            .filter(|n| n.state == HostState::Normal)
    }

    /// Distinct racks present in a datacenter, counting only hosts that can
    /// carry replicas.
    pub fn racks_in_dc(&self, dc: &str) -> HashSet<&str> {
        self.nodes
            .values()
            .filter(|n| n.dc == dc && n.state != HostState::Left)
            .map(|n| n.rack.as_str())
            .collect()
    }

    /// Datacenter names present in the topology.
    pub fn dcs(&self) -> HashSet<&str> {
        self.nodes.values().map(|n| n.dc.as_str()).collect()
    }
}
