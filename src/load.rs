//! Per-host, per-shard replica-count summary.
//!
//! The load sketch is a derived, read-only view over tablet metadata used by
//! the allocator. It holds no locks and is rebuilt from a metadata snapshot
//! in `O(total replicas)`.

use crate::error::{Error, Result};
use crate::tablets::{TabletMetadata, TabletReplica};
use crate::topology::Topology;
use crate::types::{HostId, ShardId};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct HostLoad {
    shards: Vec<u64>,
}

/// Replica counts per host and per CPU shard.
#[derive(Debug, Clone, Default)]
pub struct LoadSketch {
    hosts: HashMap<HostId, HostLoad>,
}

impl LoadSketch {
    /// Create a sketch with a zeroed entry for every host in the topology.
    pub fn new(topology: &Topology) -> Self {
        let hosts = topology
            .nodes()
            .map(|n| {
                (
                    n.host,
                    HostLoad {
                        shards: vec![0; n.shard_count as usize],
                    },
                )
            })
            .collect();
        Self { hosts }
    }

    /// Count current replicas plus, for tablets in transition, the pending
    /// replica.
    pub fn populate(&mut self, metadata: &TabletMetadata) -> Result<()> {
        for (_, tmap) in metadata.tables() {
            for (id, info) in tmap.tablets() {
                for replica in &info.replicas {
                    self.add(*replica)?;
                }
                if let Some(transition) = tmap.get_transition(id) {
                    self.add(transition.pending_replica)?;
                }
            }
        }
        Ok(())
    }

    /// Count the replica set each tablet will have once pending transitions
    /// commit: `next_replicas` when a transition is present, the current set
    /// otherwise. The allocator plans against this view so that in-progress
    /// migrations count as done.
    pub fn populate_committed(&mut self, metadata: &TabletMetadata) -> Result<()> {
        for (_, tmap) in metadata.tables() {
            for (id, info) in tmap.tablets() {
                let replicas = match tmap.get_transition(id) {
                    Some(transition) => &transition.next_replicas,
                    None => &info.replicas,
                };
                for replica in replicas {
                    self.add(*replica)?;
                }
            }
        }
        Ok(())
    }

    /// Record one replica. Fails if the host is unknown to the topology or
    /// the shard is out of range.
    pub fn add(&mut self, replica: TabletReplica) -> Result<()> {
        let load = self.hosts.get_mut(&replica.host).ok_or_else(|| {
            Error::Configuration(format!("replica on unknown host {}", replica.host))
        })?;
        let slot = load.shards.get_mut(replica.shard as usize).ok_or_else(|| {
            Error::Configuration(format!(
                "replica on {} exceeds the host's shard count",
                replica
            ))
        })?;
        *slot += 1;
        Ok(())
    }

    /// Remove one previously recorded replica.
    pub fn remove(&mut self, replica: TabletReplica) {
        if let Some(load) = self.hosts.get_mut(&replica.host) {
            if let Some(slot) = load.shards.get_mut(replica.shard as usize) {
                *slot = slot.saturating_sub(1);
            }
        }
    }

    /// Total replica count on a host. Unknown hosts report zero.
    pub fn load(&self, host: HostId) -> u64 {
        self.hosts
            .get(&host)
            .map(|l| l.shards.iter().sum())
            .unwrap_or(0)
    }

    /// Replica count divided by the host's shard count.
    pub fn avg_shard_load(&self, host: HostId) -> f64 {
        match self.hosts.get(&host) {
            Some(l) if !l.shards.is_empty() => {
                l.shards.iter().sum::<u64>() as f64 / l.shards.len() as f64
            }
            _ => 0.0,
        }
    }

    /// Replica count on one shard of a host.
    pub fn shard_load(&self, host: HostId, shard: ShardId) -> u64 {
        self.hosts
            .get(&host)
            .and_then(|l| l.shards.get(shard as usize))
            .copied()
            .unwrap_or(0)
    }

    /// The least loaded shard of a host, lowest index on ties.
    pub fn least_loaded_shard(&self, host: HostId) -> ShardId {
        self.hosts
            .get(&host)
            .and_then(|l| {
                l.shards
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, count)| **count)
                    .map(|(shard, _)| shard as ShardId)
            })
            .unwrap_or(0)
    }

    /// Hosts tracked by the sketch.
    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.hosts.keys().copied()
    }
}
