//! Tablet allocator and load balancer.
//!
//! Produces migration plans that reduce per-shard load imbalance subject to
//! replication-factor and rack constraints, drains decommissioned hosts,
//! and drives the split/merge control loop from measured tablet sizes.
//!
//! Planning treats in-progress transitions as already committed, so the
//! balancer keeps making progress without waiting for migrations to finish.

use crate::config::AllocatorConfig;
use crate::error::{Error, Result};
use crate::load::LoadSketch;
use crate::tablets::{
    ResizeDecision, ResizeWay, TabletId, TabletMetadata, TabletReplica, TransitionKind,
};
use crate::topology::{HostState, Topology};
use crate::types::{HostId, TableId};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Globally unique tablet reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalTabletId {
    /// Owning table.
    pub table: TableId,
    /// Tablet within the table's map.
    pub tablet: TabletId,
}

impl std::fmt::Display for GlobalTabletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.tablet)
    }
}

/// One planned replica movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Tablet being moved.
    pub tablet: GlobalTabletId,
    /// Replica to remove.
    pub src: TabletReplica,
    /// Replica to add.
    pub dst: TabletReplica,
    /// Transition kind to announce.
    pub kind: TransitionKind,
}

impl Migration {
    /// Create a movement; the kind follows from whether source and
    /// destination share a host.
    pub fn new(tablet: GlobalTabletId, src: TabletReplica, dst: TabletReplica) -> Self {
        let kind = if src.host == dst.host {
            TransitionKind::IntranodeMigration
        } else {
            TransitionKind::Migration
        };
        Self {
            tablet,
            src,
            dst,
            kind,
        }
    }
}

/// Pending tablet-count changes, per table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResizePlan {
    /// New resize decisions to persist.
    pub resize: BTreeMap<TableId, ResizeDecision>,
    /// Tables whose split is ready to finalize (tablet count doubles).
    pub finalize: Vec<TableId>,
}

impl ResizePlan {
    /// Whether the plan requests nothing.
    pub fn is_empty(&self) -> bool {
        self.resize.is_empty() && self.finalize.is_empty()
    }
}

/// Output of one balancing pass.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    /// Ordered replica movements.
    pub migrations: Vec<Migration>,
    /// Split/merge requests.
    pub resize: ResizePlan,
}

impl MigrationPlan {
    /// Whether the plan requests nothing.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty() && self.resize.is_empty()
    }

    /// Number of planned movements.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }
}

/// Per-table size statistics reported by replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLoadStats {
    /// Total size of the table in bytes.
    pub size_in_bytes: u64,
    /// Highest split sequence number every replica is ready for.
    pub split_ready_seq_number: i64,
}

/// Size statistics for all tables.
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    /// Stats keyed by table.
    pub tables: HashMap<TableId, TableLoadStats>,
}

/// The tablet allocator. One instance per process; stateless between calls
/// apart from the shuffle testing hook.
#[derive(Debug, Default)]
pub struct TabletAllocator {
    config: AllocatorConfig,
    shuffle: AtomicBool,
}

impl TabletAllocator {
    /// Create an allocator.
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            shuffle: AtomicBool::new(false),
        }
    }

    /// The configuration.
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Force at least one movement per plan even on a balanced cluster.
    /// Testing hook.
    pub fn set_shuffle(&self, enabled: bool) {
        self.shuffle.store(enabled, Ordering::SeqCst);
        tracing::warn!(enabled, "Allocator shuffle mode changed");
    }

    /// Whether shuffle mode is on.
    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle.load(Ordering::SeqCst)
    }

    /// Compute a migration plan for the given metadata snapshot.
    ///
    /// Decommissioned hosts are drained first; then greedy moves shrink the
    /// gap between the most and least loaded hosts of each datacenter until
    /// no move improves balance. With balancing disabled only draining
    /// happens and no resize decisions are made.
    pub async fn balance_tablets(
        &self,
        metadata: &TabletMetadata,
        topology: &Topology,
        load_stats: Option<&LoadStats>,
        skiplist: &HashSet<HostId>,
    ) -> Result<MigrationPlan> {
        let mut planner = Planner::new(metadata, topology, skiplist)?;

        planner.drain_decommissioned()?;

        let mut plan = MigrationPlan::default();
        if metadata.balancing_enabled() {
            planner.balance()?;
            if self.shuffle_enabled() {
                planner.shuffle();
            }
            if let Some(stats) = load_stats {
                plan.resize = self.plan_resize(metadata, stats);
            }
        }

        plan.migrations = planner.into_migrations();
        if !plan.is_empty() {
            tracing::info!(
                migrations = plan.migrations.len(),
                resizes = plan.resize.resize.len(),
                finalizes = plan.resize.finalize.len(),
                "Computed migration plan"
            );
        }
        Ok(plan)
    }

    fn plan_resize(&self, metadata: &TabletMetadata, stats: &LoadStats) -> ResizePlan {
        let mut plan = ResizePlan::default();
        for (table, tmap) in metadata.tables() {
            let Some(table_stats) = stats.tables.get(&table) else {
                continue;
            };
            let avg_tablet_size = table_stats.size_in_bytes / tmap.tablet_count();
            let target = self.config.target_size_for(table);
            let wanted = if avg_tablet_size >= target {
                ResizeWay::Split
            } else if avg_tablet_size < self.config.merge_threshold_for(table) {
                ResizeWay::Merge
            } else {
                ResizeWay::None
            };

            let current = tmap.resize_decision();
            if current.way == ResizeWay::Split
                && wanted == ResizeWay::Split
                && table_stats.split_ready_seq_number >= current.sequence_number
                && !tmap.has_transitions()
            {
                tracing::info!(table = %table, "Split ready on all replicas, finalizing");
                plan.finalize.push(table);
            } else if wanted != current.way {
                tracing::info!(
                    table = %table,
                    way = %wanted,
                    avg_tablet_size,
                    target,
                    "Revising resize decision"
                );
                plan.resize.insert(table, current.revised(wanted));
            }
        }
        plan
    }
}

// Working state of one planning pass: effective replica sets, the load
// sketch they imply, and the movements proposed so far.
struct Planner<'a> {
    topology: &'a Topology,
    skiplist: &'a HashSet<HostId>,
    sketch: LoadSketch,
    replicas: HashMap<GlobalTabletId, Vec<TabletReplica>>,
    by_host: HashMap<HostId, BTreeSet<GlobalTabletId>>,
    // Tablets that may not move in this pass: already in transition, or
    // already moved by this plan. At most one pending change per tablet.
    frozen: HashSet<GlobalTabletId>,
    migrations: Vec<Migration>,
}

impl<'a> Planner<'a> {
    fn new(
        metadata: &TabletMetadata,
        topology: &'a Topology,
        skiplist: &'a HashSet<HostId>,
    ) -> Result<Self> {
        let mut sketch = LoadSketch::new(topology);
        sketch.populate_committed(metadata)?;

        let mut replicas = HashMap::new();
        let mut by_host: HashMap<HostId, BTreeSet<GlobalTabletId>> = HashMap::new();
        let mut frozen = HashSet::new();
        for (table, tmap) in metadata.tables() {
            for (tablet, info) in tmap.tablets() {
                let gid = GlobalTabletId { table, tablet };
                let effective = match tmap.get_transition(tablet) {
                    Some(transition) => {
                        frozen.insert(gid);
                        transition.next_replicas.clone()
                    }
                    None => info.replicas.clone(),
                };
                for replica in &effective {
                    by_host.entry(replica.host).or_default().insert(gid);
                }
                replicas.insert(gid, effective);
            }
        }

        Ok(Self {
            topology,
            skiplist,
            sketch,
            replicas,
            by_host,
            frozen,
            migrations: Vec::new(),
        })
    }

    fn into_migrations(self) -> Vec<Migration> {
        self.migrations
    }

    // Hosts eligible to receive replicas, deterministic order.
    fn receiving_hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self
            .topology
            .nodes()
            .filter(|n| {
                n.state == HostState::Normal
                    && n.shard_count > 0
                    && !self.skiplist.contains(&n.host)
            })
            .map(|n| n.host)
            .collect();
        hosts.sort();
        hosts
    }

    // Whether moving one of `gid`'s replicas from `leaving` to `dst` keeps
    // the placement legal: distinct hosts, and distinct racks within the
    // datacenter whenever the datacenter has at least RF racks.
    fn placement_ok(&self, gid: GlobalTabletId, leaving: HostId, dst: HostId) -> bool {
        let Some(dst_dc) = self.topology.dc_of(dst) else {
            return false;
        };
        let replica_set = &self.replicas[&gid];
        if replica_set.iter().any(|r| r.host == dst) {
            return false;
        }

        let peers_in_dc: Vec<HostId> = replica_set
            .iter()
            .filter(|r| r.host != leaving)
            .filter(|r| self.topology.dc_of(r.host) == Some(dst_dc))
            .map(|r| r.host)
            .collect();
        let rf_in_dc = peers_in_dc.len() + 1;
        if self.topology.racks_in_dc(dst_dc).len() < rf_in_dc {
            // Not enough racks for uniqueness; the constraint is waived.
            return true;
        }
        let dst_rack = self.topology.rack_of(dst);
        !peers_in_dc
            .iter()
            .any(|h| self.topology.rack_of(*h) == dst_rack)
    }

    // Least-loaded legal destination in the source replica's datacenter.
    fn pick_destination(&self, gid: GlobalTabletId, leaving: HostId) -> Result<HostId> {
        let dc = self
            .topology
            .dc_of(leaving)
            .ok_or_else(|| Error::Configuration(format!("replica on unknown host {leaving}")))?
            .to_string();

        let mut candidates: Vec<HostId> = self
            .receiving_hosts()
            .into_iter()
            .filter(|h| *h != leaving && self.topology.dc_of(*h) == Some(dc.as_str()))
            .collect();
        candidates.sort_by(|a, b| {
            self.sketch
                .avg_shard_load(*a)
                .total_cmp(&self.sketch.avg_shard_load(*b))
                .then(a.cmp(b))
        });

        let replica_set = &self.replicas[&gid];
        let mut rack_blocked = false;
        for dst in candidates {
            if replica_set.iter().any(|r| r.host == dst) {
                continue;
            }
            if self.placement_ok(gid, leaving, dst) {
                return Ok(dst);
            }
            rack_blocked = true;
        }

        if rack_blocked {
            Err(Error::RackConstraintViolation { dc })
        } else {
            let available = self
                .topology
                .live_hosts_in_dc(&dc)
                .filter(|n| !self.skiplist.contains(&n.host))
                .count();
            Err(Error::NotEnoughNodes {
                dc,
                requested: replica_set
                    .iter()
                    .filter(|r| self.topology.dc_of(r.host) == self.topology.dc_of(leaving))
                    .count(),
                available,
            })
        }
    }

    fn apply_move(&mut self, gid: GlobalTabletId, src: TabletReplica, dst_host: HostId) {
        let dst = TabletReplica::new(dst_host, self.sketch.least_loaded_shard(dst_host));
        self.sketch.remove(src);
        // The destination passed placement checks against the topology, so
        // the slot exists.
        let _ = self.sketch.add(dst);

        if let Some(set) = self.replicas.get_mut(&gid) {
            if let Some(slot) = set.iter_mut().find(|r| **r == src) {
                *slot = dst;
            }
        }
        if let Some(tablets) = self.by_host.get_mut(&src.host) {
            tablets.remove(&gid);
        }
        self.by_host.entry(dst.host).or_default().insert(gid);
        self.frozen.insert(gid);

        tracing::debug!(tablet = %gid, src = %src, dst = %dst, "Planned migration");
        self.migrations.push(Migration::new(gid, src, dst));
    }

    // Move every replica off hosts that are being decommissioned. Runs even
    // with balancing disabled.
    fn drain_decommissioned(&mut self) -> Result<()> {
        let mut draining: Vec<HostId> = self
            .topology
            .nodes()
            .filter(|n| n.state == HostState::BeingDecommissioned)
            .map(|n| n.host)
            .collect();
        draining.sort();

        for host in draining {
            let tablets: Vec<GlobalTabletId> = self
                .by_host
                .get(&host)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            if !tablets.is_empty() {
                tracing::info!(host = %host, tablets = tablets.len(), "Draining decommissioned host");
            }
            for gid in tablets {
                if self.frozen.contains(&gid) {
                    continue;
                }
                let Some(src) = self.replicas[&gid].iter().find(|r| r.host == host).copied()
                else {
                    continue;
                };
                let dst = self.pick_destination(gid, host)?;
                self.apply_move(gid, src, dst);
            }
        }
        Ok(())
    }

    // Moving a replica from `src` to `dst` improves balance iff
    //   avg(src) - avg(dst) >= 1/shards(src) + 1/shards(dst)
    // evaluated exactly in integers. Each such move strictly decreases
    // sum(load^2 / shards), so the greedy loop terminates.
    fn move_improves(&self, src: HostId, dst: HostId) -> bool {
        let (Some(ss), Some(sd)) = (self.topology.shard_count(src), self.topology.shard_count(dst))
        else {
            return false;
        };
        let (ss, sd) = (ss as i128, sd as i128);
        let load_s = self.sketch.load(src) as i128;
        let load_d = self.sketch.load(dst) as i128;
        load_s * sd - load_d * ss >= ss + sd
    }

    fn balance(&mut self) -> Result<()> {
        // Generous upper bound; the potential argument above is what
        // actually stops the loop.
        let max_moves = self.replicas.len() * self.topology.len().max(1) + 16;

        for _ in 0..max_moves {
            if !self.balance_step() {
                break;
            }
        }
        Ok(())
    }

    // One greedy move from the most loaded host toward the least loaded
    // compatible host of the same datacenter. Returns false at fixpoint.
    fn balance_step(&mut self) -> bool {
        let mut hosts = self.receiving_hosts();
        hosts.sort_by(|a, b| {
            self.sketch
                .avg_shard_load(*b)
                .total_cmp(&self.sketch.avg_shard_load(*a))
                .then(a.cmp(b))
        });

        for src in &hosts {
            let src = *src;
            let Some(src_dc) = self.topology.dc_of(src) else {
                continue;
            };
            let mut dsts: Vec<HostId> = hosts
                .iter()
                .copied()
                .filter(|h| *h != src && self.topology.dc_of(*h) == Some(src_dc))
                .collect();
            dsts.sort_by(|a, b| {
                self.sketch
                    .avg_shard_load(*a)
                    .total_cmp(&self.sketch.avg_shard_load(*b))
                    .then(a.cmp(b))
            });

            for dst in dsts {
                if !self.move_improves(src, dst) {
                    // Destinations are sorted by load; no later one helps.
                    break;
                }
                let tablets: Vec<GlobalTabletId> = self
                    .by_host
                    .get(&src)
                    .map(|s| s.iter().copied().collect())
                    .unwrap_or_default();
                for gid in tablets {
                    if self.frozen.contains(&gid) || !self.placement_ok(gid, src, dst) {
                        continue;
                    }
                    let Some(src_replica) =
                        self.replicas[&gid].iter().find(|r| r.host == src).copied()
                    else {
                        continue;
                    };
                    self.apply_move(gid, src_replica, dst);
                    return true;
                }
            }
        }
        false
    }

    // Force one legal movement regardless of balance. Testing hook backing
    // the allocator's shuffle mode.
    fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        let mut hosts: Vec<HostId> = self
            .by_host
            .iter()
            .filter(|(_, tablets)| !tablets.is_empty())
            .map(|(h, _)| *h)
            .collect();
        hosts.sort();
        hosts.shuffle(&mut rng);

        for src in hosts {
            let mut tablets: Vec<GlobalTabletId> = self
                .by_host
                .get(&src)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            tablets.shuffle(&mut rng);
            let mut dsts = self.receiving_hosts();
            dsts.shuffle(&mut rng);
            for gid in tablets {
                if self.frozen.contains(&gid) {
                    continue;
                }
                for dst in &dsts {
                    if *dst == src || !self.placement_ok(gid, src, *dst) {
                        continue;
                    }
                    if self.topology.dc_of(*dst) != self.topology.dc_of(src) {
                        continue;
                    }
                    let Some(src_replica) =
                        self.replicas[&gid].iter().find(|r| r.host == src).copied()
                    else {
                        continue;
                    };
                    tracing::debug!(tablet = %gid, "Shuffle-forced migration");
                    self.apply_move(gid, src_replica, *dst);
                    return;
                }
            }
        }
    }
}
