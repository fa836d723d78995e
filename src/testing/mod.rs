//! Testing utilities for the tablet subsystem.
//!
//! Provides helpers that reflect a migration plan into tablet metadata the
//! way the topology coordinator eventually would, plus an invariant checker
//! used by the end-to-end balancing tests. The helpers are public so that
//! embedders can drive the allocator in their own harnesses.

#[cfg(test)]
mod balancer_e2e_tests;

use crate::balancer::{LoadStats, MigrationPlan, TabletAllocator};
use crate::error::Result;
use crate::tablets::{replace_replica, TabletMetadata, TransitionKind};
use crate::topology::Topology;
use crate::transition::transition_for_migration;
use crate::types::HostId;
use std::collections::{HashMap, HashSet};

/// Reflect a plan into the metadata as if every migration were fully
/// executed and every resize decision persisted.
pub fn apply_plan(metadata: &mut TabletMetadata, plan: &MigrationPlan) {
    for migration in &plan.migrations {
        let Some(tmap) = metadata.get_mut(migration.tablet.table) else {
            continue;
        };
        let mut info = tmap.get_info(migration.tablet.tablet).clone();
        info.replicas = match migration.kind {
            TransitionKind::Rebuild => {
                let mut replicas = info.replicas;
                replicas.push(migration.dst);
                replicas
            }
            _ => replace_replica(&info.replicas, migration.src, migration.dst),
        };
        tmap.set_info(migration.tablet.tablet, info);
    }
    apply_resize_plan(metadata, plan);
}

/// Reflect a plan into the metadata as if the migrations were started but
/// not yet executed: each one becomes a pending transition.
pub fn apply_plan_as_in_progress(metadata: &mut TabletMetadata, plan: &MigrationPlan) {
    for migration in &plan.migrations {
        let Some(tmap) = metadata.get_mut(migration.tablet.table) else {
            continue;
        };
        let info = tmap.get_info(migration.tablet.tablet).clone();
        tmap.set_transition(
            migration.tablet.tablet,
            transition_for_migration(&info, migration),
        );
    }
    apply_resize_plan(metadata, plan);
}

fn apply_resize_plan(metadata: &mut TabletMetadata, plan: &MigrationPlan) {
    for (table, decision) in &plan.resize.resize {
        if let Some(tmap) = metadata.get_mut(*table) {
            tmap.set_resize_decision(*decision);
        }
    }
    for table in &plan.resize.finalize {
        if let Some(tmap) = metadata.get(*table) {
            let split = tmap.split();
            metadata.set_map(*table, split);
        }
    }
}

/// Complete every pending transition: replicas become the transition
/// targets and the records are cleared.
pub fn execute_transitions(metadata: &mut TabletMetadata) {
    for (_, tmap) in metadata.tables_mut() {
        let pending: Vec<_> = tmap
            .transitions()
            .map(|(id, transition)| (id, transition.next_replicas.clone()))
            .collect();
        for (id, replicas) in pending {
            let mut info = tmap.get_info(id).clone();
            info.replicas = replicas;
            tmap.set_info(id, info);
        }
        tmap.clear_transitions();
    }
}

/// Balance repeatedly, applying each plan as fully executed, until the
/// allocator reports nothing left to do.
pub async fn rebalance_to_fixpoint(
    allocator: &TabletAllocator,
    metadata: &mut TabletMetadata,
    topology: &Topology,
    load_stats: Option<&LoadStats>,
    skiplist: &HashSet<HostId>,
) -> Result<()> {
    loop {
        let plan = allocator
            .balance_tablets(metadata, topology, load_stats, skiplist)
            .await?;
        if plan.is_empty() {
            return Ok(());
        }
        apply_plan(metadata, &plan);
    }
}

/// Balance repeatedly, applying each plan as in-progress transitions. The
/// allocator must keep making progress despite the active migrations.
pub async fn rebalance_as_in_progress(
    allocator: &TabletAllocator,
    metadata: &mut TabletMetadata,
    topology: &Topology,
) -> Result<()> {
    loop {
        let plan = allocator
            .balance_tablets(metadata, topology, None, &HashSet::new())
            .await?;
        if plan.is_empty() {
            return Ok(());
        }
        apply_plan_as_in_progress(metadata, &plan);
    }
}

/// Assert the structural invariants that must hold at every observable
/// metadata version: power-of-two tablet counts, host-distinct replica
/// sets, every replica on a known host within its shard range, and pending
/// replicas contained in their transition targets.
pub fn verify_invariants(metadata: &TabletMetadata, topology: &Topology) {
    for (table, tmap) in metadata.tables() {
        assert!(
            tmap.tablet_count().is_power_of_two(),
            "table {table} has non-power-of-two tablet count"
        );
        for (id, info) in tmap.tablets() {
            let hosts: HashMap<HostId, usize> =
                info.replicas
                    .iter()
                    .fold(HashMap::new(), |mut counts, replica| {
                        *counts.entry(replica.host).or_insert(0) += 1;
                        counts
                    });
            for (host, count) in hosts {
                assert_eq!(count, 1, "tablet {table}:{id} has {count} replicas on {host}");
            }
            for replica in &info.replicas {
                let shard_count = topology
                    .shard_count(replica.host)
                    .unwrap_or_else(|| panic!("replica on unknown host {}", replica.host));
                assert!(
                    replica.shard < shard_count,
                    "tablet {table}:{id} replica {replica} out of shard range"
                );
            }
            if let Some(transition) = tmap.get_transition(id) {
                assert!(
                    transition
                        .next_replicas
                        .contains(&transition.pending_replica),
                    "tablet {table}:{id} pending replica outside next replicas"
                );
            }
        }
    }
}
