//! Replica reallocation for replication-factor changes.
//!
//! Given a table's tablet map and new per-datacenter replication factors,
//! computes a new map. Each datacenter succeeds or fails independently: a
//! datacenter with fewer live hosts than its target factor is reported as
//! such and its replicas stay untouched, while every successful datacenter
//! is applied atomically.

use crate::error::Result;
use crate::load::LoadSketch;
use crate::tablets::{TabletInfo, TabletMap, TabletReplica};
use crate::topology::Topology;
use crate::types::HostId;
use std::collections::BTreeMap;

/// Outcome of reallocating one datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocationStatus {
    /// Every tablet satisfies the new replication factor.
    Success,
    /// The datacenter has fewer live hosts than the requested factor.
    NotEnoughNodes,
}

impl std::fmt::Display for ReallocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReallocationStatus::Success => write!(f, "success"),
            ReallocationStatus::NotEnoughNodes => write!(f, "not_enough_nodes"),
        }
    }
}

/// New tablet map plus the per-datacenter outcome.
#[derive(Debug, Clone)]
pub struct ReallocationResult {
    /// The reallocated map. Datacenters that failed keep their old replicas.
    pub map: TabletMap,
    /// Outcome per requested datacenter.
    pub statuses: BTreeMap<String, ReallocationStatus>,
}

/// Recompute replica sets for new per-datacenter replication factors.
///
/// Upsizing adds replicas on the least loaded hosts, preferring racks not
/// yet holding a replica of the tablet. Downsizing removes replicas from
/// the most loaded hosts first, breaking ties toward racks holding the
/// most replicas.
pub fn reallocate_for_new_rf(
    map: &TabletMap,
    topology: &Topology,
    new_rf_per_dc: &BTreeMap<String, usize>,
) -> Result<ReallocationResult> {
    let mut result = map.clone();
    let mut statuses = BTreeMap::new();

    let mut sketch = LoadSketch::new(topology);
    for (_, info) in map.tablets() {
        for replica in &info.replicas {
            sketch.add(*replica)?;
        }
    }

    for (dc, &target_rf) in new_rf_per_dc {
        let mut live: Vec<HostId> = topology.live_hosts_in_dc(dc).map(|n| n.host).collect();
        live.sort();

        if live.len() < target_rf {
            tracing::warn!(
                dc = %dc,
                requested = target_rf,
                available = live.len(),
                "Cannot satisfy new replication factor"
            );
            statuses.insert(dc.clone(), ReallocationStatus::NotEnoughNodes);
            continue;
        }

        for id in result.tablet_ids().collect::<Vec<_>>() {
            let mut replicas = result.get_info(id).replicas.clone();

            while replicas_in_dc(&replicas, topology, dc) < target_rf {
                let Some(host) = pick_addition(&replicas, topology, dc, &live, &sketch) else {
                    // Live-host count was checked up front, so a candidate
                    // always exists.
                    break;
                };
                let added = TabletReplica::new(host, sketch.least_loaded_shard(host));
                sketch.add(added)?;
                replicas.push(added);
            }

            while replicas_in_dc(&replicas, topology, dc) > target_rf {
                if let Some(victim) = pick_removal(&replicas, topology, dc, &sketch) {
                    sketch.remove(victim);
                    replicas.retain(|r| *r != victim);
                }
            }

            result.set_info(id, TabletInfo::new(replicas));
        }

        tracing::info!(dc = %dc, rf = target_rf, "Reallocated replicas for new replication factor");
        statuses.insert(dc.clone(), ReallocationStatus::Success);
    }

    Ok(ReallocationResult {
        map: result,
        statuses,
    })
}

fn replicas_in_dc(replicas: &[TabletReplica], topology: &Topology, dc: &str) -> usize {
    replicas
        .iter()
        .filter(|r| topology.dc_of(r.host) == Some(dc))
        .count()
}

// Least loaded live host not yet holding a replica, preferring racks the
// tablet does not use in this datacenter.
fn pick_addition(
    replicas: &[TabletReplica],
    topology: &Topology,
    dc: &str,
    live: &[HostId],
    sketch: &LoadSketch,
) -> Option<HostId> {
    let used_racks: Vec<&str> = replicas
        .iter()
        .filter(|r| topology.dc_of(r.host) == Some(dc))
        .filter_map(|r| topology.rack_of(r.host))
        .collect();

    live.iter()
        .copied()
        .filter(|h| !replicas.iter().any(|r| r.host == *h))
        .min_by(|a, b| {
            let a_rack_used = topology
                .rack_of(*a)
                .map(|rack| used_racks.contains(&rack))
                .unwrap_or(false);
            let b_rack_used = topology
                .rack_of(*b)
                .map(|rack| used_racks.contains(&rack))
                .unwrap_or(false);
            a_rack_used
                .cmp(&b_rack_used)
                .then(sketch.avg_shard_load(*a).total_cmp(&sketch.avg_shard_load(*b)))
                .then(a.cmp(b))
        })
}

// Replica to drop: most loaded host first, then racks holding the most
// replicas of this tablet.
fn pick_removal(
    replicas: &[TabletReplica],
    topology: &Topology,
    dc: &str,
    sketch: &LoadSketch,
) -> Option<TabletReplica> {
    let rack_counts: BTreeMap<&str, usize> = replicas
        .iter()
        .filter(|r| topology.dc_of(r.host) == Some(dc))
        .filter_map(|r| topology.rack_of(r.host))
        .fold(BTreeMap::new(), |mut counts, rack| {
            *counts.entry(rack).or_insert(0) += 1;
            counts
        });

    replicas
        .iter()
        .filter(|r| topology.dc_of(r.host) == Some(dc))
        .max_by(|a, b| {
            sketch
                .avg_shard_load(a.host)
                .total_cmp(&sketch.avg_shard_load(b.host))
                .then_with(|| {
                    let a_rack = topology.rack_of(a.host).and_then(|r| rack_counts.get(r));
                    let b_rack = topology.rack_of(b.host).and_then(|r| rack_counts.get(r));
                    a_rack.cmp(&b_rack)
                })
                .then(b.host.cmp(&a.host))
        })
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablets::TabletId;
    use crate::topology::HostState;
    use std::collections::HashSet;

    fn topology_with(dcs: &[(&str, &[(&str, HostId)])], shard_count: u32) -> Topology {
        let mut topo = Topology::new();
        for (dc, hosts) in dcs {
            for (rack, host) in *hosts {
                topo.update_node(*host, *dc, *rack, HostState::Normal, shard_count);
            }
        }
        topo
    }

    // Round-robin placement of `rf` replicas per tablet over the hosts.
    fn populated_map(tablets: u64, rf: usize, hosts: &[HostId]) -> TabletMap {
        let mut tmap = TabletMap::new(tablets);
        for (i, id) in tmap.tablet_ids().collect::<Vec<_>>().into_iter().enumerate() {
            let replicas = (0..rf)
                .map(|k| TabletReplica::new(hosts[(i + k) % hosts.len()], 0))
                .collect();
            tmap.set_info(id, TabletInfo::new(replicas));
        }
        tmap
    }

    fn dc_rf(map: &TabletMap, topology: &Topology, id: TabletId, dc: &str) -> usize {
        replicas_in_dc(&map.get_info(id).replicas, topology, dc)
    }

    #[test]
    fn test_upsize_one_dc() {
        let hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[("dc1", &[("r1", hosts[0]), ("r2", hosts[1]), ("r3", hosts[2])])],
            3,
        );
        let tmap = populated_map(8, 2, &hosts);

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 3)])).unwrap();

        assert_eq!(result.statuses["dc1"], ReallocationStatus::Success);
        for id in result.map.tablet_ids() {
            let replicas = &result.map.get_info(id).replicas;
            assert_eq!(replicas.len(), 3);
            let distinct: HashSet<_> = replicas.iter().map(|r| r.host).collect();
            assert_eq!(distinct.len(), 3);
        }
    }

    #[test]
    fn test_downsize_one_dc() {
        let hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[("dc1", &[("r1", hosts[0]), ("r2", hosts[1]), ("r3", hosts[2])])],
            3,
        );
        let tmap = populated_map(8, 3, &hosts);

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 2)])).unwrap();

        assert_eq!(result.statuses["dc1"], ReallocationStatus::Success);
        for id in result.map.tablet_ids() {
            assert_eq!(dc_rf(&result.map, &topo, id, "dc1"), 2);
        }
    }

    #[test]
    fn test_no_change_is_identity() {
        let hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[("dc1", &[("r1", hosts[0]), ("r2", hosts[1]), ("r3", hosts[2])])],
            3,
        );
        let tmap = populated_map(8, 3, &hosts);

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 3)])).unwrap();

        assert_eq!(result.statuses["dc1"], ReallocationStatus::Success);
        assert_eq!(result.map, tmap);
    }

    #[test]
    fn test_not_enough_nodes_leaves_replicas_untouched() {
        let hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[("dc1", &[("r1", hosts[0]), ("r2", hosts[1]), ("r3", hosts[2])])],
            3,
        );
        let tmap = populated_map(8, 3, &hosts);

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 5)])).unwrap();

        assert_eq!(result.statuses["dc1"], ReallocationStatus::NotEnoughNodes);
        assert_eq!(result.map, tmap);
    }

    #[test]
    fn test_mixed_dcs_apply_independently() {
        let dc1_hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let dc2_hosts: Vec<HostId> = (0..2).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[
                (
                    "dc1",
                    &[
                        ("r1", dc1_hosts[0]),
                        ("r2", dc1_hosts[1]),
                        ("r3", dc1_hosts[2]),
                    ],
                ),
                ("dc2", &[("r1", dc2_hosts[0]), ("r2", dc2_hosts[1])]),
            ],
            2,
        );

        // RF 2 in dc1, RF 1 in dc2.
        let mut tmap = TabletMap::new(4);
        for (i, id) in tmap.tablet_ids().collect::<Vec<_>>().into_iter().enumerate() {
            tmap.set_info(
                id,
                TabletInfo::new(vec![
                    TabletReplica::new(dc1_hosts[i % 3], 0),
                    TabletReplica::new(dc1_hosts[(i + 1) % 3], 0),
                    TabletReplica::new(dc2_hosts[i % 2], 0),
                ]),
            );
        }

        // dc1 upsizes, dc2 asks for more hosts than exist.
        let result = reallocate_for_new_rf(
            &tmap,
            &topo,
            &BTreeMap::from([("dc1".into(), 3), ("dc2".into(), 4)]),
        )
        .unwrap();

        assert_eq!(result.statuses["dc1"], ReallocationStatus::Success);
        assert_eq!(result.statuses["dc2"], ReallocationStatus::NotEnoughNodes);

        for id in result.map.tablet_ids() {
            assert_eq!(dc_rf(&result.map, &topo, id, "dc1"), 3);
            // dc2 untouched.
            assert_eq!(dc_rf(&result.map, &topo, id, "dc2"), 1);
        }
    }

    #[test]
    fn test_upsize_prefers_unused_racks() {
        let hosts: Vec<HostId> = (0..4).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[(
                "dc1",
                &[
                    ("r1", hosts[0]),
                    ("r1", hosts[1]),
                    ("r2", hosts[2]),
                    ("r2", hosts[3]),
                ],
            )],
            1,
        );

        let mut tmap = TabletMap::new(2);
        for id in tmap.tablet_ids().collect::<Vec<_>>() {
            tmap.set_info(id, TabletInfo::new(vec![TabletReplica::new(hosts[0], 0)]));
        }

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 2)])).unwrap();

        for id in result.map.tablet_ids() {
            let replicas = &result.map.get_info(id).replicas;
            let racks: HashSet<_> = replicas
                .iter()
                .filter_map(|r| topo.rack_of(r.host))
                .collect();
            assert_eq!(racks.len(), 2, "replicas should span both racks");
        }
    }

    #[test]
    fn test_downsize_drops_most_loaded_host_first() {
        let hosts: Vec<HostId> = (0..3).map(|_| HostId::random()).collect();
        let topo = topology_with(
            &[("dc1", &[("r1", hosts[0]), ("r2", hosts[1]), ("r3", hosts[2])])],
            1,
        );

        // hosts[0] carries extra load from a second replica-less imbalance:
        // give it two tablets' worth while the others hold one each.
        let mut tmap = TabletMap::new(2);
        tmap.set_info(
            TabletId(0),
            TabletInfo::new(vec![
                TabletReplica::new(hosts[0], 0),
                TabletReplica::new(hosts[1], 0),
                TabletReplica::new(hosts[2], 0),
            ]),
        );
        tmap.set_info(
            TabletId(1),
            TabletInfo::new(vec![TabletReplica::new(hosts[0], 0)]),
        );

        let result =
            reallocate_for_new_rf(&tmap, &topo, &BTreeMap::from([("dc1".into(), 2)])).unwrap();

        // Tablet 0 drops its replica on the overloaded hosts[0].
        let survivors: HashSet<_> = result
            .map
            .get_info(TabletId(0))
            .replicas
            .iter()
            .map(|r| r.host)
            .collect();
        assert!(!survivors.contains(&hosts[0]));
        assert_eq!(survivors.len(), 2);
    }
}
