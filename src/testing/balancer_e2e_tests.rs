//! End-to-end balancing scenarios, driven to fixpoint against in-memory
//! metadata the way the topology coordinator drives the real catalog.

use crate::balancer::{LoadStats, TableLoadStats, TabletAllocator};
use crate::config::AllocatorConfig;
use crate::error::Error;
use crate::load::LoadSketch;
use crate::tablets::{
    ResizeWay, TabletId, TabletInfo, TabletMap, TabletMetadata, TabletReplica,
    TabletTransitionInfo, TransitionKind, TransitionStage,
};
use crate::testing::{
    execute_transitions, rebalance_as_in_progress, rebalance_to_fixpoint, verify_invariants,
};
use crate::topology::{HostState, Topology};
use crate::types::{HostId, ShardId, TableId};
use rand::Rng;
use std::collections::{HashMap, HashSet};

fn replica(host: HostId, shard: ShardId) -> TabletReplica {
    TabletReplica::new(host, shard)
}

fn sketch_of(metadata: &TabletMetadata, topology: &Topology) -> LoadSketch {
    let mut sketch = LoadSketch::new(topology);
    sketch.populate(metadata).unwrap();
    sketch
}

// Four RF=2 tablets fully placed on the first two hosts, shard layout as
// uneven as two shards allow.
fn four_tablets_on(h1: HostId, h2: HostId) -> TabletMap {
    let mut tmap = TabletMap::new(4);
    tmap.set_info(TabletId(0), TabletInfo::new(vec![replica(h1, 0), replica(h2, 1)]));
    tmap.set_info(TabletId(1), TabletInfo::new(vec![replica(h1, 0), replica(h2, 1)]));
    tmap.set_info(TabletId(2), TabletInfo::new(vec![replica(h1, 0), replica(h2, 0)]));
    tmap.set_info(TabletId(3), TabletInfo::new(vec![replica(h1, 1), replica(h2, 0)]));
    tmap
}

#[tokio::test]
async fn test_load_balancing_with_empty_node() {
    // Bootstrapping a single empty node: the balancer must see it and move
    // tablets onto it.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    for h in [h1, h2, h3] {
        topo.update_node(h, "dc1", "rack-1", HostState::Normal, 2);
    }

    let mut tm = TabletMetadata::new();
    tm.set_map(table, four_tablets_on(h1, h2));

    // Sanity check on the starting sketch.
    {
        let load = sketch_of(&tm, &topo);
        assert_eq!(load.load(h1), 4);
        assert_eq!(load.avg_shard_load(h1), 2.0);
        assert_eq!(load.load(h2), 4);
        assert_eq!(load.avg_shard_load(h2), 2.0);
        assert_eq!(load.load(h3), 0);
        assert_eq!(load.avg_shard_load(h3), 0.0);
    }

    let allocator = TabletAllocator::default();
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    let load = sketch_of(&tm, &topo);
    for h in [h1, h2, h3] {
        assert!(load.load(h) <= 3, "host over capacity after rebalance");
        assert!(load.load(h) >= 2, "host left under-filled after rebalance");
        assert!(load.avg_shard_load(h) <= 2.0);
        assert!(load.avg_shard_load(h) > 0.0);
    }
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_load_balancing_with_skiplist() {
    // A DOWN node sits in the skip-list; the balancer must not move
    // anything onto it.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    for h in [h1, h2, h3] {
        topo.update_node(h, "dc1", "rack-1", HostState::Normal, 2);
    }

    let mut tm = TabletMetadata::new();
    tm.set_map(table, four_tablets_on(h1, h2));

    let allocator = TabletAllocator::default();
    let skiplist = HashSet::from([h3]);
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &skiplist)
        .await
        .unwrap();

    let load = sketch_of(&tm, &topo);
    assert_eq!(load.load(h3), 0);
    assert_eq!(load.avg_shard_load(h3), 0.0);
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_decommission_rf_met() {
    // The decommissioned host drains completely; the survivors end up
    // carrying its replicas.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, 2);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, 2);
    topo.update_node(h3, "dc1", "rack-1", HostState::BeingDecommissioned, 2);

    let mut tmap = TabletMap::new(4);
    tmap.set_info(TabletId(0), TabletInfo::new(vec![replica(h1, 0), replica(h2, 1)]));
    tmap.set_info(TabletId(1), TabletInfo::new(vec![replica(h1, 0), replica(h2, 1)]));
    tmap.set_info(TabletId(2), TabletInfo::new(vec![replica(h1, 0), replica(h3, 0)]));
    tmap.set_info(TabletId(3), TabletInfo::new(vec![replica(h2, 1), replica(h3, 1)]));
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    {
        let load = sketch_of(&tm, &topo);
        assert_eq!(load.avg_shard_load(h1), 2.0);
        assert_eq!(load.avg_shard_load(h2), 2.0);
        assert_eq!(load.avg_shard_load(h3), 0.0);
    }

    // Once the host has left, another pass changes nothing.
    topo.update_state(h3, HostState::Left);
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    let load = sketch_of(&tm, &topo);
    assert_eq!(load.avg_shard_load(h1), 2.0);
    assert_eq!(load.avg_shard_load(h2), 2.0);
    assert_eq!(load.avg_shard_load(h3), 0.0);
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_decommission_two_racks() {
    // Draining a host in a two-rack datacenter keeps replicas rack-unique.
    let hosts: Vec<HostId> = (0..4).map(|_| HostId::random()).collect();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(hosts[0], "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(hosts[1], "dc1", "rack-2", HostState::Normal, 1);
    topo.update_node(hosts[2], "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(hosts[3], "dc1", "rack-2", HostState::BeingDecommissioned, 1);

    let mut tmap = TabletMap::new(4);
    tmap.set_info(
        TabletId(0),
        TabletInfo::new(vec![replica(hosts[0], 0), replica(hosts[1], 0)]),
    );
    tmap.set_info(
        TabletId(1),
        TabletInfo::new(vec![replica(hosts[1], 0), replica(hosts[2], 0)]),
    );
    tmap.set_info(
        TabletId(2),
        TabletInfo::new(vec![replica(hosts[2], 0), replica(hosts[3], 0)]),
    );
    tmap.set_info(
        TabletId(3),
        TabletInfo::new(vec![replica(hosts[0], 0), replica(hosts[1], 0)]),
    );
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    let load = sketch_of(&tm, &topo);
    assert_eq!(load.load(hosts[3]), 0);
    for h in &hosts[..3] {
        assert!(load.load(*h) >= 2);
    }

    // No two replicas of any tablet share a rack.
    let tmap = tm.get(table).unwrap();
    for (_, info) in tmap.tablets() {
        let racks: HashSet<_> = info
            .replicas
            .iter()
            .filter_map(|r| topo.rack_of(r.host))
            .collect();
        assert_eq!(racks.len(), info.replicas.len());
    }
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_decommission_rack_load_failure() {
    // Every survivor lives in the same rack as the remaining replicas, so
    // draining the lone rack-2 host cannot satisfy rack uniqueness.
    let hosts: Vec<HostId> = (0..4).map(|_| HostId::random()).collect();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(hosts[0], "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(hosts[1], "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(hosts[2], "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(hosts[3], "dc1", "rack-2", HostState::BeingDecommissioned, 1);

    let mut tmap = TabletMap::new(4);
    for (i, id) in tmap.tablet_ids().collect::<Vec<_>>().into_iter().enumerate() {
        tmap.set_info(
            id,
            TabletInfo::new(vec![replica(hosts[i % 3], 0), replica(hosts[3], 0)]),
        );
    }
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    let err = allocator
        .balance_tablets(&tm, &topo, None, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RackConstraintViolation { .. }));
}

#[tokio::test]
async fn test_decommission_rf_not_met() {
    // RF 3 across three hosts: draining one leaves nowhere to put its
    // replica.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, 2);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, 2);
    topo.update_node(h3, "dc1", "rack-1", HostState::BeingDecommissioned, 2);

    let mut tmap = TabletMap::new(1);
    tmap.set_info(
        TabletId(0),
        TabletInfo::new(vec![replica(h1, 0), replica(h2, 0), replica(h3, 0)]),
    );
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    let err = allocator
        .balance_tablets(&tm, &topo, None, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotEnoughNodes { .. }));
}

#[tokio::test]
async fn test_load_balancing_works_with_in_progress_transitions() {
    // An active migration must not stall the balancer: planning against
    // the committed view, the final state is perfectly balanced.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(h3, "dc1", "rack-1", HostState::Normal, 2);

    let mut tmap = TabletMap::new(4);
    for id in tmap.tablet_ids().collect::<Vec<_>>() {
        tmap.set_info(id, TabletInfo::new(vec![replica(h1, 0), replica(h2, 0)]));
    }
    tmap.set_transition(
        TabletId(0),
        TabletTransitionInfo::new(
            TransitionStage::AllowWriteBothReadOld,
            TransitionKind::Migration,
            vec![replica(h3, 0), replica(h2, 0)],
            replica(h3, 0),
        ),
    );
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    rebalance_as_in_progress(&allocator, &mut tm, &topo)
        .await
        .unwrap();
    execute_transitions(&mut tm);

    let load = sketch_of(&tm, &topo);
    for h in [h1, h2, h3] {
        assert_eq!(load.avg_shard_load(h), 2.0);
    }
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_load_balancing_with_two_empty_nodes() {
    let hosts: Vec<HostId> = (0..4).map(|_| HostId::random()).collect();
    let table = TableId::random();
    let shard_count = 2;

    let mut topo = Topology::new();
    for &h in &hosts {
        topo.update_node(h, "dc1", "rack-1", HostState::Normal, shard_count);
    }

    let mut rng = rand::thread_rng();
    let mut tmap = TabletMap::new(16);
    for id in tmap.tablet_ids().collect::<Vec<_>>() {
        tmap.set_info(
            id,
            TabletInfo::new(vec![
                replica(hosts[0], rng.gen_range(0..shard_count)),
                replica(hosts[1], rng.gen_range(0..shard_count)),
            ]),
        );
    }
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    let load = sketch_of(&tm, &topo);
    for &h in &hosts {
        assert_eq!(load.avg_shard_load(h), 4.0);
    }
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_load_balancer_disabling() {
    // host1 loaded, host2 empty: an imbalance the balancer would fix,
    // unless balancing is disabled.
    let h1 = HostId::random();
    let h2 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, 1);

    let mut tmap = TabletMap::new(16);
    for id in tmap.tablet_ids().collect::<Vec<_>>() {
        tmap.set_info(id, TabletInfo::new(vec![replica(h1, 0)]));
    }
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    let skiplist = HashSet::new();

    let plan = allocator
        .balance_tablets(&tm, &topo, None, &skiplist)
        .await
        .unwrap();
    assert!(!plan.is_empty());

    tm.set_balancing_enabled(false);
    let plan = allocator
        .balance_tablets(&tm, &topo, None, &skiplist)
        .await
        .unwrap();
    assert!(plan.is_empty());

    // Cloning the metadata preserves the switch.
    let cloned = tm.clone();
    let plan = allocator
        .balance_tablets(&cloned, &topo, None, &skiplist)
        .await
        .unwrap();
    assert!(plan.is_empty());

    tm.set_balancing_enabled(true);
    let plan = allocator
        .balance_tablets(&tm, &topo, None, &skiplist)
        .await
        .unwrap();
    assert!(!plan.is_empty());
}

#[tokio::test]
async fn test_load_balancer_shuffle_mode() {
    let h1 = HostId::random();
    let h2 = HostId::random();
    let h3 = HostId::random();
    let table = TableId::random();

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, 1);
    topo.update_node(h3, "dc1", "rack-1", HostState::Normal, 2);

    let mut tmap = TabletMap::new(4);
    for id in tmap.tablet_ids().collect::<Vec<_>>() {
        tmap.set_info(id, TabletInfo::new(vec![replica(h1, 0), replica(h2, 0)]));
    }
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator = TabletAllocator::default();
    rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
        .await
        .unwrap();

    // Balanced: nothing to do.
    let plan = allocator
        .balance_tablets(&tm, &topo, None, &HashSet::new())
        .await
        .unwrap();
    assert!(plan.is_empty());

    // Shuffle mode forces movement anyway.
    allocator.set_shuffle(true);
    let plan = allocator
        .balance_tablets(&tm, &topo, None, &HashSet::new())
        .await
        .unwrap();
    assert!(!plan.is_empty());
}

#[tokio::test]
async fn test_load_balancing_resize_requests() {
    let h1 = HostId::random();
    let h2 = HostId::random();
    let table = TableId::random();
    let shard_count = 2;
    let target: u64 = 1000;

    let mut topo = Topology::new();
    topo.update_node(h1, "dc1", "rack-1", HostState::Normal, shard_count);
    topo.update_node(h2, "dc1", "rack-1", HostState::Normal, shard_count);

    let mut rng = rand::thread_rng();
    let mut tmap = TabletMap::new(2);
    for id in tmap.tablet_ids().collect::<Vec<_>>() {
        tmap.set_info(
            id,
            TabletInfo::new(vec![
                replica(h1, rng.gen_range(0..shard_count)),
                replica(h2, rng.gen_range(0..shard_count)),
            ]),
        );
    }
    let mut tm = TabletMetadata::new();
    tm.set_map(table, tmap);

    let allocator =
        TabletAllocator::new(AllocatorConfig::new().with_target_tablet_size(target));
    let initial_tablets = tm.get(table).unwrap().tablet_count();

    let stats_for = |size_in_bytes: u64, ready: i64| LoadStats {
        tables: HashMap::from([(
            table,
            TableLoadStats {
                size_in_bytes,
                split_ready_seq_number: ready,
            },
        )]),
    };

    // Tablets empty: average size is under the merge threshold.
    rebalance_to_fixpoint(
        &allocator,
        &mut tm,
        &topo,
        Some(&stats_for(0, i64::MIN)),
        &HashSet::new(),
    )
    .await
    .unwrap();
    assert_eq!(tm.get(table).unwrap().tablet_count(), initial_tablets);
    assert_eq!(
        tm.get(table).unwrap().resize_decision().way,
        ResizeWay::Merge
    );

    // Average size back between the thresholds: merge cancelled.
    rebalance_to_fixpoint(
        &allocator,
        &mut tm,
        &topo,
        Some(&stats_for(target / 2 * initial_tablets, i64::MIN)),
        &HashSet::new(),
    )
    .await
    .unwrap();
    assert_eq!(tm.get(table).unwrap().tablet_count(), initial_tablets);
    assert_eq!(tm.get(table).unwrap().resize_decision().way, ResizeWay::None);

    // Average size at the split threshold: split requested.
    let oversized = target * 3 / 2 * initial_tablets;
    rebalance_to_fixpoint(
        &allocator,
        &mut tm,
        &topo,
        Some(&stats_for(oversized, i64::MIN)),
        &HashSet::new(),
    )
    .await
    .unwrap();
    let decision = tm.get(table).unwrap().resize_decision();
    assert_eq!(tm.get(table).unwrap().tablet_count(), initial_tablets);
    assert_eq!(decision.way, ResizeWay::Split);
    assert!(decision.sequence_number > 0);

    // Replicas report ready: the split finalizes, doubling the count and
    // resetting the decision; children inherit their parent's replicas.
    let before = tm.get(table).unwrap().clone();
    rebalance_to_fixpoint(
        &allocator,
        &mut tm,
        &topo,
        Some(&stats_for(oversized, decision.sequence_number)),
        &HashSet::new(),
    )
    .await
    .unwrap();

    let after = tm.get(table).unwrap();
    assert_eq!(after.tablet_count(), initial_tablets * 2);
    assert_eq!(after.resize_decision().way, ResizeWay::None);
    for parent in before.tablet_ids() {
        assert_eq!(
            after.get_info(TabletId(parent.0 * 2)),
            before.get_info(parent)
        );
        assert_eq!(
            after.get_info(TabletId(parent.0 * 2 + 1)),
            before.get_info(parent)
        );
    }
    verify_invariants(&tm, &topo);
}

#[tokio::test]
async fn test_load_balancing_with_random_load() {
    let n_hosts = 6;
    let racks = ["rack-1", "rack-2"];
    let shard_count = 2;

    let mut rng = rand::thread_rng();
    for _ in 0..8 {
        let hosts: Vec<HostId> = (0..n_hosts).map(|_| HostId::random()).collect();
        let mut topo = Topology::new();
        let mut hosts_by_rack: HashMap<&str, Vec<HostId>> = HashMap::new();
        for (i, &h) in hosts.iter().enumerate() {
            let rack = racks[i % racks.len()];
            topo.update_node(h, "dc1", rack, HostState::Normal, shard_count);
            if i != 0 {
                // Leave the first host empty to create an imbalance.
                hosts_by_rack.entry(rack).or_default().push(h);
            }
        }

        let rf = rng.gen_range(2..=4usize);
        let mut tm = TabletMetadata::new();
        for log2_tablets in 0..6u32 {
            if rng.gen_bool(0.5) {
                continue;
            }
            let mut tmap = TabletMap::new(1 << log2_tablets);
            for id in tmap.tablet_ids().collect::<Vec<_>>() {
                // Fill racks evenly with distinct hosts.
                let mut replica_hosts: Vec<HostId> = Vec::new();
                for k in 0..rf {
                    let rack_hosts = &hosts_by_rack[racks[k % racks.len()]];
                    loop {
                        let candidate = rack_hosts[rng.gen_range(0..rack_hosts.len())];
                        if !replica_hosts.contains(&candidate) {
                            replica_hosts.push(candidate);
                            break;
                        }
                    }
                }
                tmap.set_info(
                    id,
                    TabletInfo::new(
                        replica_hosts
                            .into_iter()
                            .map(|h| replica(h, rng.gen_range(0..shard_count)))
                            .collect(),
                    ),
                );
            }
            tm.set_map(TableId::random(), tmap);
        }

        let allocator = TabletAllocator::default();
        rebalance_to_fixpoint(&allocator, &mut tm, &topo, None, &HashSet::new())
            .await
            .unwrap();

        // The algorithm must reach a fixpoint with all invariants intact;
        // perfect balance is not guaranteed across racks.
        verify_invariants(&tm, &topo);
    }
}
