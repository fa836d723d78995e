//! Tablet metadata model.
//!
//! A tablet is a contiguous shard of one table's token range and the unit of
//! replica placement. This module holds the in-memory model: replica sets,
//! pending transitions, resize decisions, the per-table [`TabletMap`] and the
//! cluster-wide [`TabletMetadata`].

use crate::token::{self, RangeSide, Token, TokenRange};
use crate::types::{HostId, SessionId, ShardId, TableId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Dense tablet index, local to one tablet map.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TabletId(pub u64);

impl std::fmt::Display for TabletId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One replica of a tablet: a specific CPU shard on a specific host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletReplica {
    /// Host holding the replica.
    pub host: HostId,
    /// CPU shard on that host.
    pub shard: ShardId,
}

impl TabletReplica {
    /// Create a replica reference.
    pub fn new(host: HostId, shard: ShardId) -> Self {
        Self { host, shard }
    }
}

impl std::fmt::Display for TabletReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.shard)
    }
}

/// Current replica set of one tablet. Size equals the table's total
/// replication factor; hosts are pairwise distinct.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TabletInfo {
    /// Ordered replica set.
    pub replicas: Vec<TabletReplica>,
}

impl TabletInfo {
    /// Create from a replica set.
    pub fn new(replicas: Vec<TabletReplica>) -> Self {
        Self { replicas }
    }

    /// Whether a host holds a replica of this tablet.
    pub fn has_host(&self, host: HostId) -> bool {
        self.replicas.iter().any(|r| r.host == host)
    }
}

/// Replace one replica in a set, preserving order.
pub fn replace_replica(
    replicas: &[TabletReplica],
    src: TabletReplica,
    dst: TabletReplica,
) -> Vec<TabletReplica> {
    replicas
        .iter()
        .map(|r| if *r == src { dst } else { *r })
        .collect()
}

/// The replica present in `next` but not in `current`, i.e. the one being
/// added or moved by a transition.
pub fn pending_replica_of(
    current: &[TabletReplica],
    next: &[TabletReplica],
) -> Option<TabletReplica> {
    next.iter().find(|r| !current.contains(r)).copied()
}

/// Stage of a tablet migration. Stages advance linearly; rollback is only
/// permitted before reads shift to the new replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionStage {
    /// Writes go to both replica sets; reads still come from the old one.
    AllowWriteBothReadOld,
    /// Streaming from the source replica is about to begin.
    WriteBothReadOld,
    /// Data copy in progress, bound to a session.
    Streaming,
    /// Streaming complete; the read switch is pending.
    WriteBothReadNew,
    /// Reads come from the new replica set; the old replica still gets writes.
    UseNew,
    /// The old replica stops receiving writes and deletes local data.
    Cleanup,
    /// Terminal: the transition record is removed and replicas become next.
    EndMigration,
}

impl TransitionStage {
    /// The next stage for a transition of the given kind, or `None` from the
    /// terminal stage. Intranode migrations carry no data, so the streaming
    /// stages collapse into the shard remap at `WriteBothReadNew`.
    pub fn next(self, kind: TransitionKind) -> Option<TransitionStage> {
        use TransitionStage::*;
        Some(match (self, kind) {
            (AllowWriteBothReadOld, TransitionKind::IntranodeMigration) => WriteBothReadNew,
            (AllowWriteBothReadOld, _) => WriteBothReadOld,
            (WriteBothReadOld, _) => Streaming,
            (Streaming, _) => WriteBothReadNew,
            (WriteBothReadNew, _) => UseNew,
            (UseNew, _) => Cleanup,
            (Cleanup, _) => EndMigration,
            (EndMigration, _) => return None,
        })
    }

    /// Whether the transition may still be rolled back. Once reads shift,
    /// failures must be repaired forward.
    pub fn can_rollback(self) -> bool {
        matches!(
            self,
            TransitionStage::AllowWriteBothReadOld
                | TransitionStage::WriteBothReadOld
                | TransitionStage::Streaming
        )
    }

    /// Catalog text of the stage.
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionStage::AllowWriteBothReadOld => "allow_write_both_read_old",
            TransitionStage::WriteBothReadOld => "write_both_read_old",
            TransitionStage::Streaming => "streaming",
            TransitionStage::WriteBothReadNew => "write_both_read_new",
            TransitionStage::UseNew => "use_new",
            TransitionStage::Cleanup => "cleanup",
            TransitionStage::EndMigration => "end_migration",
        }
    }
}

impl std::fmt::Display for TransitionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "allow_write_both_read_old" => TransitionStage::AllowWriteBothReadOld,
            "write_both_read_old" => TransitionStage::WriteBothReadOld,
            "streaming" => TransitionStage::Streaming,
            "write_both_read_new" => TransitionStage::WriteBothReadNew,
            "use_new" => TransitionStage::UseNew,
            "cleanup" => TransitionStage::Cleanup,
            "end_migration" => TransitionStage::EndMigration,
            other => return Err(format!("unknown transition stage: {other}")),
        })
    }
}

/// Kind of a tablet transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionKind {
    /// Replace one replica with a replica on another host.
    Migration,
    /// Same host, different shard; no streaming involved.
    IntranodeMigration,
    /// Add a replica without removing any (RF upsize).
    Rebuild,
}

impl TransitionKind {
    /// Catalog text of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionKind::Migration => "migration",
            TransitionKind::IntranodeMigration => "intranode_migration",
            TransitionKind::Rebuild => "rebuild",
        }
    }
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "migration" => TransitionKind::Migration,
            "intranode_migration" => TransitionKind::IntranodeMigration,
            "rebuild" => TransitionKind::Rebuild,
            other => return Err(format!("unknown transition kind: {other}")),
        })
    }
}

/// Pending change to one tablet's replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletTransitionInfo {
    /// Current stage.
    pub stage: TransitionStage,
    /// Kind of change.
    pub kind: TransitionKind,
    /// Target replica set.
    pub next_replicas: Vec<TabletReplica>,
    /// The single replica being added or moved; always in `next_replicas`.
    pub pending_replica: TabletReplica,
    /// Streaming session bound to this transition, if one is active.
    pub session: Option<SessionId>,
}

impl TabletTransitionInfo {
    /// Create a transition record without an active session.
    pub fn new(
        stage: TransitionStage,
        kind: TransitionKind,
        next_replicas: Vec<TabletReplica>,
        pending_replica: TabletReplica,
    ) -> Self {
        Self {
            stage,
            kind,
            next_replicas,
            pending_replica,
            session: None,
        }
    }

    /// Attach a streaming session.
    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }
}

/// Direction of a pending tablet-count change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ResizeWay {
    /// No resize pending.
    #[default]
    None,
    /// Tablets are too large; the count should double.
    Split,
    /// Tablets are too small; the count should halve.
    Merge,
}

impl ResizeWay {
    /// Catalog text of the way.
    pub fn as_str(self) -> &'static str {
        match self {
            ResizeWay::None => "none",
            ResizeWay::Split => "split",
            ResizeWay::Merge => "merge",
        }
    }
}

impl std::fmt::Display for ResizeWay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResizeWay {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "none" => ResizeWay::None,
            "split" => ResizeWay::Split,
            "merge" => ResizeWay::Merge,
            other => return Err(format!("unknown resize way: {other}")),
        })
    }
}

/// Per-table flag advertising an impending split or merge. The sequence
/// number strictly increases on every change and never decreases on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResizeDecision {
    /// Pending direction.
    pub way: ResizeWay,
    /// Monotonic sequence number of the decision.
    pub sequence_number: i64,
}

impl ResizeDecision {
    /// Create a decision.
    pub fn new(way: ResizeWay, sequence_number: i64) -> Self {
        Self {
            way,
            sequence_number,
        }
    }

    /// The decision that supersedes this one with a different way.
    pub fn revised(self, way: ResizeWay) -> Self {
        Self {
            way,
            sequence_number: self.sequence_number + 1,
        }
    }
}

/// Tablet-to-replicas mapping of one table.
///
/// The tablet count is a power of two (or 1); a tablet's token range is
/// determined solely by its index and the count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletMap {
    log2_tablets: u32,
    tablets: Vec<TabletInfo>,
    transitions: BTreeMap<TabletId, TabletTransitionInfo>,
    resize: ResizeDecision,
}

impl TabletMap {
    /// Create a map with `count` empty tablets. `count` must be a power of
    /// two (1 is allowed).
    pub fn new(count: u64) -> Self {
        assert!(count >= 1 && count.is_power_of_two(), "tablet count must be a power of two");
        let log2_tablets = count.trailing_zeros();
        Self {
            log2_tablets,
            tablets: vec![TabletInfo::default(); count as usize],
            transitions: BTreeMap::new(),
            resize: ResizeDecision::default(),
        }
    }

    /// Number of tablets.
    pub fn tablet_count(&self) -> u64 {
        1u64 << self.log2_tablets
    }

    /// The first tablet.
    pub fn first_tablet(&self) -> TabletId {
        TabletId(0)
    }

    /// The last tablet.
    pub fn last_tablet(&self) -> TabletId {
        TabletId(self.tablet_count() - 1)
    }

    /// The tablet after `id`, if any.
    pub fn next_tablet(&self, id: TabletId) -> Option<TabletId> {
        if id.0 + 1 < self.tablet_count() {
            Some(TabletId(id.0 + 1))
        } else {
            None
        }
    }

    /// Iterate over all tablet ids.
    pub fn tablet_ids(&self) -> impl Iterator<Item = TabletId> {
        (0..self.tablet_count()).map(TabletId)
    }

    /// Replica set of a tablet.
    pub fn get_info(&self, id: TabletId) -> &TabletInfo {
        &self.tablets[id.0 as usize]
    }

    /// Replace the replica set of a tablet.
    pub fn set_info(&mut self, id: TabletId, info: TabletInfo) {
        self.tablets[id.0 as usize] = info;
    }

    /// Pending transition of a tablet, if any.
    pub fn get_transition(&self, id: TabletId) -> Option<&TabletTransitionInfo> {
        self.transitions.get(&id)
    }

    /// Record a pending transition.
    pub fn set_transition(&mut self, id: TabletId, info: TabletTransitionInfo) {
        self.transitions.insert(id, info);
    }

    /// Remove the pending transition of a tablet.
    pub fn clear_transition(&mut self, id: TabletId) {
        self.transitions.remove(&id);
    }

    /// Remove every pending transition.
    pub fn clear_transitions(&mut self) {
        self.transitions.clear();
    }

    /// Iterate over all tablets and their replica sets.
    pub fn tablets(&self) -> impl Iterator<Item = (TabletId, &TabletInfo)> {
        self.tablets
            .iter()
            .enumerate()
            .map(|(i, info)| (TabletId(i as u64), info))
    }

    /// Iterate over pending transitions.
    pub fn transitions(&self) -> impl Iterator<Item = (TabletId, &TabletTransitionInfo)> {
        self.transitions.iter().map(|(id, info)| (*id, info))
    }

    /// Whether any transition is pending.
    pub fn has_transitions(&self) -> bool {
        !self.transitions.is_empty()
    }

    /// Shard of the replica a host holds in the tablet's current replica
    /// set. The transition target is not consulted; there is at most one
    /// match since hosts in a replica set are distinct.
    pub fn get_shard(&self, id: TabletId, host: HostId) -> Option<ShardId> {
        self.get_info(id)
            .replicas
            .iter()
            .find(|r| r.host == host)
            .map(|r| r.shard)
    }

    /// The tablet owning a token.
    pub fn tablet_for_token(&self, t: Token) -> TabletId {
        TabletId(token::tablet_index(self.log2_tablets, t))
    }

    /// The owning tablet plus the side of its range the token falls into
    /// after a prospective split.
    pub fn tablet_id_and_side(&self, t: Token) -> (TabletId, RangeSide) {
        let (index, side) = token::tablet_index_and_side(self.log2_tablets, t);
        (TabletId(index), side)
    }

    /// First token of a tablet's range.
    pub fn get_first_token(&self, id: TabletId) -> Token {
        token::first_token(self.log2_tablets, id.0)
    }

    /// Last token of a tablet's range.
    pub fn get_last_token(&self, id: TabletId) -> Token {
        token::last_token(self.log2_tablets, id.0)
    }

    /// Token range of a tablet.
    pub fn get_token_range(&self, id: TabletId) -> TokenRange {
        TokenRange {
            first: self.get_first_token(id),
            last: self.get_last_token(id),
        }
    }

    /// Current resize decision.
    pub fn resize_decision(&self) -> ResizeDecision {
        self.resize
    }

    /// Replace the resize decision.
    pub fn set_resize_decision(&mut self, decision: ResizeDecision) {
        self.resize = decision;
    }

    /// Produce the doubled map that finalizes a split: tablet `i` becomes
    /// tablets `2i` and `2i+1`, both inheriting the replica set. Token
    /// boundaries are preserved by construction. The resize decision resets
    /// to `none` with the sequence number retained, so the persisted
    /// sequence never decreases. Transitions must have drained first.
    pub fn split(&self) -> TabletMap {
        assert!(
            self.transitions.is_empty(),
            "cannot finalize a split while transitions are pending"
        );
        let mut tablets = Vec::with_capacity(self.tablets.len() * 2);
        for info in &self.tablets {
            tablets.push(info.clone());
            tablets.push(info.clone());
        }
        TabletMap {
            log2_tablets: self.log2_tablets + 1,
            tablets,
            transitions: BTreeMap::new(),
            resize: ResizeDecision::new(ResizeWay::None, self.resize.sequence_number),
        }
    }
}

impl std::fmt::Display for TabletMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tablet_map[{} tablets]", self.tablet_count())
    }
}

/// Tablet maps of every table, plus the global balancing switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletMetadata {
    maps: BTreeMap<TableId, TabletMap>,
    balancing_enabled: bool,
}

impl Default for TabletMetadata {
    fn default() -> Self {
        Self {
            maps: BTreeMap::new(),
            balancing_enabled: true,
        }
    }
}

impl TabletMetadata {
    /// Create empty metadata with balancing enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tablet map of a table.
    pub fn get(&self, table: TableId) -> Option<&TabletMap> {
        self.maps.get(&table)
    }

    /// Mutable tablet map of a table.
    pub fn get_mut(&mut self, table: TableId) -> Option<&mut TabletMap> {
        self.maps.get_mut(&table)
    }

    /// Install the tablet map of a table, replacing any previous one.
    pub fn set_map(&mut self, table: TableId, map: TabletMap) {
        self.maps.insert(table, map);
    }

    /// Drop the tablet map of a table.
    pub fn remove(&mut self, table: TableId) {
        self.maps.remove(&table);
    }

    /// Iterate over all tables and their maps.
    pub fn tables(&self) -> impl Iterator<Item = (TableId, &TabletMap)> {
        self.maps.iter().map(|(id, map)| (*id, map))
    }

    /// Iterate mutably over all tables and their maps.
    pub fn tables_mut(&mut self) -> impl Iterator<Item = (TableId, &mut TabletMap)> {
        self.maps.iter_mut().map(|(id, map)| (*id, map))
    }

    /// Number of tables.
    pub fn table_count(&self) -> usize {
        self.maps.len()
    }

    /// Whether the balancer may produce plans.
    pub fn balancing_enabled(&self) -> bool {
        self.balancing_enabled
    }

    /// Flip the balancing switch.
    pub fn set_balancing_enabled(&mut self, enabled: bool) {
        self.balancing_enabled = enabled;
    }
}
