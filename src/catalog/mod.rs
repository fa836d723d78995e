//! System catalog persistence for tablet metadata.
//!
//! Tablet metadata is persisted as one row per tablet keyed by
//! `(table_id, last_token)`, plus a per-table sidecar row carrying the
//! tablet count and a table-independent singleton row carrying the
//! balancing switch. Values are timestamped cells; readers reconstruct the
//! newest consistent state, so a persisted snapshot reads back exactly.
//!
//! The resize decision is stored once per table, on the row whose
//! `last_token` is the ring maximum (the last tablet's row).

pub mod mutation;

pub use mutation::TabletMutationBuilder;

use crate::error::{Error, Result};
use crate::tablets::{
    pending_replica_of, ResizeDecision, ResizeWay, TabletInfo, TabletMap, TabletMetadata,
    TabletReplica, TabletTransitionInfo, TransitionKind, TransitionStage,
};
use crate::token::Token;
use crate::types::{SessionId, TableId};
use async_trait::async_trait;
use bytes::{Buf, BufMut};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Catalog mutation timestamp, microseconds in the original scheme. Only
/// relative order matters here.
pub type Timestamp = i64;

/// Row key below every real tablet row; used by the per-table sidecar row
/// and the table-independent singleton row.
pub const SIDECAR_TOKEN: i64 = i64::MIN;

/// Columns of the tablets catalog table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    /// Current replica set, `list<(host_uuid, shard_u32)>`.
    Replicas,
    /// Target replica set of a pending transition.
    NewReplicas,
    /// Transition stage name.
    Stage,
    /// Transition kind name.
    Transition,
    /// Streaming session id.
    Session,
    /// Resize way name; present on the last tablet's row only.
    ResizeType,
    /// Resize sequence number; present on the last tablet's row only.
    ResizeSeqNumber,
    /// Tablet count; present on the sidecar row only.
    TabletCount,
    /// Balancing switch; present on the singleton row only.
    BalancingEnabled,
}

/// One timestamped column value. `None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Write timestamp.
    pub ts: Timestamp,
    /// Value bytes, or `None` for a delete.
    pub value: Option<Vec<u8>>,
}

/// Key of one catalog row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// Owning table, or [`TableId::nil`] for table-independent rows.
    pub table: TableId,
    /// Last token of the tablet, or [`SIDECAR_TOKEN`].
    pub last_token: i64,
}

impl RowKey {
    /// Create a row key.
    pub fn new(table: TableId, last_token: i64) -> Self {
        Self { table, last_token }
    }

    /// Wire encoding: table uuid followed by the token with the sign bit
    /// flipped, big endian, so byte order equals logical order.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.put_slice(self.table.0.as_bytes());
        buf.put_u64((self.last_token as u64) ^ (1 << 63));
        buf
    }

    /// Inverse of [`RowKey::encode`].
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 24 {
            return Err(Error::CatalogIo(format!(
                "malformed row key of {} bytes",
                bytes.len()
            )));
        }
        let mut uuid = [0u8; 16];
        bytes.copy_to_slice(&mut uuid);
        let token = (bytes.get_u64() ^ (1 << 63)) as i64;
        Ok(Self {
            table: TableId(uuid::Uuid::from_bytes(uuid)),
            last_token: token,
        })
    }
}

/// Partial update of one row.
#[derive(Debug, Clone)]
pub struct RowMutation {
    /// Target row.
    pub key: RowKey,
    /// Cell writes and tombstones.
    pub cells: HashMap<Column, Cell>,
}

impl RowMutation {
    /// Create an empty mutation for a row.
    pub fn new(key: RowKey) -> Self {
        Self {
            key,
            cells: HashMap::new(),
        }
    }

    /// Write a column value.
    pub fn set(&mut self, column: Column, ts: Timestamp, value: Vec<u8>) {
        self.cells.insert(column, Cell { ts, value: Some(value) });
    }

    /// Tombstone a column.
    pub fn delete(&mut self, column: Column, ts: Timestamp) {
        self.cells.insert(column, Cell { ts, value: None });
    }
}

/// One entry of an atomic catalog batch.
#[derive(Debug, Clone)]
pub enum CatalogMutation {
    /// Shadow every cell of a table written before `ts`.
    DropTable { table: TableId, ts: Timestamp },
    /// Merge cells into one row.
    Row(RowMutation),
}

/// A row as seen by a reader: live column values only.
#[derive(Debug, Clone)]
pub struct CatalogRow {
    /// Row key.
    pub key: RowKey,
    /// Live column values.
    pub columns: HashMap<Column, Vec<u8>>,
}

/// The quorum-replicated system catalog, as consumed by the tablet
/// subsystem. Batches apply atomically; readers observe a prefix of applied
/// batches and never a partial one.
#[async_trait]
pub trait Catalog: Send + Sync + std::fmt::Debug {
    /// Apply one atomic batch of mutations.
    async fn apply(&self, batch: Vec<CatalogMutation>) -> Result<()>;

    /// Scan every live row, ordered by encoded key.
    async fn scan(&self) -> Result<Vec<CatalogRow>>;
}

#[derive(Debug, Default)]
struct MemoryCatalogInner {
    rows: BTreeMap<Vec<u8>, StoredRow>,
    table_tombstones: HashMap<TableId, Timestamp>,
}

#[derive(Debug, Clone)]
struct StoredRow {
    key: RowKey,
    cells: HashMap<Column, Cell>,
}

/// In-memory catalog with the merge semantics the subsystem relies on:
/// the newest timestamp wins per cell, a tombstone wins a same-cell tie,
/// and a table tombstone at `ts` shadows cells written strictly before
/// `ts` (writes of the same batch survive their own tombstone).
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryCatalogInner>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn apply(&self, batch: Vec<CatalogMutation>) -> Result<()> {
        let mut inner = self.inner.write();
        for mutation in batch {
            match mutation {
                CatalogMutation::DropTable { table, ts } => {
                    let slot = inner.table_tombstones.entry(table).or_insert(ts);
                    *slot = (*slot).max(ts);
                }
                CatalogMutation::Row(row) => {
                    let stored = inner
                        .rows
                        .entry(row.key.encode())
                        .or_insert_with(|| StoredRow {
                            key: row.key,
                            cells: HashMap::new(),
                        });
                    for (column, cell) in row.cells {
                        match stored.cells.get(&column) {
                            Some(existing)
                                if existing.ts > cell.ts
                                    || (existing.ts == cell.ts && existing.value.is_none()) => {}
                            _ => {
                                stored.cells.insert(column, cell);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<CatalogRow>> {
        let inner = self.inner.read();
        let mut rows = Vec::new();
        for stored in inner.rows.values() {
            let tombstone = inner
                .table_tombstones
                .get(&stored.key.table)
                .copied()
                .unwrap_or(Timestamp::MIN);
            let columns: HashMap<Column, Vec<u8>> = stored
                .cells
                .iter()
                .filter(|(_, cell)| cell.ts >= tombstone)
                .filter_map(|(column, cell)| cell.value.clone().map(|v| (*column, v)))
                .collect();
            if !columns.is_empty() {
                rows.push(CatalogRow {
                    key: stored.key,
                    columns,
                });
            }
        }
        Ok(rows)
    }
}

pub(crate) fn encode_replicas(replicas: &[TabletReplica]) -> Result<Vec<u8>> {
    bincode::serialize(replicas).map_err(|e| Error::CatalogIo(e.to_string()))
}

pub(crate) fn decode_replicas(bytes: &[u8]) -> Result<Vec<TabletReplica>> {
    bincode::deserialize(bytes).map_err(|e| Error::CatalogIo(e.to_string()))
}

pub(crate) fn encode_session(session: SessionId) -> Result<Vec<u8>> {
    bincode::serialize(&session).map_err(|e| Error::CatalogIo(e.to_string()))
}

fn decode_session(bytes: &[u8]) -> Result<SessionId> {
    bincode::deserialize(bytes).map_err(|e| Error::CatalogIo(e.to_string()))
}

fn decode_text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::CatalogIo(e.to_string()))
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CatalogIo("malformed integer cell".into()))?;
    Ok(i64::from_be_bytes(arr))
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::CatalogIo("malformed integer cell".into()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Persist a full tablet-metadata snapshot as one atomic batch at `ts`.
/// Reading the catalog afterwards yields exactly `metadata`; rows of tables
/// no longer present are shadowed.
pub async fn save_tablet_metadata(
    catalog: &dyn Catalog,
    metadata: &TabletMetadata,
    ts: Timestamp,
) -> Result<()> {
    let mut batch = Vec::new();

    // Shadow tables that disappeared since the last persisted version.
    for row in catalog.scan().await? {
        if row.key.table != TableId::nil() && metadata.get(row.key.table).is_none() {
            batch.push(CatalogMutation::DropTable {
                table: row.key.table,
                ts,
            });
        }
    }

    // Balancing switch, table-independent singleton.
    batch.push(CatalogMutation::DropTable {
        table: TableId::nil(),
        ts,
    });
    let mut singleton = RowMutation::new(RowKey::new(TableId::nil(), SIDECAR_TOKEN));
    singleton.set(
        Column::BalancingEnabled,
        ts,
        vec![metadata.balancing_enabled() as u8],
    );
    batch.push(CatalogMutation::Row(singleton));

    for (table, tmap) in metadata.tables() {
        batch.extend(table_mutations(table, tmap, ts)?);
    }

    catalog.apply(batch).await
}

/// The full set of mutations writing one table's tablet map at `ts`,
/// shadowing whatever the table held before.
pub fn table_mutations(
    table: TableId,
    tmap: &TabletMap,
    ts: Timestamp,
) -> Result<Vec<CatalogMutation>> {
    let mut batch = Vec::with_capacity(tmap.tablet_count() as usize + 2);
    batch.push(CatalogMutation::DropTable { table, ts });

    let mut sidecar = RowMutation::new(RowKey::new(table, SIDECAR_TOKEN));
    sidecar.set(
        Column::TabletCount,
        ts,
        tmap.tablet_count().to_be_bytes().to_vec(),
    );
    batch.push(CatalogMutation::Row(sidecar));

    for (id, info) in tmap.tablets() {
        let key = RowKey::new(table, tmap.get_last_token(id).catalog_key());
        let mut row = RowMutation::new(key);
        row.set(Column::Replicas, ts, encode_replicas(&info.replicas)?);

        if let Some(transition) = tmap.get_transition(id) {
            row.set(
                Column::NewReplicas,
                ts,
                encode_replicas(&transition.next_replicas)?,
            );
            row.set(Column::Stage, ts, transition.stage.as_str().into());
            row.set(Column::Transition, ts, transition.kind.as_str().into());
            if let Some(session) = transition.session {
                row.set(Column::Session, ts, encode_session(session)?);
            }
        }

        if id == tmap.last_tablet() {
            let decision = tmap.resize_decision();
            row.set(Column::ResizeType, ts, decision.way.as_str().into());
            row.set(
                Column::ResizeSeqNumber,
                ts,
                decision.sequence_number.to_be_bytes().to_vec(),
            );
        }

        batch.push(CatalogMutation::Row(row));
    }

    Ok(batch)
}

/// Reconstruct tablet metadata from the catalog. Exact inverse of
/// [`save_tablet_metadata`] for every valid snapshot.
pub async fn read_tablet_metadata(catalog: &dyn Catalog) -> Result<TabletMetadata> {
    let mut metadata = TabletMetadata::new();
    let mut per_table: BTreeMap<TableId, Vec<CatalogRow>> = BTreeMap::new();

    for row in catalog.scan().await? {
        if row.key.table == TableId::nil() {
            if let Some(value) = row.columns.get(&Column::BalancingEnabled) {
                metadata.set_balancing_enabled(value.first().copied() == Some(1));
            }
            continue;
        }
        per_table.entry(row.key.table).or_default().push(row);
    }

    for (table, rows) in per_table {
        let count = rows
            .iter()
            .find(|r| r.key.last_token == SIDECAR_TOKEN)
            .and_then(|r| r.columns.get(&Column::TabletCount))
            .ok_or_else(|| {
                Error::CatalogIo(format!("table {table} has no tablet count row"))
            })
            .and_then(|v| decode_u64(v))?;
        if count == 0 || !count.is_power_of_two() {
            return Err(Error::CatalogIo(format!(
                "table {table} has invalid tablet count {count}"
            )));
        }

        let mut tmap = TabletMap::new(count);
        for row in rows {
            if row.key.last_token == SIDECAR_TOKEN {
                continue;
            }
            let id = tmap.tablet_for_token(Token::Key(row.key.last_token));

            let replicas = row
                .columns
                .get(&Column::Replicas)
                .map(|v| decode_replicas(v))
                .transpose()?
                .unwrap_or_default();

            if let (Some(next), Some(stage), Some(kind)) = (
                row.columns.get(&Column::NewReplicas),
                row.columns.get(&Column::Stage),
                row.columns.get(&Column::Transition),
            ) {
                let next = decode_replicas(next)?;
                let stage: TransitionStage = decode_text(stage)?
                    .parse()
                    .map_err(Error::CatalogIo)?;
                let kind: TransitionKind = decode_text(kind)?
                    .parse()
                    .map_err(Error::CatalogIo)?;
                let pending = pending_replica_of(&replicas, &next).ok_or_else(|| {
                    Error::CatalogIo(format!(
                        "tablet {id} of table {table} has a transition without a pending replica"
                    ))
                })?;
                let mut transition = TabletTransitionInfo::new(stage, kind, next, pending);
                if let Some(session) = row.columns.get(&Column::Session) {
                    transition.session = Some(decode_session(session)?);
                }
                tmap.set_transition(id, transition);
            }

            if let (Some(way), Some(seq)) = (
                row.columns.get(&Column::ResizeType),
                row.columns.get(&Column::ResizeSeqNumber),
            ) {
                let way: ResizeWay = decode_text(way)?.parse().map_err(Error::CatalogIo)?;
                tmap.set_resize_decision(ResizeDecision::new(way, decode_i64(seq)?));
            }

            tmap.set_info(id, TabletInfo::new(replicas));
        }
        metadata.set_map(table, tmap);
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablets::TabletId;
    use crate::types::HostId;

    fn replica(host: HostId, shard: u32) -> TabletReplica {
        TabletReplica::new(host, shard)
    }

    async fn verify_roundtrip(catalog: &MemoryCatalog, metadata: &TabletMetadata, ts: Timestamp) {
        save_tablet_metadata(catalog, metadata, ts).await.unwrap();
        let read = read_tablet_metadata(catalog).await.unwrap();
        assert_eq!(&read, metadata);
    }

    #[test]
    fn test_row_key_encoding_preserves_order() {
        let table = TableId::random();
        let keys = [
            RowKey::new(table, SIDECAR_TOKEN),
            RowKey::new(table, -500),
            RowKey::new(table, 0),
            RowKey::new(table, i64::MAX),
        ];
        for pair in keys.windows(2) {
            assert!(pair[0].encode() < pair[1].encode());
        }
        for key in keys {
            assert_eq!(RowKey::decode(&key.encode()).unwrap(), key);
        }
    }

    #[tokio::test]
    async fn test_metadata_persistence_roundtrip() {
        let h1 = HostId::random();
        let h2 = HostId::random();
        let h3 = HostId::random();
        let table1 = TableId::random();
        let table2 = TableId::random();

        let catalog = MemoryCatalog::new();
        let mut ts = 10;
        let mut tm = TabletMetadata::new();

        // Single-tablet table.
        {
            let mut tmap = TabletMap::new(1);
            tmap.set_info(
                TabletId(0),
                TabletInfo::new(vec![replica(h1, 0), replica(h2, 3), replica(h3, 1)]),
            );
            tm.set_map(table1, tmap);
        }
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;

        // Four-tablet table.
        {
            let mut tmap = TabletMap::new(4);
            tmap.set_info(TabletId(0), TabletInfo::new(vec![replica(h1, 0)]));
            tmap.set_info(TabletId(1), TabletInfo::new(vec![replica(h3, 3)]));
            tmap.set_info(TabletId(2), TabletInfo::new(vec![replica(h2, 2)]));
            tmap.set_info(TabletId(3), TabletInfo::new(vec![replica(h1, 1)]));
            tm.set_map(table2, tmap);
        }
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;

        // Transitions at different stages, with and without a session.
        {
            let tmap = tm.get_mut(table2).unwrap();
            tmap.set_transition(
                TabletId(1),
                TabletTransitionInfo::new(
                    TransitionStage::AllowWriteBothReadOld,
                    TransitionKind::Migration,
                    vec![replica(h3, 3), replica(h1, 7)],
                    replica(h1, 7),
                ),
            );
            tmap.set_transition(
                TabletId(2),
                TabletTransitionInfo::new(
                    TransitionStage::UseNew,
                    TransitionKind::Migration,
                    vec![replica(h1, 4), replica(h2, 2)],
                    replica(h1, 4),
                )
                .with_session(SessionId::random()),
            );
        }
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;

        // Shrink the second table back to two tablets; stale rows must go.
        {
            let mut tmap = TabletMap::new(2);
            tmap.set_info(TabletId(0), TabletInfo::new(vec![replica(h1, 0)]));
            tmap.set_info(TabletId(1), TabletInfo::new(vec![replica(h3, 3)]));
            tm.set_map(table2, tmap);
        }
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;

        // Change the resize decision of the first table.
        {
            let mut tmap = TabletMap::new(1);
            tmap.set_info(TabletId(0), TabletInfo::new(vec![replica(h3, 7)]));
            tmap.set_resize_decision(ResizeDecision::new(ResizeWay::Split, 1));
            tm.set_map(table1, tmap);
        }
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;

        // Drop a table entirely.
        tm.remove(table2);
        ts += 1;
        verify_roundtrip(&catalog, &tm, ts).await;
    }

    #[tokio::test]
    async fn test_balancing_flag_roundtrip() {
        let catalog = MemoryCatalog::new();
        let mut tm = TabletMetadata::new();
        tm.set_balancing_enabled(false);
        verify_roundtrip(&catalog, &tm, 5).await;

        tm.set_balancing_enabled(true);
        verify_roundtrip(&catalog, &tm, 6).await;
    }

    #[tokio::test]
    async fn test_large_metadata_roundtrip() {
        let h1 = HostId::random();
        let h2 = HostId::random();
        let h3 = HostId::random();

        let catalog = MemoryCatalog::new();
        let mut tm = TabletMetadata::new();
        for _ in 0..16 {
            let mut tmap = TabletMap::new(64);
            for id in tmap.tablet_ids().collect::<Vec<_>>() {
                tmap.set_info(
                    id,
                    TabletInfo::new(vec![replica(h1, 0), replica(h2, 1), replica(h3, 2)]),
                );
            }
            tm.set_map(TableId::random(), tmap);
        }
        verify_roundtrip(&catalog, &tm, 100).await;
    }

    #[tokio::test]
    async fn test_stale_cells_lose_to_newer_timestamps() {
        let catalog = MemoryCatalog::new();
        let key = RowKey::new(TableId::random(), 42);

        let mut newer = RowMutation::new(key);
        newer.set(Column::Stage, 10, b"use_new".to_vec());
        catalog.apply(vec![CatalogMutation::Row(newer)]).await.unwrap();

        let mut older = RowMutation::new(key);
        older.set(Column::Stage, 5, b"streaming".to_vec());
        catalog.apply(vec![CatalogMutation::Row(older)]).await.unwrap();

        let rows = catalog.scan().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].columns[&Column::Stage], b"use_new".to_vec());
    }

    #[tokio::test]
    async fn test_tombstone_wins_same_timestamp_tie() {
        let catalog = MemoryCatalog::new();
        let key = RowKey::new(TableId::random(), 42);

        let mut write = RowMutation::new(key);
        write.set(Column::Session, 7, vec![1, 2, 3]);
        let mut tomb = RowMutation::new(key);
        tomb.delete(Column::Session, 7);

        catalog
            .apply(vec![
                CatalogMutation::Row(write),
                CatalogMutation::Row(tomb),
            ])
            .await
            .unwrap();

        assert!(catalog.scan().await.unwrap().is_empty());
    }
}
