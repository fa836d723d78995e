//! Topology coordination.
//!
//! All tablet-metadata writes flow through the replicated topology log: the
//! coordinator acquires an exclusive guard, commits one atomic batch, and
//! publishes a fresh immutable snapshot. Readers hold snapshot handles and
//! never block on the writer. Only the coordinator shard proposes batches;
//! every other shard is read-only.

use crate::balancer::{LoadStats, Migration, MigrationPlan, TabletAllocator};
use crate::catalog::{
    table_mutations, Catalog, CatalogMutation, Timestamp, TabletMutationBuilder,
};
use crate::error::{Error, Result};
use crate::tablets::TabletMetadata;
use crate::topology::Topology;
use crate::transition::{transition_for_migration, Advance, MigrationDriver};
use crate::types::{HostId, TableId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;

const MAX_COMMIT_RETRIES: usize = 10;

/// Exclusive lease on the topology log for one batch. Carries the observed
/// log position and the timestamp the batch must use, strictly greater
/// than that of the last committed entry.
#[derive(Debug)]
pub struct TopologyGuard {
    state_id: u64,
    ts: Timestamp,
}

impl TopologyGuard {
    /// Timestamp to stamp the guarded batch with.
    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }
}

#[derive(Debug, Default)]
struct LogState {
    state_id: u64,
    last_ts: Timestamp,
}

/// The replicated topology log, reduced to the commit/guard interface the
/// tablet subsystem consumes. Batches commit in log order; a commit under a
/// stale guard fails with [`Error::ConcurrentModification`] and never
/// partially applies.
#[derive(Debug, Default)]
pub struct TopologyLog {
    state: Mutex<LogState>,
}

impl TopologyLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current log position.
    pub fn state_id(&self) -> u64 {
        self.state.lock().state_id
    }

    /// Take a guard at the current log position.
    pub fn acquire_guard(&self) -> TopologyGuard {
        let state = self.state.lock();
        TopologyGuard {
            state_id: state.state_id,
            ts: state.last_ts + 1,
        }
    }

    /// Commit a batch under a guard. Fails if the log advanced past the
    /// guard; the caller recomputes and retries with a fresh one.
    pub async fn commit(
        &self,
        guard: TopologyGuard,
        catalog: &dyn Catalog,
        batch: Vec<CatalogMutation>,
    ) -> Result<()> {
        {
            let state = self.state.lock();
            if state.state_id != guard.state_id {
                return Err(Error::ConcurrentModification);
            }
        }
        catalog.apply(batch).await?;
        let mut state = self.state.lock();
        state.state_id += 1;
        state.last_ts = state.last_ts.max(guard.ts);
        Ok(())
    }
}

/// Schema-change notifications emitted on tablet map mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaEvent {
    /// A keyspace's tablet placement changed.
    Updated {
        /// Affected keyspace.
        keyspace: String,
    },
}

/// Atomically published, immutable tablet-metadata snapshots.
///
/// Readers clone an `Arc` handle whose lifetime is independent of future
/// writes; the single writer swaps in a fresh snapshot under an async lock.
#[derive(Debug)]
pub struct SharedTabletMetadata {
    snapshot: RwLock<Arc<TabletMetadata>>,
    writer: tokio::sync::Mutex<()>,
}

impl SharedTabletMetadata {
    /// Publish an initial snapshot.
    pub fn new(metadata: TabletMetadata) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(metadata)),
            writer: tokio::sync::Mutex::new(()),
        }
    }

    /// The current snapshot. Never blocks on the writer.
    pub fn get(&self) -> Arc<TabletMetadata> {
        self.snapshot.read().clone()
    }

    /// Apply a mutation and publish the result as a new snapshot. Readers
    /// observe either the previous or the new value, never a partial one.
    pub async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut TabletMetadata) -> Result<()>,
    {
        let _writer = self.writer.lock().await;
        let mut next = (**self.snapshot.read()).clone();
        f(&mut next)?;
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }
}

/// A requested keyspace-wide replication-factor change, queued as a global
/// topology request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyspaceRfChange {
    /// Target keyspace.
    pub keyspace: String,
    /// New replication factor per datacenter.
    pub rf_per_dc: BTreeMap<String, usize>,
}

/// Drives tablet balancing and transitions, committing every metadata
/// change through the topology log.
#[derive(Debug)]
pub struct TopologyCoordinator {
    allocator: TabletAllocator,
    driver: MigrationDriver,
    catalog: Arc<dyn Catalog>,
    log: Arc<TopologyLog>,
    shared: Arc<SharedTabletMetadata>,
    events: broadcast::Sender<SchemaEvent>,
    keyspaces: RwLock<HashMap<TableId, String>>,
    pending_request: Mutex<Option<KeyspaceRfChange>>,
}

impl TopologyCoordinator {
    /// Create a coordinator over a catalog and topology log, starting from
    /// the given metadata snapshot.
    pub fn new(
        allocator: TabletAllocator,
        driver: MigrationDriver,
        catalog: Arc<dyn Catalog>,
        log: Arc<TopologyLog>,
        metadata: TabletMetadata,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            allocator,
            driver,
            catalog,
            log,
            shared: Arc::new(SharedTabletMetadata::new(metadata)),
            events,
            keyspaces: RwLock::new(HashMap::new()),
            pending_request: Mutex::new(None),
        }
    }

    /// The current metadata snapshot.
    pub fn metadata(&self) -> Arc<TabletMetadata> {
        self.shared.get()
    }

    /// Subscribe to schema-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchemaEvent> {
        self.events.subscribe()
    }

    /// Record which keyspace a table belongs to, for event routing.
    pub fn register_table(&self, table: TableId, keyspace: impl Into<String>) {
        self.keyspaces.write().insert(table, keyspace.into());
    }

    fn keyspace_of(&self, table: TableId) -> String {
        self.keyspaces
            .read()
            .get(&table)
            .cloned()
            .unwrap_or_else(|| table.to_string())
    }

    fn notify(&self, table: TableId) {
        let _ = self.events.send(SchemaEvent::Updated {
            keyspace: self.keyspace_of(table),
        });
    }

    // Commit a batch built against a guard's timestamp, retrying with a
    // fresh guard on concurrent modification. The builder runs again on
    // every attempt since the plan may change once the log moves.
    async fn commit_with_retries<F>(&self, mut build: F) -> Result<()>
    where
        F: FnMut(Timestamp) -> Result<Vec<CatalogMutation>>,
    {
        for _ in 0..MAX_COMMIT_RETRIES {
            let guard = self.log.acquire_guard();
            let batch = build(guard.timestamp())?;
            match self.log.commit(guard, self.catalog.as_ref(), batch).await {
                Ok(()) => return Ok(()),
                Err(Error::ConcurrentModification) => {
                    tracing::debug!("Topology log moved under us, retrying with a fresh guard");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::ConcurrentModification)
    }

    /// Run one balancing pass: compute a plan against the current snapshot
    /// and commit it (transition announcements, resize decisions, split
    /// finalizations). Returns the executed plan.
    pub async fn run_once(
        &self,
        topology: &Topology,
        load_stats: Option<&LoadStats>,
        skiplist: &HashSet<HostId>,
    ) -> Result<MigrationPlan> {
        let snapshot = self.shared.get();
        let plan = self
            .allocator
            .balance_tablets(&snapshot, topology, load_stats, skiplist)
            .await?;
        if plan.is_empty() {
            return Ok(plan);
        }

        for migration in &plan.migrations {
            self.start_migration(migration).await?;
        }
        for (table, decision) in &plan.resize.resize {
            let (table, decision) = (*table, *decision);
            self.commit_with_retries(|ts| {
                let mut builder = TabletMutationBuilder::new(ts, table);
                builder.set_resize_decision(decision);
                builder.build()
            })
            .await?;
            self.shared
                .mutate(|tm| {
                    if let Some(tmap) = tm.get_mut(table) {
                        tmap.set_resize_decision(decision);
                    }
                    Ok(())
                })
                .await?;
            self.notify(table);
        }
        for table in &plan.resize.finalize {
            self.finalize_split(*table).await?;
        }

        Ok(plan)
    }

    // Durably announce a migration, then publish it in memory.
    async fn start_migration(&self, migration: &Migration) -> Result<()> {
        let snapshot = self.shared.get();
        let tmap = snapshot.get(migration.tablet.table).ok_or_else(|| {
            Error::InvalidRequest(format!("unknown table {}", migration.tablet.table))
        })?;
        let info = tmap.get_info(migration.tablet.tablet);
        let transition = transition_for_migration(info, migration);
        let last_token = tmap.get_last_token(migration.tablet.tablet);

        self.commit_with_retries(|ts| {
            let mut builder = TabletMutationBuilder::new(ts, migration.tablet.table);
            builder
                .set_new_replicas(last_token, transition.next_replicas.clone())
                .set_stage(last_token, transition.stage)
                .set_transition(last_token, transition.kind);
            builder.build()
        })
        .await?;

        let transition_for_memory = transition.clone();
        self.shared
            .mutate(move |tm| {
                if let Some(tmap) = tm.get_mut(migration.tablet.table) {
                    tmap.set_transition(migration.tablet.tablet, transition_for_memory);
                }
                Ok(())
            })
            .await?;

        tracing::info!(
            tablet = %migration.tablet,
            src = %migration.src,
            dst = %migration.dst,
            kind = %migration.kind,
            "Migration announced"
        );
        self.notify(migration.tablet.table);
        Ok(())
    }

    /// Advance every pending transition by one stage, committing each step.
    /// Returns how many tablets advanced.
    pub async fn advance_transitions(&self) -> Result<usize> {
        let snapshot = self.shared.get();
        let mut advanced = 0;

        for (table, tmap) in snapshot.tables() {
            for (tablet, transition) in tmap.transitions() {
                let info = tmap.get_info(tablet);
                let range = tmap.get_token_range(tablet);
                let last_token = tmap.get_last_token(tablet);

                match self.driver.advance(range, info, transition).await? {
                    Advance::Updated(updated) => {
                        self.commit_with_retries(|ts| {
                            let mut builder = TabletMutationBuilder::new(ts, table);
                            builder.set_stage(last_token, updated.stage);
                            if let Some(session) = updated.session {
                                builder.set_session(last_token, session);
                            }
                            builder.build()
                        })
                        .await?;
                        let updated_for_memory = updated.clone();
                        self.shared
                            .mutate(move |tm| {
                                if let Some(tmap) = tm.get_mut(table) {
                                    tmap.set_transition(tablet, updated_for_memory);
                                }
                                Ok(())
                            })
                            .await?;
                        tracing::debug!(
                            table = %table,
                            tablet = %tablet,
                            stage = %updated.stage,
                            "Transition advanced"
                        );
                    }
                    Advance::Finished(replicas) => {
                        let replicas_for_commit = replicas.clone();
                        self.commit_with_retries(|ts| {
                            let mut builder = TabletMutationBuilder::new(ts, table);
                            builder
                                .set_replicas(last_token, replicas_for_commit.clone())
                                .del_transition(last_token);
                            builder.build()
                        })
                        .await?;
                        self.shared
                            .mutate(move |tm| {
                                if let Some(tmap) = tm.get_mut(table) {
                                    let mut info = tmap.get_info(tablet).clone();
                                    info.replicas = replicas;
                                    tmap.set_info(tablet, info);
                                    tmap.clear_transition(tablet);
                                }
                                Ok(())
                            })
                            .await?;
                        tracing::info!(table = %table, tablet = %tablet, "Migration finished");
                    }
                }
                advanced += 1;
                self.notify(table);
            }
        }

        Ok(advanced)
    }

    /// Drive every pending transition to completion.
    pub async fn drain_transitions(&self) -> Result<()> {
        while self.advance_transitions().await? > 0 {}
        Ok(())
    }

    // Double the table's tablet count and persist the new map wholesale.
    async fn finalize_split(&self, table: TableId) -> Result<()> {
        let snapshot = self.shared.get();
        let tmap = snapshot
            .get(table)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown table {table}")))?;
        let split = tmap.split();

        self.commit_with_retries(|ts| table_mutations(table, &split, ts))
            .await?;

        let split_for_memory = split.clone();
        self.shared
            .mutate(move |tm| {
                tm.set_map(table, split_for_memory);
                Ok(())
            })
            .await?;

        tracing::info!(
            table = %table,
            tablet_count = split.tablet_count(),
            "Split finalized"
        );
        self.notify(table);
        Ok(())
    }

    /// Submit a keyspace-wide replication-factor change as a global
    /// topology request. Rejected while another request is pending.
    pub async fn request_keyspace_rf_change(
        &self,
        keyspace: impl Into<String>,
        rf_per_dc: BTreeMap<String, usize>,
    ) -> Result<()> {
        let request = KeyspaceRfChange {
            keyspace: keyspace.into(),
            rf_per_dc,
        };
        {
            let mut pending = self.pending_request.lock();
            if pending.is_some() {
                return Err(Error::InvalidRequest(
                    "another topology request is pending".into(),
                ));
            }
            *pending = Some(request.clone());
        }

        // TODO: encode the keyspace_rf_change request payload into the log
        // entry once its format is settled; for now the submission itself is
        // what is sequenced.
        let result = self.commit_with_retries(|_ts| Ok(Vec::new())).await;
        if result.is_err() {
            *self.pending_request.lock() = None;
        }
        result
    }

    /// The queued replication-factor change, if any, removing it.
    pub fn take_pending_request(&self) -> Option<KeyspaceRfChange> {
        self.pending_request.lock().take()
    }
}
