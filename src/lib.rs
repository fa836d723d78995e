//! Tablet placement and rebalancing core for a wide-column distributed
//! database.
//!
//! A *tablet* is a contiguous shard of one table's token range and the unit
//! of replica placement. This crate owns:
//! - the persisted, versioned metadata model mapping every tablet to a set
//!   of `(host, shard)` replicas,
//! - the per-tablet multi-stage transition protocol that moves a tablet
//!   between replicas while old readers keep working,
//! - the allocator that reacts to topology changes and storage pressure
//!   with migration plans and split/merge decisions.
//!
//! Query execution, membership gossip, the consensus log, and the storage
//! engine are external collaborators; only their contracts appear here (the
//! catalog, the topology-log guard, and the streaming session).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                TopologyCoordinator                  │
//! │   plans · guarded commits · snapshot publishing     │
//! └─────────────────────────────────────────────────────┘
//!        │                  │                  │
//!        ▼                  ▼                  ▼
//! ┌──────────────┐  ┌───────────────┐  ┌──────────────┐
//! │TabletAllocator│ │MigrationDriver│  │   Catalog    │
//! │ load sketch   │ │ stage machine │  │ rows + cells │
//! │ resize loop   │ │ streaming     │  │ round-trip   │
//! └──────────────┘  └───────────────┘  └──────────────┘
//!        │                  │                  │
//!        └──────────────────┴──────────────────┘
//!                           ▼
//!               ┌───────────────────────┐
//!               │     TabletMetadata    │
//!               │ TabletMap per table   │
//!               └───────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use lamina::{
//!     AllocatorConfig, TabletAllocator, TabletMetadata, Topology, HostState,
//! };
//! use std::collections::HashSet;
//!
//! # async fn example(metadata: TabletMetadata, topology: Topology) -> lamina::Result<()> {
//! let allocator = TabletAllocator::new(AllocatorConfig::new());
//! let plan = allocator
//!     .balance_tablets(&metadata, &topology, None, &HashSet::new())
//!     .await?;
//! for migration in &plan.migrations {
//!     println!("move {} from {} to {}", migration.tablet, migration.src, migration.dst);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! The crate is written for a shard-per-core cooperative runtime: tasks
//! yield only at catalog, log and streaming boundaries. Metadata snapshots
//! are immutable values published atomically; readers hold `Arc` handles
//! and never block on the single writer. Only the coordinator shard
//! proposes topology batches.

pub mod balancer;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod load;
pub mod reallocation;
pub mod tablets;
pub mod testing;
pub mod token;
pub mod topology;
pub mod transition;
pub mod types;

// Re-export main types for convenience
pub use balancer::{
    GlobalTabletId, LoadStats, Migration, MigrationPlan, ResizePlan, TableLoadStats,
    TabletAllocator,
};
pub use catalog::{
    read_tablet_metadata, save_tablet_metadata, Catalog, CatalogMutation, MemoryCatalog,
    TabletMutationBuilder, Timestamp,
};
pub use config::{AllocatorConfig, TransitionConfig, DEFAULT_TARGET_TABLET_SIZE};
pub use coordinator::{
    KeyspaceRfChange, SchemaEvent, SharedTabletMetadata, TopologyCoordinator, TopologyGuard,
    TopologyLog,
};
pub use error::{Error, Result};
pub use load::LoadSketch;
pub use reallocation::{reallocate_for_new_rf, ReallocationResult, ReallocationStatus};
pub use tablets::{
    ResizeDecision, ResizeWay, TabletId, TabletInfo, TabletMap, TabletMetadata, TabletReplica,
    TabletTransitionInfo, TransitionKind, TransitionStage,
};
pub use token::{next_token, RangeSide, Token, TokenRange};
pub use topology::{HostState, Node, Topology};
pub use transition::{
    transition_for_migration, Advance, MigrationDriver, NoopStreaming, Streaming,
};
pub use types::{HostId, SessionId, ShardId, TableId};
