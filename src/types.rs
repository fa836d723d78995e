//! Core identifiers used throughout the tablet subsystem.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CPU shard index on a node.
pub type ShardId = u32;

/// Identifies a node in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct HostId(pub Uuid);

impl HostId {
    /// Create a random host id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a table whose token range is split into tablets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct TableId(pub Uuid);

impl TableId {
    /// Create a random table id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil table id, used as the partition key of table-independent
    /// catalog rows.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of one streaming session between two replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a fresh session id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
