//! Builder for atomic, timestamped updates of individual tablet rows.
//!
//! The coordinator commits stage transitions as partial updates scoped to
//! one `(table, last_token)` row. Every cell is stamped with the builder's
//! timestamp; deleting the transition tombstones its columns at that same
//! timestamp, so a concurrent reader never observes half a transition.

use crate::catalog::{
    encode_replicas, encode_session, CatalogMutation, Column, RowKey, RowMutation, Timestamp,
};
use crate::error::Result;
use crate::tablets::{ResizeDecision, TabletReplica, TransitionKind, TransitionStage};
use crate::token::Token;
use crate::types::{SessionId, TableId};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone)]
struct RowOps {
    replicas: Option<Vec<TabletReplica>>,
    new_replicas: Option<Vec<TabletReplica>>,
    stage: Option<TransitionStage>,
    kind: Option<TransitionKind>,
    session: Option<SessionId>,
    del_transition: bool,
    resize: Option<ResizeDecision>,
}

/// Accumulates partial updates for one table; multiple operations against
/// the same builder merge into a single atomic batch.
#[derive(Debug)]
pub struct TabletMutationBuilder {
    ts: Timestamp,
    table: TableId,
    rows: BTreeMap<i64, RowOps>,
}

impl TabletMutationBuilder {
    /// Create a builder stamping every operation with `ts`.
    pub fn new(ts: Timestamp, table: TableId) -> Self {
        Self {
            ts,
            table,
            rows: BTreeMap::new(),
        }
    }

    fn row(&mut self, last_token: Token) -> &mut RowOps {
        self.rows.entry(last_token.catalog_key()).or_default()
    }

    /// Set the current replica set of a tablet.
    pub fn set_replicas(&mut self, last_token: Token, replicas: Vec<TabletReplica>) -> &mut Self {
        self.row(last_token).replicas = Some(replicas);
        self
    }

    /// Set the target replica set of the tablet's transition.
    pub fn set_new_replicas(
        &mut self,
        last_token: Token,
        replicas: Vec<TabletReplica>,
    ) -> &mut Self {
        self.row(last_token).new_replicas = Some(replicas);
        self
    }

    /// Set the transition stage of a tablet.
    pub fn set_stage(&mut self, last_token: Token, stage: TransitionStage) -> &mut Self {
        self.row(last_token).stage = Some(stage);
        self
    }

    /// Set the transition kind of a tablet.
    pub fn set_transition(&mut self, last_token: Token, kind: TransitionKind) -> &mut Self {
        self.row(last_token).kind = Some(kind);
        self
    }

    /// Bind a streaming session to the tablet's transition.
    pub fn set_session(&mut self, last_token: Token, session: SessionId) -> &mut Self {
        self.row(last_token).session = Some(session);
        self
    }

    /// Remove the tablet's transition record. Tombstones every transition
    /// column at the builder's timestamp and supersedes any transition
    /// cells queued on this builder for the same row.
    pub fn del_transition(&mut self, last_token: Token) -> &mut Self {
        self.row(last_token).del_transition = true;
        self
    }

    /// Set the table's resize decision. Stored on the row whose last token
    /// is the ring maximum.
    pub fn set_resize_decision(&mut self, decision: ResizeDecision) -> &mut Self {
        self.row(Token::Maximum).resize = Some(decision);
        self
    }

    /// Produce the atomic batch.
    pub fn build(self) -> Result<Vec<CatalogMutation>> {
        let mut batch = Vec::with_capacity(self.rows.len());
        for (last_token, ops) in self.rows {
            let mut row = RowMutation::new(RowKey::new(self.table, last_token));

            if let Some(replicas) = &ops.replicas {
                row.set(Column::Replicas, self.ts, encode_replicas(replicas)?);
            }

            if ops.del_transition {
                row.delete(Column::NewReplicas, self.ts);
                row.delete(Column::Stage, self.ts);
                row.delete(Column::Transition, self.ts);
                row.delete(Column::Session, self.ts);
            } else {
                if let Some(replicas) = &ops.new_replicas {
                    row.set(Column::NewReplicas, self.ts, encode_replicas(replicas)?);
                }
                if let Some(stage) = ops.stage {
                    row.set(Column::Stage, self.ts, stage.as_str().into());
                }
                if let Some(kind) = ops.kind {
                    row.set(Column::Transition, self.ts, kind.as_str().into());
                }
                if let Some(session) = ops.session {
                    row.set(Column::Session, self.ts, encode_session(session)?);
                }
            }

            if let Some(decision) = ops.resize {
                row.set(Column::ResizeType, self.ts, decision.way.as_str().into());
                row.set(
                    Column::ResizeSeqNumber,
                    self.ts,
                    decision.sequence_number.to_be_bytes().to_vec(),
                );
            }

            batch.push(CatalogMutation::Row(row));
        }
        Ok(batch)
    }
}
