//! Per-tablet transition driver.
//!
//! Drives one tablet's migration through its linear stages, invoking the
//! streaming collaborator between the write fan-out and the read switch.
//! The driver only computes the next durable record; committing it through
//! the catalog is the coordinator's job.

use crate::balancer::Migration;
use crate::config::TransitionConfig;
use crate::error::{Error, Result};
use crate::tablets::{
    replace_replica, TabletInfo, TabletReplica, TabletTransitionInfo, TransitionKind,
    TransitionStage,
};
use crate::token::TokenRange;
use crate::types::SessionId;
use async_trait::async_trait;
use std::sync::Arc;

/// The streaming collaborator that copies a tablet's data between replicas.
/// The returned future resolves when the copy is complete.
#[async_trait]
pub trait Streaming: Send + Sync + std::fmt::Debug {
    /// Copy the tablet's data for `range` from `src` to `dst` under the
    /// given session.
    async fn start(
        &self,
        session: SessionId,
        src: TabletReplica,
        dst: TabletReplica,
        range: TokenRange,
    ) -> Result<()>;

    /// Cancel an in-flight session.
    async fn cancel(&self, session: SessionId) -> Result<()>;
}

/// Streaming that completes instantly without moving data. For tests and
/// for intranode flows that never stream.
#[derive(Debug, Default)]
pub struct NoopStreaming;

#[async_trait]
impl Streaming for NoopStreaming {
    async fn start(
        &self,
        _session: SessionId,
        _src: TabletReplica,
        _dst: TabletReplica,
        _range: TokenRange,
    ) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _session: SessionId) -> Result<()> {
        Ok(())
    }
}

/// Build the transition record that announces a migration: stage one, with
/// the target replica set derived from the movement.
pub fn transition_for_migration(info: &TabletInfo, migration: &Migration) -> TabletTransitionInfo {
    let next_replicas = match migration.kind {
        TransitionKind::Rebuild => {
            let mut replicas = info.replicas.clone();
            replicas.push(migration.dst);
            replicas
        }
        _ => replace_replica(&info.replicas, migration.src, migration.dst),
    };
    TabletTransitionInfo::new(
        TransitionStage::AllowWriteBothReadOld,
        migration.kind,
        next_replicas,
        migration.dst,
    )
}

/// Outcome of advancing a transition by one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The transition moved to a new stage; commit the updated record.
    Updated(TabletTransitionInfo),
    /// The terminal stage was reached; install this replica set and remove
    /// the transition record.
    Finished(Vec<TabletReplica>),
}

/// Advances tablet transitions stage by stage.
#[derive(Debug)]
pub struct MigrationDriver {
    config: TransitionConfig,
    streaming: Arc<dyn Streaming>,
}

impl MigrationDriver {
    /// Create a driver over a streaming collaborator.
    pub fn new(config: TransitionConfig, streaming: Arc<dyn Streaming>) -> Self {
        Self { config, streaming }
    }

    /// Driver with default config and no-op streaming.
    pub fn with_defaults() -> Self {
        Self::new(TransitionConfig::default(), Arc::new(NoopStreaming))
    }

    /// Advance the transition by one stage. The stage entered from
    /// `Streaming` only commits once the data copy finished; transient
    /// streaming failures are retried on a fresh session up to the
    /// configured budget, after which they are fatal.
    pub async fn advance(
        &self,
        range: TokenRange,
        current: &TabletInfo,
        transition: &TabletTransitionInfo,
    ) -> Result<Advance> {
        let Some(next_stage) = transition.stage.next(transition.kind) else {
            return Ok(Advance::Finished(transition.next_replicas.clone()));
        };

        let mut updated = transition.clone();
        updated.stage = next_stage;

        match transition.stage {
            TransitionStage::WriteBothReadOld => {
                // Entering the streaming stage binds a fresh session.
                updated.session = Some(SessionId::random());
            }
            TransitionStage::Streaming => {
                let session = match transition.session {
                    Some(session) => session,
                    None => SessionId::random(),
                };
                let session = self.run_streaming(session, current, transition, range).await?;
                updated.session = Some(session);
            }
            _ => {}
        }

        Ok(Advance::Updated(updated))
    }

    /// Roll the transition back. Only legal before the read switch; the
    /// caller clears the transition record, leaving the replica set as it
    /// was.
    pub async fn rollback(&self, transition: &TabletTransitionInfo) -> Result<()> {
        if !transition.stage.can_rollback() {
            return Err(Error::InvalidRequest(format!(
                "cannot roll back a transition at stage {}",
                transition.stage
            )));
        }
        if let Some(session) = transition.session {
            self.streaming.cancel(session).await?;
        }
        Ok(())
    }

    // Run the data copy, retrying on a fresh session until the budget runs
    // out. Returns the session the copy completed under.
    async fn run_streaming(
        &self,
        session: SessionId,
        current: &TabletInfo,
        transition: &TabletTransitionInfo,
        range: TokenRange,
    ) -> Result<SessionId> {
        let src = stream_source(current, transition).ok_or_else(|| {
            Error::InvalidRequest("transition has no replica to stream from".into())
        })?;
        let dst = transition.pending_replica;

        let mut session = session;
        let mut attempts = 0;
        loop {
            match self.streaming.start(session, src, dst, range).await {
                Ok(()) => return Ok(session),
                Err(err) => {
                    attempts += 1;
                    if attempts > self.config.max_streaming_retries {
                        return Err(Error::StreamingFailure {
                            reason: err.to_string(),
                            attempts,
                        });
                    }
                    tracing::warn!(
                        %session,
                        attempts,
                        error = %err,
                        "Streaming failed, retrying on a fresh session"
                    );
                    session = SessionId::random();
                }
            }
        }
    }
}

// The replica data is copied from: for migrations, the one leaving the set;
// for rebuilds nothing leaves, so any current replica serves.
fn stream_source(
    current: &TabletInfo,
    transition: &TabletTransitionInfo,
) -> Option<TabletReplica> {
    current
        .replicas
        .iter()
        .find(|r| !transition.next_replicas.contains(r))
        .or_else(|| current.replicas.first())
        .copied()
}
