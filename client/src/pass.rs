//! One synchronization pass over every entity type.
//!
//! For each entity type the pass fetches the remote delta, reconciles it with
//! the local pending set, runs the resulting pushes, and lands every local
//! write together with the new cursor. Entity types run concurrently except
//! where one depends on another's remote ids; junctions wait for collections.

use crate::auth::{AccessToken, TokenProvider};
use crate::error::Result;
use crate::remote::{RemoteApi, RemoteError};
use crate::scheduler::SyncTask;
use crate::store::LocalStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mushaf_engine::adapter::to_fields;
use mushaf_engine::{
    decode_delta, discard_echoes, reconcile, EntityType, LedgerWrite, LocalId, Push, PushAction,
    PushOutcome, RemoteId,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a pass did for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReport {
    pub entity: EntityType,
    /// Remote changes left after discarding echoes
    pub fetched: usize,
    pub pushed: usize,
    pub failed_pushes: usize,
    /// Local writes that landed
    pub applied: usize,
    pub conflicts: usize,
    pub deferred: usize,
    /// Remote records skipped because they could not be decoded or stored
    pub malformed: Vec<RemoteId>,
    /// Records the user changed while the pass was running
    pub stale: usize,
    /// The delta cursor was kept so the same changes are fetched again
    pub cursor_held: bool,
    /// Set when this entity type could not be synced at all
    pub error: Option<String>,
}

impl EntityReport {
    fn new(entity: EntityType) -> Self {
        Self {
            entity,
            fetched: 0,
            pushed: 0,
            failed_pushes: 0,
            applied: 0,
            conflicts: 0,
            deferred: 0,
            malformed: Vec::new(),
            stale: 0,
            cursor_held: false,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.failed_pushes == 0
    }
}

/// Outcome of a whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub entities: Vec<EntityReport>,
}

impl PassReport {
    /// True when every entity type synced and every push landed.
    pub fn is_success(&self) -> bool {
        self.entities.iter().all(EntityReport::is_success)
    }

    pub fn entity(&self, entity: EntityType) -> Option<&EntityReport> {
        self.entities.iter().find(|r| r.entity == entity)
    }
}

/// Runs passes against one local store and one remote service.
#[derive(Clone)]
pub struct Synchronizer {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteApi>,
    tokens: Arc<dyn TokenProvider>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteApi>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            store,
            remote,
            tokens,
        }
    }

    /// Run one pass.
    ///
    /// Fails only when no access token can be obtained. Failures confined to
    /// one entity type or one push are reported in the [`PassReport`] and
    /// leave the affected records pending for the next pass.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let started_at = Utc::now();
        let token = self.tokens.access_token().await?;

        let (independent, dependent): (Vec<EntityType>, Vec<EntityType>) =
            EntityType::ALL.iter().copied().partition(|entity| {
                !EntityType::ALL
                    .iter()
                    .any(|e| e.dependents().contains(entity))
            });

        let mut entities = join_all(
            independent
                .iter()
                .map(|entity| self.sync_entity(&token, *entity)),
        )
        .await;
        entities.extend(
            join_all(
                dependent
                    .iter()
                    .map(|entity| self.sync_entity(&token, *entity)),
            )
            .await,
        );

        let report = PassReport {
            started_at,
            finished_at: Utc::now(),
            entities,
        };
        info!(
            success = report.is_success(),
            pushed = report.entities.iter().map(|r| r.pushed).sum::<usize>(),
            applied = report.entities.iter().map(|r| r.applied).sum::<usize>(),
            "Sync pass finished"
        );
        Ok(report)
    }

    async fn sync_entity(&self, token: &AccessToken, entity: EntityType) -> EntityReport {
        let mut report = EntityReport::new(entity);
        if let Err(e) = self.try_sync_entity(token, entity, &mut report).await {
            error!(entity = %entity, error = %e, "Entity sync failed");
            report.error = Some(e.to_string());
        }
        report
    }

    async fn try_sync_entity(
        &self,
        token: &AccessToken,
        entity: EntityType,
        report: &mut EntityReport,
    ) -> Result<()> {
        let since = self.store.cursor(entity).await?;
        let delta = self
            .remote
            .fetch_delta(token, entity, since.as_deref())
            .await?;

        let (changes, malformed) = decode_delta(entity, &delta.changes);
        for (remote_id, e) in malformed {
            warn!(
                entity = %entity,
                remote_id = %remote_id,
                error = %e,
                "Skipping malformed remote record"
            );
            report.malformed.push(remote_id);
        }

        let remote_ids: Vec<RemoteId> = changes.iter().map(|c| c.remote_id.clone()).collect();
        let known = self.store.by_remote_ids(entity, &remote_ids).await?;
        let changes = discard_echoes(changes, &known);
        report.fetched = changes.len();

        let pending = self.store.pending(entity).await?;
        let plan = reconcile(entity, pending, changes)?;
        report.conflicts = plan.conflicts.len();
        report.deferred = plan.deferred.len();
        debug!(
            entity = %entity,
            pushes = plan.pushes.len(),
            pulls = plan.pulls.len(),
            resolved = plan.resolved.len(),
            conflicts = plan.conflicts.len(),
            deferred = plan.deferred.len(),
            "Reconciled"
        );

        // A pairing found by conflict key lives only in this delta. If its
        // push fails, the next pass must see the same remote record again.
        let key_matched: BTreeSet<LocalId> = plan
            .conflicts
            .iter()
            .filter(|c| c.key.is_some())
            .map(|c| c.local_id)
            .collect();

        let mut writes = plan.local_writes();
        for push in &plan.pushes {
            match self.execute_push(token, entity, push).await {
                Ok(write) => {
                    writes.push(write);
                    report.pushed += 1;
                }
                Err(e) => {
                    warn!(
                        entity = %entity,
                        local_id = push.local_id,
                        error = %e,
                        "Push failed, record stays pending"
                    );
                    report.failed_pushes += 1;
                    report.cursor_held |= key_matched.contains(&push.local_id);
                }
            }
        }

        let cursor = if report.cursor_held {
            debug!(entity = %entity, "Keeping the delta cursor for a retry");
            None
        } else {
            Some(delta.cursor)
        };
        let applied = self.store.apply(entity, writes, cursor).await?;
        for remote_id in &applied.malformed {
            warn!(
                entity = %entity,
                remote_id = %remote_id,
                "Skipping remote record that references an unknown collection"
            );
        }
        if !applied.stale.is_empty() {
            debug!(
                entity = %entity,
                stale = ?applied.stale,
                "Records changed during the pass stay pending"
            );
        }
        report.applied = applied.applied;
        report.stale = applied.stale.len();
        report.malformed.extend(applied.malformed);
        Ok(())
    }

    async fn execute_push(
        &self,
        token: &AccessToken,
        entity: EntityType,
        push: &Push,
    ) -> Result<LedgerWrite> {
        let outcome = match &push.action {
            PushAction::Create { payload } => PushOutcome::Saved(
                self.remote
                    .push_create(token, entity, &to_fields(payload))
                    .await?,
            ),
            PushAction::Update { remote_id, payload } => PushOutcome::Saved(
                self.remote
                    .push_update(token, entity, remote_id, &to_fields(payload))
                    .await?,
            ),
            PushAction::Delete { remote_id } => {
                match self.remote.push_delete(token, entity, remote_id).await {
                    // Already gone remotely, which is what was asked for
                    Ok(()) | Err(RemoteError::NotFound(_)) => PushOutcome::Deleted,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(push.confirm(entity, outcome)?)
    }
}

#[async_trait]
impl SyncTask for Synchronizer {
    async fn run(&self) -> bool {
        match self.run_pass().await {
            Ok(report) => report.is_success(),
            Err(e) => {
                warn!(error = %e, "Sync pass aborted");
                false
            }
        }
    }
}
