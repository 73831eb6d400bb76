//! In-memory store wrapping the engine's [`Ledger`].

use super::LocalStore;
use crate::error::Result;
use async_trait::async_trait;
use mushaf_engine::{
    ApplyReport, Cursor, EntityType, Ledger, LedgerSnapshot, LedgerWrite, LocalId, LocalRecord,
    Payload, RemoteId, Timestamp,
};
use tokio::sync::Mutex;

/// A ledger behind an async mutex. Contents can be moved in and out as a
/// [`LedgerSnapshot`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            ledger: Mutex::new(Ledger::new()),
        }
    }

    /// Restore a store from a validated snapshot.
    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Result<Self> {
        Ok(Self {
            ledger: Mutex::new(Ledger::import_state(snapshot)?),
        })
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.lock().await.export_state()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn create(&self, payload: Payload, now: Timestamp) -> Result<LocalRecord> {
        Ok(self.ledger.lock().await.create(payload, now)?)
    }

    async fn update(
        &self,
        entity: EntityType,
        local_id: LocalId,
        payload: Payload,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        Ok(self.ledger.lock().await.update(entity, local_id, payload, now)?)
    }

    async fn delete(
        &self,
        entity: EntityType,
        local_id: LocalId,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        Ok(self.ledger.lock().await.delete(entity, local_id, now)?)
    }

    async fn get(&self, entity: EntityType, local_id: LocalId) -> Result<Option<LocalRecord>> {
        Ok(self.ledger.lock().await.get(entity, local_id))
    }

    async fn records(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        Ok(self.ledger.lock().await.records(entity))
    }

    async fn pending(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        Ok(self.ledger.lock().await.pending(entity))
    }

    async fn by_remote_ids(
        &self,
        entity: EntityType,
        remote_ids: &[RemoteId],
    ) -> Result<Vec<LocalRecord>> {
        Ok(self.ledger.lock().await.by_remote_ids(entity, remote_ids))
    }

    async fn cursor(&self, entity: EntityType) -> Result<Option<Cursor>> {
        Ok(self.ledger.lock().await.cursor(entity).cloned())
    }

    async fn apply(
        &self,
        entity: EntityType,
        writes: Vec<LedgerWrite>,
        cursor: Option<Cursor>,
    ) -> Result<ApplyReport> {
        Ok(self.ledger.lock().await.apply(entity, writes, cursor)?)
    }
}
