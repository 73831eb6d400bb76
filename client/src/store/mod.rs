//! Local persistence of the record ledger.
//!
//! Every store honours the ledger's write semantics: user operations mark
//! records pending, and [`LocalStore::apply`] lands a whole pass's writes for
//! one entity type together with its new cursor, or nothing at all.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use async_trait::async_trait;
use mushaf_engine::{
    ApplyReport, Cursor, EntityType, LedgerWrite, LocalId, LocalRecord, Payload, RemoteId,
    Timestamp,
};

/// A persistent home for the ledger.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Create a record on behalf of the user.
    async fn create(&self, payload: Payload, now: Timestamp) -> Result<LocalRecord>;

    /// Replace the payload of a live record.
    async fn update(
        &self,
        entity: EntityType,
        local_id: LocalId,
        payload: Payload,
        now: Timestamp,
    ) -> Result<LocalRecord>;

    /// Soft-delete a live record.
    async fn delete(&self, entity: EntityType, local_id: LocalId, now: Timestamp)
        -> Result<LocalRecord>;

    /// A record by local id, tombstones included.
    async fn get(&self, entity: EntityType, local_id: LocalId) -> Result<Option<LocalRecord>>;

    /// Live records, ordered by local id.
    async fn records(&self, entity: EntityType) -> Result<Vec<LocalRecord>>;

    /// Records with a pending mutation, ordered by local id.
    async fn pending(&self, entity: EntityType) -> Result<Vec<LocalRecord>>;

    /// Records holding any of `remote_ids`, tombstones included.
    async fn by_remote_ids(
        &self,
        entity: EntityType,
        remote_ids: &[RemoteId],
    ) -> Result<Vec<LocalRecord>>;

    /// Cursor of the last applied delta.
    async fn cursor(&self, entity: EntityType) -> Result<Option<Cursor>>;

    /// Atomically apply one pass's writes and advance the cursor.
    async fn apply(
        &self,
        entity: EntityType,
        writes: Vec<LedgerWrite>,
        cursor: Option<Cursor>,
    ) -> Result<ApplyReport>;
}
