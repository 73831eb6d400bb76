//! Ledger - the in-memory mutation ledger.
//!
//! The Ledger holds one table of [`LocalRecord`]s per entity type together
//! with the delta cursor of each type. User operations mark records as
//! pending; a reconciliation pass retires them through [`LedgerWrite`]s,
//! applied all-or-nothing per entity type.
//!
//! Collection bookmarks are stored pointing at their collection's
//! `local_id`. Every read resolves that reference to the collection's
//! remote id once it has one, which is the form reconciliation and the
//! server work with.

use crate::record::{LocalRecord, RemoteEntity, ResolvedState};
use crate::{
    CollectionRef, Cursor, EntityType, Error, LocalId, Payload, RemoteId, Result, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A write produced by a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LedgerWrite {
    /// Record the converged state of a local record and clear its pending
    /// flags. Skipped if the record changed since `base_modified_at`.
    Commit {
        local_id: LocalId,
        base_modified_at: Timestamp,
        state: ResolvedState,
    },
    /// Hard-delete a local record.
    Purge { local_id: LocalId },
    /// Insert or overwrite the record holding `remote.remote_id`.
    Upsert { remote: RemoteEntity },
    /// Hard-delete the record holding `remote_id`, if it has no pending edit.
    PurgeRemote { remote_id: RemoteId },
}

/// Outcome of applying one batch of writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    /// Writes that changed the ledger
    pub applied: usize,
    /// Records left pending because the user edited them during the pass
    pub stale: Vec<LocalId>,
    /// Remote records skipped because they cannot be stored
    pub malformed: Vec<RemoteId>,
}

/// Records of one entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    records: BTreeMap<LocalId, LocalRecord>,
}

impl Table {
    pub(crate) fn from_records(records: Vec<LocalRecord>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.local_id, r)).collect(),
        }
    }

    pub fn get(&self, local_id: LocalId) -> Option<&LocalRecord> {
        self.records.get(&local_id)
    }

    /// All records, tombstones included, in local id order.
    pub fn all_records(&self) -> impl Iterator<Item = &LocalRecord> {
        self.records.values()
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&LocalRecord> {
        self.records
            .values()
            .find(|r| r.remote_id.as_deref() == Some(remote_id))
    }

    /// Count of live (non-deleted) records.
    pub fn len(&self) -> usize {
        self.records.values().filter(|r| !r.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The main ledger holding every entity table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ledger {
    tables: BTreeMap<EntityType, Table>,
    cursors: BTreeMap<EntityType, Cursor>,
    next_local_id: LocalId,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            tables: EntityType::ALL
                .iter()
                .map(|entity| (*entity, Table::default()))
                .collect(),
            cursors: BTreeMap::new(),
            next_local_id: 1,
        }
    }

    pub(crate) fn from_parts(
        tables: BTreeMap<EntityType, Table>,
        cursors: BTreeMap<EntityType, Cursor>,
        next_local_id: LocalId,
    ) -> Self {
        let mut ledger = Self::new();
        ledger.tables.extend(tables);
        ledger.cursors = cursors;
        ledger.next_local_id = next_local_id;
        ledger
    }

    pub(crate) fn next_local_id(&self) -> LocalId {
        self.next_local_id
    }

    /// Raw table access, without collection references resolved.
    pub fn table(&self, entity: EntityType) -> Option<&Table> {
        self.tables.get(&entity)
    }

    fn table_mut(&mut self, entity: EntityType) -> &mut Table {
        self.tables.entry(entity).or_default()
    }

    fn allocate_id(&mut self) -> LocalId {
        let id = self.next_local_id.max(1);
        self.next_local_id = id + 1;
        id
    }

    /// Create a record on behalf of the user.
    pub fn create(&mut self, payload: Payload, now: Timestamp) -> Result<LocalRecord> {
        let payload = self.localize(payload)?;
        self.ensure_unique(&payload, None)?;
        let local_id = self.allocate_id();
        let record = LocalRecord::new(local_id, payload, now);
        self.table_mut(record.entity_type())
            .records
            .insert(local_id, record.clone());
        Ok(self.resolve_refs(record))
    }

    /// Replace the payload of a live record on behalf of the user.
    pub fn update(
        &mut self,
        entity: EntityType,
        local_id: LocalId,
        payload: Payload,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        payload.expect_type(entity)?;
        let payload = self.localize(payload)?;
        self.live_record_mut(entity, local_id)?;
        self.ensure_unique(&payload, Some(local_id))?;
        let record = self.live_record_mut(entity, local_id)?;
        record.update_payload(payload, now);
        let record = record.clone();
        Ok(self.resolve_refs(record))
    }

    /// Soft-delete a live record on behalf of the user.
    pub fn delete(
        &mut self,
        entity: EntityType,
        local_id: LocalId,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        let record = self.live_record_mut(entity, local_id)?;
        record.mark_deleted(now);
        let record = record.clone();
        Ok(self.resolve_refs(record))
    }

    /// Refuse a payload that a live record other than `except` already holds.
    fn ensure_unique(&self, payload: &Payload, except: Option<LocalId>) -> Result<()> {
        let entity = payload.entity_type();
        let holder = self.table(entity).and_then(|t| {
            t.all_records().find(|r| {
                !r.deleted && Some(r.local_id) != except && r.payload.same_identity(payload)
            })
        });
        match holder {
            Some(record) => Err(Error::AlreadyExists {
                entity,
                local_id: record.local_id,
            }),
            None => Ok(()),
        }
    }

    fn live_record_mut(
        &mut self,
        entity: EntityType,
        local_id: LocalId,
    ) -> Result<&mut LocalRecord> {
        let record = self
            .table_mut(entity)
            .records
            .get_mut(&local_id)
            .ok_or(Error::RecordNotFound { entity, local_id })?;
        if record.deleted {
            return Err(Error::OperationOnDeleted { entity, local_id });
        }
        Ok(record)
    }

    /// Get a record, tombstones included.
    pub fn get(&self, entity: EntityType, local_id: LocalId) -> Option<LocalRecord> {
        self.tables
            .get(&entity)
            .and_then(|t| t.get(local_id))
            .cloned()
            .map(|r| self.resolve_refs(r))
    }

    /// Live records of one entity type.
    pub fn records(&self, entity: EntityType) -> Vec<LocalRecord> {
        self.select(entity, |r| !r.deleted)
    }

    /// The local pending set of one entity type.
    pub fn pending(&self, entity: EntityType) -> Vec<LocalRecord> {
        self.select(entity, LocalRecord::is_pending)
    }

    /// Records, tombstones included, holding any of `remote_ids`.
    pub fn by_remote_ids(&self, entity: EntityType, remote_ids: &[RemoteId]) -> Vec<LocalRecord> {
        self.select(entity, |r| {
            r.remote_id
                .as_ref()
                .is_some_and(|id| remote_ids.contains(id))
        })
    }

    fn select(
        &self,
        entity: EntityType,
        predicate: impl Fn(&LocalRecord) -> bool,
    ) -> Vec<LocalRecord> {
        self.tables
            .get(&entity)
            .map(|t| {
                t.all_records()
                    .filter(|r| predicate(*r))
                    .cloned()
                    .map(|r| self.resolve_refs(r))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn cursor(&self, entity: EntityType) -> Option<&Cursor> {
        self.cursors.get(&entity)
    }

    pub fn cursors(&self) -> &BTreeMap<EntityType, Cursor> {
        &self.cursors
    }

    pub fn set_cursor(&mut self, entity: EntityType, cursor: impl Into<Cursor>) {
        self.cursors.insert(entity, cursor.into());
    }

    /// Apply the writes of one pass over `entity`, then advance its cursor.
    ///
    /// Either every write and the cursor land, or the ledger is left
    /// untouched and the error is returned. Stale commits and remote records
    /// that cannot be stored are skipped and listed in the report.
    pub fn apply(
        &mut self,
        entity: EntityType,
        writes: Vec<LedgerWrite>,
        cursor: Option<Cursor>,
    ) -> Result<ApplyReport> {
        let mut staged = self.clone();
        let mut report = ApplyReport::default();
        for write in writes {
            staged.apply_one(entity, write, &mut report)?;
        }
        if let Some(cursor) = cursor {
            staged.set_cursor(entity, cursor);
        }
        *self = staged;
        Ok(report)
    }

    fn apply_one(
        &mut self,
        entity: EntityType,
        write: LedgerWrite,
        report: &mut ApplyReport,
    ) -> Result<()> {
        match write {
            LedgerWrite::Commit {
                local_id,
                base_modified_at,
                state,
            } => {
                state.payload.expect_type(entity)?;
                let remote_id = state.remote_id.clone();
                let payload = match self.localize_remote(state.payload) {
                    Ok(payload) => payload,
                    Err(e) if e.is_malformed_record() => {
                        report.malformed.push(remote_id);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let state = ResolvedState { payload, ..state };

                let Some(record) = self.table_mut(entity).records.get(&local_id) else {
                    report.stale.push(local_id);
                    return Ok(());
                };
                if record.modified_at != base_modified_at {
                    report.stale.push(local_id);
                    return Ok(());
                }
                if let Some(current) = &record.remote_id {
                    if current != &state.remote_id {
                        return Err(Error::RemoteIdChanged {
                            entity,
                            local_id,
                            current: current.clone(),
                            requested: state.remote_id,
                        });
                    }
                }
                self.ensure_remote_id_free(entity, &state.remote_id, local_id)?;
                if let Some(record) = self.table_mut(entity).records.get_mut(&local_id) {
                    record.resolve(state);
                }
                report.applied += 1;
            }
            LedgerWrite::Purge { local_id } => {
                if self.purge(entity, local_id) {
                    report.applied += 1;
                }
            }
            LedgerWrite::Upsert { remote } => {
                let Some(state) = remote.resolved_state() else {
                    return self.apply_one(
                        entity,
                        LedgerWrite::PurgeRemote {
                            remote_id: remote.remote_id,
                        },
                        report,
                    );
                };
                state.payload.expect_type(entity)?;
                let payload = match self.localize_remote(state.payload) {
                    Ok(payload) => payload,
                    Err(e) if e.is_malformed_record() => {
                        report.malformed.push(state.remote_id);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let state = ResolvedState { payload, ..state };

                let existing = self
                    .table_mut(entity)
                    .find_by_remote_id(&state.remote_id)
                    .map(|r| (r.local_id, r.is_pending()));
                match existing {
                    Some((local_id, true)) => report.stale.push(local_id),
                    Some((local_id, false)) => {
                        if let Some(record) = self.table_mut(entity).records.get_mut(&local_id) {
                            record.resolve(state);
                        }
                        report.applied += 1;
                    }
                    None => {
                        let local_id = self.allocate_id();
                        let mut record =
                            LocalRecord::new(local_id, state.payload.clone(), state.modified_at);
                        record.resolve(state);
                        self.table_mut(entity).records.insert(local_id, record);
                        report.applied += 1;
                    }
                }
            }
            LedgerWrite::PurgeRemote { remote_id } => {
                let existing = self
                    .table_mut(entity)
                    .find_by_remote_id(&remote_id)
                    .map(|r| (r.local_id, r.is_pending()));
                match existing {
                    Some((local_id, true)) => report.stale.push(local_id),
                    Some((local_id, false)) => {
                        self.purge(entity, local_id);
                        report.applied += 1;
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    /// Remove a record; removing a collection also removes its bookmarks.
    fn purge(&mut self, entity: EntityType, local_id: LocalId) -> bool {
        let removed = self.table_mut(entity).records.remove(&local_id).is_some();
        if removed && entity == EntityType::Collection {
            self.table_mut(EntityType::CollectionBookmark)
                .records
                .retain(|_, r| r.payload.collection_ref() != Some(&CollectionRef::Local(local_id)));
        }
        removed
    }

    fn ensure_remote_id_free(
        &self,
        entity: EntityType,
        remote_id: &str,
        owner: LocalId,
    ) -> Result<()> {
        match self
            .tables
            .get(&entity)
            .and_then(|t| t.find_by_remote_id(remote_id))
        {
            Some(other) if other.local_id != owner => {
                Err(Error::RemoteIdTaken(remote_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Point a user-supplied junction at its collection's local id.
    fn localize(&self, payload: Payload) -> Result<Payload> {
        if let Some(CollectionRef::Local(collection)) = payload.collection_ref() {
            match self.table(EntityType::Collection).and_then(|t| t.get(*collection)) {
                Some(record) if !record.deleted => {}
                Some(_) => {
                    return Err(Error::OperationOnDeleted {
                        entity: EntityType::Collection,
                        local_id: *collection,
                    })
                }
                None => {
                    return Err(Error::RecordNotFound {
                        entity: EntityType::Collection,
                        local_id: *collection,
                    })
                }
            }
        }
        self.localize_remote(payload)
    }

    /// Rewrite a remote collection reference to the matching local id.
    fn localize_remote(&self, payload: Payload) -> Result<Payload> {
        match payload {
            Payload::CollectionBookmark {
                collection: CollectionRef::Remote(remote_id),
                location,
            } => {
                let local_id = self
                    .table(EntityType::Collection)
                    .and_then(|t| t.find_by_remote_id(&remote_id))
                    .map(|r| r.local_id)
                    .ok_or(Error::UnknownCollection(remote_id))?;
                Ok(Payload::CollectionBookmark {
                    collection: CollectionRef::Local(local_id),
                    location,
                })
            }
            other => Ok(other),
        }
    }

    /// Rewrite a stored local collection reference to the collection's
    /// remote id, when it has one.
    fn resolve_refs(&self, mut record: LocalRecord) -> LocalRecord {
        if let Payload::CollectionBookmark { collection, .. } = &mut record.payload {
            let CollectionRef::Local(local_id) = *collection else {
                return record;
            };
            if let Some(remote_id) = self
                .table(EntityType::Collection)
                .and_then(|t| t.get(local_id))
                .and_then(|r| r.remote_id.clone())
            {
                *collection = CollectionRef::Remote(remote_id);
            }
        }
        record
    }
}
