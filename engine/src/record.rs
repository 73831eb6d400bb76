//! Record envelope shared by every entity table, and the remote change
//! records the server reports.

use crate::adapter::{self, Fields};
use crate::{ConflictKey, EntityType, LocalId, Payload, RemoteId, Result, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of change a record carries relative to the remote replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mutation {
    Created,
    Modified,
    Deleted,
}

/// A record in a local entity table.
///
/// Timestamps are milliseconds since epoch, already truncated to the
/// entity type's stored resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalRecord {
    /// Process-local identity, never reused
    pub local_id: LocalId,
    /// Server identity, set by the first successful push or pull
    pub remote_id: Option<RemoteId>,
    /// Tombstone kept until the deletion is confirmed remotely
    pub deleted: bool,
    /// Modified by the user since the last convergence
    pub dirty: bool,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    pub payload: Payload,
}

impl LocalRecord {
    /// A record freshly created by the user.
    pub fn new(local_id: LocalId, payload: Payload, timestamp: Timestamp) -> Self {
        let timestamp = payload.entity_type().time_unit().truncate(timestamp);
        Self {
            local_id,
            remote_id: None,
            deleted: false,
            dirty: false,
            created_at: timestamp,
            modified_at: timestamp,
            payload,
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    /// Derive the pending mutation from the stored flags.
    ///
    /// `None` means the record matches the remote replica.
    pub fn mutation(&self) -> Option<Mutation> {
        if self.deleted {
            Some(Mutation::Deleted)
        } else if self.remote_id.is_none() {
            Some(Mutation::Created)
        } else if self.dirty {
            Some(Mutation::Modified)
        } else {
            None
        }
    }

    pub fn is_pending(&self) -> bool {
        self.mutation().is_some()
    }

    /// A tombstone the server never heard of.
    pub fn is_free_delete(&self) -> bool {
        self.deleted && self.remote_id.is_none()
    }

    pub fn conflict_key(&self) -> Option<ConflictKey> {
        self.payload.conflict_key()
    }

    /// Apply a user edit.
    pub fn update_payload(&mut self, payload: Payload, timestamp: Timestamp) {
        self.payload = payload;
        self.touch(timestamp);
    }

    /// Soft-delete on behalf of the user.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.touch(timestamp);
    }

    fn touch(&mut self, timestamp: Timestamp) {
        self.modified_at = self.entity_type().time_unit().truncate(timestamp);
        self.dirty = true;
    }

    /// Write back the converged state, clearing all pending flags.
    pub fn resolve(&mut self, state: ResolvedState) {
        self.remote_id = Some(state.remote_id);
        self.modified_at = self.entity_type().time_unit().truncate(state.modified_at);
        self.payload = state.payload;
        self.deleted = false;
        self.dirty = false;
    }
}

/// Final state of a record once both replicas agree on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedState {
    pub remote_id: RemoteId,
    pub modified_at: Timestamp,
    pub payload: Payload,
}

/// One entry of the server's delta, in wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteChange {
    pub remote_id: RemoteId,
    pub kind: Mutation,
    #[serde(default)]
    pub fields: Fields,
    /// Milliseconds since epoch
    pub modified_at: Timestamp,
}

impl RemoteChange {
    /// Decode the change for `entity`, normalizing its timestamp to the
    /// entity's stored resolution.
    ///
    /// Deletions do not need a payload, so their fields are decoded on a
    /// best-effort basis.
    pub fn decode(&self, entity: EntityType) -> Result<RemoteEntity> {
        let modified_at = entity.time_unit().truncate(self.modified_at);
        let deleted = self.kind == Mutation::Deleted;
        let payload = if deleted {
            adapter::from_fields(entity, &self.fields).ok()
        } else {
            Some(adapter::from_fields(entity, &self.fields)?)
        };
        Ok(RemoteEntity {
            remote_id: self.remote_id.clone(),
            deleted,
            payload,
            modified_at,
        })
    }
}

/// A decoded remote change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub remote_id: RemoteId,
    pub deleted: bool,
    /// Always present for live entities
    pub payload: Option<Payload>,
    pub modified_at: Timestamp,
}

impl RemoteEntity {
    /// A live remote entity.
    pub fn live(remote_id: impl Into<RemoteId>, payload: Payload, modified_at: Timestamp) -> Self {
        Self {
            remote_id: remote_id.into(),
            deleted: false,
            payload: Some(payload),
            modified_at,
        }
    }

    /// A remote deletion.
    pub fn deleted(remote_id: impl Into<RemoteId>, modified_at: Timestamp) -> Self {
        Self {
            remote_id: remote_id.into(),
            deleted: true,
            payload: None,
            modified_at,
        }
    }

    /// Conflict key of a live entity. Deletions never match by key.
    pub fn conflict_key(&self) -> Option<ConflictKey> {
        if self.deleted {
            None
        } else {
            self.payload.as_ref().and_then(Payload::conflict_key)
        }
    }

    /// Converged local state for a live entity.
    pub fn resolved_state(&self) -> Option<ResolvedState> {
        match (&self.payload, self.deleted) {
            (Some(payload), false) => Some(ResolvedState {
                remote_id: self.remote_id.clone(),
                modified_at: self.modified_at,
                payload: payload.clone(),
            }),
            _ => None,
        }
    }
}

/// The server's confirmation of a pushed create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub remote_id: RemoteId,
    pub fields: Fields,
    /// Milliseconds since epoch
    pub modified_at: Timestamp,
}
