//! Reconciliation of local pending records against the server's delta.
//!
//! Given the pending set of one entity type and the remote changes reported
//! since the last pass, this module decides which records must be pushed,
//! which remote changes must be pulled, and which local records can be
//! retired without any network call. It performs no I/O; the resulting
//! [`ReconcilePlan`] is executed by the caller.
//!
//! # Algorithm
//!
//! 1. Remote changes are deduplicated by remote id (latest wins)
//! 2. Pending records that already carry a remote id are paired with the
//!    change for that id
//! 3. Remaining live records without a remote id are paired with live remote
//!    changes on equal conflict keys
//! 4. Unpaired records become pushes (or free purges), unpaired changes
//!    become pulls
//! 5. Pairs are resolved by `modified_at`: remote strictly newer wins,
//!    otherwise the local side wins
//!
//! Output order is deterministic: records by local id, changes by remote id.

use crate::adapter::{self, Fields};
use crate::record::{
    LocalRecord, Mutation, RemoteChange, RemoteEntity, RemoteRecord, ResolvedState,
};
use crate::{
    ConflictKey, EntityType, Error, LedgerWrite, LocalId, Payload, RemoteId, Result, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// How a matched pair was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local side was newer or equally recent
    LocalWins,
    /// Remote side was strictly newer
    RemoteWins,
    /// Both sides already agree
    Converged,
}

/// A local record and a remote change found to be the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    /// Key the pair was matched on, `None` when matched by remote id
    pub key: Option<ConflictKey>,
    pub local_modified_at: Timestamp,
    pub remote_modified_at: Timestamp,
    pub resolution: ConflictResolution,
}

/// Network write needed to bring the server up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PushAction {
    Create { payload: Payload },
    Update { remote_id: RemoteId, payload: Payload },
    Delete { remote_id: RemoteId },
}

/// A push for one local record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Push {
    pub local_id: LocalId,
    /// `modified_at` of the record when the plan was made
    pub base_modified_at: Timestamp,
    pub action: PushAction,
}

/// What the server answered to a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Create or update stored, with the server's view of the record
    Saved(RemoteRecord),
    /// Delete acknowledged
    Deleted,
}

impl Push {
    /// Flat fields to send, if the action carries a payload.
    pub fn fields(&self) -> Option<Fields> {
        match &self.action {
            PushAction::Create { payload } | PushAction::Update { payload, .. } => {
                Some(adapter::to_fields(payload))
            }
            PushAction::Delete { .. } => None,
        }
    }

    /// Turn the server's answer into the ledger write that retires this
    /// push.
    ///
    /// The confirmed record is decoded and its identity checked against what
    /// was pushed: an update must come back with the same remote id, and any
    /// keyed payload must come back with the same conflict key. A plain
    /// success without a matching identity is not trusted.
    pub fn confirm(&self, entity: EntityType, outcome: PushOutcome) -> Result<LedgerWrite> {
        match (&self.action, outcome) {
            (PushAction::Delete { .. }, PushOutcome::Deleted) => Ok(LedgerWrite::Purge {
                local_id: self.local_id,
            }),
            (PushAction::Create { payload }, PushOutcome::Saved(record)) => {
                if record.remote_id.trim().is_empty() {
                    return Err(Error::IdentityMismatch {
                        entity,
                        expected: "a remote id".into(),
                        confirmed: "an empty remote id".into(),
                    });
                }
                self.commit(entity, payload, record)
            }
            (PushAction::Update { remote_id, payload }, PushOutcome::Saved(record)) => {
                if &record.remote_id != remote_id {
                    return Err(Error::IdentityMismatch {
                        entity,
                        expected: format!("remote id {remote_id}"),
                        confirmed: format!("remote id {}", record.remote_id),
                    });
                }
                self.commit(entity, payload, record)
            }
            (action, outcome) => Err(Error::IdentityMismatch {
                entity,
                expected: format!("{action:?}"),
                confirmed: format!("{outcome:?}"),
            }),
        }
    }

    fn commit(
        &self,
        entity: EntityType,
        pushed: &Payload,
        record: RemoteRecord,
    ) -> Result<LedgerWrite> {
        let confirmed = adapter::from_fields(entity, &record.fields)?;
        if let Some(expected) = pushed.conflict_key() {
            let actual = confirmed.conflict_key();
            if actual.as_ref() != Some(&expected) {
                return Err(Error::IdentityMismatch {
                    entity,
                    expected: expected.to_string(),
                    confirmed: actual.map_or_else(|| "no key".to_string(), |k| k.to_string()),
                });
            }
        }
        Ok(LedgerWrite::Commit {
            local_id: self.local_id,
            base_modified_at: self.base_modified_at,
            state: ResolvedState {
                remote_id: record.remote_id,
                modified_at: entity.time_unit().truncate(record.modified_at),
                payload: confirmed,
            },
        })
    }
}

/// Local write needed to bring the device up to date with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Pull {
    /// Take the remote state. `local_id` is set when it overwrites a
    /// pending record that lost its conflict.
    Apply {
        local_id: Option<LocalId>,
        base_modified_at: Option<Timestamp>,
        remote: RemoteEntity,
    },
    /// The server deleted an entity this device has no pending edit for.
    Delete { remote_id: RemoteId },
}

impl Pull {
    pub fn to_write(&self) -> LedgerWrite {
        match self {
            Pull::Apply {
                local_id: Some(local_id),
                base_modified_at,
                remote,
            } => match remote.resolved_state() {
                Some(state) => LedgerWrite::Commit {
                    local_id: *local_id,
                    base_modified_at: base_modified_at.unwrap_or(remote.modified_at),
                    state,
                },
                None => LedgerWrite::Purge {
                    local_id: *local_id,
                },
            },
            Pull::Apply {
                local_id: None,
                remote,
                ..
            } => LedgerWrite::Upsert {
                remote: remote.clone(),
            },
            Pull::Delete { remote_id } => LedgerWrite::PurgeRemote {
                remote_id: remote_id.clone(),
            },
        }
    }
}

/// Local-only settlement, no network call involved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Resolution {
    /// Hard-delete a tombstone the server never knew about, or whose
    /// deletion the server already reports
    Purge { local_id: LocalId },
    /// Both sides agree; record the remote identity and timestamp
    Align {
        local_id: LocalId,
        base_modified_at: Timestamp,
        state: ResolvedState,
    },
}

impl Resolution {
    pub fn to_write(&self) -> LedgerWrite {
        match self {
            Resolution::Purge { local_id } => LedgerWrite::Purge {
                local_id: *local_id,
            },
            Resolution::Align {
                local_id,
                base_modified_at,
                state,
            } => LedgerWrite::Commit {
                local_id: *local_id,
                base_modified_at: *base_modified_at,
                state: state.clone(),
            },
        }
    }
}

/// Everything one pass must do for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub entity: EntityType,
    pub pushes: Vec<Push>,
    pub pulls: Vec<Pull>,
    pub resolved: Vec<Resolution>,
    /// Matched pairs and how they were settled
    pub conflicts: Vec<Conflict>,
    /// Pending records that cannot be synced yet (junctions whose collection
    /// has no remote id)
    pub deferred: Vec<LocalId>,
}

impl ReconcilePlan {
    fn new(entity: EntityType) -> Self {
        Self {
            entity,
            pushes: Vec::new(),
            pulls: Vec::new(),
            resolved: Vec::new(),
            conflicts: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// True when the pass has nothing to push, pull, or retire.
    pub fn is_empty(&self) -> bool {
        self.pushes.is_empty() && self.pulls.is_empty() && self.resolved.is_empty()
    }

    /// Ledger writes that need no network round trip.
    pub fn local_writes(&self) -> Vec<LedgerWrite> {
        self.resolved
            .iter()
            .map(Resolution::to_write)
            .chain(self.pulls.iter().map(Pull::to_write))
            .collect()
    }
}

/// Decode a raw delta, setting aside changes that cannot be decoded.
pub fn decode_delta(
    entity: EntityType,
    changes: &[RemoteChange],
) -> (Vec<RemoteEntity>, Vec<(RemoteId, Error)>) {
    let mut decoded = Vec::with_capacity(changes.len());
    let mut malformed = Vec::new();
    for change in changes {
        match change.decode(entity) {
            Ok(entity) => decoded.push(entity),
            Err(e) => malformed.push((change.remote_id.clone(), e)),
        }
    }
    (decoded, malformed)
}

/// Drop remote changes that carry nothing new for this device.
///
/// `known` are the local records holding the delta's remote ids. A change is
/// dropped when it only echoes a synced record (same payload and timestamp,
/// which is what the server reports back after our own pushes), or when it
/// deletes a record this device no longer has.
pub fn discard_echoes(delta: Vec<RemoteEntity>, known: &[LocalRecord]) -> Vec<RemoteEntity> {
    let known: BTreeMap<&str, &LocalRecord> = known
        .iter()
        .filter_map(|r| r.remote_id.as_deref().map(|id| (id, r)))
        .collect();

    delta
        .into_iter()
        .filter(|change| match known.get(change.remote_id.as_str()) {
            None => !change.deleted,
            Some(local) if local.is_pending() => true,
            Some(local) => {
                change.deleted
                    || change.payload.as_ref() != Some(&local.payload)
                    || change.modified_at != local.modified_at
            }
        })
        .collect()
}

/// Compute the plan for one entity type.
///
/// `local_pending` is the pending set of the ledger (records without a
/// pending mutation are ignored). Remote changes must already be decoded and
/// normalized with [`decode_delta`].
pub fn reconcile(
    entity: EntityType,
    local_pending: Vec<LocalRecord>,
    remote_delta: Vec<RemoteEntity>,
) -> Result<ReconcilePlan> {
    for record in &local_pending {
        record.payload.expect_type(entity)?;
    }
    for change in &remote_delta {
        if let Some(payload) = &change.payload {
            payload.expect_type(entity)?;
        }
    }

    let mut plan = ReconcilePlan::new(entity);

    // Latest change per remote id
    let mut remote: BTreeMap<RemoteId, RemoteEntity> = BTreeMap::new();
    for change in remote_delta {
        match remote.entry(change.remote_id.clone()) {
            Entry::Occupied(mut slot) => {
                if change.modified_at >= slot.get().modified_at {
                    slot.insert(change);
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(change);
            }
        }
    }

    let mut locals: Vec<LocalRecord> = local_pending
        .into_iter()
        .filter(LocalRecord::is_pending)
        .collect();
    locals.sort_by_key(|r| r.local_id);

    let mut pairs: Vec<(LocalRecord, RemoteEntity, Option<ConflictKey>)> = Vec::new();
    let mut local_only: Vec<LocalRecord> = Vec::new();
    let mut unidentified: BTreeMap<ConflictKey, LocalRecord> = BTreeMap::new();

    for local in locals {
        if let Some(change) = local.remote_id.as_ref().and_then(|id| remote.remove(id)) {
            pairs.push((local, change, None));
            continue;
        }
        let key = if local.remote_id.is_none() && !local.deleted {
            local.conflict_key()
        } else {
            None
        };
        match key {
            Some(key) => match unidentified.entry(key) {
                Entry::Occupied(slot) => {
                    return Err(Error::DuplicateConflictKey {
                        entity,
                        key: slot.key().clone(),
                        side: "local",
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(local);
                }
            },
            None => local_only.push(local),
        }
    }

    let mut remote_only: Vec<RemoteEntity> = Vec::new();
    let mut keyed: BTreeMap<ConflictKey, RemoteEntity> = BTreeMap::new();
    for change in remote.into_values() {
        match change.conflict_key().filter(|k| unidentified.contains_key(k)) {
            Some(key) => match keyed.entry(key) {
                Entry::Occupied(slot) => {
                    return Err(Error::DuplicateConflictKey {
                        entity,
                        key: slot.key().clone(),
                        side: "remote",
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(change);
                }
            },
            None => remote_only.push(change),
        }
    }

    for (key, local) in unidentified {
        match keyed.remove(&key) {
            Some(change) => pairs.push((local, change, Some(key))),
            None => local_only.push(local),
        }
    }

    local_only.sort_by_key(|r| r.local_id);
    for local in local_only {
        plan_local_only(&mut plan, local);
    }

    for change in remote_only {
        plan.pulls.push(if change.deleted {
            Pull::Delete {
                remote_id: change.remote_id,
            }
        } else {
            Pull::Apply {
                local_id: None,
                base_modified_at: None,
                remote: change,
            }
        });
    }

    pairs.sort_by_key(|(local, _, _)| local.local_id);
    for (local, change, key) in pairs {
        plan_pair(&mut plan, local, change, key);
    }

    Ok(plan)
}

fn plan_local_only(plan: &mut ReconcilePlan, local: LocalRecord) {
    let unresolved = matches!(
        local.payload.collection_ref(),
        Some(crate::CollectionRef::Local(_))
    );
    let base_modified_at = local.modified_at;
    let action = match (local.mutation(), local.remote_id) {
        (Some(Mutation::Deleted), Some(remote_id)) => PushAction::Delete { remote_id },
        (Some(Mutation::Deleted), None) => {
            plan.resolved.push(Resolution::Purge {
                local_id: local.local_id,
            });
            return;
        }
        _ if unresolved => {
            plan.deferred.push(local.local_id);
            return;
        }
        (Some(Mutation::Created), _) | (_, None) => PushAction::Create {
            payload: local.payload,
        },
        (Some(Mutation::Modified), Some(remote_id)) => PushAction::Update {
            remote_id,
            payload: local.payload,
        },
        (None, Some(_)) => return,
    };
    plan.pushes.push(Push {
        local_id: local.local_id,
        base_modified_at,
        action,
    });
}

fn plan_pair(
    plan: &mut ReconcilePlan,
    local: LocalRecord,
    change: RemoteEntity,
    key: Option<ConflictKey>,
) {
    let converged = match (local.deleted, change.deleted) {
        (true, true) => true,
        (false, false) => change.payload.as_ref() == Some(&local.payload),
        _ => false,
    };

    let resolution = if converged {
        if local.deleted {
            plan.resolved.push(Resolution::Purge {
                local_id: local.local_id,
            });
        } else {
            plan.resolved.push(Resolution::Align {
                local_id: local.local_id,
                base_modified_at: local.modified_at,
                state: ResolvedState {
                    remote_id: change.remote_id.clone(),
                    modified_at: change.modified_at,
                    payload: local.payload.clone(),
                },
            });
        }
        ConflictResolution::Converged
    } else if change.modified_at > local.modified_at {
        if change.deleted {
            plan.resolved.push(Resolution::Purge {
                local_id: local.local_id,
            });
        } else {
            plan.pulls.push(Pull::Apply {
                local_id: Some(local.local_id),
                base_modified_at: Some(local.modified_at),
                remote: change.clone(),
            });
        }
        ConflictResolution::RemoteWins
    } else {
        let remote_id = local
            .remote_id
            .clone()
            .unwrap_or_else(|| change.remote_id.clone());
        let action = if local.deleted {
            PushAction::Delete { remote_id }
        } else {
            PushAction::Update {
                remote_id,
                payload: local.payload.clone(),
            }
        };
        plan.pushes.push(Push {
            local_id: local.local_id,
            base_modified_at: local.modified_at,
            action,
        });
        ConflictResolution::LocalWins
    };

    plan.conflicts.push(Conflict {
        local_id: local.local_id,
        remote_id: change.remote_id,
        key,
        local_modified_at: local.modified_at,
        remote_modified_at: change.modified_at,
        resolution,
    });
}
