//! Snapshot types for persisting and restoring ledger state.
//!
//! Snapshots are the bridge between the in-memory [`Ledger`] and whatever
//! persistence the host provides. They serialize deterministically so two
//! equal ledgers always produce identical JSON.

use crate::ledger::{Ledger, Table};
use crate::record::LocalRecord;
use crate::{error::Result, Cursor, EntityType, Error, LocalId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Next local id the ledger will hand out
    pub next_local_id: LocalId,
    /// All records per entity type, tombstones included, in local id order
    pub tables: BTreeMap<EntityType, Vec<LocalRecord>>,
    /// Delta cursor per entity type
    pub cursors: BTreeMap<EntityType, Cursor>,
}

impl LedgerSnapshot {
    /// Count total records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Count records with a pending mutation.
    pub fn pending_count(&self) -> usize {
        self.tables
            .values()
            .flatten()
            .filter(|r| r.is_pending())
            .count()
    }

    /// Check internal consistency.
    ///
    /// Every record must sit in the table of its payload type, local ids must
    /// be unique and below `next_local_id`, and remote ids unique per table.
    pub fn validate(&self) -> Result<()> {
        let mut local_ids = BTreeSet::new();
        for (entity, records) in &self.tables {
            let mut remote_ids = BTreeSet::new();
            for record in records {
                record.payload.expect_type(*entity)?;
                if !local_ids.insert(record.local_id) {
                    return Err(Error::InvalidSnapshot(format!(
                        "local id {} appears more than once",
                        record.local_id
                    )));
                }
                if record.local_id >= self.next_local_id {
                    return Err(Error::InvalidSnapshot(format!(
                        "local id {} is not below next local id {}",
                        record.local_id, self.next_local_id
                    )));
                }
                if let Some(remote_id) = &record.remote_id {
                    if !remote_ids.insert(remote_id.as_str()) {
                        return Err(Error::RemoteIdTaken(remote_id.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}

impl Ledger {
    /// Export the current ledger state as a snapshot.
    pub fn export_state(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_local_id: self.next_local_id(),
            tables: EntityType::ALL
                .iter()
                .filter_map(|entity| {
                    let records: Vec<_> = self.table(*entity)?.all_records().cloned().collect();
                    (!records.is_empty()).then_some((*entity, records))
                })
                .collect(),
            cursors: self.cursors().clone(),
        }
    }

    /// Rebuild a ledger from a snapshot.
    pub fn import_state(snapshot: LedgerSnapshot) -> Result<Self> {
        snapshot.validate()?;
        let tables = snapshot
            .tables
            .into_iter()
            .map(|(entity, records)| (entity, Table::from_records(records)))
            .collect();
        Ok(Ledger::from_parts(tables, snapshot.cursors, snapshot.next_local_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BookmarkLocation, CollectionRef, LedgerWrite, Payload, ResolvedState};

    fn sample_ledger() -> Ledger {
        let mut ledger = Ledger::new();
        let hifz = ledger
            .create(Payload::Collection { name: "Hifz".into() }, 1_000)
            .unwrap();
        ledger
            .create(
                Payload::CollectionBookmark {
                    collection: CollectionRef::Local(hifz.local_id),
                    location: BookmarkLocation::Page(77),
                },
                1_000,
            )
            .unwrap();
        ledger
            .apply(
                EntityType::Collection,
                vec![LedgerWrite::Commit {
                    local_id: hifz.local_id,
                    base_modified_at: 1_000,
                    state: ResolvedState {
                        remote_id: "c1".into(),
                        modified_at: 1_000,
                        payload: Payload::Collection { name: "Hifz".into() },
                    },
                }],
                Some("cursor-1".into()),
            )
            .unwrap();
        ledger
    }

    #[test]
    fn export_import_roundtrip() {
        let ledger = sample_ledger();
        let snapshot = ledger.export_state();
        assert_eq!(snapshot.record_count(), 2);
        assert_eq!(snapshot.pending_count(), 1);

        let json = snapshot.to_json().unwrap();
        let restored = Ledger::import_state(LedgerSnapshot::from_json(&json).unwrap()).unwrap();

        assert_eq!(restored.export_state(), snapshot);
        assert_eq!(
            restored.cursor(EntityType::Collection),
            Some(&"cursor-1".to_string())
        );
        assert_eq!(
            restored.pending(EntityType::CollectionBookmark)[0]
                .payload
                .collection_ref(),
            Some(&CollectionRef::Remote("c1".into()))
        );
    }

    #[test]
    fn restored_ledger_keeps_allocating_fresh_ids() {
        let ledger = sample_ledger();
        let mut restored = Ledger::import_state(ledger.export_state()).unwrap();
        let record = restored
            .create(Payload::PageBookmark { page: 1 }, 2_000)
            .unwrap();
        assert_eq!(record.local_id, 3);
    }

    #[test]
    fn deterministic_serialization() {
        let a = sample_ledger().export_state().to_json().unwrap();
        let b = sample_ledger().export_state().to_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reject_record_in_wrong_table() {
        let mut snapshot = sample_ledger().export_state();
        let records = snapshot.tables.remove(&EntityType::Collection).unwrap();
        snapshot.tables.insert(EntityType::Note, records);
        assert!(matches!(
            snapshot.validate(),
            Err(Error::PayloadMismatch { .. })
        ));
    }

    #[test]
    fn reject_duplicate_local_ids() {
        let mut snapshot = sample_ledger().export_state();
        let mut copy = snapshot.tables[&EntityType::Collection][0].clone();
        copy.remote_id = None;
        snapshot
            .tables
            .get_mut(&EntityType::Collection)
            .unwrap()
            .push(copy);
        assert!(matches!(
            snapshot.validate(),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "nextLocalId": 1,
            "tables": {},
            "cursors": {}
        }"#;

        let result = LedgerSnapshot::from_json(json);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }
}
