//! SqliteStore behaviour against an in-memory database.

mod common;

use common::{device, device_with, FakeRemote};
use mushaf_engine::{
    AyahRange, BookmarkLocation, CollectionRef, EntityType, Error as EngineError, LedgerWrite,
    Payload, RemoteEntity, ResolvedState, Verse,
};
use mushaf_sync::{LocalStore, SqliteStore, StaticTokenProvider, SyncError};
use pretty_assertions::assert_eq;
use std::sync::Arc;

async fn open() -> SqliteStore {
    SqliteStore::open("sqlite::memory:").await.unwrap()
}

fn collection(name: &str) -> Payload {
    Payload::Collection { name: name.into() }
}

// ============================================================================
// User operations
// ============================================================================

#[tokio::test]
async fn create_update_delete_lifecycle() {
    let store = open().await;
    let created = store
        .create(Payload::PageBookmark { page: 5 }, 1_706_745_600_999)
        .await
        .unwrap();
    // Bookmarks keep whole seconds
    assert_eq!(created.modified_at, 1_706_745_600_000);
    assert!(created.is_pending());

    let updated = store
        .update(
            EntityType::PageBookmark,
            created.local_id,
            Payload::PageBookmark { page: 6 },
            1_706_745_700_000,
        )
        .await
        .unwrap();
    assert_eq!(updated.payload, Payload::PageBookmark { page: 6 });
    assert_eq!(updated.created_at, 1_706_745_600_000);

    store
        .delete(EntityType::PageBookmark, created.local_id, 1_706_745_800_000)
        .await
        .unwrap();
    let tombstone = store
        .get(EntityType::PageBookmark, created.local_id)
        .await
        .unwrap()
        .unwrap();
    assert!(tombstone.deleted);
    assert!(store.records(EntityType::PageBookmark).await.unwrap().is_empty());
    assert_eq!(store.pending(EntityType::PageBookmark).await.unwrap(), vec![tombstone]);

    let err = store
        .delete(EntityType::PageBookmark, created.local_id, 1_706_745_900_000)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(EngineError::OperationOnDeleted { .. })));
}

#[tokio::test]
async fn notes_keep_milliseconds_and_ranges() {
    let store = open().await;
    let payload = Payload::Note {
        body: "Ayat al-Kursi".into(),
        ranges: vec![
            AyahRange::single(Verse::new(2, 255).unwrap()),
            AyahRange::new(Verse::new(2, 284).unwrap(), Verse::new(2, 286).unwrap()).unwrap(),
        ],
    };
    let created = store.create(payload.clone(), 1_706_745_600_123).await.unwrap();

    let stored = store
        .get(EntityType::Note, created.local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.modified_at, 1_706_745_600_123);
    assert_eq!(stored.payload, payload);
}

#[tokio::test]
async fn local_ids_are_never_reused() {
    let store = open().await;
    let first = store
        .create(Payload::RecentPage { page: 1 }, 1_000)
        .await
        .unwrap();
    store
        .apply(
            EntityType::RecentPage,
            vec![LedgerWrite::Purge {
                local_id: first.local_id,
            }],
            None,
        )
        .await
        .unwrap();

    let second = store
        .create(Payload::RecentPage { page: 2 }, 2_000)
        .await
        .unwrap();
    assert!(second.local_id > first.local_id);
}

#[tokio::test]
async fn update_rejects_wrong_payload_type() {
    let store = open().await;
    let record = store
        .create(Payload::PageBookmark { page: 5 }, 1_000)
        .await
        .unwrap();
    let err = store
        .update(EntityType::PageBookmark, record.local_id, collection("x"), 2_000)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(EngineError::PayloadMismatch { .. })));
}

#[tokio::test]
async fn create_refuses_duplicate_content() {
    let store = open().await;
    let first = store.create(collection("Hifz"), 1_000).await.unwrap();
    let err = store.create(collection(" Hifz "), 2_000).await.unwrap_err();
    assert!(matches!(
        err,
        SyncError::Engine(EngineError::AlreadyExists {
            entity: EntityType::Collection,
            local_id
        }) if local_id == first.local_id
    ));

    let entry = Payload::CollectionBookmark {
        collection: CollectionRef::Local(first.local_id),
        location: BookmarkLocation::Page(2),
    };
    store.create(entry.clone(), 3_000).await.unwrap();
    let err = store.create(entry, 4_000).await.unwrap_err();
    assert!(matches!(err, SyncError::Engine(EngineError::AlreadyExists { .. })));
    assert_eq!(store.records(EntityType::CollectionBookmark).await.unwrap().len(), 1);
}

// ============================================================================
// Applying writes
// ============================================================================

#[tokio::test]
async fn apply_is_all_or_nothing() {
    let store = open().await;
    store
        .apply(
            EntityType::PageBookmark,
            vec![LedgerWrite::Upsert {
                remote: RemoteEntity::live("r1", Payload::PageBookmark { page: 1 }, 1_000),
            }],
            Some("1".into()),
        )
        .await
        .unwrap();
    let synced = store
        .by_remote_ids(EntityType::PageBookmark, &["r1".into()])
        .await
        .unwrap()
        .remove(0);

    let err = store
        .apply(
            EntityType::PageBookmark,
            vec![
                LedgerWrite::Upsert {
                    remote: RemoteEntity::live("r2", Payload::PageBookmark { page: 2 }, 2_000),
                },
                LedgerWrite::Commit {
                    local_id: synced.local_id,
                    base_modified_at: synced.modified_at,
                    state: ResolvedState {
                        remote_id: "other".into(),
                        modified_at: 3_000,
                        payload: Payload::PageBookmark { page: 1 },
                    },
                },
            ],
            Some("2".into()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Engine(EngineError::RemoteIdChanged { .. })));

    assert!(store
        .by_remote_ids(EntityType::PageBookmark, &["r2".into()])
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        store.cursor(EntityType::PageBookmark).await.unwrap().as_deref(),
        Some("1")
    );
}

#[tokio::test]
async fn commit_after_user_edit_is_stale() {
    let store = open().await;
    let record = store
        .create(Payload::PageBookmark { page: 5 }, 1_000_000)
        .await
        .unwrap();
    store
        .update(
            EntityType::PageBookmark,
            record.local_id,
            Payload::PageBookmark { page: 8 },
            2_000_000,
        )
        .await
        .unwrap();

    let report = store
        .apply(
            EntityType::PageBookmark,
            vec![LedgerWrite::Commit {
                local_id: record.local_id,
                base_modified_at: record.modified_at,
                state: ResolvedState {
                    remote_id: "r1".into(),
                    modified_at: 1_500_000,
                    payload: Payload::PageBookmark { page: 5 },
                },
            }],
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.stale, vec![record.local_id]);
    assert_eq!(report.applied, 0);

    let current = store
        .get(EntityType::PageBookmark, record.local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.payload, Payload::PageBookmark { page: 8 });
    assert!(current.is_pending());
}

#[tokio::test]
async fn upsert_updates_by_remote_id() {
    let store = open().await;
    for (page, at) in [(1, 1_000), (2, 2_000)] {
        store
            .apply(
                EntityType::RecentPage,
                vec![LedgerWrite::Upsert {
                    remote: RemoteEntity::live("r1", Payload::RecentPage { page }, at),
                }],
                None,
            )
            .await
            .unwrap();
    }
    let records = store.records(EntityType::RecentPage).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload, Payload::RecentPage { page: 2 });
    assert_eq!(records[0].remote_id.as_deref(), Some("r1"));
    assert!(!records[0].is_pending());
}

// ============================================================================
// Collections and their bookmarks
// ============================================================================

#[tokio::test]
async fn junction_refs_resolve_and_cascade() {
    let store = open().await;
    store
        .apply(
            EntityType::Collection,
            vec![LedgerWrite::Upsert {
                remote: RemoteEntity::live("c1", collection("Favourites"), 1_000),
            }],
            None,
        )
        .await
        .unwrap();
    let report = store
        .apply(
            EntityType::CollectionBookmark,
            vec![
                LedgerWrite::Upsert {
                    remote: RemoteEntity::live(
                        "j1",
                        Payload::CollectionBookmark {
                            collection: CollectionRef::Remote("c1".into()),
                            location: BookmarkLocation::Page(5),
                        },
                        1_000,
                    ),
                },
                LedgerWrite::Upsert {
                    remote: RemoteEntity::live(
                        "j2",
                        Payload::CollectionBookmark {
                            collection: CollectionRef::Remote("missing".into()),
                            location: BookmarkLocation::Page(6),
                        },
                        1_000,
                    ),
                },
            ],
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.malformed, vec!["j2".to_string()]);

    let junctions = store.records(EntityType::CollectionBookmark).await.unwrap();
    assert_eq!(junctions.len(), 1);
    assert_eq!(
        junctions[0].payload.collection_ref(),
        Some(&CollectionRef::Remote("c1".into()))
    );

    store
        .apply(
            EntityType::Collection,
            vec![LedgerWrite::PurgeRemote {
                remote_id: "c1".into(),
            }],
            None,
        )
        .await
        .unwrap();
    assert!(store.records(EntityType::Collection).await.unwrap().is_empty());
    assert!(store
        .records(EntityType::CollectionBookmark)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn junction_needs_a_live_collection() {
    let store = open().await;
    let missing = store
        .create(
            Payload::CollectionBookmark {
                collection: CollectionRef::Local(99),
                location: BookmarkLocation::Page(1),
            },
            1_000,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        missing,
        SyncError::Engine(EngineError::RecordNotFound {
            entity: EntityType::Collection,
            local_id: 99
        })
    ));

    let list = store.create(collection("Old"), 1_000).await.unwrap();
    store
        .delete(EntityType::Collection, list.local_id, 2_000)
        .await
        .unwrap();
    let deleted = store
        .create(
            Payload::CollectionBookmark {
                collection: CollectionRef::Local(list.local_id),
                location: BookmarkLocation::Page(1),
            },
            3_000,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        deleted,
        SyncError::Engine(EngineError::OperationOnDeleted { .. })
    ));
}

// ============================================================================
// Sync through SQLite
// ============================================================================

#[tokio::test]
async fn sqlite_device_converges_with_memory_device() {
    let remote = FakeRemote::new();
    let phone = device_with(
        &remote,
        Arc::new(open().await),
        Arc::new(StaticTokenProvider::new("token")),
    );
    let tablet = device(&remote);

    let favourites = phone.store.create(collection("Favourites"), 1_000).await.unwrap();
    phone
        .store
        .create(
            Payload::CollectionBookmark {
                collection: CollectionRef::Local(favourites.local_id),
                location: BookmarkLocation::Ayah(Verse::new(36, 1).unwrap()),
            },
            1_000,
        )
        .await
        .unwrap();
    tablet
        .store
        .create(Payload::PageBookmark { page: 42 }, 1_000)
        .await
        .unwrap();

    assert!(phone.sync.run_pass().await.unwrap().is_success());
    assert!(tablet.sync.run_pass().await.unwrap().is_success());
    assert!(phone.sync.run_pass().await.unwrap().is_success());

    for entity in EntityType::ALL {
        let mut on_phone: Vec<_> = phone
            .store
            .records(entity)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        let mut on_tablet: Vec<_> = tablet
            .store
            .records(entity)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.payload)
            .collect();
        on_phone.sort_by_key(|p| format!("{p:?}"));
        on_tablet.sort_by_key(|p| format!("{p:?}"));
        assert_eq!(on_phone, on_tablet, "{entity}");
        assert!(phone.store.pending(entity).await.unwrap().is_empty(), "{entity}");
    }

    // A further pass has nothing left to do
    let calls = remote.calls();
    let report = phone.sync.run_pass().await.unwrap();
    assert_eq!(remote.calls().pushes(), calls.pushes());
    assert!(report.entities.iter().all(|r| r.applied == 0));
}
