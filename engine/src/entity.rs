//! Entity types and their persisted layout.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Resolution of the timestamps stored for an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Millis,
}

impl TimeUnit {
    /// Convert an internal millisecond timestamp to the stored unit.
    pub fn to_stored(self, millis: Timestamp) -> i64 {
        match self {
            TimeUnit::Seconds => millis.div_euclid(1000),
            TimeUnit::Millis => millis,
        }
    }

    /// Convert a stored value back to internal milliseconds.
    pub fn from_stored(self, stored: i64) -> Timestamp {
        match self {
            TimeUnit::Seconds => stored.saturating_mul(1000),
            TimeUnit::Millis => stored,
        }
    }

    /// Drop any precision the stored unit cannot hold.
    pub fn truncate(self, millis: Timestamp) -> Timestamp {
        self.from_stored(self.to_stored(millis))
    }
}

/// Storage type of a payload column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Text,
}

/// A payload column of an entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn int(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Integer,
    }
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Text,
    }
}

/// Every kind of entity the client keeps in sync.
///
/// Each entity type owns one local table with the common envelope
/// (`local_id`, `remote_id`, `deleted`, `dirty`, `created_at`, `modified_at`)
/// followed by its payload columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    PageBookmark,
    AyahBookmark,
    Collection,
    CollectionBookmark,
    Note,
    RecentPage,
}

impl EntityType {
    /// All entity types in sync order.
    pub const ALL: [EntityType; 6] = [
        EntityType::PageBookmark,
        EntityType::AyahBookmark,
        EntityType::Collection,
        EntityType::Note,
        EntityType::RecentPage,
        EntityType::CollectionBookmark,
    ];

    /// Local table name.
    pub fn table(self) -> &'static str {
        match self {
            EntityType::PageBookmark => "page_bookmarks",
            EntityType::AyahBookmark => "ayah_bookmarks",
            EntityType::Collection => "collections",
            EntityType::CollectionBookmark => "collection_bookmarks",
            EntityType::Note => "notes",
            EntityType::RecentPage => "recent_pages",
        }
    }

    /// Resolution of `created_at`/`modified_at` in the local table.
    pub fn time_unit(self) -> TimeUnit {
        match self {
            EntityType::Note | EntityType::RecentPage => TimeUnit::Millis,
            _ => TimeUnit::Seconds,
        }
    }

    /// Payload columns, in table order.
    pub fn columns(self) -> &'static [Column] {
        const PAGE: &[Column] = &[int("page")];
        const AYAH: &[Column] = &[int("sura"), int("ayah")];
        const COLLECTION: &[Column] = &[text("name")];
        const COLLECTION_BOOKMARK: &[Column] = &[
            int("collection_local_id"),
            text("location_kind"),
            int("page"),
            int("sura"),
            int("ayah"),
        ];
        const NOTE: &[Column] = &[text("body"), text("ranges")];

        match self {
            EntityType::PageBookmark | EntityType::RecentPage => PAGE,
            EntityType::AyahBookmark => AYAH,
            EntityType::Collection => COLLECTION,
            EntityType::CollectionBookmark => COLLECTION_BOOKMARK,
            EntityType::Note => NOTE,
        }
    }

    /// Entity types whose conflict key depends on this type's remote ids.
    ///
    /// These must be reconciled after this type within a pass.
    pub fn dependents(self) -> &'static [EntityType] {
        match self {
            EntityType::Collection => &[EntityType::CollectionBookmark],
            _ => &[],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
