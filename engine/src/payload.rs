//! Typed payloads for every entity type, and the conflict keys derived from
//! them.

use crate::{EntityType, Error, LocalId, RemoteId, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of ayat in each sura, indexed by `sura - 1`.
const AYAH_COUNTS: [u16; 114] = [
    7, 286, 200, 176, 120, 165, 206, 75, 129, 109, 123, 111, 43, 52, 99, 128, 111, 110, 98, 135,
    112, 78, 118, 64, 77, 227, 93, 88, 69, 60, 34, 30, 73, 54, 45, 83, 182, 88, 75, 85, 54, 53, 89,
    59, 37, 35, 38, 29, 18, 45, 60, 49, 62, 55, 78, 96, 29, 22, 24, 13, 14, 11, 11, 18, 12, 12, 30,
    52, 52, 44, 28, 28, 20, 56, 40, 31, 50, 40, 46, 42, 29, 19, 36, 25, 22, 17, 19, 26, 30, 20, 15,
    21, 11, 8, 8, 19, 5, 8, 8, 11, 11, 8, 3, 9, 5, 4, 7, 3, 6, 3, 5, 4, 5, 6,
];

/// A single ayah, addressed by sura and ayah number (both 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Verse {
    pub sura: u16,
    pub ayah: u16,
}

impl Verse {
    /// Create a verse, rejecting addresses outside the mushaf.
    pub fn new(sura: u16, ayah: u16) -> Result<Self> {
        let Some(count) = sura
            .checked_sub(1)
            .and_then(|i| AYAH_COUNTS.get(usize::from(i)))
        else {
            return Err(Error::InvalidField {
                field: "sura".into(),
                reason: format!("{sura} is not in 1..=114"),
            });
        };
        if ayah == 0 || ayah > *count {
            return Err(Error::InvalidField {
                field: "ayah".into(),
                reason: format!("sura {sura} has {count} ayat, got {ayah}"),
            });
        }
        Ok(Self { sura, ayah })
    }
}

impl fmt::Display for Verse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sura, self.ayah)
    }
}

/// An inclusive span of ayat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AyahRange {
    pub start: Verse,
    pub end: Verse,
}

impl AyahRange {
    /// Create a range; `start` must not come after `end`.
    pub fn new(start: Verse, end: Verse) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidField {
                field: "ranges".into(),
                reason: format!("range starts at {start} after it ends at {end}"),
            });
        }
        Ok(Self { start, end })
    }

    /// A range covering exactly one ayah.
    pub fn single(verse: Verse) -> Self {
        Self {
            start: verse,
            end: verse,
        }
    }
}

/// Where a bookmark points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookmarkLocation {
    Page(u32),
    Ayah(Verse),
}

impl fmt::Display for BookmarkLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookmarkLocation::Page(page) => write!(f, "page {page}"),
            BookmarkLocation::Ayah(verse) => write!(f, "ayah {verse}"),
        }
    }
}

/// Reference from a collection bookmark to its collection.
///
/// Locally created junctions point at the collection's `local_id`. Once the
/// collection has been pushed the reference is resolved to its remote id,
/// which is the only form the server understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionRef {
    Local(LocalId),
    Remote(RemoteId),
}

/// The type-specific part of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    PageBookmark {
        page: u32,
    },
    AyahBookmark {
        verse: Verse,
    },
    Collection {
        name: String,
    },
    CollectionBookmark {
        collection: CollectionRef,
        location: BookmarkLocation,
    },
    Note {
        body: String,
        ranges: Vec<AyahRange>,
    },
    RecentPage {
        page: u32,
    },
}

impl Payload {
    /// The entity type this payload belongs to.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Payload::PageBookmark { .. } => EntityType::PageBookmark,
            Payload::AyahBookmark { .. } => EntityType::AyahBookmark,
            Payload::Collection { .. } => EntityType::Collection,
            Payload::CollectionBookmark { .. } => EntityType::CollectionBookmark,
            Payload::Note { .. } => EntityType::Note,
            Payload::RecentPage { .. } => EntityType::RecentPage,
        }
    }

    /// Fail unless this payload belongs to `expected`.
    pub fn expect_type(&self, expected: EntityType) -> Result<()> {
        let actual = self.entity_type();
        if actual == expected {
            Ok(())
        } else {
            Err(Error::PayloadMismatch { expected, actual })
        }
    }

    /// Content-derived identity used to match local and remote records.
    ///
    /// Returns `None` when the payload has no usable identity: unnamed
    /// collections, notes, and collection bookmarks whose collection has not
    /// been synced yet.
    pub fn conflict_key(&self) -> Option<ConflictKey> {
        match self {
            Payload::PageBookmark { page } | Payload::RecentPage { page } => {
                Some(ConflictKey::Page(*page))
            }
            Payload::AyahBookmark { verse } => Some(ConflictKey::Ayah(*verse)),
            Payload::Collection { name } => {
                let name = name.trim();
                (!name.is_empty()).then(|| ConflictKey::Name(name.to_string()))
            }
            Payload::CollectionBookmark {
                collection: CollectionRef::Remote(collection),
                location,
            } => Some(ConflictKey::CollectionEntry {
                collection: collection.clone(),
                location: *location,
            }),
            Payload::CollectionBookmark {
                collection: CollectionRef::Local(_),
                ..
            } => None,
            Payload::Note { .. } => None,
        }
    }

    /// Whether two stored payloads describe the same logical entity.
    ///
    /// Collection bookmarks compare their collection reference as stored, so
    /// junctions of a collection without a remote id are covered too.
    pub fn same_identity(&self, other: &Payload) -> bool {
        match (self, other) {
            (
                Payload::CollectionBookmark {
                    collection: a,
                    location: la,
                },
                Payload::CollectionBookmark {
                    collection: b,
                    location: lb,
                },
            ) => a == b && la == lb,
            _ => self.conflict_key().is_some() && self.conflict_key() == other.conflict_key(),
        }
    }

    /// The collection a junction points at, if this is a collection bookmark.
    pub fn collection_ref(&self) -> Option<&CollectionRef> {
        match self {
            Payload::CollectionBookmark { collection, .. } => Some(collection),
            _ => None,
        }
    }
}

/// Identity of a logical entity across devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKey {
    Page(u32),
    Ayah(Verse),
    Name(String),
    CollectionEntry {
        collection: RemoteId,
        location: BookmarkLocation,
    },
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKey::Page(page) => write!(f, "page {page}"),
            ConflictKey::Ayah(verse) => write!(f, "ayah {verse}"),
            ConflictKey::Name(name) => write!(f, "name {name:?}"),
            ConflictKey::CollectionEntry {
                collection,
                location,
            } => write!(f, "{location} in collection {collection}"),
        }
    }
}
