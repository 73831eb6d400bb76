//! Entity adapters: conversion between typed payloads and the flat field
//! form used by local tables and the remote wire.
//!
//! Both directions are total. Encoding never fails; decoding reports a
//! malformed record through [`Error`] so callers can log and skip it.

use crate::payload::{AyahRange, BookmarkLocation, CollectionRef, Payload, Verse};
use crate::{EntityType, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator between ranges in a note's `ranges` column.
pub const RANGE_SEPARATOR: char = ',';

/// A single flat column value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(FieldValue::Null, Into::into)
    }
}

/// Flat, column-named representation of a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Value of a column; `Null` reads as absent.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name).filter(|v| **v != FieldValue::Null)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn integer(&self, name: &str) -> Result<Option<i64>> {
        match self.get(name) {
            None => Ok(None),
            Some(FieldValue::Integer(v)) => Ok(Some(*v)),
            Some(other) => Err(Error::InvalidField {
                field: name.into(),
                reason: format!("expected integer, got {other:?}"),
            }),
        }
    }

    fn text(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(FieldValue::Text(v)) => Ok(Some(v)),
            Some(other) => Err(Error::InvalidField {
                field: name.into(),
                reason: format!("expected text, got {other:?}"),
            }),
        }
    }

    fn required_integer(&self, entity: EntityType, name: &str) -> Result<i64> {
        self.integer(name)?.ok_or_else(|| missing(entity, name))
    }

    fn required_text(&self, entity: EntityType, name: &str) -> Result<&str> {
        self.text(name)?.ok_or_else(|| missing(entity, name))
    }
}

fn missing(entity: EntityType, field: &str) -> Error {
    Error::MissingField {
        entity,
        field: field.into(),
    }
}

impl FromIterator<(String, FieldValue)> for Fields {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Encode a payload into its flat form (toPersisted).
pub fn to_fields(payload: &Payload) -> Fields {
    match payload {
        Payload::PageBookmark { page } | Payload::RecentPage { page } => {
            Fields::new().with("page", i64::from(*page))
        }
        Payload::AyahBookmark { verse } => Fields::new()
            .with("sura", i64::from(verse.sura))
            .with("ayah", i64::from(verse.ayah)),
        Payload::Collection { name } => Fields::new().with("name", name.as_str()),
        Payload::CollectionBookmark {
            collection,
            location,
        } => {
            let fields = match collection {
                CollectionRef::Local(local_id) => Fields::new()
                    .with("collection_local_id", *local_id)
                    .with("collection", FieldValue::Null),
                CollectionRef::Remote(remote_id) => Fields::new()
                    .with("collection_local_id", FieldValue::Null)
                    .with("collection", remote_id.as_str()),
            };
            match location {
                BookmarkLocation::Page(page) => fields
                    .with("location_kind", "page")
                    .with("page", i64::from(*page))
                    .with("sura", FieldValue::Null)
                    .with("ayah", FieldValue::Null),
                BookmarkLocation::Ayah(verse) => fields
                    .with("location_kind", "ayah")
                    .with("page", FieldValue::Null)
                    .with("sura", i64::from(verse.sura))
                    .with("ayah", i64::from(verse.ayah)),
            }
        }
        Payload::Note { body, ranges } => Fields::new()
            .with("body", body.as_str())
            .with("ranges", encode_ranges(ranges)),
    }
}

/// Decode the flat form of `entity` into a payload (fromPersisted).
pub fn from_fields(entity: EntityType, fields: &Fields) -> Result<Payload> {
    match entity {
        EntityType::PageBookmark => Ok(Payload::PageBookmark {
            page: page(entity, fields)?,
        }),
        EntityType::RecentPage => Ok(Payload::RecentPage {
            page: page(entity, fields)?,
        }),
        EntityType::AyahBookmark => Ok(Payload::AyahBookmark {
            verse: verse(entity, fields)?,
        }),
        EntityType::Collection => Ok(Payload::Collection {
            name: fields.text("name")?.unwrap_or_default().to_string(),
        }),
        EntityType::CollectionBookmark => {
            let collection = match fields.text("collection")? {
                Some(remote_id) => CollectionRef::Remote(remote_id.to_string()),
                None => CollectionRef::Local(
                    fields.required_integer(entity, "collection_local_id")?,
                ),
            };
            let location = match fields.required_text(entity, "location_kind")? {
                "page" => BookmarkLocation::Page(page(entity, fields)?),
                "ayah" => BookmarkLocation::Ayah(verse(entity, fields)?),
                other => {
                    return Err(Error::InvalidField {
                        field: "location_kind".into(),
                        reason: format!("unknown location kind {other:?}"),
                    })
                }
            };
            Ok(Payload::CollectionBookmark {
                collection,
                location,
            })
        }
        EntityType::Note => Ok(Payload::Note {
            body: fields.text("body")?.unwrap_or_default().to_string(),
            ranges: parse_ranges(fields.text("ranges")?.unwrap_or_default())?,
        }),
    }
}

fn page(entity: EntityType, fields: &Fields) -> Result<u32> {
    let raw = fields.required_integer(entity, "page")?;
    match u32::try_from(raw) {
        Ok(page) if page > 0 => Ok(page),
        _ => Err(Error::InvalidField {
            field: "page".into(),
            reason: format!("{raw} is not a page number"),
        }),
    }
}

fn verse(entity: EntityType, fields: &Fields) -> Result<Verse> {
    let sura = small(fields.required_integer(entity, "sura")?, "sura")?;
    let ayah = small(fields.required_integer(entity, "ayah")?, "ayah")?;
    Verse::new(sura, ayah)
}

fn small(raw: i64, field: &str) -> Result<u16> {
    u16::try_from(raw).map_err(|_| Error::InvalidField {
        field: field.into(),
        reason: format!("{raw} is out of range"),
    })
}

/// Encode ranges as `"s:a-s:a"` items joined by [`RANGE_SEPARATOR`].
pub fn encode_ranges(ranges: &[AyahRange]) -> String {
    ranges
        .iter()
        .map(|r| format!("{}-{}", r.start, r.end))
        .collect::<Vec<_>>()
        .join(&RANGE_SEPARATOR.to_string())
}

/// Parse the text form written by [`encode_ranges`].
///
/// A range without `-` is a single ayah. Empty text is an empty list.
pub fn parse_ranges(text: &str) -> Result<Vec<AyahRange>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let unparseable = || Error::UnparseableField {
        field: "ranges".into(),
        text: text.to_string(),
    };
    text.split(RANGE_SEPARATOR)
        .map(|item| {
            let item = item.trim();
            let (start, end) = item.split_once('-').unwrap_or((item, item));
            let start = parse_verse(start).ok_or_else(unparseable)?;
            let end = parse_verse(end).ok_or_else(unparseable)?;
            AyahRange::new(start, end).map_err(|_| unparseable())
        })
        .collect()
}

fn parse_verse(text: &str) -> Option<Verse> {
    let (sura, ayah) = text.trim().split_once(':')?;
    Verse::new(sura.trim().parse().ok()?, ayah.trim().parse().ok()?).ok()
}
