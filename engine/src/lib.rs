//! # Mushaf Engine
//!
//! The deterministic core of the mushaf sync client.
//!
//! This crate holds everything about synchronization that can be decided
//! without I/O: the typed payloads of each entity, their flat persisted form,
//! the mutation-tracked record envelope, an in-memory ledger, and the
//! reconciliation algorithm that turns a local pending set and a remote delta
//! into a plan of pushes, pulls and local writes.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches a database, the network or a clock
//! - **Deterministic**: the same inputs always produce the same plan
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Every entity table shares one envelope ([`LocalRecord`]): a `local_id`
//! that never changes, a `remote_id` set once by the first successful sync, a
//! tombstone flag, a dirty flag and millisecond timestamps truncated to the
//! entity's stored resolution. The pending mutation ([`Mutation`]) is derived
//! from those flags, never stored.
//!
//! ### Conflict keys
//!
//! Records created on two devices have different ids but may describe the
//! same thing (a bookmark on page 5). [`Payload::conflict_key`] derives that
//! identity from content so both sides can be matched.
//!
//! ### Reconciliation
//!
//! [`reconcile`] pairs local and remote records, resolves each pair by
//! timestamp (remote strictly newer wins) and returns a [`ReconcilePlan`].
//! The caller executes pushes against the server and applies the resulting
//! [`LedgerWrite`]s in one transaction.
//!
//! ## Quick Start
//!
//! ```rust
//! use mushaf_engine::{reconcile, EntityType, Ledger, Payload, RemoteEntity};
//!
//! let mut ledger = Ledger::new();
//! ledger.create(Payload::PageBookmark { page: 5 }, 100_000).unwrap();
//!
//! let delta = vec![RemoteEntity::live("r1", Payload::PageBookmark { page: 5 }, 200_000)];
//! let plan = reconcile(
//!     EntityType::PageBookmark,
//!     ledger.pending(EntityType::PageBookmark),
//!     delta,
//! )
//! .unwrap();
//!
//! // Both sides already agree: no network call needed.
//! assert!(plan.pushes.is_empty());
//! ledger
//!     .apply(EntityType::PageBookmark, plan.local_writes(), Some("c1".into()))
//!     .unwrap();
//! assert!(ledger.pending(EntityType::PageBookmark).is_empty());
//! ```

pub mod adapter;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod payload;
pub mod reconcile;
pub mod record;
pub mod snapshot;

// Re-export main types at crate root
pub use adapter::{FieldValue, Fields};
pub use entity::{Column, ColumnKind, EntityType, TimeUnit};
pub use error::{Error, Result};
pub use ledger::{ApplyReport, Ledger, LedgerWrite};
pub use payload::{AyahRange, BookmarkLocation, CollectionRef, ConflictKey, Payload, Verse};
pub use reconcile::{
    decode_delta, discard_echoes, reconcile, Conflict, ConflictResolution, Pull, Push,
    PushAction, PushOutcome, ReconcilePlan, Resolution,
};
pub use record::{
    LocalRecord, Mutation, RemoteChange, RemoteEntity, RemoteRecord, ResolvedState,
};
pub use snapshot::{LedgerSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type LocalId = i64;
pub type RemoteId = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
/// Opaque position in the server's change feed
pub type Cursor = String;
