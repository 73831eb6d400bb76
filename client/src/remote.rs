//! The remote service as seen by the pass.
//!
//! Transport and wire format live behind [`RemoteApi`]. Records cross this
//! boundary in flat [`Fields`] form; decoding and validation happen in the
//! engine so a malformed record can be skipped instead of failing the pass.

use crate::auth::AccessToken;
use async_trait::async_trait;
use mushaf_engine::{Cursor, EntityType, Fields, RemoteChange, RemoteId, RemoteRecord};
use serde::{Deserialize, Serialize};

/// Changes reported by the server since a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub changes: Vec<RemoteChange>,
    /// Cursor to pass as `since` next time
    pub cursor: Cursor,
}

/// Failure of a single remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("access token rejected")]
    Unauthorized,

    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("remote record not found: {0}")]
    NotFound(RemoteId),
}

impl RemoteError {
    /// True when retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Unauthorized)
    }
}

/// The remote sync API.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Changes of one entity type since `since` (everything when `None`).
    async fn fetch_delta(
        &self,
        token: &AccessToken,
        entity: EntityType,
        since: Option<&str>,
    ) -> Result<Delta, RemoteError>;

    /// Create a record; the server assigns its remote id.
    async fn push_create(
        &self,
        token: &AccessToken,
        entity: EntityType,
        fields: &Fields,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Overwrite the record with `remote_id`.
    async fn push_update(
        &self,
        token: &AccessToken,
        entity: EntityType,
        remote_id: &str,
        fields: &Fields,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Delete the record with `remote_id`.
    async fn push_delete(
        &self,
        token: &AccessToken,
        entity: EntityType,
        remote_id: &str,
    ) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_wire_format() {
        let json = r#"{
            "changes": [
                {"remoteId": "r1", "kind": "created", "fields": {"page": 5}, "modifiedAt": 1000},
                {"remoteId": "r2", "kind": "deleted", "modifiedAt": 2000}
            ],
            "cursor": "abc"
        }"#;
        let delta: Delta = serde_json::from_str(json).unwrap();
        assert_eq!(delta.changes.len(), 2);
        assert_eq!(delta.cursor, "abc");
        assert_eq!(
            delta.changes[0].fields,
            Fields::new().with("page", 5_i64)
        );
    }

    #[test]
    fn transient_errors() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(!RemoteError::NotFound("r1".into()).is_transient());
        assert!(!RemoteError::Rejected {
            status: 422,
            message: "bad".into()
        }
        .is_transient());
    }
}
