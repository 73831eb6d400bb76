//! Inspect the local sync state: pending mutations and cursors per entity
//! type.

use mushaf_engine::EntityType;
use mushaf_sync::{telemetry, LocalStore, SqliteStore, SyncConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init()?;

    let config = SyncConfig::from_env()?;
    let store = SqliteStore::open(&config.database_url).await?;

    for entity in EntityType::ALL {
        let live = store.records(entity).await?.len();
        let pending = store.pending(entity).await?.len();
        let cursor = store.cursor(entity).await?;
        info!(
            entity = %entity,
            live,
            pending,
            cursor = cursor.as_deref().unwrap_or("-"),
            "Local state"
        );
    }

    store.close().await;
    Ok(())
}
