//! SQLite-backed store.
//!
//! One table per entity type, shaped by [`EntityType::columns`]. Junctions
//! reference their collection through a foreign key, so purging a collection
//! removes its bookmarks in the same statement.

use super::LocalStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use mushaf_engine::adapter::{from_fields, to_fields};
use mushaf_engine::{
    ApplyReport, CollectionRef, ColumnKind, Cursor, EntityType, Error as EngineError, FieldValue,
    Fields, LedgerWrite, LocalId, LocalRecord, Payload, RemoteId, ResolvedState, Timestamp,
};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const BOOKKEEPING: &str = "local_id, remote_id, deleted, dirty, created_at, modified_at";
const PENDING: &str = "deleted = 1 OR dirty = 1 OR remote_id IS NULL";

/// Ledger persisted in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and run migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // SQLite has a single writer, and an in-memory database lives only as
        // long as its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!(url, "Local store ready");

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn create(&self, payload: Payload, now: Timestamp) -> Result<LocalRecord> {
        let mut tx = self.pool.begin().await?;
        let payload = localize_user(&mut tx, payload).await?;
        ensure_unique(&mut tx, &payload, None).await?;
        let local_id = allocate_id(&mut tx).await?;
        let mut record = LocalRecord::new(local_id, payload, now);
        save(&mut tx, &record).await?;
        resolve_refs(&mut tx, std::slice::from_mut(&mut record)).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn update(
        &self,
        entity: EntityType,
        local_id: LocalId,
        payload: Payload,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        payload.expect_type(entity)?;
        let mut tx = self.pool.begin().await?;
        let mut record = live_record(&mut tx, entity, local_id).await?;
        let payload = localize_user(&mut tx, payload).await?;
        ensure_unique(&mut tx, &payload, Some(local_id)).await?;
        record.update_payload(payload, now);
        save(&mut tx, &record).await?;
        resolve_refs(&mut tx, std::slice::from_mut(&mut record)).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn delete(
        &self,
        entity: EntityType,
        local_id: LocalId,
        now: Timestamp,
    ) -> Result<LocalRecord> {
        let mut tx = self.pool.begin().await?;
        let mut record = live_record(&mut tx, entity, local_id).await?;
        record.mark_deleted(now);
        save(&mut tx, &record).await?;
        resolve_refs(&mut tx, std::slice::from_mut(&mut record)).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, entity: EntityType, local_id: LocalId) -> Result<Option<LocalRecord>> {
        let mut conn = self.pool.acquire().await?;
        let mut records = fetch(&mut conn, entity, "local_id = ?", &[local_id.into()]).await?;
        resolve_refs(&mut conn, &mut records).await?;
        Ok(records.into_iter().next())
    }

    async fn records(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        let mut conn = self.pool.acquire().await?;
        let mut records = fetch(&mut conn, entity, "deleted = 0", &[]).await?;
        resolve_refs(&mut conn, &mut records).await?;
        Ok(records)
    }

    async fn pending(&self, entity: EntityType) -> Result<Vec<LocalRecord>> {
        let mut conn = self.pool.acquire().await?;
        let mut records = fetch(&mut conn, entity, PENDING, &[]).await?;
        resolve_refs(&mut conn, &mut records).await?;
        Ok(records)
    }

    async fn by_remote_ids(
        &self,
        entity: EntityType,
        remote_ids: &[RemoteId],
    ) -> Result<Vec<LocalRecord>> {
        if remote_ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!("remote_id IN ({})", vec!["?"; remote_ids.len()].join(", "));
        let params: Vec<FieldValue> = remote_ids.iter().map(|id| id.as_str().into()).collect();

        let mut conn = self.pool.acquire().await?;
        let mut records = fetch(&mut conn, entity, &filter, &params).await?;
        resolve_refs(&mut conn, &mut records).await?;
        Ok(records)
    }

    async fn cursor(&self, entity: EntityType) -> Result<Option<Cursor>> {
        let cursor =
            sqlx::query_scalar::<_, String>("SELECT cursor FROM sync_cursors WHERE entity = ?")
                .bind(entity.table())
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor)
    }

    async fn apply(
        &self,
        entity: EntityType,
        writes: Vec<LedgerWrite>,
        cursor: Option<Cursor>,
    ) -> Result<ApplyReport> {
        let mut tx = self.pool.begin().await?;
        let mut report = ApplyReport::default();
        for write in writes {
            apply_one(&mut tx, entity, write, &mut report).await?;
        }
        if let Some(cursor) = cursor {
            sqlx::query(
                r#"
                INSERT INTO sync_cursors (entity, cursor)
                VALUES (?, ?)
                ON CONFLICT (entity) DO UPDATE SET cursor = excluded.cursor
                "#,
            )
            .bind(entity.table())
            .bind(cursor)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(
            entity = %entity,
            applied = report.applied,
            stale = report.stale.len(),
            malformed = report.malformed.len(),
            "Writes applied"
        );
        Ok(report)
    }
}

async fn apply_one(
    conn: &mut SqliteConnection,
    entity: EntityType,
    write: LedgerWrite,
    report: &mut ApplyReport,
) -> Result<()> {
    match write {
        LedgerWrite::Commit {
            local_id,
            base_modified_at,
            state,
        } => {
            state.payload.expect_type(entity)?;
            let payload = match localize_remote(conn, state.payload).await {
                Ok(payload) => payload,
                Err(SyncError::Engine(e)) if e.is_malformed_record() => {
                    report.malformed.push(state.remote_id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let state = ResolvedState { payload, ..state };

            let Some(mut record) = find_by_id(conn, entity, local_id).await? else {
                report.stale.push(local_id);
                return Ok(());
            };
            if record.modified_at != base_modified_at {
                report.stale.push(local_id);
                return Ok(());
            }
            if let Some(current) = &record.remote_id {
                if current != &state.remote_id {
                    return Err(EngineError::RemoteIdChanged {
                        entity,
                        local_id,
                        current: current.clone(),
                        requested: state.remote_id,
                    }
                    .into());
                }
            }
            if let Some(other) = find_by_remote_id(conn, entity, &state.remote_id).await? {
                if other.local_id != local_id {
                    return Err(EngineError::RemoteIdTaken(state.remote_id).into());
                }
            }
            record.resolve(state);
            save(conn, &record).await?;
            report.applied += 1;
        }
        LedgerWrite::Purge { local_id } => {
            if purge(conn, entity, local_id).await? {
                report.applied += 1;
            }
        }
        LedgerWrite::Upsert { remote } => {
            let Some(state) = remote.resolved_state() else {
                return purge_remote(conn, entity, &remote.remote_id, report).await;
            };
            state.payload.expect_type(entity)?;
            let payload = match localize_remote(conn, state.payload).await {
                Ok(payload) => payload,
                Err(SyncError::Engine(e)) if e.is_malformed_record() => {
                    report.malformed.push(state.remote_id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let state = ResolvedState { payload, ..state };

            match find_by_remote_id(conn, entity, &state.remote_id).await? {
                Some(existing) if existing.is_pending() => report.stale.push(existing.local_id),
                Some(mut existing) => {
                    existing.resolve(state);
                    save(conn, &existing).await?;
                    report.applied += 1;
                }
                None => {
                    let local_id = allocate_id(conn).await?;
                    let mut record =
                        LocalRecord::new(local_id, state.payload.clone(), state.modified_at);
                    record.resolve(state);
                    save(conn, &record).await?;
                    report.applied += 1;
                }
            }
        }
        LedgerWrite::PurgeRemote { remote_id } => {
            purge_remote(conn, entity, &remote_id, report).await?;
        }
    }
    Ok(())
}

async fn purge_remote(
    conn: &mut SqliteConnection,
    entity: EntityType,
    remote_id: &str,
    report: &mut ApplyReport,
) -> Result<()> {
    match find_by_remote_id(conn, entity, remote_id).await? {
        Some(existing) if existing.is_pending() => report.stale.push(existing.local_id),
        Some(existing) => {
            purge(conn, entity, existing.local_id).await?;
            report.applied += 1;
        }
        None => {}
    }
    Ok(())
}

async fn purge(conn: &mut SqliteConnection, entity: EntityType, local_id: LocalId) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE local_id = ?", entity.table());
    let result = sqlx::query(&sql).bind(local_id).execute(&mut *conn).await?;
    Ok(result.rows_affected() > 0)
}

async fn allocate_id(conn: &mut SqliteConnection) -> Result<LocalId> {
    let local_id = sqlx::query("INSERT INTO local_id_sequence DEFAULT VALUES")
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
    // AUTOINCREMENT remembers the high-water mark without the row
    sqlx::query("DELETE FROM local_id_sequence WHERE id = ?")
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(local_id)
}

async fn live_record(
    conn: &mut SqliteConnection,
    entity: EntityType,
    local_id: LocalId,
) -> Result<LocalRecord> {
    match find_by_id(conn, entity, local_id).await? {
        None => Err(EngineError::RecordNotFound { entity, local_id }.into()),
        Some(record) if record.deleted => {
            Err(EngineError::OperationOnDeleted { entity, local_id }.into())
        }
        Some(record) => Ok(record),
    }
}

async fn ensure_unique(
    conn: &mut SqliteConnection,
    payload: &Payload,
    except: Option<LocalId>,
) -> Result<()> {
    let entity = payload.entity_type();
    let live = fetch(conn, entity, "deleted = 0", &[]).await?;
    match live
        .iter()
        .find(|r| Some(r.local_id) != except && r.payload.same_identity(payload))
    {
        Some(holder) => Err(EngineError::AlreadyExists {
            entity,
            local_id: holder.local_id,
        }
        .into()),
        None => Ok(()),
    }
}

async fn find_by_id(
    conn: &mut SqliteConnection,
    entity: EntityType,
    local_id: LocalId,
) -> Result<Option<LocalRecord>> {
    let records = fetch(conn, entity, "local_id = ?", &[local_id.into()]).await?;
    Ok(records.into_iter().next())
}

async fn find_by_remote_id(
    conn: &mut SqliteConnection,
    entity: EntityType,
    remote_id: &str,
) -> Result<Option<LocalRecord>> {
    let records = fetch(conn, entity, "remote_id = ?", &[remote_id.into()]).await?;
    Ok(records.into_iter().next())
}

/// Check a user-supplied collection reference and store it in local form.
async fn localize_user(conn: &mut SqliteConnection, payload: Payload) -> Result<Payload> {
    if let Some(CollectionRef::Local(collection)) = payload.collection_ref() {
        match find_by_id(conn, EntityType::Collection, *collection).await? {
            Some(record) if !record.deleted => {}
            Some(_) => {
                return Err(EngineError::OperationOnDeleted {
                    entity: EntityType::Collection,
                    local_id: *collection,
                }
                .into())
            }
            None => {
                return Err(EngineError::RecordNotFound {
                    entity: EntityType::Collection,
                    local_id: *collection,
                }
                .into())
            }
        }
    }
    localize_remote(conn, payload).await
}

async fn localize_remote(conn: &mut SqliteConnection, payload: Payload) -> Result<Payload> {
    match payload {
        Payload::CollectionBookmark {
            collection: CollectionRef::Remote(remote_id),
            location,
        } => {
            let Some(record) = find_by_remote_id(conn, EntityType::Collection, &remote_id).await?
            else {
                return Err(EngineError::UnknownCollection(remote_id).into());
            };
            Ok(Payload::CollectionBookmark {
                collection: CollectionRef::Local(record.local_id),
                location,
            })
        }
        other => Ok(other),
    }
}

/// Rewrite stored collection references to remote ids where known.
async fn resolve_refs(conn: &mut SqliteConnection, records: &mut [LocalRecord]) -> Result<()> {
    if !records
        .iter()
        .any(|r| matches!(r.payload.collection_ref(), Some(CollectionRef::Local(_))))
    {
        return Ok(());
    }

    let rows =
        sqlx::query("SELECT local_id, remote_id FROM collections WHERE remote_id IS NOT NULL")
            .fetch_all(&mut *conn)
            .await?;
    let mut remote_ids = HashMap::with_capacity(rows.len());
    for row in &rows {
        let local_id: LocalId = row.try_get("local_id")?;
        let remote_id: RemoteId = row.try_get("remote_id")?;
        remote_ids.insert(local_id, remote_id);
    }

    for record in records {
        if let Payload::CollectionBookmark { collection, .. } = &mut record.payload {
            let CollectionRef::Local(local_id) = *collection else {
                continue;
            };
            if let Some(remote_id) = remote_ids.get(&local_id) {
                *collection = CollectionRef::Remote(remote_id.clone());
            }
        }
    }
    Ok(())
}

async fn fetch(
    conn: &mut SqliteConnection,
    entity: EntityType,
    filter: &str,
    params: &[FieldValue],
) -> Result<Vec<LocalRecord>> {
    let columns: Vec<&str> = entity.columns().iter().map(|c| c.name).collect();
    let sql = format!(
        "SELECT {BOOKKEEPING}, {} FROM {} WHERE {filter} ORDER BY local_id",
        columns.join(", "),
        entity.table()
    );

    let mut query = sqlx::query(&sql);
    for param in params {
        query = bind_value(query, Some(param));
    }
    let rows = query.fetch_all(&mut *conn).await?;
    rows.iter().map(|row| decode_row(entity, row)).collect()
}

async fn save(conn: &mut SqliteConnection, record: &LocalRecord) -> Result<()> {
    let entity = record.entity_type();
    let columns = entity.columns();
    let names: Vec<&str> = columns.iter().map(|c| c.name).collect();
    let placeholders = vec!["?"; 6 + names.len()].join(", ");
    let updates: Vec<String> = ["remote_id", "deleted", "dirty", "created_at", "modified_at"]
        .into_iter()
        .chain(names.iter().copied())
        .map(|name| format!("{name} = excluded.{name}"))
        .collect();

    // An upsert rather than REPLACE, which would fire the junction cascade
    let sql = format!(
        "INSERT INTO {} ({BOOKKEEPING}, {}) VALUES ({placeholders}) \
         ON CONFLICT (local_id) DO UPDATE SET {}",
        entity.table(),
        names.join(", "),
        updates.join(", ")
    );

    let unit = entity.time_unit();
    let fields = to_fields(&record.payload);
    let mut query = sqlx::query(&sql)
        .bind(record.local_id)
        .bind(record.remote_id.clone())
        .bind(record.deleted)
        .bind(record.dirty)
        .bind(unit.to_stored(record.created_at))
        .bind(unit.to_stored(record.modified_at));
    for column in columns {
        query = bind_value(query, fields.get(column.name));
    }
    query.execute(&mut *conn).await?;
    Ok(())
}

fn bind_value<'q>(query: Query<'q>, value: Option<&FieldValue>) -> Query<'q> {
    match value {
        Some(FieldValue::Integer(v)) => query.bind(*v),
        Some(FieldValue::Text(v)) => query.bind(v.clone()),
        Some(FieldValue::Null) | None => query.bind(Option::<i64>::None),
    }
}

fn decode_row(entity: EntityType, row: &SqliteRow) -> Result<LocalRecord> {
    let mut fields = Fields::new();
    for column in entity.columns() {
        let value = match column.kind {
            ColumnKind::Integer => FieldValue::from(row.try_get::<Option<i64>, _>(column.name)?),
            ColumnKind::Text => FieldValue::from(row.try_get::<Option<String>, _>(column.name)?),
        };
        fields.set(column.name, value);
    }

    let unit = entity.time_unit();
    Ok(LocalRecord {
        local_id: row.try_get("local_id")?,
        remote_id: row.try_get("remote_id")?,
        deleted: row.try_get("deleted")?,
        dirty: row.try_get("dirty")?,
        created_at: unit.from_stored(row.try_get("created_at")?),
        modified_at: unit.from_stored(row.try_get("modified_at")?),
        payload: from_fields(entity, &fields)?,
    })
}
