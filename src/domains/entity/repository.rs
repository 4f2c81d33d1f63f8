use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::entity::types::{next_updated_at, EntityRecord, EntityRow, NewEntity};
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{NewOutboxEntry, OutboxOperation};
use crate::errors::{DbError, DomainError, DomainResult};

const SELECT_COLUMNS: &str = "local_id, entity_type, sync_id, payload, updated_at, \
     is_deleted, is_local, is_dirty, last_synced_at";

/// Transactional store for syncable records.
///
/// Every local write also enqueues the matching outbox entry inside the same
/// transaction, so no mutation can exist without a queued intent to upload it.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Fetch a live record. Tombstoned records are not found.
    async fn find_by_sync_id(&self, entity_type: &str, sync_id: Uuid)
        -> DomainResult<EntityRecord>;

    /// Fetch a record including tombstones.
    async fn find_with_deleted(
        &self,
        entity_type: &str,
        sync_id: Uuid,
    ) -> DomainResult<Option<EntityRecord>>;

    /// Create or update a record from the application. Bumps `updated_at`,
    /// marks the record dirty, and enqueues the outbox entry. Fails with
    /// `DeletedEntity` on a tombstoned record.
    async fn upsert_local(&self, entity: &NewEntity) -> DomainResult<EntityRecord>;

    /// Tombstone a record and enqueue its Delete. Deleting an already
    /// tombstoned record is a no-op.
    async fn soft_delete_local(&self, entity_type: &str, sync_id: Uuid) -> DomainResult<()>;

    /// Records with unsynced local changes, optionally limited to one type.
    async fn list_dirty(&self, entity_type: Option<&str>) -> DomainResult<Vec<EntityRecord>>;

    /// Distinct entity types present in the store.
    async fn list_types(&self) -> DomainResult<Vec<String>>;

    /// Physically remove a record. Only valid once the remote tombstone is
    /// confirmed.
    async fn purge_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    // Coordinator-side operations below. These bypass change tracking: remote
    // state is applied verbatim, never re-enqueued.

    async fn find_with_deleted_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<EntityRecord>>;

    /// Write a remote version of a record: clean, acknowledged, not dirty.
    async fn apply_remote_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Record a successful round-trip: `is_local = false`, `last_synced_at`
    /// set, and `is_dirty` cleared once no outbox entries remain for the
    /// record.
    async fn mark_synced_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        synced_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

/// SQLite implementation of the EntityStore
pub struct SqliteEntityStore {
    pool: SqlitePool,
    outbox: Arc<dyn OutboxRepository>,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool, outbox: Arc<dyn OutboxRepository>) -> Self {
        Self { pool, outbox }
    }

    async fn fetch_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<EntityRow>> {
        let row = query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM entities WHERE entity_type = ? AND sync_id = ?",
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(sync_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(row)
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn find_by_sync_id(
        &self,
        entity_type: &str,
        sync_id: Uuid,
    ) -> DomainResult<EntityRecord> {
        let row = query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM entities
             WHERE entity_type = ? AND sync_id = ? AND is_deleted = 0",
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(sync_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(EntityRecord::try_from)
            .transpose()?
            .ok_or_else(|| DomainError::EntityNotFound(entity_type.to_string(), sync_id))
    }

    async fn find_with_deleted(
        &self,
        entity_type: &str,
        sync_id: Uuid,
    ) -> DomainResult<Option<EntityRecord>> {
        let row = query_as::<_, EntityRow>(&format!(
            "SELECT {} FROM entities WHERE entity_type = ? AND sync_id = ?",
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(sync_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        row.map(EntityRecord::try_from).transpose()
    }

    async fn upsert_local(&self, entity: &NewEntity) -> DomainResult<EntityRecord> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let sync_id = entity.sync_id.unwrap_or_else(Uuid::new_v4);
        let existing = self
            .fetch_with_tx(&entity.entity_type, sync_id, &mut tx)
            .await?;

        let payload_json = entity.payload.to_string();

        let record = match existing {
            Some(row) if row.is_deleted != 0 => {
                return Err(DomainError::DeletedEntity(
                    entity.entity_type.clone(),
                    sync_id,
                ));
            }
            Some(row) => {
                let previous =
                    crate::domains::parse_datetime(&row.updated_at, "entities.updated_at")?;
                let updated_at = next_updated_at(Some(previous));

                query(
                    "UPDATE entities
                     SET payload = ?, updated_at = ?, is_dirty = 1
                     WHERE entity_type = ? AND sync_id = ?",
                )
                .bind(&payload_json)
                .bind(updated_at.to_rfc3339())
                .bind(&entity.entity_type)
                .bind(sync_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;

                self.outbox
                    .enqueue_with_tx(
                        &NewOutboxEntry {
                            entity_type: entity.entity_type.clone(),
                            sync_id,
                            operation: OutboxOperation::Update,
                            payload: Some(entity.payload.clone()),
                            snapshot_updated_at: updated_at,
                        },
                        &mut tx,
                    )
                    .await?;

                let mut record: EntityRecord = row.try_into()?;
                record.payload = entity.payload.clone();
                record.meta.updated_at = updated_at;
                record.meta.is_dirty = true;
                record
            }
            None => {
                let updated_at = next_updated_at(None);

                let result = query(
                    "INSERT INTO entities
                         (entity_type, sync_id, payload, updated_at,
                          is_deleted, is_local, is_dirty, last_synced_at)
                     VALUES (?, ?, ?, ?, 0, 1, 1, NULL)",
                )
                .bind(&entity.entity_type)
                .bind(sync_id.to_string())
                .bind(&payload_json)
                .bind(updated_at.to_rfc3339())
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;

                self.outbox
                    .enqueue_with_tx(
                        &NewOutboxEntry {
                            entity_type: entity.entity_type.clone(),
                            sync_id,
                            operation: OutboxOperation::Create,
                            payload: Some(entity.payload.clone()),
                            snapshot_updated_at: updated_at,
                        },
                        &mut tx,
                    )
                    .await?;

                EntityRecord {
                    local_id: result.last_insert_rowid(),
                    entity_type: entity.entity_type.clone(),
                    payload: entity.payload.clone(),
                    meta: crate::domains::entity::types::SyncMeta {
                        sync_id,
                        updated_at,
                        is_deleted: false,
                        is_local: true,
                        is_dirty: true,
                        last_synced_at: None,
                    },
                }
            }
        };

        tx.commit().await.map_err(DbError::from)?;
        Ok(record)
    }

    async fn soft_delete_local(&self, entity_type: &str, sync_id: Uuid) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let row = self
            .fetch_with_tx(entity_type, sync_id, &mut tx)
            .await?
            .ok_or_else(|| DomainError::EntityNotFound(entity_type.to_string(), sync_id))?;

        if row.is_deleted != 0 {
            // Already tombstoned; nothing to propagate twice.
            return Ok(());
        }

        let previous = crate::domains::parse_datetime(&row.updated_at, "entities.updated_at")?;
        let updated_at = next_updated_at(Some(previous));

        query(
            "UPDATE entities
             SET is_deleted = 1, is_dirty = 1, updated_at = ?
             WHERE entity_type = ? AND sync_id = ?",
        )
        .bind(updated_at.to_rfc3339())
        .bind(entity_type)
        .bind(sync_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        self.outbox
            .enqueue_with_tx(
                &NewOutboxEntry {
                    entity_type: entity_type.to_string(),
                    sync_id,
                    operation: OutboxOperation::Delete,
                    payload: None,
                    snapshot_updated_at: updated_at,
                },
                &mut tx,
            )
            .await?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(())
    }

    async fn list_dirty(&self, entity_type: Option<&str>) -> DomainResult<Vec<EntityRecord>> {
        let rows = match entity_type {
            Some(t) => {
                query_as::<_, EntityRow>(&format!(
                    "SELECT {} FROM entities
                     WHERE entity_type = ? AND is_dirty = 1
                     ORDER BY updated_at",
                    SELECT_COLUMNS
                ))
                .bind(t)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                query_as::<_, EntityRow>(&format!(
                    "SELECT {} FROM entities WHERE is_dirty = 1 ORDER BY updated_at",
                    SELECT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(DbError::from)?;

        rows.into_iter().map(EntityRecord::try_from).collect()
    }

    async fn list_types(&self) -> DomainResult<Vec<String>> {
        let types = query_scalar::<_, String>(
            "SELECT DISTINCT entity_type FROM entities ORDER BY entity_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(types)
    }

    async fn purge_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("DELETE FROM entities WHERE entity_type = ? AND sync_id = ?")
            .bind(entity_type)
            .bind(sync_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn find_with_deleted_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<EntityRecord>> {
        let row = self.fetch_with_tx(entity_type, sync_id, tx).await?;
        row.map(EntityRecord::try_from).transpose()
    }

    async fn apply_remote_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            "INSERT INTO entities
                 (entity_type, sync_id, payload, updated_at,
                  is_deleted, is_local, is_dirty, last_synced_at)
             VALUES (?, ?, ?, ?, 0, 0, 0, ?)
             ON CONFLICT (entity_type, sync_id) DO UPDATE SET
                 payload = excluded.payload,
                 updated_at = excluded.updated_at,
                 is_deleted = 0,
                 is_local = 0,
                 is_dirty = 0,
                 last_synced_at = excluded.last_synced_at",
        )
        .bind(entity_type)
        .bind(sync_id.to_string())
        .bind(payload.to_string())
        .bind(updated_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn mark_synced_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        synced_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            "UPDATE entities
             SET is_local = 0, last_synced_at = ?,
                 is_dirty = CASE
                     WHEN EXISTS (SELECT 1 FROM outbox
                                  WHERE outbox.entity_type = entities.entity_type
                                    AND outbox.sync_id = entities.sync_id)
                     THEN is_dirty ELSE 0 END
             WHERE entity_type = ? AND sync_id = ?",
        )
        .bind(synced_at.to_rfc3339())
        .bind(entity_type)
        .bind(sync_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }
}
