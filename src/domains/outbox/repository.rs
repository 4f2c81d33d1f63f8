use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::errors::{DbError, DomainError, DomainResult};
use crate::domains::outbox::types::{
    NewOutboxEntry, OutboxEntry, OutboxEntryRow, OutboxOperation, OutboxStatus,
};

const SELECT_COLUMNS: &str = "entry_id, entity_type, sync_id, operation, payload, \
     snapshot_updated_at, enqueued_at, attempt_count, status, last_error, next_attempt_at";

/// Repository for the durable mutation queue.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Enqueue a mutation inside the caller's transaction, coalescing against
    /// any unacknowledged entry for the same (entity_type, sync_id):
    /// a later snapshot replaces a pending Update's payload, an Update over a
    /// pending Create stays a Create, and a Delete supersedes everything.
    /// A second Delete is a no-op.
    async fn enqueue_with_tx<'t>(
        &self,
        entry: &NewOutboxEntry,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Entries eligible for upload, ordered by enqueue time: pending entries,
    /// failed entries whose backoff has elapsed and that still have retry
    /// budget, and entries left in flight by an interrupted cycle.
    async fn due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> DomainResult<Vec<OutboxEntry>>;

    async fn mark_in_flight(&self, entry_id: i64) -> DomainResult<()>;

    /// Acknowledge an entry. The row is deleted; Done is not a stored state.
    async fn mark_done_with_tx<'t>(
        &self,
        entry_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    /// Record a failed attempt. `next_attempt_at = None` marks the failure as
    /// permanent (no further auto-retry).
    async fn mark_failed(
        &self,
        entry_id: i64,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()>;

    /// Drop unacknowledged entries for an entity whose local changes were
    /// superseded by a remotely-won conflict.
    async fn cancel_for_entity_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64>;

    async fn pending_count(&self) -> DomainResult<i64>;

    /// Entries that exhausted their retry budget and await external
    /// intervention. Never silently dropped.
    async fn permanent_failures(&self, max_attempts: u32) -> DomainResult<Vec<OutboxEntry>>;
}

/// SQLite implementation of the OutboxRepository
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn find_unacked_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<OutboxEntry>> {
        let row = query_as::<_, OutboxEntryRow>(&format!(
            "SELECT {} FROM outbox
             WHERE entity_type = ? AND sync_id = ? AND status IN ('pending', 'failed')
             ORDER BY entry_id LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(entity_type)
        .bind(sync_id.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(DbError::from)?;

        row.map(OutboxEntry::try_from).transpose()
    }

    async fn insert_with_tx<'t>(
        &self,
        entry: &NewOutboxEntry,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let payload = entry
            .payload
            .as_ref()
            .map(|p| p.to_string());

        query(
            "INSERT INTO outbox (entity_type, sync_id, operation, payload, snapshot_updated_at,
                                 enqueued_at, attempt_count, status)
             VALUES (?, ?, ?, ?, ?, ?, 0, 'pending')",
        )
        .bind(&entry.entity_type)
        .bind(entry.sync_id.to_string())
        .bind(entry.operation.as_str())
        .bind(payload)
        .bind(entry.snapshot_updated_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn enqueue_with_tx<'t>(
        &self,
        entry: &NewOutboxEntry,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let existing = self
            .find_unacked_with_tx(&entry.entity_type, entry.sync_id, tx)
            .await?;

        let Some(current) = existing else {
            return self.insert_with_tx(entry, tx).await;
        };

        match (current.operation, entry.operation) {
            (OutboxOperation::Delete, OutboxOperation::Delete) => {
                // Deleting twice is a no-op.
                Ok(())
            }
            (_, OutboxOperation::Delete) => {
                query(
                    "UPDATE outbox
                     SET operation = 'delete', payload = NULL, snapshot_updated_at = ?,
                         attempt_count = 0, status = 'pending',
                         last_error = NULL, next_attempt_at = NULL
                     WHERE entry_id = ?",
                )
                .bind(entry.snapshot_updated_at.to_rfc3339())
                .bind(current.entry_id)
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
                Ok(())
            }
            (OutboxOperation::Delete, _) => {
                // The entity store rejects mutations of tombstoned records, so
                // an op arriving after a pending Delete is a caller bug.
                Err(DomainError::DeletedEntity(
                    entry.entity_type.clone(),
                    entry.sync_id,
                ))
            }
            (kept, _) => {
                // Latest snapshot wins; a pending Create stays a Create because
                // the server has not seen the row yet.
                let payload = entry.payload.as_ref().map(|p| p.to_string());

                query(
                    "UPDATE outbox
                     SET operation = ?, payload = ?, snapshot_updated_at = ?,
                         attempt_count = 0, status = 'pending',
                         last_error = NULL, next_attempt_at = NULL
                     WHERE entry_id = ?",
                )
                .bind(kept.as_str())
                .bind(payload)
                .bind(entry.snapshot_updated_at.to_rfc3339())
                .bind(current.entry_id)
                .execute(&mut **tx)
                .await
                .map_err(DbError::from)?;
                Ok(())
            }
        }
    }

    async fn due(
        &self,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: u32,
    ) -> DomainResult<Vec<OutboxEntry>> {
        let rows = query_as::<_, OutboxEntryRow>(&format!(
            "SELECT {} FROM outbox
             WHERE status IN ('pending', 'in_flight')
                OR (status = 'failed' AND attempt_count < ?
                    AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?)
             ORDER BY enqueued_at, entry_id
             LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(i64::from(max_attempts))
        .bind(now.to_rfc3339())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(OutboxEntry::try_from).collect()
    }

    async fn mark_in_flight(&self, entry_id: i64) -> DomainResult<()> {
        query("UPDATE outbox SET status = 'in_flight' WHERE entry_id = ?")
            .bind(entry_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn mark_done_with_tx<'t>(
        &self,
        entry_id: i64,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query("DELETE FROM outbox WHERE entry_id = ?")
            .bind(entry_id)
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        entry_id: i64,
        error: &str,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> DomainResult<()> {
        query(
            "UPDATE outbox
             SET status = 'failed', attempt_count = attempt_count + 1,
                 last_error = ?, next_attempt_at = ?
             WHERE entry_id = ?",
        )
        .bind(error)
        .bind(next_attempt_at.map(|t| t.to_rfc3339()))
        .bind(entry_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn cancel_for_entity_with_tx<'t>(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<u64> {
        let result = query(
            "DELETE FROM outbox WHERE entity_type = ? AND sync_id = ?",
        )
        .bind(entity_type)
        .bind(sync_id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> DomainResult<i64> {
        let count = query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn permanent_failures(&self, max_attempts: u32) -> DomainResult<Vec<OutboxEntry>> {
        let rows = query_as::<_, OutboxEntryRow>(&format!(
            "SELECT {} FROM outbox
             WHERE status = 'failed' AND (attempt_count >= ? OR next_attempt_at IS NULL)
             ORDER BY enqueued_at, entry_id",
            SELECT_COLUMNS
        ))
        .bind(i64::from(max_attempts))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(OutboxEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_pool;
    use serde_json::json;

    fn new_entry(
        sync_id: Uuid,
        operation: OutboxOperation,
        payload: Option<serde_json::Value>,
    ) -> NewOutboxEntry {
        NewOutboxEntry {
            entity_type: "notes".to_string(),
            sync_id,
            operation,
            payload,
            snapshot_updated_at: Utc::now(),
        }
    }

    async fn enqueue(repo: &SqliteOutboxRepository, pool: &SqlitePool, entry: &NewOutboxEntry) {
        let mut tx = pool.begin().await.expect("begin");
        repo.enqueue_with_tx(entry, &mut tx).await.expect("enqueue");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn coalesces_updates_then_delete_into_one_delete() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Update, Some(json!({"v": 1})))).await;
        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Update, Some(json!({"v": 2})))).await;
        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Delete, None)).await;

        let due = repo.due(Utc::now(), 5, 100).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].operation, OutboxOperation::Delete);
        assert!(due[0].payload.is_none());
    }

    #[tokio::test]
    async fn update_over_pending_create_stays_a_create_with_latest_payload() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Create, Some(json!({"v": 1})))).await;
        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Update, Some(json!({"v": 2})))).await;

        let due = repo.due(Utc::now(), 5, 100).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].operation, OutboxOperation::Create);
        assert_eq!(due[0].payload, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn second_delete_is_a_no_op() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Delete, None)).await;
        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Delete, None)).await;

        assert_eq!(repo.pending_count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn independent_sync_ids_are_not_coalesced() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());

        enqueue(&repo, &pool, &new_entry(Uuid::new_v4(), OutboxOperation::Create, Some(json!({})))).await;
        enqueue(&repo, &pool, &new_entry(Uuid::new_v4(), OutboxOperation::Create, Some(json!({})))).await;

        assert_eq!(repo.pending_count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn failed_entries_wait_for_backoff_and_cap_out() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Create, Some(json!({})))).await;
        let entry = repo.due(Utc::now(), 3, 10).await.expect("due")[0].clone();

        // Failure with a future retry time is not due yet.
        let later = Utc::now() + chrono::Duration::minutes(5);
        repo.mark_failed(entry.entry_id, "connection reset", Some(later))
            .await
            .expect("mark failed");
        assert!(repo.due(Utc::now(), 3, 10).await.expect("due").is_empty());

        // Once the retry time passes, it becomes due again.
        let due = repo.due(later + chrono::Duration::seconds(1), 3, 10).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt_count, 1);

        // Exhaust the budget: attempt_count reaches the cap.
        repo.mark_failed(entry.entry_id, "connection reset", Some(later))
            .await
            .expect("mark failed");
        repo.mark_failed(entry.entry_id, "connection reset", None)
            .await
            .expect("mark failed");

        assert!(repo
            .due(later + chrono::Duration::hours(1), 3, 10)
            .await
            .expect("due")
            .is_empty());
        let failures = repo.permanent_failures(3).await.expect("failures");
        assert_eq!(failures.len(), 1);
        assert!(failures[0].is_permanently_failed(3));
    }

    #[tokio::test]
    async fn in_flight_entries_from_an_interrupted_cycle_are_retried() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Create, Some(json!({})))).await;
        let entry = repo.due(Utc::now(), 3, 10).await.expect("due")[0].clone();
        repo.mark_in_flight(entry.entry_id).await.expect("in flight");

        let due = repo.due(Utc::now(), 3, 10).await.expect("due");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].status, OutboxStatus::InFlight);
    }

    #[tokio::test]
    async fn mark_done_deletes_the_entry() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let sync_id = Uuid::new_v4();

        enqueue(&repo, &pool, &new_entry(sync_id, OutboxOperation::Create, Some(json!({})))).await;
        let entry = repo.due(Utc::now(), 3, 10).await.expect("due")[0].clone();

        let mut tx = pool.begin().await.expect("begin");
        repo.mark_done_with_tx(entry.entry_id, &mut tx).await.expect("done");
        tx.commit().await.expect("commit");

        assert_eq!(repo.pending_count().await.expect("count"), 0);
    }
}
