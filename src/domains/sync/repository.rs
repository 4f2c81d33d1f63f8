use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, Sqlite, SqlitePool, Transaction};

use crate::domains::sync::types::{
    SyncCursor, SyncCursorRow, SyncCycle, SyncCycleRow, SyncCycleStatus, SyncStats,
};
use crate::errors::{DbError, DomainResult};

/// Repository for per-entity-type download watermarks.
#[async_trait]
pub trait SyncCursorRepository: Send + Sync {
    async fn last_pulled_at(&self, entity_type: &str) -> DomainResult<Option<DateTime<Utc>>>;

    /// Advance the watermark inside the reconcile transaction, so the cursor
    /// and the applied batch commit or roll back together.
    async fn advance_with_tx<'t>(
        &self,
        entity_type: &str,
        pulled_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn all_cursors(&self) -> DomainResult<Vec<SyncCursor>>;
}

/// Repository for sync cycle history.
#[async_trait]
pub trait SyncCycleRepository: Send + Sync {
    async fn create_cycle(&self, cycle: &SyncCycle) -> DomainResult<()>;

    async fn finalize_cycle(
        &self,
        cycle_id: &str,
        status: SyncCycleStatus,
        stats: &SyncStats,
        error_message: Option<&str>,
    ) -> DomainResult<()>;

    async fn recent_cycles(&self, limit: u32) -> DomainResult<Vec<SyncCycle>>;
}

/// SQLite implementation of the SyncCursorRepository
pub struct SqliteSyncCursorRepository {
    pool: SqlitePool,
}

impl SqliteSyncCursorRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncCursorRepository for SqliteSyncCursorRepository {
    async fn last_pulled_at(&self, entity_type: &str) -> DomainResult<Option<DateTime<Utc>>> {
        let row = query_as::<_, SyncCursorRow>(
            "SELECT entity_type, last_pulled_at, updated_at
             FROM sync_cursors WHERE entity_type = ?",
        )
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(row
            .map(SyncCursor::try_from)
            .transpose()?
            .map(|c| c.last_pulled_at))
    }

    async fn advance_with_tx<'t>(
        &self,
        entity_type: &str,
        pulled_at: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            "INSERT INTO sync_cursors (entity_type, last_pulled_at, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT (entity_type) DO UPDATE SET
                 last_pulled_at = excluded.last_pulled_at,
                 updated_at = excluded.updated_at",
        )
        .bind(entity_type)
        .bind(pulled_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn all_cursors(&self) -> DomainResult<Vec<SyncCursor>> {
        let rows = query_as::<_, SyncCursorRow>(
            "SELECT entity_type, last_pulled_at, updated_at
             FROM sync_cursors ORDER BY entity_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SyncCursor::try_from).collect()
    }
}

/// SQLite implementation of the SyncCycleRepository
pub struct SqliteSyncCycleRepository {
    pool: SqlitePool,
}

impl SqliteSyncCycleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SyncCycleRepository for SqliteSyncCycleRepository {
    async fn create_cycle(&self, cycle: &SyncCycle) -> DomainResult<()> {
        query(
            "INSERT INTO sync_cycles
                 (cycle_id, started_at, completed_at, status, uploaded, downloaded,
                  conflicts, failed_uploads, failed_downloads, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cycle.cycle_id)
        .bind(cycle.started_at.to_rfc3339())
        .bind(cycle.completed_at.map(|t| t.to_rfc3339()))
        .bind(cycle.status.as_str())
        .bind(cycle.uploaded)
        .bind(cycle.downloaded)
        .bind(cycle.conflicts)
        .bind(cycle.failed_uploads)
        .bind(cycle.failed_downloads)
        .bind(cycle.error_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn finalize_cycle(
        &self,
        cycle_id: &str,
        status: SyncCycleStatus,
        stats: &SyncStats,
        error_message: Option<&str>,
    ) -> DomainResult<()> {
        query(
            "UPDATE sync_cycles
             SET completed_at = ?, status = ?, uploaded = ?, downloaded = ?,
                 conflicts = ?, failed_uploads = ?, failed_downloads = ?,
                 error_message = ?
             WHERE cycle_id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(status.as_str())
        .bind(stats.uploaded)
        .bind(stats.downloaded)
        .bind(stats.conflicts)
        .bind(stats.failed_uploads)
        .bind(stats.failed_downloads)
        .bind(error_message)
        .bind(cycle_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn recent_cycles(&self, limit: u32) -> DomainResult<Vec<SyncCycle>> {
        let rows = query_as::<_, SyncCycleRow>(
            "SELECT cycle_id, started_at, completed_at, status, uploaded, downloaded,
                    conflicts, failed_uploads, failed_downloads, error_message
             FROM sync_cycles ORDER BY started_at DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        rows.into_iter().map(SyncCycle::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn cursor_advances_only_on_commit() {
        let pool = migrated_pool().await;
        let repo = SqliteSyncCursorRepository::new(pool.clone());

        assert!(repo.last_pulled_at("notes").await.expect("read").is_none());

        let t1 = Utc::now();

        // Rolled-back transaction leaves the cursor untouched.
        {
            let mut tx = pool.begin().await.expect("begin");
            repo.advance_with_tx("notes", t1, &mut tx).await.expect("advance");
            tx.rollback().await.expect("rollback");
        }
        assert!(repo.last_pulled_at("notes").await.expect("read").is_none());

        // Committed transaction advances it.
        {
            let mut tx = pool.begin().await.expect("begin");
            repo.advance_with_tx("notes", t1, &mut tx).await.expect("advance");
            tx.commit().await.expect("commit");
        }
        assert_eq!(repo.last_pulled_at("notes").await.expect("read"), Some(t1));

        // And it moves forward on the next batch.
        let t2 = t1 + Duration::seconds(30);
        {
            let mut tx = pool.begin().await.expect("begin");
            repo.advance_with_tx("notes", t2, &mut tx).await.expect("advance");
            tx.commit().await.expect("commit");
        }
        assert_eq!(repo.last_pulled_at("notes").await.expect("read"), Some(t2));
    }

    #[tokio::test]
    async fn cycles_are_recorded_and_finalized() {
        let pool = migrated_pool().await;
        let repo = SqliteSyncCycleRepository::new(pool.clone());

        let started = Utc::now();
        let cycle = SyncCycle {
            cycle_id: "cycle-1".to_string(),
            started_at: started,
            completed_at: None,
            status: SyncCycleStatus::Running,
            uploaded: 0,
            downloaded: 0,
            conflicts: 0,
            failed_uploads: 0,
            failed_downloads: 0,
            error_message: None,
        };
        repo.create_cycle(&cycle).await.expect("create");

        let mut stats = SyncStats::new(started);
        stats.uploaded = 3;
        stats.downloaded = 2;
        repo.finalize_cycle("cycle-1", SyncCycleStatus::Completed, &stats, None)
            .await
            .expect("finalize");

        let recent = repo.recent_cycles(10).await.expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, SyncCycleStatus::Completed);
        assert_eq!(recent[0].uploaded, 3);
        assert_eq!(recent[0].downloaded, 2);
        assert!(recent[0].completed_at.is_some());
    }
}
