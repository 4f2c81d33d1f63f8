use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

// Public modules
pub mod domains;
pub mod errors;

// Private modules
mod db_migration;

#[cfg(test)]
pub(crate) mod test_support;

use errors::{DbError, DomainResult};

/// Open (or create) the local database and bring its schema up to date.
/// This must run before any repository is constructed on the pool.
pub async fn initialize(db_url: &str) -> DomainResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(DbError::from)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::from)?;

    db_migration::initialize_database(&pool).await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initialize_creates_a_usable_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("sync.db");
        let url = format!("sqlite://{}", db_path.display());

        let pool = initialize(&url).await.expect("initialize");

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('entities', 'outbox', 'sync_cursors', 'sync_cycles')",
        )
        .fetch_one(&pool)
        .await
        .expect("table count");
        assert_eq!(tables, 4);

        // Reopening the same file is a no-op for the schema.
        pool.close().await;
        let pool = initialize(&url).await.expect("reinitialize");
        let migrations: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM migrations")
            .fetch_one(&pool)
            .await
            .expect("migration count");
        assert_eq!(migrations, 3);
    }
}
