use sqlx::SqlitePool;

use crate::errors::{DbError, DomainError, DomainResult};

// Embed all migration SQL files at compile time
const MIGRATION_ENTITIES: &str = include_str!("../migrations/20250601000000_entities.sql");
const MIGRATION_OUTBOX: &str = include_str!("../migrations/20250601000001_outbox.sql");
const MIGRATION_SYNC_STATE: &str = include_str!("../migrations/20250601000002_sync_state.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_entities.sql", MIGRATION_ENTITIES),
    ("20250601000001_outbox.sql", MIGRATION_OUTBOX),
    ("20250601000002_sync_state.sql", MIGRATION_SYNC_STATE),
];

/// Apply any migrations that have not yet run against this database.
pub async fn initialize_database(pool: &SqlitePool) -> DomainResult<()> {
    create_migrations_table(pool).await?;

    let applied = applied_migrations(pool).await?;

    for (name, sql) in MIGRATIONS {
        if applied.iter().any(|a| a == name) {
            continue;
        }

        log::info!("Applying migration {}", name);
        apply_migration(pool, name, sql).await?;
    }

    Ok(())
}

/// Create migrations table if it doesn't exist
async fn create_migrations_table(pool: &SqlitePool) -> DomainResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DomainError::Database(DbError::Migration(format!(
        "Failed to create migrations table: {}",
        e
    ))))?;

    Ok(())
}

/// Get the names of all applied migrations
async fn applied_migrations(pool: &SqlitePool) -> DomainResult<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| DomainError::Database(DbError::Migration(format!(
            "Failed to read applied migrations: {}",
            e
        ))))?;

    Ok(names)
}

/// Apply a single migration and record it, atomically.
async fn apply_migration(pool: &SqlitePool, name: &str, sql: &str) -> DomainResult<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    // Migration files may contain multiple statements.
    for statement in sql.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| DomainError::Database(DbError::Migration(format!(
                "Migration {} failed: {}",
                name, e
            ))))?;
    }

    sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
        .bind(name)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(|e| DomainError::Database(DbError::Migration(format!(
            "Failed to record migration {}: {}",
            name, e
        ))))?;

    tx.commit()
        .await
        .map_err(|e| DomainError::Database(DbError::Transaction(e.to_string())))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory pool")
    }

    #[tokio::test]
    async fn applies_all_migrations() {
        let pool = memory_pool().await;
        initialize_database(&pool).await.expect("migrations run");

        let applied = applied_migrations(&pool).await.expect("read migrations");
        assert_eq!(applied.len(), MIGRATIONS.len());

        // Core tables exist afterwards.
        for table in ["entities", "outbox", "sync_cursors", "sync_cycles"] {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .expect("table check");
            assert_eq!(count, 1, "missing table {}", table);
        }
    }

    #[tokio::test]
    async fn rerunning_is_a_no_op() {
        let pool = memory_pool().await;
        initialize_database(&pool).await.expect("first run");
        initialize_database(&pool).await.expect("second run");

        let applied = applied_migrations(&pool).await.expect("read migrations");
        assert_eq!(applied.len(), MIGRATIONS.len());
    }
}
