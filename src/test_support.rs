use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// In-memory database with the full schema applied. Single connection so the
/// memory database is shared across all queries on the pool.
pub(crate) async fn migrated_pool() -> SqlitePool {
    let _ = env_logger::builder().is_test(true).try_init();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");

    crate::db_migration::initialize_database(&pool)
        .await
        .expect("migrations");

    pool
}
