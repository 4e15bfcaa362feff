use sqlx::SqlitePool;

use crate::errors::{DbError, DomainResult};

// Embed all migration SQL files at compile time
const MIGRATION_ENTITIES: &str = include_str!("../migrations/20250301000000_entities.sql");
const MIGRATION_SYNC: &str = include_str!("../migrations/20250301000001_sync.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250301000000_entities.sql", MIGRATION_ENTITIES),
    ("20250301000001_sync.sql", MIGRATION_SYNC),
];

/// Apply all pending migrations, tracking applied ones in schema_migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DomainResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(DbError::from)?;

    for (name, sql) in MIGRATIONS.iter().copied() {
        let applied: Option<String> =
            sqlx::query_scalar("SELECT name FROM schema_migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(DbError::from)?;

        if applied.is_some() {
            continue;
        }

        log::info!("Applying migration {}", name);

        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Migration(format!("{} failed: {}", name, e)))?;

        sqlx::query("INSERT INTO schema_migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(pool)
            .await
            .map_err(DbError::from)?;
    }

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
    async fn test_migrations_apply_and_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.expect("first run");
        run_migrations(&pool).await.expect("second run");

        let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(applied as usize, MIGRATIONS.len());

        // Spot-check a table from each migration
        sqlx::query("SELECT id FROM projects LIMIT 1")
            .fetch_optional(&pool)
            .await
            .unwrap();
        sqlx::query("SELECT id FROM sync_queue LIMIT 1")
            .fetch_optional(&pool)
            .await
            .unwrap();
    }
}
