use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the index schema on an open pool. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // One row per document path; owned by the indexer.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_index (
            path TEXT PRIMARY KEY COLLATE NOCASE,
            file_name TEXT NOT NULL,
            display_name TEXT NOT NULL,
            document_type TEXT NOT NULL DEFAULT '',
            code TEXT,
            sequence_number INTEGER,
            line TEXT NOT NULL DEFAULT '',
            station TEXT NOT NULL DEFAULT '',
            model TEXT NOT NULL DEFAULT '',
            machine_name TEXT NOT NULL DEFAULT '',
            uploaded_by TEXT NOT NULL DEFAULT '',
            comment TEXT NOT NULL DEFAULT '',
            version INTEGER,
            active_version_id TEXT,
            url TEXT NOT NULL,
            file_size INTEGER,
            updated_ticks INTEGER NOT NULL DEFAULT 0,
            last_indexed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            added INTEGER NOT NULL,
            updated INTEGER NOT NULL,
            removed INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_catalog_index_updated ON catalog_index(updated_ticks DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_index_type ON catalog_index(document_type)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_index_line ON catalog_index(line)")
        .execute(pool)
        .await?;

    Ok(())
}
