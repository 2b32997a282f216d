use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Finished analyses; the full result is kept as JSON
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            highlight_count INTEGER NOT NULL DEFAULT 0,
            barometer_score INTEGER NOT NULL DEFAULT 0,
            result_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per UTC day
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_ledger (
            day TEXT PRIMARY KEY,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            lock_until TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analyses_client_created ON analyses(client_id, created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_text_hash ON analyses(text_hash)")
        .execute(pool)
        .await?;

    Ok(())
}
