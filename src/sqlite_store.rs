//! SQLite-backed [`AnalysisStore`] implementation.
//!
//! Finished analyses are stored as one row each, with the complete
//! [`AnalysisResult`] serialized into `result_json` and a few columns broken
//! out for listing. The token ledger is one row per UTC day keyed by the
//! ISO date string; `lock_until` is stored as RFC 3339 text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteExecutor, SqlitePool};

use parley_core::models::{AnalysisResult, StoredAnalysis, UsageLedgerEntry};
use parley_core::store::{AnalysisStore, ChargeOutcome, UsageCharge};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn parse_lock(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .with_context(|| format!("invalid lock_until in usage ledger: {}", s))
    })
    .transpose()
}

#[async_trait]
impl AnalysisStore for SqliteStore {
    async fn save_analysis(&self, result: &AnalysisResult) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let result_json = serde_json::to_string(result)?;

        sqlx::query(
            r#"
            INSERT INTO analyses (id, client_id, created_at, text, text_hash,
                                  highlight_count, barometer_score, result_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&result.client_id)
        .bind(result.created_at.timestamp())
        .bind(&result.text)
        .bind(text_hash(&result.text))
        .bind(result.highlights.len() as i64)
        .bind(i64::from(result.barometer.score))
        .bind(&result_json)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_analysis(&self, id: &str) -> Result<Option<StoredAnalysis>> {
        let row = sqlx::query("SELECT id, result_json FROM analyses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let result_json: String = row.get("result_json");
        let result: AnalysisResult = serde_json::from_str(&result_json)
            .with_context(|| format!("corrupt result_json for analysis {}", id))?;

        Ok(Some(StoredAnalysis {
            id: row.get("id"),
            result,
        }))
    }

    async fn get_usage_for_day(&self, day: NaiveDate) -> Result<Option<UsageLedgerEntry>> {
        usage_row(&self.pool, day).await
    }

    async fn upsert_usage_for_day(&self, entry: &UsageLedgerEntry) -> Result<()> {
        write_usage(&self.pool, entry).await
    }

    async fn apply_usage(&self, charge: &UsageCharge) -> Result<ChargeOutcome> {
        // The write lock is taken at BEGIN, so ledger writers on other
        // connections and processes wait on busy_timeout instead of
        // interleaving between the read and the write.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let current = usage_row(&mut *tx, charge.day).await?;
        let mut previous = Vec::new();
        for day in charge.previous_days() {
            if let Some(entry) = usage_row(&mut *tx, day).await? {
                previous.push(entry);
            }
        }

        let outcome = charge.evaluate(current, &previous);
        if let Some(entry) = outcome.entry() {
            write_usage(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }
}

async fn usage_row<'e, E>(executor: E, day: NaiveDate) -> Result<Option<UsageLedgerEntry>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query("SELECT tokens_used, lock_until FROM usage_ledger WHERE day = ?")
        .bind(day.to_string())
        .fetch_optional(executor)
        .await?;

    match row {
        Some(r) => {
            let tokens_used: i64 = r.get("tokens_used");
            Ok(Some(UsageLedgerEntry {
                day,
                tokens_used: tokens_used.max(0) as u64,
                lock_until: parse_lock(r.get("lock_until"))?,
            }))
        }
        None => Ok(None),
    }
}

async fn write_usage<'e, E>(executor: E, entry: &UsageLedgerEntry) -> Result<()>
where
    E: SqliteExecutor<'e>,
{
    let tokens_used = i64::try_from(entry.tokens_used).unwrap_or(i64::MAX);
    sqlx::query(
        r#"
        INSERT INTO usage_ledger (day, tokens_used, lock_until)
        VALUES (?, ?, ?)
        ON CONFLICT(day) DO UPDATE SET
            tokens_used = excluded.tokens_used,
            lock_until = excluded.lock_until
        "#,
    )
    .bind(entry.day.to_string())
    .bind(tokens_used)
    .bind(entry.lock_until.map(|t| t.to_rfc3339()))
    .execute(executor)
    .await?;
    Ok(())
}
