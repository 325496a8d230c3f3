//! SQLite-backed stability store
//!
//! Single writer: the pipeline commits one transaction per run containing
//! every touched record plus a row in `runs`.

use crate::error::StoreError;
use crate::proxy::models::Tier;
use crate::stability::StabilityRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stability (
        fingerprint TEXT PRIMARY KEY NOT NULL,
        success_streak INTEGER NOT NULL DEFAULT 0,
        failure_streak INTEGER NOT NULL DEFAULT 0,
        first_seen TEXT NOT NULL,
        last_seen TEXT NOT NULL,
        last_status TEXT NOT NULL,
        last_success TEXT,
        last_latency_ms INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        candidates INTEGER NOT NULL,
        accepted INTEGER NOT NULL
    )",
];

const SELECT_RECORD: &str = "SELECT fingerprint, success_streak, failure_streak, first_seen, last_seen, last_status, last_success, last_latency_ms FROM stability";

/// Bookkeeping row for one committed run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: u64,
    pub accepted: u64,
}

/// Durable store for [`StabilityRecord`]s
#[derive(Debug, Clone)]
pub struct StabilityStore {
    pool: SqlitePool,
}

impl StabilityStore {
    /// Open (creating if missing) the database file
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;
        Self::init(pool).await
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StoreError::Open)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Open)?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(StoreError::Open)?;
        }
        Ok(Self { pool })
    }

    /// Every record keyed by fingerprint
    pub async fn load_all(&self) -> Result<HashMap<String, StabilityRecord>, StoreError> {
        let rows = sqlx::query(SELECT_RECORD)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        rows.iter()
            .map(|row| record_from_row(row).map(|r| (r.fingerprint.clone(), r)))
            .collect()
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<StabilityRecord>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE fingerprint = ?", SELECT_RECORD))
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Read)?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Records ordered by success streak, best first
    pub async fn list(&self) -> Result<Vec<StabilityRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY success_streak DESC, failure_streak ASC, fingerprint ASC",
            SELECT_RECORD
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Read)?;
        rows.iter().map(record_from_row).collect()
    }

    /// Upsert every updated record and the run row in one transaction
    pub async fn commit_run(
        &self,
        run: &RunRecord,
        updates: &HashMap<String, StabilityRecord>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Write)?;

        for record in updates.values() {
            sqlx::query(
                "INSERT INTO stability (fingerprint, success_streak, failure_streak, first_seen, last_seen, last_status, last_success, last_latency_ms)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    success_streak = excluded.success_streak,
                    failure_streak = excluded.failure_streak,
                    first_seen = excluded.first_seen,
                    last_seen = excluded.last_seen,
                    last_status = excluded.last_status,
                    last_success = excluded.last_success,
                    last_latency_ms = excluded.last_latency_ms",
            )
            .bind(&record.fingerprint)
            .bind(i64::from(record.success_streak))
            .bind(i64::from(record.failure_streak))
            .bind(record.first_seen)
            .bind(record.last_seen)
            .bind(record.last_status.as_str())
            .bind(record.last_success)
            .bind(record.last_latency_ms.map(|ms| ms as i64))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Write)?;
        }

        sqlx::query(
            "INSERT INTO runs (run_id, started_at, finished_at, candidates, accepted) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.candidates as i64)
        .bind(run.accepted as i64)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Write)?;

        tx.commit().await.map_err(StoreError::Write)
    }

    /// Committed runs, newest first
    pub async fn runs(&self) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT run_id, started_at, finished_at, candidates, accepted FROM runs ORDER BY started_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Read)?;

        rows.iter()
            .map(|row| {
                Ok(RunRecord {
                    run_id: row.try_get("run_id").map_err(StoreError::Read)?,
                    started_at: row.try_get("started_at").map_err(StoreError::Read)?,
                    finished_at: row.try_get("finished_at").map_err(StoreError::Read)?,
                    candidates: row.try_get::<i64, _>("candidates").map_err(StoreError::Read)? as u64,
                    accepted: row.try_get::<i64, _>("accepted").map_err(StoreError::Read)? as u64,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &SqliteRow) -> Result<StabilityRecord, StoreError> {
    let fingerprint: String = row.try_get("fingerprint").map_err(StoreError::Read)?;
    let corrupt = |reason: String| StoreError::Corrupt {
        fingerprint: fingerprint.clone(),
        reason,
    };

    let status: String = row.try_get("last_status").map_err(StoreError::Read)?;
    let last_status = Tier::from_str(&status).map_err(corrupt)?;
    let streak = |column: &str| -> Result<u32, StoreError> {
        let value: i64 = row.try_get(column).map_err(StoreError::Read)?;
        u32::try_from(value).map_err(|_| corrupt(format!("{} out of range: {}", column, value)))
    };
    let success_streak = streak("success_streak")?;
    let failure_streak = streak("failure_streak")?;
    if success_streak > 0 && failure_streak > 0 {
        return Err(corrupt("both streaks are non-zero".to_string()));
    }

    let last_latency_ms: Option<i64> = row.try_get("last_latency_ms").map_err(StoreError::Read)?;

    Ok(StabilityRecord {
        fingerprint: fingerprint.clone(),
        success_streak,
        failure_streak,
        first_seen: row.try_get("first_seen").map_err(StoreError::Read)?,
        last_seen: row.try_get("last_seen").map_err(StoreError::Read)?,
        last_status,
        last_success: row.try_get("last_success").map_err(StoreError::Read)?,
        last_latency_ms: last_latency_ms.map(|ms| ms.max(0) as u64),
    })
}
