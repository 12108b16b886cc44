use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

use types::Reading;

mod counters;
mod credentials;

/// Local persistence for the bridge: the outbound reading queue, the
/// pairing credentials and the per-day upload counters.
#[derive(Debug, Clone)]
pub struct BufferStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct BufferedReading {
    pub id: i64,
    pub reading: Reading,
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

impl BufferStore {
    pub async fn new(path: &str) -> Result<Self, BufferError> {
        let options = SqliteConnectOptions::from_str(&sqlite_url(path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reading_queue (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                entity_id TEXT NOT NULL,\
                payload TEXT NOT NULL,\
                created_at INTEGER NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_created_at ON reading_queue(created_at)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS credentials (\
                id INTEGER PRIMARY KEY CHECK (id = 1),\
                api_token TEXT NOT NULL,\
                instance_id TEXT NOT NULL,\
                user_email TEXT NOT NULL,\
                api_url TEXT NOT NULL,\
                paired_at TEXT NOT NULL\
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS daily_uploads (\
                day TEXT PRIMARY KEY,\
                uploaded INTEGER NOT NULL DEFAULT 0\
            )",
        )
        .execute(&pool)
        .await?;

        info!(path = %path, "buffer initialized");

        Ok(Self { pool })
    }

    pub async fn enqueue(&self, reading: &Reading) -> Result<(), BufferError> {
        let payload =
            serde_json::to_string(reading).map_err(|err| BufferError::Corrupt(err.to_string()))?;
        sqlx::query("INSERT INTO reading_queue (entity_id, payload, created_at) VALUES (?, ?, ?)")
            .bind(&reading.entity_id)
            .bind(payload)
            .bind(unix_ms())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Oldest-first batch. Rows that no longer decode are dropped.
    pub async fn dequeue_batch(&self, limit: i64) -> Result<Vec<BufferedReading>, BufferError> {
        let rows = sqlx::query("SELECT id, payload FROM reading_queue ORDER BY id ASC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut readings = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();
        for row in rows {
            let id = row.get::<i64, _>("id");
            let payload = row.get::<String, _>("payload");
            match serde_json::from_str::<Reading>(&payload) {
                Ok(reading) => readings.push(BufferedReading { id, reading }),
                Err(err) => {
                    warn!(id, error = %err, "dropping undecodable buffered reading");
                    corrupt.push(id);
                }
            }
        }
        self.delete_batch(&corrupt).await?;

        Ok(readings)
    }

    pub async fn delete_batch(&self, ids: &[i64]) -> Result<(), BufferError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut query = String::from("DELETE FROM reading_queue WHERE id IN (");
        for (idx, _) in ids.iter().enumerate() {
            if idx > 0 {
                query.push_str(", ");
            }
            query.push('?');
        }
        query.push(')');

        let mut statement = sqlx::query(&query);
        for id in ids {
            statement = statement.bind(id);
        }
        statement.execute(&self.pool).await?;

        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64, BufferError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM reading_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count"))
    }

    /// Drops the oldest readings so at most `max_pending` remain. Returns
    /// how many were dropped.
    pub async fn trim_to(&self, max_pending: i64) -> Result<u64, BufferError> {
        let result = sqlx::query(
            "DELETE FROM reading_queue WHERE id NOT IN (\
                SELECT id FROM reading_queue ORDER BY id DESC LIMIT ?\
            )",
        )
        .bind(max_pending.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_queue(&self) -> Result<u64, BufferError> {
        let result = sqlx::query("DELETE FROM reading_queue")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn sqlite_url(path: &str) -> String {
    if path.starts_with("sqlite:") {
        path.to_string()
    } else {
        format!("sqlite://{path}")
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
