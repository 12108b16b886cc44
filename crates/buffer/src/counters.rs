use chrono::NaiveDate;
use sqlx::Row;

use crate::{BufferError, BufferStore};

impl BufferStore {
    /// Adds `count` uploads to `day` and returns the new total for that day.
    pub async fn record_uploaded(&self, day: NaiveDate, count: i64) -> Result<i64, BufferError> {
        let key = day_key(day);
        sqlx::query(
            "INSERT INTO daily_uploads (day, uploaded) VALUES (?, ?) \
                ON CONFLICT(day) DO UPDATE SET uploaded = uploaded + excluded.uploaded",
        )
        .bind(&key)
        .bind(count)
        .execute(&self.pool)
        .await?;

        self.uploaded_on(day).await
    }

    pub async fn uploaded_on(&self, day: NaiveDate) -> Result<i64, BufferError> {
        let row = sqlx::query("SELECT uploaded FROM daily_uploads WHERE day = ?")
            .bind(day_key(day))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("uploaded")).unwrap_or(0))
    }

    /// Forgets counters for days before `day`.
    pub async fn prune_counters_before(&self, day: NaiveDate) -> Result<u64, BufferError> {
        let result = sqlx::query("DELETE FROM daily_uploads WHERE day < ?")
            .bind(day_key(day))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn clear_counters(&self) -> Result<u64, BufferError> {
        let result = sqlx::query("DELETE FROM daily_uploads")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}
