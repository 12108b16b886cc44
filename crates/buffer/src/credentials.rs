use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::info;

use types::Credentials;

use crate::{BufferError, BufferStore};

impl BufferStore {
    /// Stores the pairing credentials, replacing any previous entry.
    pub async fn save_credentials(&self, credentials: &Credentials) -> Result<(), BufferError> {
        sqlx::query(
            "INSERT OR REPLACE INTO credentials \
                (id, api_token, instance_id, user_email, api_url, paired_at) \
                VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(&credentials.api_token)
        .bind(&credentials.instance_id)
        .bind(&credentials.user_email)
        .bind(&credentials.api_url)
        .bind(credentials.paired_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        info!(instance_id = %credentials.instance_id, "credentials stored");
        Ok(())
    }

    pub async fn load_credentials(&self) -> Result<Option<Credentials>, BufferError> {
        let row = sqlx::query(
            "SELECT api_token, instance_id, user_email, api_url, paired_at \
                FROM credentials WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let paired_at = row.get::<String, _>("paired_at");
        let paired_at = DateTime::parse_from_rfc3339(&paired_at)
            .map_err(|err| BufferError::Corrupt(format!("credentials.paired_at: {err}")))?
            .with_timezone(&Utc);

        Ok(Some(Credentials {
            api_token: row.get::<String, _>("api_token"),
            instance_id: row.get::<String, _>("instance_id"),
            user_email: row.get::<String, _>("user_email"),
            api_url: row.get::<String, _>("api_url"),
            paired_at,
        }))
    }

    /// Removes the credentials. Returns `false` when none were stored.
    pub async fn clear_credentials(&self) -> Result<bool, BufferError> {
        let result = sqlx::query("DELETE FROM credentials")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
