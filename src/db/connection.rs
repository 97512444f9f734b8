use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::error::Result;

/// One inbound SMTP session. Created when the peer connects, closed at most
/// once when the socket goes away.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Connection {
    pub id: i64,
    pub remote_addr: String,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub messages_received: i64,
}

impl Connection {
    /// Registers a new session. A failure here must reject the session: no
    /// traffic is accepted without a recorded identity.
    pub async fn open(pool: &SqlitePool, remote_addr: &str) -> Result<i64> {
        Ok(
            sqlx::query_scalar("INSERT INTO connections (remote_addr) VALUES ($1) RETURNING id")
                .bind(remote_addr)
                .fetch_one(pool)
                .await?,
        )
    }

    /// Bumps the per-session message counter. Best-effort bookkeeping; the
    /// single UPDATE cannot lose increments under concurrency.
    pub async fn record_message(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query("UPDATE connections SET messages_received = messages_received + 1 WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Stamps the disconnect time, once.
    pub async fn close(pool: &SqlitePool, id: i64) -> Result<()> {
        sqlx::query(
            "
            UPDATE connections
            SET disconnected_at = CURRENT_TIMESTAMP
            WHERE id = $1 AND disconnected_at IS NULL
            ",
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find(pool: &SqlitePool, id: i64) -> Result<Option<Connection>> {
        Ok(sqlx::query_as("SELECT * FROM connections WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?)
    }
}
