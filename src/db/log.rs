use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, SqlitePool};

use crate::error::Result;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only audit record. Never mutated or deleted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemLogEntry {
    pub id: i64,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub details: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

impl SystemLogEntry {
    pub async fn append(
        pool: &SqlitePool,
        level: LogLevel,
        component: &str,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_logs (level, component, message, details) VALUES ($1, $2, $3, $4)",
        )
        .bind(level)
        .bind(component)
        .bind(message)
        .bind(details.map(Json))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SystemLogEntry>> {
        Ok(
            sqlx::query_as("SELECT * FROM system_logs ORDER BY id DESC LIMIT $1")
                .bind(limit)
                .fetch_all(pool)
                .await?,
        )
    }
}

/// Appends an audit row, swallowing storage failures. The audit trail is
/// observational; it must never fail the operation being audited.
pub async fn log_event(
    pool: &SqlitePool,
    level: LogLevel,
    component: &str,
    message: &str,
    details: Option<serde_json::Value>,
) {
    if let Err(e) = SystemLogEntry::append(pool, level, component, message, details).await {
        tracing::warn!(component, message, "failed to write system log entry: {e}");
    }
}
