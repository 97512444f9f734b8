use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, FromRow, QueryBuilder, Sqlite, SqlitePool};

use crate::error::{Error, Result};

/// Delivery lifecycle of a stored message.
///
/// `sent` is terminal; `failed` stays eligible for an externally triggered
/// re-send.
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
pub enum MessageStatus {
    Received,
    Sending,
    Sent,
    Failed,
}

impl MessageStatus {
    /// Valid transitions of the delivery state machine. Nothing ever leaves
    /// `sent`.
    pub fn can_transition(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, next) {
            (Sent, _) => false,
            (_, Sending) => true,
            (Sending, Sent) | (Sending, Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub message_id: Option<String>,
    pub from_address: String,
    pub to_addresses: Json<Vec<String>>,
    pub cc_addresses: Json<Vec<String>>,
    pub bcc_addresses: Json<Vec<String>>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Json<Vec<AttachmentMeta>>,
    pub headers: Json<serde_json::Map<String, serde_json::Value>>,
    pub size_bytes: i64,
    pub received_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
}

/// Listing shape served to administrative callers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MessageSummary {
    pub id: i64,
    pub from_address: String,
    pub to_addresses: Json<Vec<String>>,
    pub subject: Option<String>,
    pub received_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub size_bytes: i64,
}

/// A parsed inbound message, ready to persist.
#[derive(Debug, Clone, Default)]
pub struct NewMessage {
    pub message_id: Option<String>,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    pub cc_addresses: Vec<String>,
    pub bcc_addresses: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub q: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Message {
    /// Inserts a freshly ingested message with status `received`.
    ///
    /// A replayed protocol message-id must not fail ingestion: on a unique
    /// violation the row is stored again with a NULL `message_id`.
    pub async fn insert(pool: &SqlitePool, new: &NewMessage) -> Result<i64> {
        match Self::insert_row(pool, new, new.message_id.as_deref()).await {
            Ok(id) => Ok(id),
            Err(Error::Sqlx { source }) if is_message_id_conflict(&source) => {
                tracing::warn!(
                    message_id = new.message_id.as_deref(),
                    "duplicate protocol message-id, storing without it"
                );
                Self::insert_row(pool, new, None).await
            }
            Err(e) => Err(e),
        }
    }

    async fn insert_row(
        pool: &SqlitePool,
        new: &NewMessage,
        message_id: Option<&str>,
    ) -> Result<i64> {
        let id = sqlx::query_scalar(
            "
            INSERT INTO messages (
                message_id, from_address, to_addresses, cc_addresses, bcc_addresses,
                subject, body_text, body_html, attachments, headers, size_bytes, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id
            ",
        )
        .bind(message_id)
        .bind(&new.from_address)
        .bind(Json(&new.to_addresses))
        .bind(Json(&new.cc_addresses))
        .bind(Json(&new.bcc_addresses))
        .bind(&new.subject)
        .bind(&new.body_text)
        .bind(&new.body_html)
        .bind(Json(&new.attachments))
        .bind(Json(&new.headers))
        .bind(new.size_bytes)
        .bind(MessageStatus::Received)
        .fetch_one(pool)
        .await?;

        Ok(id)
    }

    pub async fn find(pool: &SqlitePool, id: i64) -> Result<Option<Message>> {
        Ok(sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?)
    }

    pub async fn list(pool: &SqlitePool, filter: &MessageFilter) -> Result<Vec<MessageSummary>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, from_address, to_addresses, subject, received_at, status, size_bytes \
             FROM messages",
        );

        let mut prefix = " WHERE ";
        if let Some(status) = filter.status {
            qb.push(prefix).push("status = ").push_bind(status);
            prefix = " AND ";
        }
        if let Some(from) = filter.from.as_deref().filter(|s| !s.is_empty()) {
            qb.push(prefix)
                .push("from_address LIKE ")
                .push_bind(format!("%{from}%"));
            prefix = " AND ";
        }
        if let Some(to) = filter.to.as_deref().filter(|s| !s.is_empty()) {
            qb.push(prefix)
                .push("to_addresses LIKE ")
                .push_bind(format!("%{to}%"));
            prefix = " AND ";
        }
        if let Some(q) = filter.q.as_deref().filter(|s| !s.is_empty()) {
            let pattern = format!("%{q}%");
            qb.push(prefix)
                .push("(subject LIKE ")
                .push_bind(pattern.clone())
                .push(" OR body_text LIKE ")
                .push_bind(pattern)
                .push(")");
        }

        qb.push(" ORDER BY id DESC LIMIT ")
            .push_bind(filter.limit)
            .push(" OFFSET ")
            .push_bind(filter.offset);

        Ok(qb.build_query_as().fetch_all(pool).await?)
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(1) FROM messages")
            .fetch_one(pool)
            .await?)
    }

    /// Marks a send attempt in flight: status `sending`, retry counter bumped,
    /// previous error cleared. Persisted before any network call so concurrent
    /// readers observe the attempt. Guarded against racing past `sent`.
    pub async fn mark_sending(pool: &SqlitePool, id: i64) -> Result<()> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = $2, retry_count = retry_count + 1, last_error = NULL
            WHERE id = $1 AND status != $3
            ",
        )
        .bind(id)
        .bind(MessageStatus::Sending)
        .bind(MessageStatus::Sent)
        .execute(pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(Error::invalid_parameter(format!(
                "message {id} is already sent"
            )));
        }

        Ok(())
    }

    pub async fn mark_sent(
        pool: &SqlitePool,
        id: i64,
        provider_message_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "
            UPDATE messages
            SET status = $2, sent_at = CURRENT_TIMESTAMP,
                provider_message_id = $3, last_error = NULL
            WHERE id = $1 AND status != $2
            ",
        )
        .bind(id)
        .bind(MessageStatus::Sent)
        .bind(provider_message_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> Result<()> {
        let res = sqlx::query(
            "
            UPDATE messages
            SET status = $2, last_error = $3
            WHERE id = $1 AND status != $4
            ",
        )
        .bind(id)
        .bind(MessageStatus::Failed)
        .bind(error)
        .bind(MessageStatus::Sent)
        .execute(pool)
        .await?;

        if res.rows_affected() == 0 {
            tracing::warn!(id, "refusing to mark a sent message as failed");
        }

        Ok(())
    }
}

fn is_message_id_conflict(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.message().contains("messages.message_id"))
}

#[cfg(test)]
mod tests {
    use super::MessageStatus::*;

    #[test]
    fn sent_is_terminal() {
        assert!(!Sent.can_transition(Sending));
        assert!(!Sent.can_transition(Failed));
        assert!(!Sent.can_transition(Received));
    }

    #[test]
    fn failed_messages_can_be_retried() {
        assert!(Failed.can_transition(Sending));
        assert!(Received.can_transition(Sending));
    }

    #[test]
    fn in_flight_resolves_to_sent_or_failed() {
        assert!(Sending.can_transition(Sent));
        assert!(Sending.can_transition(Failed));
        assert!(!Received.can_transition(Sent));
        assert!(!Received.can_transition(Failed));
    }
}
