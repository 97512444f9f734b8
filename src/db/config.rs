//! Runtime-mutable configuration: a key/value table with upsert semantics,
//! environment fallbacks, and masking rules for reads by administrative
//! callers.

use std::collections::HashMap;

use sqlx::SqlitePool;

use crate::error::Result;

pub const SMTP_PORT: &str = "SMTP_PORT";
pub const WEB_PORT: &str = "WEB_PORT";
pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const RELAY_MAILBOX: &str = "O365_USER_EMAIL";

/// The only keys administrative writes may touch.
pub const ALLOWED_KEYS: &[&str] = &[
    SMTP_PORT,
    WEB_PORT,
    AZURE_TENANT_ID,
    AZURE_CLIENT_ID,
    AZURE_CLIENT_SECRET,
    RELAY_MAILBOX,
];

/// Fully masked on read.
const SECRET_KEYS: &[&str] = &[AZURE_CLIENT_SECRET];

/// Partially masked on read.
const PARTIAL_KEYS: &[&str] = &[AZURE_TENANT_ID, AZURE_CLIENT_ID];

pub const MAX_VALUE_LEN: usize = 4000;

const MASK_CHAR: char = '\u{2022}';
const SECRET_MASK_LEN: usize = 12;

/// Environment-level fallback values. Every credential field has one, so a
/// blank database never leaves the relay without a resolution path.
pub fn env_defaults() -> HashMap<String, String> {
    let var = |key: &str, default: &str| {
        (
            key.to_owned(),
            std::env::var(key).unwrap_or_else(|_| default.to_owned()),
        )
    };

    HashMap::from([
        var(SMTP_PORT, "2525"),
        var(WEB_PORT, "3000"),
        var(AZURE_TENANT_ID, ""),
        var(AZURE_CLIENT_ID, ""),
        var(AZURE_CLIENT_SECRET, ""),
        var(RELAY_MAILBOX, ""),
    ])
}

pub async fn stored(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM config")
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().collect())
}

/// Stored configuration merged over environment fallbacks. Explicit
/// configuration wins; an empty stored value falls through to the default.
pub async fn effective(pool: &SqlitePool) -> Result<HashMap<String, String>> {
    let mut merged = env_defaults();
    for (key, value) in stored(pool).await? {
        if !value.is_empty() {
            merged.insert(key, value);
        }
    }

    Ok(merged)
}

/// Upserts a batch of entries in one atomic transaction.
pub async fn set_many(pool: &SqlitePool, updates: &[(String, String)]) -> Result<()> {
    let mut tx = pool.begin().await?;

    for (key, value) in updates {
        sqlx::query(
            "
            INSERT INTO config (key, value, updated_at) VALUES ($1, $2, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE
            SET value = excluded.value, updated_at = CURRENT_TIMESTAMP
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    Ok(())
}

/// Applies the masking rules to a configuration map before it leaves the
/// process.
pub fn masked(cfg: &HashMap<String, String>) -> HashMap<String, String> {
    cfg.iter()
        .map(|(key, value)| {
            let shown = if value.is_empty() {
                value.clone()
            } else if SECRET_KEYS.contains(&key.as_str()) {
                mask_secret()
            } else if PARTIAL_KEYS.contains(&key.as_str()) {
                mask_partial(value)
            } else {
                value.clone()
            };

            (key.clone(), shown)
        })
        .collect()
}

/// Fixed-length mask: reveals nothing about the secret, not even its length.
pub fn mask_secret() -> String {
    MASK_CHAR.to_string().repeat(SECRET_MASK_LEN)
}

/// Keeps the first and last few characters visible so an operator can tell
/// identifiers apart.
pub fn mask_partial(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 6 {
        let mut out: String = chars.into_iter().take(1).collect();
        out.push_str(&MASK_CHAR.to_string().repeat(3));
        return out;
    }

    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{head}{}{tail}", MASK_CHAR.to_string().repeat(6))
}

/// True when a submitted value is a masked round-trip of a secret rather than
/// a new secret. Writing it back would clobber the stored value.
pub fn is_masked_value(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c == MASK_CHAR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_mask_is_fixed_length() {
        assert_eq!(mask_secret(), "\u{2022}".repeat(12));
    }

    #[test]
    fn partial_mask_keeps_edges() {
        assert_eq!(mask_partial("tenant-xyz-123"), "ten••••••123");
        assert_eq!(mask_partial("abcdef1234"), "abc••••••234");
    }

    #[test]
    fn short_identifiers_keep_only_first_char() {
        assert_eq!(mask_partial("abc"), "a•••");
        assert_eq!(mask_partial("abcdef"), "a•••");
    }

    #[test]
    fn masked_round_trip_detected() {
        assert!(is_masked_value(&mask_secret()));
        assert!(!is_masked_value("hunter2"));
        assert!(!is_masked_value(""));
    }

    #[test]
    fn masking_skips_plain_keys() {
        let cfg = HashMap::from([
            (SMTP_PORT.to_owned(), "2525".to_owned()),
            (AZURE_CLIENT_SECRET.to_owned(), "abcdef1234567890".to_owned()),
        ]);
        let out = masked(&cfg);
        assert_eq!(out[SMTP_PORT], "2525");
        assert_eq!(out[AZURE_CLIENT_SECRET], mask_secret());
    }
}
