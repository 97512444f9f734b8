use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use super::{AccessToken, Identity, TokenProvider};
use crate::{
    db::log::{log_event, LogLevel},
    error::Result,
};

/// Safety margin before actual expiry: a token inside this window is treated
/// as expired so it cannot lapse mid-request.
const EXPIRY_SKEW_SECS: i64 = 120;

struct CachedToken {
    key: String,
    token: AccessToken,
}

/// Single-slot token cache shared by every outbound send. One broker per
/// process, owned by the service and injected where tokens are needed.
///
/// The slot lock is held across a provider round-trip, so concurrent cache
/// misses for the same identity serialize instead of racing the slot, and an
/// invalidation from a failing send is visible to every acquisition that
/// follows it.
pub struct TokenBroker {
    pool: SqlitePool,
    provider: Arc<dyn TokenProvider>,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenBroker {
    pub fn new(pool: SqlitePool, provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            pool,
            provider,
            cache: Mutex::new(None),
        }
    }

    /// Returns a cached token while it stays outside the expiry skew window,
    /// otherwise performs a fresh acquisition and caches the result.
    ///
    /// A slot cached for a different identity is discarded first, so a
    /// configuration change can never leak a stale token across identities.
    pub async fn acquire(&self, identity: &Identity) -> Result<AccessToken> {
        let mut slot = self.cache.lock().await;

        if slot
            .as_ref()
            .is_some_and(|cached| cached.key != identity.cache_key())
        {
            *slot = None;
        }

        if let Some(cached) = slot.as_ref() {
            if Utc::now() + Duration::seconds(EXPIRY_SKEW_SECS) < cached.token.expires_at {
                return Ok(cached.token.clone());
            }
        }

        let token = self.provider.fetch(identity).await?;
        *slot = Some(CachedToken {
            key: identity.cache_key(),
            token: token.clone(),
        });

        Ok(token)
    }

    /// Drops whatever is cached. Idempotent; the next acquisition goes to the
    /// provider.
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Connectivity probe for administrative callers: acquires a token and
    /// records the outcome in the audit trail with a redacted identity hint.
    pub async fn test_acquire(&self, identity: &Identity) -> Result<AccessToken> {
        match self.acquire(identity).await {
            Ok(token) => {
                log_event(
                    &self.pool,
                    LogLevel::Info,
                    "oauth",
                    "token acquired (test)",
                    Some(serde_json::json!({
                        "expires_at": token.expires_at.to_rfc3339(),
                        "tenant": identity.tenant_hint(),
                    })),
                )
                .await;
                Ok(token)
            }
            Err(e) => {
                log_event(
                    &self.pool,
                    LogLevel::Error,
                    "oauth",
                    "token acquisition failed (test)",
                    Some(serde_json::json!({
                        "error": e.to_string(),
                        "tenant": identity.tenant_hint(),
                    })),
                )
                .await;
                Err(e)
            }
        }
    }
}
