//! Credential handling for the outbound relay: the tenant/application
//! identity, the acquisition capability, and the shared single-slot token
//! cache.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::{
    db,
    error::{Error, Result},
};

pub mod broker;
pub mod provider;

pub use broker::TokenBroker;
pub use provider::{MicrosoftTokenProvider, TokenProvider};

/// The (tenant, application, secret) triple authenticating against the
/// OAuth2 provider.
#[derive(Clone)]
pub struct Identity {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

impl Identity {
    /// Builds the identity from effective configuration, rejecting incomplete
    /// credentials before any network traffic happens.
    pub fn from_config(cfg: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| cfg.get(key).filter(|v| !v.is_empty()).cloned();

        let tenant_id = field(db::config::AZURE_TENANT_ID);
        let client_id = field(db::config::AZURE_CLIENT_ID);
        let client_secret = field(db::config::AZURE_CLIENT_SECRET);

        let missing: Vec<&str> = [
            (db::config::AZURE_TENANT_ID, tenant_id.is_none()),
            (db::config::AZURE_CLIENT_ID, client_id.is_none()),
            (db::config::AZURE_CLIENT_SECRET, client_secret.is_none()),
        ]
        .into_iter()
        .filter(|(_, absent)| *absent)
        .map(|(key, _)| key)
        .collect();

        if !missing.is_empty() {
            return Err(Error::identity_config_incomplete(missing.join(", ")));
        }

        Ok(Self {
            tenant_id: tenant_id.unwrap(),
            client_id: client_id.unwrap(),
            client_secret: SecretString::from(client_secret.unwrap()),
        })
    }

    /// Cache key: a cached token is only valid for the exact tenant and
    /// application it was issued for.
    pub fn cache_key(&self) -> String {
        format!("{}|{}", self.tenant_id, self.client_id)
    }

    /// Redacted form safe for audit rows. Never exposes the secret or the
    /// full tenant id.
    pub fn tenant_hint(&self) -> String {
        let head: String = self.tenant_id.chars().take(6).collect();
        format!("{head}\u{2026}")
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("tenant_id", &self.tenant_hint())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// A bearer token with its absolute expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn complete_identity_builds() {
        let identity = Identity::from_config(&cfg(&[
            (db::config::AZURE_TENANT_ID, "tenant-xyz-123"),
            (db::config::AZURE_CLIENT_ID, "client-1"),
            (db::config::AZURE_CLIENT_SECRET, "s3cret"),
        ]))
        .unwrap();

        assert_eq!(identity.cache_key(), "tenant-xyz-123|client-1");
        assert_eq!(identity.tenant_hint(), "tenant…");
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = Identity::from_config(&cfg(&[
            (db::config::AZURE_TENANT_ID, "tenant"),
            (db::config::AZURE_CLIENT_SECRET, ""),
        ]))
        .unwrap_err();

        match err {
            Error::IdentityConfigIncomplete { missing } => {
                assert!(missing.contains(db::config::AZURE_CLIENT_ID));
                assert!(missing.contains(db::config::AZURE_CLIENT_SECRET));
                assert!(!missing.contains(db::config::AZURE_TENANT_ID));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
