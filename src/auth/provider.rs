use std::{future::Future, pin::Pin};

use chrono::{Duration, Utc};
use secrecy::ExposeSecret;
use serde::Deserialize;

use super::{AccessToken, Identity};
use crate::error::{Error, Result};

/// Resource scope for SMTP AUTH against Office 365.
const TOKEN_SCOPE: &str = "https://outlook.office365.com/.default";

/// Capability to turn an identity into a bearer token. The production
/// implementation talks to the cloud identity provider; tests substitute a
/// stub.
pub trait TokenProvider: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Client-credentials grant against the Microsoft identity platform.
pub struct MicrosoftTokenProvider {
    http: reqwest::Client,
}

impl MicrosoftTokenProvider {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn request_token(&self, identity: &Identity) -> Result<AccessToken> {
        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            identity.tenant_id
        );

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", identity.client_id.as_str()),
                ("client_secret", identity.client_secret.expose_secret()),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::acquisition_failed(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = match response.json::<TokenErrorResponse>().await {
                Ok(body) => format!("{}: {}", body.error, body.error_description),
                Err(_) => format!("token endpoint returned HTTP {status}"),
            };
            return Err(Error::acquisition_failed(detail));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::acquisition_failed(format!("malformed token response: {e}")))?;

        Ok(AccessToken {
            token: body.access_token,
            expires_at: Utc::now() + Duration::seconds(body.expires_in),
        })
    }
}

impl Default for MicrosoftTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenProvider for MicrosoftTokenProvider {
    fn fetch<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken>> + Send + 'a>> {
        Box::pin(self.request_token(identity))
    }
}
