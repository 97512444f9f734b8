//! Outbound relay: drives a stored message through the delivery state machine
//! and out through the authenticated transport.
//!
//! Failure handling distinguishes one narrow class: authentication failures
//! are retried exactly once with a forced-fresh token. Everything else is
//! terminal for the request, so permanent problems (bad recipient, provider
//! outage) are never masked by token churn.

use std::{future::Future, pin::Pin, sync::Arc};

use lettre::{
    message::{Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::{Credentials, Mechanism},
    AsyncSmtpTransport, AsyncTransport, Message as MimeMessage, Tokio1Executor,
};
use sqlx::SqlitePool;

use crate::{
    auth::{AccessToken, Identity, TokenBroker},
    db::{
        self,
        log::{log_event, LogLevel},
        message::{Message, MessageStatus},
    },
    error::{Error, Result},
};

const O365_SMTP_HOST: &str = "smtp.office365.com";
const O365_SMTP_PORT: u16 = 587;

/// Provider responses that mean the credential was rejected or expired.
/// Matched case-insensitively as substrings of the failure text.
const AUTH_FAILURE_MARKERS: &[&str] = &[
    "5.7.3",
    "535",
    "invalid_grant",
    "authentication unsuccessful",
    "bearer",
];

pub(crate) fn is_auth_failure(detail: &str) -> bool {
    let lower = detail.to_lowercase();
    AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Envelope and content handed to the transport. Attachment payloads are not
/// carried; only their metadata is stored (known limitation, kept on purpose).
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub provider_message_id: Option<String>,
}

/// Capability to transmit one message through the cloud mail provider using a
/// bearer token. Tests substitute a scripted stub.
pub trait MailTransport: Send + Sync + 'static {
    fn deliver<'a>(
        &'a self,
        mailbox: &'a str,
        token: &'a AccessToken,
        mail: &'a OutboundEmail,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + 'a>>;
}

/// SMTP-over-STARTTLS with XOAUTH2 bearer authentication.
pub struct Office365Transport {
    host: String,
    port: u16,
}

impl Office365Transport {
    pub fn new() -> Self {
        Self {
            host: O365_SMTP_HOST.to_owned(),
            port: O365_SMTP_PORT,
        }
    }

    async fn transmit(
        &self,
        mailbox: &str,
        token: &AccessToken,
        mail: &OutboundEmail,
    ) -> Result<DeliveryReceipt> {
        let email = build_mime(mail)?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
            .map_err(|e| Error::delivery(e.to_string()))?
            .port(self.port)
            .credentials(Credentials::new(mailbox.to_owned(), token.token.clone()))
            .authentication(vec![Mechanism::Xoauth2])
            .build();

        let response = transport
            .send(email)
            .await
            .map_err(|e| Error::delivery(e.to_string()))?;

        let summary = response.message().collect::<Vec<&str>>().join(" ");
        Ok(DeliveryReceipt {
            provider_message_id: (!summary.is_empty()).then_some(summary),
        })
    }
}

impl Default for Office365Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl MailTransport for Office365Transport {
    fn deliver<'a>(
        &'a self,
        mailbox: &'a str,
        token: &'a AccessToken,
        mail: &'a OutboundEmail,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + 'a>> {
        Box::pin(self.transmit(mailbox, token, mail))
    }
}

fn build_mime(mail: &OutboundEmail) -> Result<MimeMessage> {
    let parse_mailbox = |addr: &str| -> Result<Mailbox> {
        addr.parse()
            .map_err(|e| Error::delivery(format!("invalid address {addr:?}: {e}")))
    };

    let mut builder = MimeMessage::builder()
        .from(parse_mailbox(&mail.from)?)
        .subject(mail.subject.clone());

    for addr in mail.to.iter().filter(|a| !a.is_empty()) {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in mail.cc.iter().filter(|a| !a.is_empty()) {
        builder = builder.cc(parse_mailbox(addr)?);
    }

    let built = match (mail.text.clone(), mail.html.clone()) {
        (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(text, html)),
        (Some(text), None) => builder.body(text),
        (None, Some(html)) => builder.singlepart(SinglePart::html(html)),
        (None, None) => builder.body(String::new()),
    };

    built.map_err(|e| Error::delivery(e.to_string()))
}

#[derive(Debug)]
pub struct SendOutcome {
    pub provider_message_id: Option<String>,
    pub already_sent: bool,
}

/// Owns the status state machine for stored messages.
pub struct Relay {
    pool: SqlitePool,
    broker: Arc<TokenBroker>,
    transport: Arc<dyn MailTransport>,
}

impl Relay {
    pub fn new(pool: SqlitePool, broker: Arc<TokenBroker>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            pool,
            broker,
            transport,
        }
    }

    /// Sends a stored message. Idempotent for messages already `sent`; for
    /// everything else, one external request performs at most two transmission
    /// attempts (the second only after an authentication failure, with a
    /// forced-fresh token) and bumps `retry_count` exactly once.
    pub async fn send_message(&self, id: i64) -> Result<SendOutcome> {
        let message = Message::find(&self.pool, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message {id}")))?;

        if message.status == MessageStatus::Sent {
            return Ok(SendOutcome {
                provider_message_id: message.provider_message_id,
                already_sent: true,
            });
        }

        let cfg = db::config::effective(&self.pool).await?;
        let mailbox = cfg
            .get(db::config::RELAY_MAILBOX)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::missing_parameter(db::config::RELAY_MAILBOX))?;

        Message::mark_sending(&self.pool, id).await?;

        let identity = match Identity::from_config(&cfg) {
            Ok(identity) => identity,
            Err(e) => {
                self.finish_failure(id, &e).await?;
                return Err(e);
            }
        };

        let mail = OutboundEmail {
            from: message.from_address.clone(),
            to: message.to_addresses.0.clone(),
            cc: message.cc_addresses.0.clone(),
            subject: message.subject.clone().unwrap_or_default(),
            text: message.body_text.clone(),
            html: message.body_html.clone(),
        };

        match self.attempt(&identity, &mailbox, &mail, false).await {
            Ok(receipt) => self.finish_success(id, receipt).await,
            Err(first) => {
                let detail = first.to_string();
                if !is_auth_failure(&detail) {
                    self.finish_failure(id, &first).await?;
                    return Err(first);
                }

                log_event(
                    &self.pool,
                    LogLevel::Warn,
                    "send",
                    "authentication failed, renewing token and retrying",
                    Some(serde_json::json!({ "message_id": id, "error": detail })),
                )
                .await;

                match self.attempt(&identity, &mailbox, &mail, true).await {
                    Ok(receipt) => self.finish_success(id, receipt).await,
                    Err(second) => {
                        self.finish_failure(id, &second).await?;
                        Err(second)
                    }
                }
            }
        }
    }

    async fn attempt(
        &self,
        identity: &Identity,
        mailbox: &str,
        mail: &OutboundEmail,
        force_fresh_token: bool,
    ) -> Result<DeliveryReceipt> {
        if force_fresh_token {
            self.broker.invalidate().await;
        }

        let token = self.broker.acquire(identity).await?;
        self.transport.deliver(mailbox, &token, mail).await
    }

    async fn finish_success(&self, id: i64, receipt: DeliveryReceipt) -> Result<SendOutcome> {
        Message::mark_sent(&self.pool, id, receipt.provider_message_id.as_deref()).await?;

        log_event(
            &self.pool,
            LogLevel::Info,
            "send",
            "message relayed to provider",
            Some(serde_json::json!({
                "message_id": id,
                "provider_message_id": &receipt.provider_message_id,
            })),
        )
        .await;

        Ok(SendOutcome {
            provider_message_id: receipt.provider_message_id,
            already_sent: false,
        })
    }

    /// Persists the terminal failure before it is reported, so durable state
    /// and the reported outcome never diverge.
    async fn finish_failure(&self, id: i64, error: &Error) -> Result<()> {
        Message::mark_failed(&self.pool, id, &error.to_string()).await?;

        log_event(
            &self.pool,
            LogLevel::Error,
            "send",
            "message relay failed",
            Some(serde_json::json!({ "message_id": id, "error": error.to_string() })),
        )
        .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::is_auth_failure;

    #[test]
    fn provider_auth_responses_match() {
        assert!(is_auth_failure("535 5.7.3 Authentication unsuccessful"));
        assert!(is_auth_failure("AADSTS700016: invalid_grant"));
        assert!(is_auth_failure("SMTP error: Bearer token rejected"));
    }

    #[test]
    fn ordinary_delivery_failures_do_not_match() {
        assert!(!is_auth_failure("550 5.1.1 mailbox unavailable"));
        assert!(!is_auth_failure("connection reset by peer"));
    }
}
