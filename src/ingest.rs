//! Inbound message ingestion: MIME decoding and durable persistence.
//!
//! Parsing is delegated to `mail-parser`; this module only maps the decoded
//! fields onto a stored [`Message`] row. A failure at any point rejects the
//! message without leaving a partial record, so the sending peer can retry.

use mail_parser::{Address, MessageParser, MimeHeaders};
use sqlx::SqlitePool;

use crate::{
    db::{
        log::{log_event, LogLevel},
        message::{AttachmentMeta, Message, NewMessage},
    },
    error::{Error, Result},
};

/// Persists one raw inbound message for the given session. Returns the stored
/// message id.
pub async fn ingest(pool: &SqlitePool, raw: &[u8], connection_id: i64) -> Result<i64> {
    let outcome = match parse(raw) {
        Ok(new_message) => Message::insert(pool, &new_message).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(id) => Ok(id),
        Err(e) => {
            log_event(
                pool,
                LogLevel::Error,
                "smtp",
                "message rejected at ingestion",
                Some(serde_json::json!({
                    "connection_id": connection_id,
                    "error": e.to_string(),
                })),
            )
            .await;
            Err(e)
        }
    }
}

/// Decodes a raw RFC 5322 payload into a [`NewMessage`].
///
/// Recipients from the Cc header are folded into `to_addresses` on purpose:
/// downstream they are delivery targets too, while `cc_addresses` keeps the
/// cc-only list for display.
pub fn parse(raw: &[u8]) -> Result<NewMessage> {
    if raw.is_empty() {
        return Err(Error::parse_failed("empty message payload"));
    }

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::parse_failed("unparseable MIME payload"))?;

    let to = addresses(parsed.to());
    let cc = addresses(parsed.cc());
    let bcc = addresses(parsed.bcc());

    let mut to_addresses = to;
    to_addresses.extend(cc.iter().cloned());

    let from_address = addresses(parsed.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| "unknown".to_owned());

    let attachments = parsed
        .attachments()
        .map(|part| AttachmentMeta {
            filename: part.attachment_name().map(str::to_owned),
            content_type: part.content_type().map(|ct| match ct.c_subtype.as_deref() {
                Some(sub) => format!("{}/{sub}", ct.c_type),
                None => ct.c_type.to_string(),
            }),
            size: part.contents().len() as i64,
        })
        .collect();

    Ok(NewMessage {
        message_id: parsed.message_id().map(str::to_owned),
        from_address,
        to_addresses,
        cc_addresses: cc,
        bcc_addresses: bcc,
        subject: parsed.subject().map(str::to_owned),
        body_text: parsed.body_text(0).map(|b| b.into_owned()),
        body_html: parsed.body_html(0).map(|b| b.into_owned()),
        attachments,
        headers: raw_headers(raw),
        size_bytes: raw.len() as i64,
    })
}

/// Collects the raw top-level header lines into a name → value map, unfolding
/// continuation lines. The structured fields above come from the MIME parser;
/// this keeps the unmodified header text around for display and audit.
fn raw_headers(raw: &[u8]) -> serde_json::Map<String, serde_json::Value> {
    let text = String::from_utf8_lossy(raw);
    let mut headers = serde_json::Map::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        if line.is_empty() {
            break;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }

        if let Some((name, value)) = current.take() {
            headers.insert(name, serde_json::Value::String(value));
        }

        if let Some((name, value)) = line.split_once(':') {
            current = Some((name.trim().to_owned(), value.trim().to_owned()));
        }
    }

    if let Some((name, value)) = current.take() {
        headers.insert(name, serde_json::Value::String(value));
    }

    headers
}

fn addresses(header: Option<&Address>) -> Vec<String> {
    header
        .map(|list| {
            list.iter()
                .filter_map(|addr| addr.address.as_ref().map(|a| a.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"Message-ID: <m1@example.com>\r\n\
From: Sender <sender@example.com>\r\n\
To: a@x.com\r\n\
Cc: b@x.com\r\n\
Subject: Hi\r\n\
Content-Type: text/plain\r\n\
\r\n\
Hello there\r\n";

    #[test]
    fn cc_recipients_are_folded_into_to() {
        let parsed = parse(RAW).unwrap();

        assert_eq!(parsed.to_addresses, vec!["a@x.com", "b@x.com"]);
        assert_eq!(parsed.cc_addresses, vec!["b@x.com"]);
        assert_eq!(parsed.from_address, "sender@example.com");
        assert_eq!(parsed.subject.as_deref(), Some("Hi"));
        assert_eq!(parsed.message_id.as_deref(), Some("m1@example.com"));
        assert_eq!(parsed.size_bytes, RAW.len() as i64);
        assert!(parsed.body_text.unwrap().contains("Hello there"));
        assert_eq!(
            parsed.headers.get("Subject"),
            Some(&serde_json::Value::String("Hi".to_owned()))
        );
    }

    #[test]
    fn folded_headers_are_unfolded() {
        let raw = b"To: a@x.com,\r\n\tb@x.com\r\nSubject: ok\r\n\r\nbody\r\n";
        let headers = raw_headers(raw);
        assert_eq!(
            headers.get("To"),
            Some(&serde_json::Value::String("a@x.com, b@x.com".to_owned()))
        );
        assert_eq!(
            headers.get("Subject"),
            Some(&serde_json::Value::String("ok".to_owned()))
        );
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(
            parse(b""),
            Err(Error::ParseFailed { .. })
        ));
    }

    #[test]
    fn missing_sender_falls_back_to_unknown() {
        let parsed = parse(b"To: a@x.com\r\nSubject: x\r\n\r\nbody\r\n").unwrap();
        assert_eq!(parsed.from_address, "unknown");
    }
}
