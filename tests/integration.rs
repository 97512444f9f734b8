use std::{
    collections::VecDeque,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use chrono::{Duration, Utc};
use mailgate::{
    auth::{AccessToken, Identity, TokenProvider},
    config::Config,
    db::{
        self,
        connection::Connection,
        log::LogLevel,
        message::{MessageFilter, MessageStatus},
    },
    error::Error,
    ingest,
    relay::{DeliveryReceipt, MailTransport, OutboundEmail},
    service::Service,
};
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::tcp::OwnedReadHalf,
};

const RAW_MESSAGE: &[u8] = b"Message-ID: <m1@example.com>\r\n\
From: Sender <sender@example.com>\r\n\
To: a@x.com\r\n\
Cc: b@x.com\r\n\
Subject: Hi\r\n\
\r\n\
Hello there\r\n";

/// Identity provider stub: hands out unique tokens and counts acquisitions.
struct StubProvider {
    fetches: AtomicUsize,
    expiry_secs: Mutex<i64>,
}

impl StubProvider {
    fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            expiry_secs: Mutex::new(3600),
        }
    }

    fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn set_expiry_secs(&self, secs: i64) {
        *self.expiry_secs.lock().unwrap() = secs;
    }
}

impl TokenProvider for StubProvider {
    fn fetch<'a>(
        &'a self,
        identity: &'a Identity,
    ) -> Pin<Box<dyn Future<Output = Result<AccessToken, Error>> + Send + 'a>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("token-{}-{n}", identity.tenant_id);
        let expiry_secs = *self.expiry_secs.lock().unwrap();

        Box::pin(async move {
            Ok(AccessToken {
                token,
                expires_at: Utc::now() + Duration::seconds(expiry_secs),
            })
        })
    }
}

/// Transport stub: pops scripted outcomes, succeeding by default, and counts
/// transmission attempts.
struct StubTransport {
    attempts: AtomicUsize,
    script: Mutex<VecDeque<Result<DeliveryReceipt, String>>>,
}

impl StubTransport {
    fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
        }
    }

    fn attempt_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn push_failure(&self, detail: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(detail.to_owned()));
    }
}

impl MailTransport for StubTransport {
    fn deliver<'a>(
        &'a self,
        _mailbox: &'a str,
        _token: &'a AccessToken,
        _mail: &'a OutboundEmail,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, Error>> + Send + 'a>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();

        Box::pin(async move {
            match next {
                Some(Err(detail)) => Err(Error::delivery(detail)),
                Some(Ok(receipt)) => Ok(receipt),
                None => Ok(DeliveryReceipt {
                    provider_message_id: Some("provider-ok".to_owned()),
                }),
            }
        })
    }
}

struct TmpService {
    svc: Service,
    provider: Arc<StubProvider>,
    transport: Arc<StubTransport>,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup() -> TmpService {
    let tmpdir = tempfile::tempdir().unwrap();
    let provider = Arc::new(StubProvider::new());
    let transport = Arc::new(StubTransport::new());

    let svc = Service::connect_with_parts(
        Config {
            db_path: Some(
                tmpdir
                    .path()
                    .join("mailgate.db")
                    .to_string_lossy()
                    .to_string(),
            ),
        },
        provider.clone(),
        transport.clone(),
    )
    .await
    .unwrap();

    TmpService {
        svc,
        provider,
        transport,
        tmpdir,
    }
}

async fn seed_credentials(svc: &Service) {
    svc.write_config(vec![
        (db::config::AZURE_TENANT_ID.into(), "tenant-xyz-123".into()),
        (db::config::AZURE_CLIENT_ID.into(), "client-app-1".into()),
        (
            db::config::AZURE_CLIENT_SECRET.into(),
            "abcdef1234567890".into(),
        ),
        (db::config::RELAY_MAILBOX.into(), "relay@corp.example".into()),
    ])
    .await
    .unwrap();
}

async fn seed_message(svc: &Service) -> i64 {
    let conn = Connection::open(svc.db(), "203.0.113.7").await.unwrap();
    ingest::ingest(svc.db(), RAW_MESSAGE, conn).await.unwrap()
}

fn identity(tenant: &str) -> Identity {
    Identity {
        tenant_id: tenant.to_owned(),
        client_id: "client-app-1".to_owned(),
        client_secret: SecretString::from("s3cret".to_owned()),
    }
}

#[tokio::test]
async fn ingestion_records_message_with_cc_as_recipients() {
    let service = setup().await;

    let conn = Connection::open(service.db(), "203.0.113.7").await.unwrap();
    let id = ingest::ingest(service.db(), RAW_MESSAGE, conn).await.unwrap();
    Connection::record_message(service.db(), conn).await.unwrap();

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Received);
    assert_eq!(message.from_address, "sender@example.com");
    assert_eq!(message.to_addresses.0, vec!["a@x.com", "b@x.com"]);
    assert_eq!(message.cc_addresses.0, vec!["b@x.com"]);
    assert_eq!(message.subject.as_deref(), Some("Hi"));
    assert_eq!(message.retry_count, 0);
    assert!(message.sent_at.is_none());
    assert!(message.provider_message_id.is_none());

    let connection = Connection::find(service.db(), conn).await.unwrap().unwrap();
    assert_eq!(connection.messages_received, 1);
    assert!(connection.disconnected_at.is_none());
}

#[tokio::test]
async fn malformed_payload_creates_no_row() {
    let service = setup().await;
    let conn = Connection::open(service.db(), "203.0.113.7").await.unwrap();

    let err = ingest::ingest(service.db(), b"", conn).await.unwrap_err();
    assert!(matches!(err, Error::ParseFailed { .. }));
    assert_eq!(service.message_count().await.unwrap(), 0);

    let logs = service.recent_logs(10).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Error && l.component == "smtp"));
}

#[tokio::test]
async fn duplicate_protocol_message_id_is_tolerated() {
    let service = setup().await;
    let conn = Connection::open(service.db(), "203.0.113.7").await.unwrap();

    let first = ingest::ingest(service.db(), RAW_MESSAGE, conn).await.unwrap();
    let second = ingest::ingest(service.db(), RAW_MESSAGE, conn).await.unwrap();

    assert_eq!(
        service
            .get_message(first)
            .await
            .unwrap()
            .message_id
            .as_deref(),
        Some("m1@example.com")
    );
    assert_eq!(service.get_message(second).await.unwrap().message_id, None);
    assert_eq!(service.message_count().await.unwrap(), 2);
}

#[tokio::test]
async fn send_marks_sent_and_repeat_is_idempotent() {
    let service = setup().await;
    seed_credentials(&service).await;
    let id = seed_message(&service).await;

    let outcome = service.send_message(id).await.unwrap();
    assert!(!outcome.already_sent);
    assert_eq!(outcome.provider_message_id.as_deref(), Some("provider-ok"));
    assert_eq!(service.transport.attempt_count(), 1);

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert!(message.sent_at.is_some());
    assert_eq!(message.provider_message_id.as_deref(), Some("provider-ok"));
    assert_eq!(message.retry_count, 1);
    assert!(message.last_error.is_none());

    let repeat = service.send_message(id).await.unwrap();
    assert!(repeat.already_sent);
    assert_eq!(repeat.provider_message_id.as_deref(), Some("provider-ok"));
    assert_eq!(service.transport.attempt_count(), 1);
    assert_eq!(service.get_message(id).await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn retry_count_tracks_send_requests() {
    let service = setup().await;
    seed_credentials(&service).await;
    let id = seed_message(&service).await;

    service
        .transport
        .push_failure("550 5.1.1 mailbox unavailable");
    let err = service.send_message(id).await.unwrap_err();
    assert!(matches!(err, Error::Delivery { .. }));

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 1);
    assert!(message.last_error.unwrap().contains("550"));

    service.send_message(id).await.unwrap();

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.retry_count, 2);
    assert!(message.last_error.is_none());
}

#[tokio::test]
async fn auth_failure_forces_exactly_one_extra_attempt() {
    let service = setup().await;
    seed_credentials(&service).await;
    let id = seed_message(&service).await;

    service
        .transport
        .push_failure("535 5.7.3 Authentication unsuccessful");
    service
        .transport
        .push_failure("535 5.7.3 Authentication unsuccessful");

    let err = service.send_message(id).await.unwrap_err();
    assert!(matches!(err, Error::Delivery { .. }));

    // two transmissions, two token fetches (the retry forced a fresh one)
    assert_eq!(service.transport.attempt_count(), 2);
    assert_eq!(service.provider.fetch_count(), 2);

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
    assert_eq!(message.retry_count, 1);

    let logs = service.recent_logs(20).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.level == LogLevel::Warn && l.component == "send"));
}

#[tokio::test]
async fn auth_failure_recovers_when_fresh_token_works() {
    let service = setup().await;
    seed_credentials(&service).await;
    let id = seed_message(&service).await;

    service
        .transport
        .push_failure("535 5.7.3 Authentication unsuccessful");

    let outcome = service.send_message(id).await.unwrap();
    assert_eq!(outcome.provider_message_id.as_deref(), Some("provider-ok"));
    assert_eq!(service.transport.attempt_count(), 2);

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Sent);
    assert_eq!(message.retry_count, 1);
}

#[tokio::test]
async fn non_auth_failure_is_not_retried() {
    let service = setup().await;
    seed_credentials(&service).await;
    let id = seed_message(&service).await;

    service
        .transport
        .push_failure("550 5.1.1 mailbox unavailable");

    service.send_message(id).await.unwrap_err();

    assert_eq!(service.transport.attempt_count(), 1);
    assert_eq!(service.provider.fetch_count(), 1);
    assert_eq!(
        service.get_message(id).await.unwrap().status,
        MessageStatus::Failed
    );
}

#[tokio::test]
async fn token_cache_reuses_until_invalidated() {
    let service = setup().await;
    let identity = identity("tenant-a");
    let broker = service.broker();

    let t1 = broker.acquire(&identity).await.unwrap();
    let t2 = broker.acquire(&identity).await.unwrap();
    assert_eq!(t1.token, t2.token);
    assert_eq!(service.provider.fetch_count(), 1);

    broker.invalidate().await;

    let t3 = broker.acquire(&identity).await.unwrap();
    assert_ne!(t1.token, t3.token);
    assert_eq!(service.provider.fetch_count(), 2);
}

#[tokio::test]
async fn token_inside_skew_window_is_refreshed() {
    let service = setup().await;
    let identity = identity("tenant-a");
    service.provider.set_expiry_secs(60); // inside the 120 s skew

    service.broker().acquire(&identity).await.unwrap();
    service.broker().acquire(&identity).await.unwrap();

    assert_eq!(service.provider.fetch_count(), 2);
}

#[tokio::test]
async fn identity_change_never_leaks_cached_token() {
    let service = setup().await;
    let broker = service.broker();

    let ta = broker.acquire(&identity("tenant-a")).await.unwrap();
    let tb = broker.acquire(&identity("tenant-b")).await.unwrap();

    assert_ne!(ta.token, tb.token);
    assert!(tb.token.contains("tenant-b"));
    assert_eq!(service.provider.fetch_count(), 2);
}

#[tokio::test]
async fn config_masking_hides_sensitive_values() {
    let service = setup().await;
    seed_credentials(&service).await;

    let cfg = service.read_config().await.unwrap();
    assert_eq!(cfg[db::config::AZURE_CLIENT_SECRET], "\u{2022}".repeat(12));
    assert_eq!(cfg[db::config::AZURE_TENANT_ID], "ten••••••123");
    assert_eq!(cfg[db::config::RELAY_MAILBOX], "relay@corp.example");

    // writing the masked value back must not clobber the stored secret
    service
        .write_config(vec![(
            db::config::AZURE_CLIENT_SECRET.into(),
            "\u{2022}".repeat(12),
        )])
        .await
        .unwrap();

    let stored = db::config::stored(service.db()).await.unwrap();
    assert_eq!(stored[db::config::AZURE_CLIENT_SECRET], "abcdef1234567890");
}

#[tokio::test]
async fn send_without_credentials_reports_identity_error() {
    for key in [
        db::config::AZURE_TENANT_ID,
        db::config::AZURE_CLIENT_ID,
        db::config::AZURE_CLIENT_SECRET,
    ] {
        std::env::remove_var(key);
    }

    let service = setup().await;
    service
        .write_config(vec![(
            db::config::RELAY_MAILBOX.into(),
            "relay@corp.example".into(),
        )])
        .await
        .unwrap();
    let id = seed_message(&service).await;

    let err = service.send_message(id).await.unwrap_err();
    assert!(matches!(err, Error::IdentityConfigIncomplete { .. }));

    // the terminal state is persisted before the error is reported
    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Failed);
}

#[tokio::test]
async fn listing_is_newest_first() {
    let service = setup().await;
    let conn = Connection::open(service.db(), "203.0.113.7").await.unwrap();

    let first = ingest::ingest(service.db(), RAW_MESSAGE, conn).await.unwrap();
    let second = ingest::ingest(
        service.db(),
        b"From: other@example.com\r\nTo: c@x.com\r\nSubject: Two\r\n\r\nSecond\r\n",
        conn,
    )
    .await
    .unwrap();

    let items = service
        .list_messages(&MessageFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        items.iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![second, first]
    );

    let only_other = service
        .list_messages(&MessageFilter {
            from: Some("other@".into()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(only_other.len(), 1);
    assert_eq!(only_other[0].id, second);
}

async fn read_reply(reader: &mut BufReader<OwnedReadHalf>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).await.unwrap();
    line
}

#[tokio::test]
async fn smtp_session_ingests_over_the_wire() {
    let service = setup().await;
    let port = service.start_smtp(0).await.unwrap();

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    assert!(read_reply(&mut reader).await.starts_with("220"));

    writer.write_all(b"EHLO client.example\r\n").await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("250"));

    writer
        .write_all(b"MAIL FROM:<sender@example.com>\r\n")
        .await
        .unwrap();
    assert!(read_reply(&mut reader).await.starts_with("250"));

    writer.write_all(b"RCPT TO:<a@x.com>\r\n").await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("250"));

    writer.write_all(b"DATA\r\n").await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("354"));

    writer
        .write_all(
            b"From: Sender <sender@example.com>\r\n\
To: a@x.com\r\n\
Cc: b@x.com\r\n\
Subject: Hi\r\n\
\r\n\
Hello over the wire\r\n\
.\r\n",
        )
        .await
        .unwrap();
    assert!(read_reply(&mut reader).await.starts_with("250"));

    writer.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_reply(&mut reader).await.starts_with("221"));

    // the 250 after the terminating dot means the row is already durable
    assert_eq!(service.message_count().await.unwrap(), 1);

    let items = service
        .list_messages(&MessageFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    let message = service.get_message(items[0].id).await.unwrap();
    assert_eq!(message.to_addresses.0, vec!["a@x.com", "b@x.com"]);
    assert_eq!(message.cc_addresses.0, vec!["b@x.com"]);
    assert!(message.body_text.unwrap().contains("Hello over the wire"));

    let connection = Connection::find(service.db(), 1).await.unwrap().unwrap();
    assert_eq!(connection.messages_received, 1);

    // disconnect stamp lands after the session task unwinds
    let mut closed = false;
    for _ in 0..100 {
        if Connection::find(service.db(), 1)
            .await
            .unwrap()
            .unwrap()
            .disconnected_at
            .is_some()
        {
            closed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(closed);

    service.stop_smtp().await;
    assert!(!service.smtp_status().await.running);
}

#[tokio::test]
async fn listener_restart_on_same_port_is_a_noop() {
    let service = setup().await;

    assert!(!service.smtp_status().await.running);

    let port = service.start_smtp(0).await.unwrap();
    let status = service.smtp_status().await;
    assert!(status.running);
    assert_eq!(status.port, Some(port));

    assert_eq!(service.start_smtp(port).await.unwrap(), port);

    service
        .write_config(vec![(db::config::SMTP_PORT.into(), port.to_string())])
        .await
        .unwrap();
    assert_eq!(service.restart_smtp().await.unwrap(), port);
    assert!(service.smtp_status().await.running);

    service.stop_smtp().await;
    assert!(!service.smtp_status().await.running);
}
