use std::{collections::HashMap, sync::Arc};

use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};

use crate::{
    auth::{Identity, MicrosoftTokenProvider, TokenBroker, TokenProvider},
    config::Config,
    db::{
        self,
        log::{log_event, LogLevel, SystemLogEntry},
        message::{Message, MessageFilter, MessageSummary},
    },
    error::{Error, Result},
    relay::{MailTransport, Office365Transport, Relay, SendOutcome},
    smtp::{ListenerStatus, SmtpListener},
};

/// Connectivity test result exposed to administrative callers. The token
/// itself is never returned.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectivityReport {
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct Service {
    db: SqlitePool,
    config: Config,
    broker: Arc<TokenBroker>,
    relay: Relay,
    listener: Arc<SmtpListener>,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        Self::connect_with_parts(
            config,
            Arc::new(MicrosoftTokenProvider::new()),
            Arc::new(Office365Transport::new()),
        )
        .await
    }

    /// Connects with explicit capability implementations. Tests inject stubs
    /// for the identity provider and the mail transport.
    pub async fn connect_with_parts(
        config: Config,
        provider: Arc<dyn TokenProvider>,
        transport: Arc<dyn MailTransport>,
    ) -> eyre::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let broker = Arc::new(TokenBroker::new(pool.clone(), provider));
        let relay = Relay::new(pool.clone(), broker.clone(), transport);
        let listener = Arc::new(SmtpListener::new(pool.clone()));

        Ok(Self {
            db: pool,
            config,
            broker,
            relay,
            listener,
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn broker(&self) -> &Arc<TokenBroker> {
        &self.broker
    }

    pub async fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageSummary>> {
        Message::list(&self.db, filter).await
    }

    pub async fn get_message(&self, id: i64) -> Result<Message> {
        Message::find(&self.db, id)
            .await?
            .ok_or_else(|| Error::not_found(format!("message {id}")))
    }

    pub async fn message_count(&self) -> Result<i64> {
        Message::count(&self.db).await
    }

    pub async fn send_message(&self, id: i64) -> Result<SendOutcome> {
        self.relay.send_message(id).await
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SystemLogEntry>> {
        SystemLogEntry::recent(&self.db, limit).await
    }

    /// Effective configuration with sensitive fields masked, the only form in
    /// which configuration leaves the process.
    pub async fn read_config(&self) -> Result<HashMap<String, String>> {
        Ok(db::config::masked(&db::config::effective(&self.db).await?))
    }

    /// Upserts allow-listed entries. A secret submitted in its masked form is
    /// a round-trip of the UI display, not a new value, and is skipped.
    pub async fn write_config(&self, updates: Vec<(String, String)>) -> Result<()> {
        let updates: Vec<(String, String)> = updates
            .into_iter()
            .filter(|(key, value)| {
                !(key == db::config::AZURE_CLIENT_SECRET && db::config::is_masked_value(value))
            })
            .collect();

        if updates.is_empty() {
            return Ok(());
        }

        db::config::set_many(&self.db, &updates).await?;

        let keys: Vec<&str> = updates.iter().map(|(k, _)| k.as_str()).collect();
        log_event(
            &self.db,
            LogLevel::Info,
            "web",
            "configuration updated",
            Some(serde_json::json!({ "keys": keys })),
        )
        .await;

        Ok(())
    }

    /// Probes the identity provider with the effective credentials.
    pub async fn test_connectivity(&self) -> Result<ConnectivityReport> {
        let cfg = db::config::effective(&self.db).await?;
        let identity = Identity::from_config(&cfg)?;
        let token = self.broker.test_acquire(&identity).await?;

        Ok(ConnectivityReport {
            expires_at: token.expires_at,
        })
    }

    pub async fn smtp_status(&self) -> ListenerStatus {
        self.listener.status().await
    }

    pub async fn start_smtp(&self, port: u16) -> Result<u16> {
        self.listener.start(port).await
    }

    pub async fn stop_smtp(&self) {
        self.listener.stop().await
    }

    /// Stop-then-start on the effective SMTP port; a no-op when already
    /// listening there.
    pub async fn restart_smtp(&self) -> Result<u16> {
        let cfg = db::config::effective(&self.db).await?;
        let port: u16 = cfg
            .get(db::config::SMTP_PORT)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::invalid_parameter("SMTP_PORT is not a valid port"))?;

        let port = self.listener.restart(port).await?;

        log_event(
            &self.db,
            LogLevel::Info,
            "web",
            "smtp listener restarted",
            Some(serde_json::json!({ "port": port })),
        )
        .await;

        Ok(port)
    }

    /// Effective SMTP port for bootstrap.
    pub async fn smtp_port(&self) -> Result<u16> {
        let cfg = db::config::effective(&self.db).await?;
        cfg.get(db::config::SMTP_PORT)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::invalid_parameter("SMTP_PORT is not a valid port"))
    }

    /// Effective web port for bootstrap.
    pub async fn web_port(&self) -> Result<u16> {
        let cfg = db::config::effective(&self.db).await?;
        cfg.get(db::config::WEB_PORT)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::invalid_parameter("WEB_PORT is not a valid port"))
    }
}
