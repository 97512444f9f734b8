//! Inbound SMTP listener: TCP accept loop plus stop/start/restart control.
//!
//! Each accepted socket runs an independent session task; sessions never block
//! one another or the outbound relay.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

mod session;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerStatus {
    pub running: bool,
    pub port: Option<u16>,
}

struct ListenerHandle {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct SmtpListener {
    pool: SqlitePool,
    state: Mutex<Option<ListenerHandle>>,
}

impl SmtpListener {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            state: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> ListenerStatus {
        let state = self.state.lock().await;
        ListenerStatus {
            running: state.is_some(),
            port: state.as_ref().map(|h| h.port),
        }
    }

    /// Binds and starts accepting sessions. Already listening on the requested
    /// port is a no-op; a different port stops the old listener first. Port 0
    /// binds an ephemeral port. Returns the actually bound port.
    pub async fn start(&self, port: u16) -> Result<u16> {
        let mut state = self.state.lock().await;

        if let Some(handle) = state.as_ref() {
            if port != 0 && handle.port == port {
                return Ok(handle.port);
            }
        }

        if let Some(handle) = state.take() {
            shut_down(handle).await;
        }

        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound_port = listener.local_addr()?.port();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.pool.clone(), listener, shutdown.clone()));

        *state = Some(ListenerHandle {
            port: bound_port,
            shutdown,
            task,
        });

        tracing::info!(port = bound_port, "smtp listener started");

        Ok(bound_port)
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.state.lock().await.take() {
            shut_down(handle).await;
            tracing::info!("smtp listener stopped");
        }
    }

    pub async fn restart(&self, port: u16) -> Result<u16> {
        self.start(port).await
    }
}

async fn shut_down(handle: ListenerHandle) {
    handle.shutdown.cancel();
    let _ = handle.task.await;
}

async fn accept_loop(pool: SqlitePool, listener: TcpListener, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    tokio::spawn(session::run(pool.clone(), socket, peer));
                }
                Err(e) => {
                    tracing::warn!("failed to accept smtp connection: {e}");
                }
            },
        }
    }
}
