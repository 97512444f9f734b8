//! Per-session SMTP command loop.
//!
//! Deliberately minimal: HELO/EHLO, MAIL FROM, RCPT TO, DATA, RSET, NOOP and
//! QUIT. Inbound AUTH is not offered; the gateway sits behind trusted
//! infrastructure and authentication happens on the outbound leg.

use std::net::SocketAddr;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::{db::connection::Connection, ingest};

pub(crate) async fn run(pool: sqlx::SqlitePool, socket: TcpStream, peer: SocketAddr) {
    if let Err(e) = handle(pool, socket, peer).await {
        tracing::warn!(%peer, "smtp session ended with error: {e}");
    }
}

async fn handle(pool: sqlx::SqlitePool, socket: TcpStream, peer: SocketAddr) -> eyre::Result<()> {
    socket.set_nodelay(true)?;
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);

    // No session proceeds without a recorded identity.
    let conn_id = match Connection::open(&pool, &peer.ip().to_string()).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!(%peer, "rejecting connection, could not record it: {e}");
            let _ = writer
                .write_all(b"421 Service not available, closing channel\r\n")
                .await;
            return Ok(());
        }
    };

    tracing::debug!(%peer, conn_id, "smtp session opened");
    writer.write_all(b"220 mailgate ESMTP\r\n").await?;

    let mut line = String::new();
    let mut data_mode = false;
    let mut data: Vec<String> = Vec::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let cmd = line.trim_end_matches(['\r', '\n']);

        if data_mode {
            if cmd == "." {
                data_mode = false;
                let raw = data.join("\r\n");
                data.clear();

                match ingest::ingest(&pool, raw.as_bytes(), conn_id).await {
                    Ok(id) => {
                        if let Err(e) = Connection::record_message(&pool, conn_id).await {
                            tracing::warn!(conn_id, "connection counter update failed: {e}");
                        }
                        tracing::info!(%peer, conn_id, message = id, "message ingested");
                        writer.write_all(b"250 Ok: message accepted\r\n").await?;
                    }
                    Err(e) => {
                        tracing::error!(%peer, conn_id, "ingestion failed: {e}");
                        writer
                            .write_all(b"451 Temporary failure, try again later\r\n")
                            .await?;
                    }
                }
            } else {
                // Undo SMTP dot-stuffing.
                let stored = cmd.strip_prefix('.').filter(|_| cmd.starts_with(".."));
                data.push(stored.unwrap_or(cmd).to_owned());
            }
            continue;
        }

        let upper = cmd.to_ascii_uppercase();
        if upper.starts_with("HELO") || upper.starts_with("EHLO") {
            writer.write_all(b"250 mailgate greets you\r\n").await?;
        } else if upper.starts_with("MAIL FROM:") {
            writer.write_all(b"250 Ok\r\n").await?;
        } else if upper.starts_with("RCPT TO:") {
            writer.write_all(b"250 Ok\r\n").await?;
        } else if upper == "DATA" {
            data_mode = true;
            writer
                .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                .await?;
        } else if upper == "RSET" {
            data.clear();
            writer.write_all(b"250 Ok\r\n").await?;
        } else if upper == "NOOP" {
            writer.write_all(b"250 Ok\r\n").await?;
        } else if upper == "QUIT" {
            writer.write_all(b"221 Bye\r\n").await?;
            break;
        } else {
            writer.write_all(b"502 Command not implemented\r\n").await?;
        }
    }

    if let Err(e) = Connection::close(&pool, conn_id).await {
        tracing::warn!(conn_id, "failed to stamp disconnect time: {e}");
    }
    tracing::debug!(%peer, conn_id, "smtp session closed");

    Ok(())
}
