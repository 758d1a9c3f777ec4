// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket listener: one snapshot per state change, commands in.

use crate::host::Host;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct Listener {
    tcp: TcpListener,
    host: Arc<Host>,
}

impl Listener {
    pub async fn bind(addr: &str, host: Arc<Host>) -> Result<Self, ListenError> {
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenError::Bind { addr: addr.to_string(), source })?;
        Ok(Self { tcp, host })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp.local_addr().ok()
    }

    /// Accept loop; one task per connection.
    pub async fn run(self) {
        if let Some(addr) = self.local_addr() {
            info!(%addr, "listening");
        }
        loop {
            match self.tcp.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "client connected");
                    let host = Arc::clone(&self.host);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, host).await {
                            debug!(%addr, error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    host: Arc<Host>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut tx, mut rx) = ws.split();
    let mut changes = host.changes();

    // Initial snapshot, then one per observed change.
    send_snapshot(&mut tx, &host).await?;

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                // Coalesce bursts within one scheduling tick.
                tokio::task::yield_now().await;
                changes.mark_unchanged();
                send_snapshot(&mut tx, &host).await?;
            }
            message = rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for line in text.lines().filter(|l| !l.trim().is_empty()) {
                        match labrun_wire::decode_message(line) {
                            Ok(message) => {
                                if let Err(e) = host.process_message(message).await {
                                    warn!(error = %e, "client message failed");
                                    // Errors still surface through the next
                                    // snapshot's drafts/locations.
                                    send_snapshot(&mut tx, &host).await?;
                                }
                            }
                            Err(e) => warn!(error = %e, "undecodable client message"),
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }
    }
    Ok(())
}

async fn send_snapshot(
    tx: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    host: &Host,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let snapshot = host.snapshot();
    let mut text = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string());
    text.push('\n');
    tx.send(Message::Text(text.into())).await
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
