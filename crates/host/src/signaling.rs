//! Outbound signaling WebSocket.
//!
//! At most one socket exists; `connect` replaces any prior connection. A
//! single task owns each socket, multiplexing reads and a per-connection
//! outbox so text frames never interleave. Close, error, and graceful remote
//! close all surface as one `Disconnected` event.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use p2prd_protocol::WireMessage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum SignalingEvent {
    /// One complete UTF-8 text message (tungstenite reassembles fragments).
    Message(String),
    Disconnected,
}

struct ActiveConn {
    uri: String,
    outbox: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

pub struct SignalingClient {
    events: mpsc::Sender<SignalingEvent>,
    conn: Mutex<Option<ActiveConn>>,
    connected: Arc<AtomicBool>,
    /// Generation of the live connection; a replaced task must not clobber
    /// the replacement's state.
    current_conn: Arc<AtomicU64>,
    next_conn: AtomicU64,
    shutdown: CancellationToken,
}

impl SignalingClient {
    pub fn new(events: mpsc::Sender<SignalingEvent>, shutdown: CancellationToken) -> Self {
        Self {
            events,
            conn: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            current_conn: Arc::new(AtomicU64::new(0)),
            next_conn: AtomicU64::new(1),
            shutdown,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn current_uri(&self) -> Option<String> {
        self.conn
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.uri.clone())
    }

    /// Establish a socket to `uri`, tearing down any existing one first.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        self.disconnect();

        info!(uri, "Connecting to signaling relay");
        let (ws, _) = connect_async(uri)
            .await
            .context("WebSocket connection failed")?;

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(64);
        let cancel = self.shutdown.child_token();
        {
            let mut slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some(ActiveConn {
                uri: uri.to_string(),
                outbox: outbox_tx,
                cancel: cancel.clone(),
            });
        }
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.current_conn.store(conn_id, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);

        let events = self.events.clone();
        let connected = Arc::clone(&self.connected);
        let current_conn = Arc::clone(&self.current_conn);
        let (mut ws_tx, mut ws_rx) = ws.split();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                    Some(out) = outbox_rx.recv() => {
                        if let Err(e) = ws_tx.send(out).await {
                            debug!("Signaling send failed: {e}");
                            break;
                        }
                    }
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if events.send(SignalingEvent::Message(text.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                debug!("Signaling socket error: {e}");
                                break;
                            }
                            // pings are answered by tungstenite; binary ignored
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
            if current_conn.load(Ordering::Relaxed) == conn_id {
                connected.store(false, Ordering::Relaxed);
            }
            // A replaced or cancelled connection still reports the drop: the
            // session layer tears the lease down and starts a fresh handshake
            // on whatever socket is live.
            let _ = events.send(SignalingEvent::Disconnected).await;
        });

        info!("Signaling connected");
        Ok(())
    }

    /// Queue a message on the current socket. Returns false when nothing is
    /// connected or the outbox is full; the caller decides whether that
    /// matters (frames are droppable, control replies are not retried).
    pub fn send(&self, msg: &WireMessage) -> bool {
        let json = match serde_json::to_string(msg) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to encode signaling message: {e}");
                return false;
            }
        };
        let slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(conn) => conn.outbox.try_send(Message::Text(json.into())).is_ok(),
            None => false,
        }
    }

    /// Drop the current connection, if any. The owning task notices the
    /// cancellation at its next suspension and emits `Disconnected`.
    pub fn disconnect(&self) {
        let mut slot = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conn) = slot.take() {
            debug!(uri = %conn.uri, "Replacing signaling connection");
            conn.cancel.cancel();
        }
        self.connected.store(false, Ordering::Relaxed);
    }

}
