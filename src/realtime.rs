//! Realtime fan-out channel.
//!
//! Observers connect over WebSocket and receive every [`ServerEvent`] the
//! coordinator broadcasts. The only inbound frame understood is
//! `{"type":"ping"}`, answered with a `pong`; observers that stay silent
//! past the client timeout are disconnected by the liveness sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::event::{EventKind, ServerEvent};

/// Frame queued for one observer's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized event text.
    Text(String),
    /// Close the socket.
    Close,
}

/// Bookkeeping for one connected observer.
#[derive(Debug)]
struct WsClient {
    tx: mpsc::UnboundedSender<Outbound>,
    connected_at: DateTime<Utc>,
    last_ping: DateTime<Utc>,
}

/// Minimal shape of an inbound observer frame.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: EventKind,
}

/// Registry of connected observers.
#[derive(Debug)]
pub struct RealtimeHub {
    clients: Mutex<HashMap<String, WsClient>>,
    client_timeout: Duration,
    shutdown: CancellationToken,
}

impl RealtimeHub {
    /// Create a hub that drops observers silent for longer than `client_timeout`.
    #[must_use]
    pub fn new(client_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            client_timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Track a new observer and queue its initial `pong`.
    ///
    /// Returns the generated client id and the observer's outbound queue.
    pub fn register(&self) -> (String, mpsc::UnboundedReceiver<Outbound>) {
        let client_id = format!("ws-{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Outbound::Text(ServerEvent::pong().to_json()));

        let now = Utc::now();
        let count = {
            let mut clients = self.lock();
            clients.insert(
                client_id.clone(),
                WsClient {
                    tx,
                    connected_at: now,
                    last_ping: now,
                },
            );
            clients.len()
        };
        info!(client_id, clients = count, "observer connected");
        (client_id, rx)
    }

    /// Forget an observer. Unknown ids are ignored.
    pub fn unregister(&self, client_id: &str) {
        if let Some(client) = self.lock().remove(client_id) {
            let connected_secs = (Utc::now() - client.connected_at).num_seconds();
            info!(client_id, connected_secs, "observer disconnected");
        }
    }

    /// Send `event` to every connected observer.
    ///
    /// A failed send drops that observer and never stops delivery to the
    /// rest. Returns the number of observers reached.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let text = event.to_json();
        let mut clients = self.lock();
        let mut dead = Vec::new();
        let mut delivered = 0;

        for (client_id, client) in clients.iter() {
            if client.tx.send(Outbound::Text(text.clone())).is_ok() {
                delivered += 1;
            } else {
                warn!(client_id, kind = ?event.kind, "broadcast to observer failed");
                dead.push(client_id.clone());
            }
        }
        for client_id in dead {
            clients.remove(&client_id);
        }

        debug!(kind = ?event.kind, delivered, "event broadcast");
        delivered
    }

    /// React to one text frame from an observer.
    pub fn handle_client_message(&self, client_id: &str, text: &str) {
        match serde_json::from_str::<ClientFrame>(text) {
            Ok(ClientFrame {
                kind: EventKind::Ping,
            }) => {
                if let Some(client) = self.lock().get_mut(client_id) {
                    client.last_ping = Utc::now();
                    let _ = client.tx.send(Outbound::Text(ServerEvent::pong().to_json()));
                }
            }
            Ok(frame) => {
                debug!(client_id, kind = ?frame.kind, "ignoring observer frame");
            }
            Err(err) => {
                debug!(client_id, %err, "ignoring unparseable observer frame");
            }
        }
    }

    /// Disconnect observers whose last ping is older than the client timeout.
    pub fn sweep_stale(&self) -> Vec<String> {
        self.sweep_stale_at(Utc::now())
    }

    /// [`sweep_stale`](Self::sweep_stale) against an explicit clock.
    pub fn sweep_stale_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout =
            chrono::Duration::from_std(self.client_timeout).unwrap_or(chrono::Duration::MAX);
        let mut clients = self.lock();
        let stale: Vec<String> = clients
            .iter()
            .filter(|(_, client)| now.signed_duration_since(client.last_ping) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for client_id in &stale {
            if let Some(client) = clients.remove(client_id) {
                let _ = client.tx.send(Outbound::Close);
                info!(client_id, "observer timed out");
            }
        }
        stale
    }

    /// Close every observer and stop accepting socket traffic.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut clients = self.lock();
        for client in clients.values() {
            let _ = client.tx.send(Outbound::Close);
        }
        let closed = clients.len();
        clients.clear();
        info!(closed, "realtime hub shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Connected observer count.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, WsClient>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serve one upgraded observer socket until it closes.
///
/// The connection ends when the peer closes it, or when the hub closes or
/// forgets the observer (sweep, shutdown); in the latter case both halves
/// of the socket are dropped without waiting on the peer.
pub async fn serve_socket(hub: Arc<RealtimeHub>, socket: WebSocket) {
    if hub.is_shut_down() {
        return;
    }

    let (client_id, mut rx) = hub.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let sender_done = CancellationToken::new();

    let done = sender_done.clone();
    let send_task = tokio::spawn(async move {
        let _done = done.drop_guard();
        while let Some(frame) = rx.recv().await {
            match frame {
                Outbound::Text(text) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let shutdown = hub.shutdown.clone();
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sender_done.cancelled() => {
                debug!(client_id, "observer closed by hub");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => hub.handle_client_message(&client_id, text.as_str()),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(client_id, %err, "observer socket error");
                    break;
                }
            }
        }
    }

    hub.unregister(&client_id);
    drop(ws_rx);
    let _ = send_task.await;
}

/// Spawn the periodic liveness sweep.
#[must_use]
pub fn spawn_liveness_sweep(
    hub: Arc<RealtimeHub>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("liveness sweep shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let stale = hub.sweep_stale();
                    if !stale.is_empty() {
                        info!(count = stale.len(), "stale observers disconnected");
                    }
                }
            }
        }
    })
}
