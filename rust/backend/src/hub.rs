/*
 * DevSwarm - Virtual office for AI agents
 * Copyright (C) 2025–2026 Neven Kordic <neven@broodlink.ai>
 *
 * This program is free software: you can redistribute it
 * and/or modify it under the terms of the GNU Affero
 * General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * This program is distributed in the hope that it will be
 * useful, but WITHOUT ANY WARRANTY; without even the
 * implied warranty of MERCHANTABILITY or FITNESS FOR A
 * PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 *
 * You should have received a copy of the GNU Affero General
 * Public License along with this program. If not, see
 * <https://www.gnu.org/licenses/>.
 */

//! WebSocket hub: client registry, backpressure-aware fan-out, and the
//! per-connection read/write pumps.
//!
//! Membership is owned by a single loop; register/unregister/broadcast are
//! commands on a channel, so the three always observe consistent membership.
//! A client whose bounded send queue cannot accept a broadcast is evicted
//! and its queue closed; broadcast never blocks on a slow client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::AppState;

/// Maximum inbound frame size. Inbound traffic is liveness-only.
const MAX_MESSAGE_SIZE: usize = 8192;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

enum HubCommand {
    Register {
        id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        frame: String,
    },
}

/// Cloneable handle used by producers (bridge, connection handlers).
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn register(&self, id: u64, sender: mpsc::Sender<String>) {
        let _ = self.tx.send(HubCommand::Register { id, sender });
    }

    pub fn unregister(&self, id: u64) {
        let _ = self.tx.send(HubCommand::Unregister { id });
    }

    pub fn broadcast(&self, frame: impl Into<String>) {
        let _ = self.tx.send(HubCommand::Broadcast {
            frame: frame.into(),
        });
    }
}

pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubCommand>,
    clients: HashMap<u64, mpsc::Sender<String>>,
}

impl Hub {
    #[must_use]
    pub fn new() -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                rx,
                clients: HashMap::new(),
            },
            HubHandle { tx },
        )
    }

    /// Hub event loop. Runs until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = shutdown.changed() => {
                    info!("hub shutting down");
                    break;
                }
            }
        }
    }

    fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register { id, sender } => {
                self.clients.insert(id, sender);
                info!(client = id, total = self.clients.len(), "client connected");
            }
            HubCommand::Unregister { id } => {
                // Removing the sender drops the queue's only producer, which
                // closes it exactly once.
                if self.clients.remove(&id).is_some() {
                    info!(client = id, total = self.clients.len(), "client disconnected");
                }
            }
            HubCommand::Broadcast { frame } => {
                let mut dead: Vec<u64> = Vec::new();
                for (id, sender) in &self.clients {
                    if sender.try_send(frame.clone()).is_err() {
                        dead.push(*id);
                    }
                }
                if !dead.is_empty() {
                    for id in &dead {
                        self.clients.remove(id);
                    }
                    warn!(dropped = dead.len(), "dropped unresponsive clients");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// `GET /ws`: upgrade and run the session pumps.
pub async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| client_session(socket, state))
}

async fn client_session(socket: WebSocket, state: Arc<AppState>) {
    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = mpsc::channel(state.config.hub.send_buffer);
    state.hub.register(id, sender);

    let ws_config = state.config.websocket.clone();
    let (sink, stream) = socket.split();

    let mut write_task = tokio::spawn(write_pump(sink, receiver, ws_config.clone()));
    let mut read_task = tokio::spawn(read_pump(stream, ws_config));

    // Either pump ending tears the whole session down.
    tokio::select! {
        _ = &mut write_task => read_task.abort(),
        _ = &mut read_task => write_task.abort(),
    }

    state.hub.unregister(id);
    debug!(client = id, "session closed");
}

/// Drain the send queue into the socket. Every frame is written as its own
/// text message: clients parse each frame as a standalone JSON document.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut receiver: mpsc::Receiver<String>,
    config: devswarm_config::WebsocketConfig,
) {
    let write_deadline = Duration::from_secs(config.write_deadline_secs);
    let mut ping = tokio::time::interval(Duration::from_secs(config.ping_period_secs));
    ping.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            frame = receiver.recv() => match frame {
                Some(text) => {
                    let write = sink.send(Message::Text(text));
                    match tokio::time::timeout(write_deadline, write).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                None => {
                    // Queue closed by the hub (eviction or shutdown).
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                let write = sink.send(Message::Ping(Vec::new()));
                match tokio::time::timeout(write_deadline, write).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

/// Inbound frames are read solely for liveness: any frame (pongs included)
/// extends the read deadline.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    config: devswarm_config::WebsocketConfig,
) {
    let pong_deadline = Duration::from_secs(config.pong_deadline_secs);

    loop {
        match tokio::time::timeout(pong_deadline, stream.next()).await {
            Err(_) => {
                debug!("read deadline exceeded");
                return;
            }
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => {}
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn spawn_hub() -> (HubHandle, watch::Sender<bool>) {
        let (hub, handle) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub.run(shutdown_rx));
        (handle, shutdown_tx)
    }

    async fn recv(rx: &mut mpsc::Receiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let (hub, _shutdown) = spawn_hub();

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        hub.register(1, tx_a);
        hub.register(2, tx_b);
        hub.register(3, tx_c);

        hub.broadcast("frame-1");

        assert_eq!(recv(&mut rx_a).await.as_deref(), Some("frame-1"));
        assert_eq!(recv(&mut rx_b).await.as_deref(), Some("frame-1"));
        assert_eq!(recv(&mut rx_c).await.as_deref(), Some("frame-1"));
    }

    #[tokio::test]
    async fn test_full_queue_client_is_evicted_and_queue_closed() {
        let (hub, _shutdown) = spawn_hub();

        let (tx_fast, mut rx_fast) = mpsc::channel(16);
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        hub.register(1, tx_fast);
        hub.register(2, tx_slow);

        // First broadcast fills the slow client's queue; the second finds it
        // full and evicts the client.
        hub.broadcast("one");
        hub.broadcast("two");

        assert_eq!(recv(&mut rx_fast).await.as_deref(), Some("one"));
        assert_eq!(recv(&mut rx_fast).await.as_deref(), Some("two"));

        assert_eq!(recv(&mut rx_slow).await.as_deref(), Some("one"));
        assert_eq!(
            recv(&mut rx_slow).await,
            None,
            "slow client's queue must be closed after eviction"
        );
    }

    #[tokio::test]
    async fn test_eviction_does_not_block_remaining_clients() {
        let (hub, _shutdown) = spawn_hub();

        let (tx_a, mut rx_a) = mpsc::channel(64);
        let (tx_b, _rx_b_kept_undrained) = mpsc::channel(1);
        let (tx_c, mut rx_c) = mpsc::channel(64);
        hub.register(1, tx_a);
        hub.register(2, tx_b);
        hub.register(3, tx_c);

        for i in 0..20 {
            hub.broadcast(format!("frame-{i}"));
        }

        for i in 0..20 {
            let expected = format!("frame-{i}");
            assert_eq!(recv(&mut rx_a).await.as_deref(), Some(expected.as_str()));
            assert_eq!(recv(&mut rx_c).await.as_deref(), Some(expected.as_str()));
        }
    }

    #[tokio::test]
    async fn test_frames_delivered_in_broadcast_order() {
        let (hub, _shutdown) = spawn_hub();

        let (tx, mut rx) = mpsc::channel(8);
        hub.register(1, tx);

        hub.broadcast("first");
        hub.broadcast("second");
        hub.broadcast("third");

        assert_eq!(recv(&mut rx).await.as_deref(), Some("first"));
        assert_eq!(recv(&mut rx).await.as_deref(), Some("second"));
        assert_eq!(recv(&mut rx).await.as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn test_unregister_closes_queue_and_is_idempotent() {
        let (hub, _shutdown) = spawn_hub();

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        hub.register(1, tx_a);
        hub.register(2, tx_b);

        hub.unregister(1);
        hub.unregister(1); // second unregister is a no-op

        assert_eq!(recv(&mut rx_a).await, None, "queue closed on unregister");

        // Remaining clients are unaffected.
        hub.broadcast("still-alive");
        assert_eq!(recv(&mut rx_b).await.as_deref(), Some("still-alive"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (hub, handle) = Hub::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(hub.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        drop(handle);
    }
}
