//! Control-channel sessions.
//!
//! Each client agent holds one long-lived WebSocket to the control listener.
//! Per connection:
//!
//! - a **writer task** drains an `mpsc` queue into the socket, so any task
//!   may send through the [`ChannelHandle`] without interleaving frames;
//! - a **receiver loop** parses inbound frames and dispatches them —
//!   registrations, tunnel closes, response/error correlation, ping/pong;
//! - a **liveness tick** every heartbeat interval: a channel that produced
//!   no pong since the previous tick is terminated and its tunnels closed
//!   with reason "Client unresponsive".
//!
//! Any transport close, clean or abrupt, closes all tunnels the channel
//! owns ("Client disconnected") and drops the channel record. Invalid
//! frames are answered with an `error` payload and never close the channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{ErrorCode, GatewayError};
use crate::forward;
use crate::protocol::{self, ControlMessage, RegisteredPayload};
use crate::state::GatewayState;
use crate::util::now_millis;

/// Outbound queue depth per channel.
const OUTBOUND_BUFFER: usize = 256;

/// Cheap, cloneable sending side of one control channel.
///
/// The registry stores this inside each tunnel; dropping the last clone
/// after teardown releases the underlying queue.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    /// Process-unique channel identifier; the registry keys on this, never
    /// on the handle itself.
    pub id: String,
    pub remote_addr: String,
    tx: mpsc::Sender<ControlMessage>,
    open: Arc<AtomicBool>,
}

impl ChannelHandle {
    /// Create a handle and the receiving end its writer task drains.
    pub fn open(id: String, remote_addr: String, buffer: usize) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                id,
                remote_addr,
                tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    /// Queue a message for the writer task.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::new(
                ErrorCode::ConnectionClosed,
                "Control channel is closed",
            ));
        }
        self.tx.send(msg).await.map_err(|_| {
            GatewayError::new(ErrorCode::ConnectionClosed, "Control channel is closed")
        })
    }

    /// Whether the transport is still accepting writes.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.tx.is_closed()
    }

    /// Mark the transport closed; subsequent sends fail fast.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }
}

struct ChannelEntry {
    handle: ChannelHandle,
    connected_at: u64,
}

/// Live channels, keyed by channel id. Used for stats and shutdown.
#[derive(Default)]
pub struct ChannelTable {
    inner: Mutex<HashMap<String, ChannelEntry>>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handle: ChannelHandle) {
        self.lock().insert(
            handle.id.clone(),
            ChannelEntry {
                handle,
                connected_at: now_millis(),
            },
        );
    }

    fn remove(&self, channel_id: &str) {
        self.lock().remove(channel_id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Projection for `/api/stats`.
    pub fn snapshot(&self) -> Vec<Value> {
        self.lock()
            .values()
            .map(|e| {
                json!({
                    "channelId": e.handle.id,
                    "remoteAddr": e.handle.remote_addr,
                    "connectedAt": e.connected_at,
                })
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ChannelEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `GET /connect` — agent WebSocket endpoint on the control listener.
pub async fn connect_ws(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    info!(remote = %addr, "Control channel connecting");
    ws.on_upgrade(move |socket| {
        let span = info_span!("channel", remote = %addr);
        handle_channel(socket, state, addr.to_string()).instrument(span)
    })
}

/// Per-connection session: writer task, receiver loop, liveness tick.
async fn handle_channel(socket: WebSocket, state: GatewayState, remote_addr: String) {
    let channel_id = Uuid::new_v4().to_string();
    let (handle, mut outbound) = ChannelHandle::open(channel_id.clone(), remote_addr, OUTBOUND_BUFFER);
    state.channels.insert(handle.clone());
    info!(channel = %channel_id, "Control channel open");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer task: the only place frames touch the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = protocol::encode(&msg);
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Pong since the previous liveness tick?
    let alive = Arc::new(AtomicBool::new(true));

    let heartbeat = Duration::from_secs(state.config.tunnel.heartbeat_interval_secs);
    let mut liveness = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    let mut shutdown_rx = state.shutdown.subscribe();

    let mut close_reason = "Client disconnected";
    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&state, &handle, &alive, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary and transport-level ping/pong frames
                Some(Err(e)) => {
                    warn!(channel = %channel_id, error = %e, "Control channel read error");
                    break;
                }
            },
            _ = liveness.tick() => {
                if !alive.swap(false, Ordering::SeqCst) {
                    warn!(channel = %channel_id, "No pong since previous tick, terminating");
                    close_reason = "Client unresponsive";
                    break;
                }
                let _ = handle.send(ControlMessage::ping()).await;
            },
            _ = shutdown_rx.recv() => {
                close_reason = "Server shutdown";
                break;
            }
        }
    }

    handle.mark_closed();
    state.registry.close_all_for_channel(&channel_id, close_reason);
    state.channels.remove(&channel_id);
    send_task.abort();
    info!(channel = %channel_id, reason = close_reason, "Control channel closed");
}

/// Parse one frame and act on it. Decode failures are answered in place;
/// nothing here closes the channel.
async fn dispatch(state: &GatewayState, handle: &ChannelHandle, alive: &AtomicBool, text: &str) {
    match protocol::decode(text) {
        Ok(msg) => handle_message(state, handle, alive, msg).await,
        Err(e) => {
            debug!(channel = %handle.id, error = %e, "Rejecting inbound frame");
            let _ = handle.send(ControlMessage::error(e.code(), e.to_string())).await;
        }
    }
}

async fn handle_message(
    state: &GatewayState,
    handle: &ChannelHandle,
    alive: &AtomicBool,
    msg: ControlMessage,
) {
    match msg {
        ControlMessage::Register(p) => {
            match state
                .registry
                .register(handle, p.subdomain.as_deref(), p.local_port, p.auth_token)
            {
                Ok(tunnel) => {
                    let reply = ControlMessage::Registered(RegisteredPayload {
                        tunnel_id: tunnel.id.clone(),
                        public_url: state.config.public_url(&tunnel.subdomain),
                        subdomain: tunnel.subdomain.clone(),
                        timestamp: now_millis(),
                    });
                    let _ = handle.send(reply).await;
                }
                Err(e) => {
                    let _ = handle.send(ControlMessage::error(e.code, e.message)).await;
                }
            }
        }
        ControlMessage::Close(p) => {
            // Only the owning channel may close a tunnel.
            let owns = state
                .registry
                .lookup_by_id(&p.tunnel_id)
                .is_some_and(|t| t.channel.id == handle.id);
            if owns {
                let reason = p.reason.as_deref().unwrap_or("Closed by client");
                state.registry.close(&p.tunnel_id, reason);
            } else {
                debug!(
                    channel = %handle.id,
                    tunnel = %p.tunnel_id,
                    "Ignoring close for tunnel not owned by this channel"
                );
            }
        }
        ControlMessage::HttpResponse(p) => forward::complete_request(state, &handle.id, p),
        ControlMessage::HttpError(p) => forward::fail_request(state, &handle.id, p),
        ControlMessage::Ping(p) => {
            let _ = handle.send(ControlMessage::pong(p.timestamp)).await;
        }
        ControlMessage::Pong(_) => {
            alive.store(true, Ordering::SeqCst);
        }
        ControlMessage::Registered(_) | ControlMessage::HttpRequest(_) => {
            let _ = handle
                .send(ControlMessage::error(
                    ErrorCode::InvalidMessage,
                    "Message type is not valid in the client-to-gateway direction",
                ))
                .await;
        }
        // Never answer an error with an error; a confused client would
        // bounce them back and forth forever.
        ControlMessage::Error(p) => {
            debug!(channel = %handle.id, code = %p.code, "Client reported error");
        }
    }
}
