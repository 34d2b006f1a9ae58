//! The listener: WebSocket signaling endpoint plus a small HTTP surface
//! (`/health`, `/ping`) on the same port.
//!
//! Each accepted socket gets a fresh [`PeerId`], a bounded outbound queue
//! drained by a writer task, and a read loop that feeds the dispatcher.
//! Connections run in parallel tasks; every dispatch locks the shared
//! [`ServerState`] for the duration of one message.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use voicesync_core::domain::identity::PeerId;
use voicesync_core::domain::signaling::ServerMessage;

use crate::dispatch::{self, Connection, ServerState};
use crate::registry::{ClientQueue, OUTBOUND_QUEUE_DEPTH};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub state: Mutex<ServerState>,
    pub started: Instant,
}

pub type SharedState = Arc<AppState>;

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct SignalingServer {
    shared: SharedState,
}

impl SignalingServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AppState {
                state: Mutex::new(ServerState::new()),
                started: Instant::now(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health))
            .route("/ping", get(ping))
            .with_state(self.shared.clone())
    }

    /// Serve until SIGINT.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await?;
        Ok(())
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn health(State(shared): State<SharedState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": shared.started.elapsed().as_secs(),
    }))
}

async fn ping() -> &'static str {
    "pong"
}

async fn ws_handler(ws: WebSocketUpgrade, State(shared): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, shared))
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, shared: SharedState) {
    let peer_id = PeerId::new(Uuid::new_v4().to_string());
    info!(%peer_id, "connection accepted");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE_DEPTH);
    let kill = CancellationToken::new();
    let conn = Connection {
        peer_id: peer_id.clone(),
        queue: ClientQueue::new(tx, kill.clone()),
    };

    // Writer: drains the bounded queue so dispatch never blocks on a slow
    // socket.
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(text) = serde_json::to_string(&msg) else {
                continue;
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    conn.queue.send(ServerMessage::Connected {
        peer_id: peer_id.clone(),
    });

    loop {
        tokio::select! {
            _ = kill.cancelled() => {
                debug!(%peer_id, "connection killed by queue overflow");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let mut state = shared.state.lock().unwrap();
                    dispatch::handle_frame(&mut state, &conn, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // pings are answered by the protocol layer
                Some(Err(err)) => {
                    debug!(%peer_id, %err, "websocket read error");
                    break;
                }
            },
        }
    }

    {
        let mut state = shared.state.lock().unwrap();
        dispatch::handle_disconnect(&mut state, &peer_id);
    }
    info!(%peer_id, "connection closed");

    // All queue handles are gone now, so the writer drains and exits; abort
    // it if the socket refuses to flush.
    drop(conn);
    if tokio::time::timeout(Duration::from_secs(5), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
