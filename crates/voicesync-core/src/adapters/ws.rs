//! WebSocket signaling transport.
//!
//! Wraps one `tokio-tungstenite` connection behind the [`Signaling`] port:
//! JSON text frames in both directions, a keep-alive ping every 25 s, and
//! automatic reconnection (3 s back-off, 5 attempts) after an unexpected
//! close. Reconnection does not re-authenticate; the session layer decides
//! what a drop means for the call in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::application::ports::{Signaling, TransportEvent};
use crate::domain::error::SignalingError;
use crate::domain::signaling::{ClientMessage, ServerMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keep-alive ping cadence.
    pub keepalive_interval: Duration,
    /// Pause before each reconnection attempt.
    pub reconnect_delay: Duration,
    /// Reconnection attempts before giving up with `CONN_LOST`.
    pub max_reconnect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(25),
            reconnect_delay: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct WsSignalingTransport {
    me: Weak<Self>,
    url: String,
    config: TransportConfig,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Sender into the writer task; `None` while the channel is down.
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    intentional_close: AtomicBool,
}

impl WsSignalingTransport {
    /// Build a transport for `url`. The returned receiver carries parsed
    /// frames and connectivity changes toward the session.
    pub fn new(
        url: impl Into<String>,
        config: TransportConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            url: url.into(),
            config,
            events_tx,
            outbound: Mutex::new(None),
            intentional_close: AtomicBool::new(false),
        });
        (transport, events_rx)
    }

    /// Split a fresh stream into reader and writer tasks.
    fn install(&self, stream: WsStream) {
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.outbound.lock().unwrap() = Some(out_tx);

        // Writer: drains the outbound queue and keeps the channel alive.
        let keepalive = self.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keepalive);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        let Some(msg) = outgoing else {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        };
                        let closing = matches!(msg, WsMessage::Close(_));
                        if let Err(err) = sink.send(msg).await {
                            warn!(%err, "websocket send failed");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = sink.send(WsMessage::Ping(Vec::new())).await {
                            warn!(%err, "keep-alive ping failed");
                        }
                    }
                }
            }
        });

        // Reader: parses frames until the channel goes away.
        let this = self.me.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let Some(transport) = this.upgrade() else { return };
                        transport.handle_text(&text);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {} // pongs and binary frames are uninteresting
                    Err(err) => {
                        debug!(%err, "websocket read error");
                        break;
                    }
                }
            }
            if let Some(transport) = this.upgrade() {
                transport.handle_closed();
            }
        });
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(msg) => {
                let _ = self.events_tx.send(TransportEvent::Message(msg));
            }
            Err(err) => warn!(%err, "dropping unparseable signaling frame"),
        }
    }

    fn handle_closed(&self) {
        *self.outbound.lock().unwrap() = None;
        if self.intentional_close.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events_tx.send(TransportEvent::Closed);
        if let Some(transport) = self.me.upgrade() {
            tokio::spawn(async move { transport.run_reconnect().await });
        }
    }

    async fn run_reconnect(self: Arc<Self>) {
        for attempt in 1..=self.config.max_reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay).await;
            if self.intentional_close.load(Ordering::SeqCst) {
                return;
            }
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!(attempt, "signaling reconnected");
                    self.install(stream);
                    return;
                }
                Err(err) => {
                    warn!(attempt, %err, "reconnect attempt failed");
                }
            }
        }
        let _ = self.events_tx.send(TransportEvent::ConnLost);
    }
}

#[async_trait]
impl Signaling for WsSignalingTransport {
    async fn connect(&self) -> Result<(), SignalingError> {
        self.intentional_close.store(false, Ordering::SeqCst);
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| SignalingError::connect_failed(err.to_string()))?;
        info!(url = %self.url, "signaling connected");
        self.install(stream);
        Ok(())
    }

    fn send(&self, msg: ClientMessage) {
        let Some(out_tx) = self.outbound.lock().unwrap().clone() else {
            debug!("dropping outbound message, channel not open");
            return;
        };
        match serde_json::to_string(&msg) {
            Ok(text) => {
                let _ = out_tx.send(WsMessage::Text(text));
            }
            Err(err) => warn!(%err, "failed to serialize outbound message"),
        }
    }

    async fn disconnect(&self) {
        self.intentional_close.store(true, Ordering::SeqCst);
        let out_tx = self.outbound.lock().unwrap().take();
        if let Some(out_tx) = out_tx {
            let _ = out_tx.send(WsMessage::Close(None));
        }
    }
}
