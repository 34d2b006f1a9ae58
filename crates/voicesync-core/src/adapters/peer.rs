//! WebRTC peer engine.
//!
//! A thin facade over the `webrtc` crate: one `RTCPeerConnection` per remote
//! peer, trickle-ICE negotiation fragments in and out as opaque JSON blobs,
//! and remote audio tracks surfaced as [`PeerEvent::Track`].
//!
//! The negotiation tie-break is decided by the caller: existing room members
//! create their entry with `initiator = false` and wait, the newcomer
//! creates with `initiator = true` and sends the opening offer, so each pair
//! negotiates exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::application::ports::{LocalAudioTrack, PeerEngine, PeerEvent};
use crate::domain::error::PeerError;
use crate::domain::identity::PeerId;

/// Public STUN servers used for candidate discovery.
const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ---------------------------------------------------------------------------
// Negotiation blob
// ---------------------------------------------------------------------------

/// The shape of the opaque `data` field relayed through the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum SignalBlob {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct PeerHandle {
    pc: Arc<RTCPeerConnection>,
    /// Trickle candidates that arrived before the remote description.
    pending_candidates: Vec<RTCIceCandidateInit>,
    remote_set: bool,
}

pub struct WebRtcPeerEngine {
    me: Weak<Self>,
    api: API,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    connections: Mutex<HashMap<PeerId, PeerHandle>>,
}

impl WebRtcPeerEngine {
    pub fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| PeerError::webrtc(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| PeerError::webrtc(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            api,
            events_tx,
            connections: Mutex::new(HashMap::new()),
        });
        Ok((engine, events_rx))
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_blob(&self, peer_id: PeerId, blob: &SignalBlob) {
        match serde_json::to_value(blob) {
            Ok(data) => self.emit(PeerEvent::Signal { peer_id, data }),
            Err(err) => warn!(%err, "failed to serialize negotiation blob"),
        }
    }

    fn wire_handlers(&self, peer_id: &PeerId, pc: &Arc<RTCPeerConnection>) {
        // Trickle ICE: every gathered candidate goes out as its own blob.
        let events_tx = self.events_tx.clone();
        let id = peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events_tx = events_tx.clone();
            let id = id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let blob = SignalBlob::Candidate { candidate: init };
                        if let Ok(data) = serde_json::to_value(&blob) {
                            let _ = events_tx.send(PeerEvent::Signal { peer_id: id, data });
                        }
                    }
                    Err(err) => warn!(%err, "failed to serialize ICE candidate"),
                }
            })
        }));

        let events_tx = self.events_tx.clone();
        let id = peer_id.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = events_tx.send(PeerEvent::Track {
                peer_id: id.clone(),
                track,
            });
            Box::pin(async {})
        }));

        let me = self.me.clone();
        let events_tx = self.events_tx.clone();
        let id = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let me = me.clone();
            let events_tx = events_tx.clone();
            let id = id.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = events_tx.send(PeerEvent::Connected { peer_id: id });
                    }
                    RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Closed => {
                        let Some(engine) = me.upgrade() else { return };
                        // Only report peers we still track; an explicit
                        // destroy already removed its entry.
                        if engine.connections.lock().await.remove(&id).is_some() {
                            let _ = events_tx.send(PeerEvent::Disconnected { peer_id: id });
                        }
                    }
                    _ => {}
                }
            })
        }));
    }

    async fn handle_blob(
        &self,
        peer_id: &PeerId,
        blob: SignalBlob,
    ) -> Result<(), webrtc::Error> {
        let mut connections = self.connections.lock().await;
        let Some(handle) = connections.get_mut(peer_id) else {
            debug!(%peer_id, "negotiation fragment for unknown peer, ignoring");
            return Ok(());
        };

        match blob {
            SignalBlob::Offer { sdp } => {
                let pc = handle.pc.clone();
                handle.remote_set = true;
                let queued: Vec<_> = handle.pending_candidates.drain(..).collect();
                drop(connections);

                pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                    .await?;
                for candidate in queued {
                    pc.add_ice_candidate(candidate).await?;
                }
                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                self.emit_blob(peer_id.clone(), &SignalBlob::Answer { sdp: answer.sdp });
            }
            SignalBlob::Answer { sdp } => {
                let pc = handle.pc.clone();
                handle.remote_set = true;
                let queued: Vec<_> = handle.pending_candidates.drain(..).collect();
                drop(connections);

                pc.set_remote_description(RTCSessionDescription::answer(sdp)?)
                    .await?;
                for candidate in queued {
                    pc.add_ice_candidate(candidate).await?;
                }
            }
            SignalBlob::Candidate { candidate } => {
                if handle.remote_set {
                    handle.pc.add_ice_candidate(candidate).await?;
                } else {
                    handle.pending_candidates.push(candidate);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for WebRtcPeerEngine {
    async fn create(
        &self,
        peer_id: PeerId,
        initiator: bool,
        local_track: Option<LocalAudioTrack>,
    ) -> Result<(), PeerError> {
        // Replace any prior connection for this peer.
        let previous = self.connections.lock().await.remove(&peer_id);
        if let Some(previous) = previous {
            let _ = previous.pc.close().await;
        }

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| PeerError::webrtc(e.to_string()))?,
        );
        self.wire_handlers(&peer_id, &pc);

        match local_track {
            Some(track) => {
                pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| PeerError::webrtc(e.to_string()))?;
            }
            // No microphone: still negotiate an audio section so the remote
            // side can be heard.
            None => {
                pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
                    .await
                    .map_err(|e| PeerError::webrtc(e.to_string()))?;
            }
        }

        self.connections.lock().await.insert(
            peer_id.clone(),
            PeerHandle {
                pc: pc.clone(),
                pending_candidates: Vec::new(),
                remote_set: false,
            },
        );

        if initiator {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| PeerError::webrtc(e.to_string()))?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(|e| PeerError::webrtc(e.to_string()))?;
            self.emit_blob(peer_id, &SignalBlob::Offer { sdp: offer.sdp });
        }

        Ok(())
    }

    async fn signal(&self, peer_id: &PeerId, data: serde_json::Value) {
        let blob = match serde_json::from_value::<SignalBlob>(data) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(%peer_id, %err, "dropping malformed negotiation blob");
                return;
            }
        };
        if let Err(err) = self.handle_blob(peer_id, blob).await {
            warn!(%peer_id, %err, "negotiation failed");
            self.emit(PeerEvent::Error {
                peer_id: peer_id.clone(),
                error: PeerError::webrtc(err.to_string()),
            });
        }
    }

    async fn destroy(&self, peer_id: &PeerId) {
        let handle = self.connections.lock().await.remove(peer_id);
        if let Some(handle) = handle {
            debug!(%peer_id, "closing peer connection");
            let _ = handle.pc.close().await;
        }
    }

    async fn destroy_all(&self) {
        let handles: Vec<_> = self.connections.lock().await.drain().collect();
        for (peer_id, handle) in handles {
            debug!(%peer_id, "closing peer connection");
            let _ = handle.pc.close().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
