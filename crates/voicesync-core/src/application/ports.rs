//! Port traits (interfaces) the session depends on.
//!
//! Adapters implement these traits; the session never references
//! tungstenite, webrtc internals, or cpal directly.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::domain::error::{AudioError, PeerError, SignalingError};
use crate::domain::identity::PeerId;
use crate::domain::signaling::{ClientMessage, ServerMessage};

/// The local microphone track handed to new peer connections.
pub type LocalAudioTrack = Arc<TrackLocalStaticSample>;

/// A remote peer's audio track as produced by the engine.
pub type RemoteAudioTrack = Arc<TrackRemote>;

/// One batch of local microphone samples (mono f32 PCM).
pub type SampleBatch = Arc<Vec<f32>>;

// ---------------------------------------------------------------------------
// Signaling transport
// ---------------------------------------------------------------------------

/// What the transport reports upward, besides parsed frames.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed inbound frame.
    Message(ServerMessage),
    /// The channel closed unexpectedly; reconnection may follow.
    Closed,
    /// Reconnection attempts are exhausted.
    ConnLost,
}

/// One signaling channel to the rendezvous server.
///
/// The provided methods build the canonical payload for each outbound
/// message type.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Open the channel. Resolves once the channel is usable.
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Fire-and-forget send; drops silently when the channel is not open.
    fn send(&self, msg: ClientMessage);

    /// Close intentionally, suppressing reconnection.
    async fn disconnect(&self);

    fn login(&self, username: String) {
        self.send(ClientMessage::Login { username });
    }

    fn create_room(&self) {
        self.send(ClientMessage::CreateRoom);
    }

    fn join_room(&self, room_key: String) {
        self.send(ClientMessage::JoinRoom { room_key });
    }

    fn invite(&self, to_username: String) {
        self.send(ClientMessage::Invite { to_username });
    }

    fn accept_invite(&self, room_key: String) {
        self.send(ClientMessage::AcceptInvite { room_key });
    }

    fn decline_invite(&self, room_key: String) {
        self.send(ClientMessage::DeclineInvite { room_key });
    }

    fn leave_room(&self) {
        self.send(ClientMessage::LeaveRoom);
    }

    fn signal(&self, to_peer_id: PeerId, data: serde_json::Value) {
        self.send(ClientMessage::Signal { to_peer_id, data });
    }
}

// ---------------------------------------------------------------------------
// Peer engine
// ---------------------------------------------------------------------------

/// Events produced by the peer engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A negotiation fragment to relay to the named peer.
    Signal {
        peer_id: PeerId,
        data: serde_json::Value,
    },
    /// A remote audio stream arrived.
    Track {
        peer_id: PeerId,
        track: RemoteAudioTrack,
    },
    /// Data plane established.
    Connected { peer_id: PeerId },
    /// Connection closed or failed; the entry is already removed.
    Disconnected { peer_id: PeerId },
    /// Non-fatal engine failure.
    Error { peer_id: PeerId, error: PeerError },
}

/// Facade over the WebRTC engine: one connection per remote peer.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Create (replacing any prior entry) a connection toward `peer_id`.
    ///
    /// `initiator = true` produces the opening offer; `false` waits for one.
    /// The local track, when present, is attached before negotiation.
    async fn create(
        &self,
        peer_id: PeerId,
        initiator: bool,
        local_track: Option<LocalAudioTrack>,
    ) -> Result<(), PeerError>;

    /// Hand an inbound negotiation fragment to the named connection.
    /// Unknown peers are logged and ignored.
    async fn signal(&self, peer_id: &PeerId, data: serde_json::Value);

    /// Close and remove one connection.
    async fn destroy(&self, peer_id: &PeerId);

    /// Close and remove every connection.
    async fn destroy_all(&self);
}

// ---------------------------------------------------------------------------
// Audio adapter
// ---------------------------------------------------------------------------

/// Local capture plus remote playback.
#[async_trait]
pub trait AudioAdapter: Send + Sync {
    /// Open the microphone and start producing sample batches and the local
    /// track. Idempotent once running.
    async fn start_capture(&self) -> Result<(), AudioError>;

    /// The Opus track fed by local capture; `None` before capture starts.
    fn local_track(&self) -> Option<LocalAudioTrack>;

    /// Subscribe to local microphone sample batches (one per 20 ms frame).
    fn subscribe_samples(&self) -> tokio::sync::broadcast::Receiver<SampleBatch>;

    /// Begin playing a remote peer's track through the loudspeaker.
    async fn add_remote(&self, peer_id: PeerId, track: RemoteAudioTrack);

    /// Stop playing a remote peer.
    async fn remove_remote(&self, peer_id: &PeerId);

    /// When muted, captured frames are zeroed before encode; capture keeps
    /// running.
    fn set_muted(&self, muted: bool);

    /// Stop capture and playback, releasing the devices.
    async fn stop(&self);
}
