//! Signaling wire protocol.
//!
//! Every frame is a JSON object with a `type` field; both directions are
//! modelled as closed serde enums so each side dispatches with one `match`.
//! The `data` field of `signal` frames is opaque: the server relays it
//! without inspection, and only the peer engine on the far side interprets
//! it.

use serde::{Deserialize, Serialize};

use super::identity::PeerId;
use super::room_key::RoomKey;

// ---------------------------------------------------------------------------
// Client → server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Login {
        username: String,
    },
    CreateRoom,
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Invite {
        to_username: String,
    },
    #[serde(rename_all = "camelCase")]
    AcceptInvite {
        room_key: String,
    },
    #[serde(rename_all = "camelCase")]
    DeclineInvite {
        room_key: String,
    },
    LeaveRoom,
    #[serde(rename_all = "camelCase")]
    Signal {
        to_peer_id: PeerId,
        data: serde_json::Value,
    },
}

// ---------------------------------------------------------------------------
// Server → client
// ---------------------------------------------------------------------------

/// Membership snapshot entry inside `room-joined`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Sent exactly once when the server accepts a connection.
    #[serde(rename_all = "camelCase")]
    Connected { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    LoginOk { peer_id: PeerId },
    LoginError { message: String },
    #[serde(rename_all = "camelCase")]
    RoomCreated { room_key: RoomKey },
    CreateError { message: String },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_key: RoomKey,
        peers: Vec<PeerSummary>,
    },
    JoinError { message: String },
    #[serde(rename_all = "camelCase")]
    PeerJoined { peer_id: PeerId, username: String },
    #[serde(rename_all = "camelCase")]
    PeerLeft { peer_id: PeerId, username: String },
    #[serde(rename_all = "camelCase")]
    Invite {
        from_username: String,
        room_key: RoomKey,
    },
    #[serde(rename_all = "camelCase")]
    InviteSent { to_username: String },
    InviteError { message: String },
    InviteDeclined { username: String },
    #[serde(rename_all = "camelCase")]
    Signal {
        from_peer_id: PeerId,
        data: serde_json::Value,
    },
    LeftRoom,
}

impl ServerMessage {
    /// The wire `type` tag, used to key the client's pending-request table.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::LoginOk { .. } => "login-ok",
            Self::LoginError { .. } => "login-error",
            Self::RoomCreated { .. } => "room-created",
            Self::CreateError { .. } => "create-error",
            Self::RoomJoined { .. } => "room-joined",
            Self::JoinError { .. } => "join-error",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::Invite { .. } => "invite",
            Self::InviteSent { .. } => "invite-sent",
            Self::InviteError { .. } => "invite-error",
            Self::InviteDeclined { .. } => "invite-declined",
            Self::Signal { .. } => "signal",
            Self::LeftRoom => "left-room",
        }
    }

    /// The human message carried by `*-error` replies, if this is one.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::LoginError { message }
            | Self::CreateError { message }
            | Self::JoinError { message }
            | Self::InviteError { message } => Some(message),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
