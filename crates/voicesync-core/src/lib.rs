//! voicesync-core — shared library for terminal peer-to-peer voice chat.
//!
//! # Architecture
//!
//! - **domain**: identifiers, room keys, wire protocol, errors (no I/O).
//! - **application**: the client [`Session`] coordinator + port traits.
//! - **adapters**: WebSocket signaling (tokio-tungstenite), WebRTC peer
//!   engine, cpal + Opus audio.

pub mod adapters;
pub mod application;
pub mod domain;

pub use application::session::{Session, SessionConfig, SessionEvent};
pub use domain::error::{AudioError, PeerError, RoomError, SessionError, SignalingError};
pub use domain::identity::{Participant, PeerId};
pub use domain::room_key::RoomKey;
pub use domain::signaling::{ClientMessage, PeerSummary, ServerMessage};
