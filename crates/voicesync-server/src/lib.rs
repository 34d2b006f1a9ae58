//! voicesync-server — the signaling rendezvous server.
//!
//! Tracks users and rooms, relays peer-to-peer negotiation messages, and
//! exposes a health surface on the same listener as the WebSocket endpoint.

pub mod dispatch;
pub mod registry;
pub mod server;

pub use dispatch::{Connection, ServerState};
pub use registry::{ClientQueue, RoomRegistry, UserRegistry};
pub use server::SignalingServer;
