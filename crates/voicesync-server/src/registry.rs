//! User and room registries.
//!
//! Both registries are plain data guarded by the single server-state lock;
//! no method blocks. Outbound delivery goes through [`ClientQueue`], a
//! bounded per-connection queue whose overflow is treated as a disconnect,
//! so fan-out never waits on a slow recipient.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use voicesync_core::domain::error::RoomError;
use voicesync_core::domain::identity::PeerId;
use voicesync_core::domain::room_key::RoomKey;
use voicesync_core::domain::signaling::ServerMessage;

/// Messages a recipient may fall behind before it is dropped.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Outbound queue handle
// ---------------------------------------------------------------------------

/// Cloneable handle to one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ClientQueue {
    tx: mpsc::Sender<ServerMessage>,
    kill: CancellationToken,
}

impl ClientQueue {
    pub fn new(tx: mpsc::Sender<ServerMessage>, kill: CancellationToken) -> Self {
        Self { tx, kill }
    }

    /// Best-effort enqueue. A full queue kills the connection; a closed one
    /// means the connection is already gone.
    pub fn send(&self, msg: ServerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue overflow, dropping slow client");
                self.kill.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct User {
    pub peer_id: PeerId,
    pub username: String,
    pub room: Option<RoomKey>,
    pub queue: ClientQueue,
}

/// Process-wide mapping of connection → user.
///
/// Invariant: `find_by_name` is injective modulo case.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: HashMap<PeerId, User>,
}

impl UserRegistry {
    /// Insert a user; `false` when the name is already taken (compared
    /// case-insensitively) or the peer is already registered.
    pub fn try_register(&mut self, peer_id: PeerId, username: String, queue: ClientQueue) -> bool {
        if self.users.contains_key(&peer_id) || self.find_by_name(&username).is_some() {
            return false;
        }
        self.users.insert(
            peer_id.clone(),
            User {
                peer_id,
                username,
                room: None,
                queue,
            },
        );
        true
    }

    /// No-op on unknown ids.
    pub fn unregister(&mut self, peer_id: &PeerId) -> Option<User> {
        self.users.remove(peer_id)
    }

    pub fn find_by_id(&self, peer_id: &PeerId) -> Option<&User> {
        self.users.get(peer_id)
    }

    /// Case-insensitive name lookup.
    pub fn find_by_name(&self, username: &str) -> Option<&User> {
        self.users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
    }

    /// No-op on unknown ids.
    pub fn set_room(&mut self, peer_id: &PeerId, room: Option<RoomKey>) {
        if let Some(user) = self.users.get_mut(peer_id) {
            user.room = room;
        }
    }

    pub fn list(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub peer_id: PeerId,
    pub username: String,
    pub queue: ClientQueue,
}

/// One live room. Members keep insertion order; the host is the first.
#[derive(Debug)]
pub struct Room {
    pub key: RoomKey,
    pub host_peer_id: PeerId,
    members: Vec<RoomMember>,
    pub created_at: Instant,
}

impl Room {
    pub fn members(&self) -> &[RoomMember] {
        &self.members
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.members.iter().any(|m| &m.peer_id == peer_id)
    }

    /// Everyone except `exclude`, for fan-out.
    pub fn others(&self, exclude: &PeerId) -> impl Iterator<Item = &RoomMember> {
        self.members.iter().filter(move |m| &m.peer_id != exclude)
    }
}

/// The result of removing a member.
pub struct LeaveOutcome<'a> {
    /// The surviving room, when members remain.
    pub room: Option<&'a Room>,
    /// `true` exactly once: on the leave that emptied (or missed) the room.
    pub was_empty: bool,
}

/// Process-wide mapping of room key → room.
///
/// Invariant: every registered room has at least one member.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomKey, Room>,
}

impl RoomRegistry {
    /// Create a room with a fresh unique key and the host as sole member.
    pub fn create(&mut self, host_peer_id: PeerId, host_name: String, queue: ClientQueue) -> &Room {
        let key = loop {
            let candidate = RoomKey::generate();
            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };
        let room = Room {
            key: key.clone(),
            host_peer_id: host_peer_id.clone(),
            members: vec![RoomMember {
                peer_id: host_peer_id,
                username: host_name,
                queue,
            }],
            created_at: Instant::now(),
        };
        self.rooms.entry(key).or_insert(room)
    }

    pub fn join(
        &mut self,
        key: &RoomKey,
        peer_id: PeerId,
        username: String,
        queue: ClientQueue,
    ) -> Result<&Room, RoomError> {
        let room = self
            .rooms
            .get_mut(key)
            .ok_or_else(|| RoomError::not_found(key))?;
        if room.contains(&peer_id) {
            return Err(RoomError::already_in_room());
        }
        room.members.push(RoomMember {
            peer_id,
            username,
            queue,
        });
        Ok(room)
    }

    /// Remove a member; deletes the room when it empties. Unknown keys yield
    /// `{room: None, was_empty: true}`.
    pub fn leave(&mut self, key: &RoomKey, peer_id: &PeerId) -> LeaveOutcome<'_> {
        let Some(room) = self.rooms.get_mut(key) else {
            return LeaveOutcome {
                room: None,
                was_empty: true,
            };
        };
        room.members.retain(|m| &m.peer_id != peer_id);
        if room.members.is_empty() {
            self.rooms.remove(key);
            return LeaveOutcome {
                room: None,
                was_empty: true,
            };
        }
        LeaveOutcome {
            room: Some(&self.rooms[key]),
            was_empty: false,
        }
    }

    pub fn get(&self, key: &RoomKey) -> Option<&Room> {
        self.rooms.get(key)
    }

    pub fn list(&self) -> impl Iterator<Item = &Room> {
        self.rooms.values()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
