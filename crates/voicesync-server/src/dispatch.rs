//! Inbound message dispatch.
//!
//! One call to [`handle_frame`] processes one frame from one connection
//! against the shared [`ServerState`] and enqueues every resulting outbound
//! message. The caller holds the state lock for the duration, so each
//! invocation sees and produces a consistent snapshot; enqueueing never
//! blocks, so the lock is never held across an await.

use tracing::{debug, trace, warn};

use voicesync_core::domain::identity::{clean_username, PeerId};
use voicesync_core::domain::room_key::RoomKey;
use voicesync_core::domain::signaling::{ClientMessage, PeerSummary, ServerMessage};

use crate::registry::{ClientQueue, RoomRegistry, UserRegistry};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The only process-wide mutable state: both registries, one value.
#[derive(Default)]
pub struct ServerState {
    pub users: UserRegistry,
    pub rooms: RoomRegistry,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What the dispatcher knows about the connection a frame came from.
#[derive(Clone)]
pub struct Connection {
    pub peer_id: PeerId,
    pub queue: ClientQueue,
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse and dispatch one raw text frame.
///
/// Non-JSON input is dropped silently; well-formed JSON with an unknown
/// `type` is logged and dropped.
pub fn handle_frame(state: &mut ServerState, conn: &Connection, raw: &str) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => {
            trace!(peer_id = %conn.peer_id, "ignoring non-JSON frame");
            return;
        }
    };
    match serde_json::from_value::<ClientMessage>(value) {
        Ok(msg) => handle_message(state, conn, msg),
        Err(err) => {
            warn!(peer_id = %conn.peer_id, %err, "dropping unrecognized message");
        }
    }
}

pub fn handle_message(state: &mut ServerState, conn: &Connection, msg: ClientMessage) {
    match msg {
        ClientMessage::Login { username } => login(state, conn, &username),
        ClientMessage::CreateRoom => create_room(state, conn),
        ClientMessage::JoinRoom { room_key } => join_room(state, conn, &room_key),
        ClientMessage::AcceptInvite { room_key } => join_room(state, conn, &room_key),
        ClientMessage::Invite { to_username } => invite(state, conn, &to_username),
        ClientMessage::DeclineInvite { room_key } => decline_invite(state, conn, &room_key),
        ClientMessage::LeaveRoom => leave_room(state, conn),
        ClientMessage::Signal { to_peer_id, data } => signal(state, conn, to_peer_id, data),
    }
}

/// Connection-level close: implicit leave-room, then unregister.
///
/// Produces the same `peer-left` fan-out as an explicit leave so remote UIs
/// cannot tell the difference.
pub fn handle_disconnect(state: &mut ServerState, peer_id: &PeerId) {
    remove_from_room(state, peer_id);
    if state.users.unregister(peer_id).is_some() {
        debug!(%peer_id, "user disconnected");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn login(state: &mut ServerState, conn: &Connection, raw_username: &str) {
    let Some(username) = clean_username(raw_username) else {
        conn.queue.send(ServerMessage::LoginError {
            message: "display name cannot be empty".into(),
        });
        return;
    };
    if state.users.find_by_id(&conn.peer_id).is_some() {
        conn.queue.send(ServerMessage::LoginError {
            message: "already logged in".into(),
        });
        return;
    }
    if !state
        .users
        .try_register(conn.peer_id.clone(), username.clone(), conn.queue.clone())
    {
        conn.queue.send(ServerMessage::LoginError {
            message: format!("display name \"{username}\" is already taken"),
        });
        return;
    }
    debug!(peer_id = %conn.peer_id, %username, "user logged in");
    conn.queue.send(ServerMessage::LoginOk {
        peer_id: conn.peer_id.clone(),
    });
}

fn create_room(state: &mut ServerState, conn: &Connection) {
    let Some(user) = state.users.find_by_id(&conn.peer_id) else {
        conn.queue.send(ServerMessage::CreateError {
            message: "log in before creating a room".into(),
        });
        return;
    };
    if user.room.is_some() {
        conn.queue.send(ServerMessage::CreateError {
            message: "already in a room".into(),
        });
        return;
    }
    let username = user.username.clone();
    let key = state
        .rooms
        .create(conn.peer_id.clone(), username, conn.queue.clone())
        .key
        .clone();
    state.users.set_room(&conn.peer_id, Some(key.clone()));
    debug!(peer_id = %conn.peer_id, room = %key, "room created");
    conn.queue.send(ServerMessage::RoomCreated { room_key: key });
}

fn join_room(state: &mut ServerState, conn: &Connection, raw_key: &str) {
    let Some(user) = state.users.find_by_id(&conn.peer_id) else {
        conn.queue.send(ServerMessage::JoinError {
            message: "log in before joining a room".into(),
        });
        return;
    };
    if user.room.is_some() {
        conn.queue.send(ServerMessage::JoinError {
            message: "already in a room".into(),
        });
        return;
    }
    let Some(key) = RoomKey::parse(raw_key) else {
        conn.queue.send(ServerMessage::JoinError {
            message: format!("room {raw_key} not found"),
        });
        return;
    };

    let username = user.username.clone();
    let room = match state
        .rooms
        .join(&key, conn.peer_id.clone(), username.clone(), conn.queue.clone())
    {
        Ok(room) => room,
        Err(err) => {
            conn.queue.send(ServerMessage::JoinError {
                message: err.message,
            });
            return;
        }
    };

    // The joiner learns the existing membership before anyone learns of the
    // joiner.
    let peers: Vec<PeerSummary> = room
        .others(&conn.peer_id)
        .map(|m| PeerSummary {
            peer_id: m.peer_id.clone(),
            username: m.username.clone(),
        })
        .collect();
    conn.queue.send(ServerMessage::RoomJoined {
        room_key: key.clone(),
        peers,
    });
    for member in room.others(&conn.peer_id) {
        member.queue.send(ServerMessage::PeerJoined {
            peer_id: conn.peer_id.clone(),
            username: username.clone(),
        });
    }

    state.users.set_room(&conn.peer_id, Some(key.clone()));
    debug!(peer_id = %conn.peer_id, room = %key, "peer joined room");
}

fn invite(state: &mut ServerState, conn: &Connection, to_username: &str) {
    let reject = |message: String| {
        conn.queue.send(ServerMessage::InviteError { message });
    };
    let Some(inviter) = state.users.find_by_id(&conn.peer_id) else {
        return reject("log in before inviting".into());
    };
    let Some(room_key) = inviter.room.clone() else {
        return reject("join a room before inviting".into());
    };
    let Some(target) = state.users.find_by_name(to_username) else {
        return reject(format!("{to_username} is not online"));
    };
    if target.peer_id == conn.peer_id {
        return reject("cannot invite yourself".into());
    }
    if target.room.is_some() {
        return reject(format!("{} is already in a room", target.username));
    }

    target.queue.send(ServerMessage::Invite {
        from_username: inviter.username.clone(),
        room_key,
    });
    conn.queue.send(ServerMessage::InviteSent {
        to_username: target.username.clone(),
    });
}

fn decline_invite(state: &mut ServerState, conn: &Connection, raw_key: &str) {
    // Best effort: a vanished room or an anonymous decliner is not an error.
    let Some(user) = state.users.find_by_id(&conn.peer_id) else {
        return;
    };
    let Some(key) = RoomKey::parse(raw_key) else {
        return;
    };
    let Some(room) = state.rooms.get(&key) else {
        return;
    };
    for member in room.others(&conn.peer_id) {
        member.queue.send(ServerMessage::InviteDeclined {
            username: user.username.clone(),
        });
    }
}

fn signal(state: &mut ServerState, conn: &Connection, to_peer_id: PeerId, data: serde_json::Value) {
    // The payload is opaque; a missing target is dropped silently so
    // negotiation races with disconnects stay harmless.
    let Some(target) = state.users.find_by_id(&to_peer_id) else {
        trace!(%to_peer_id, "signal for unknown peer dropped");
        return;
    };
    target.queue.send(ServerMessage::Signal {
        from_peer_id: conn.peer_id.clone(),
        data,
    });
}

fn leave_room(state: &mut ServerState, conn: &Connection) {
    remove_from_room(state, &conn.peer_id);
    // Idempotent: confirmed whether or not the user was in a room.
    conn.queue.send(ServerMessage::LeftRoom);
}

/// Shared removal path for `leave-room` and disconnect.
fn remove_from_room(state: &mut ServerState, peer_id: &PeerId) {
    let Some(user) = state.users.find_by_id(peer_id) else {
        return;
    };
    let Some(key) = user.room.clone() else {
        return;
    };
    let username = user.username.clone();

    let outcome = state.rooms.leave(&key, peer_id);
    if let Some(room) = outcome.room {
        for member in room.members() {
            member.queue.send(ServerMessage::PeerLeft {
                peer_id: peer_id.clone(),
                username: username.clone(),
            });
        }
    } else {
        debug!(room = %key, "room emptied and removed");
    }
    state.users.set_room(peer_id, None);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use crate::registry::OUTBOUND_QUEUE_DEPTH;

    use super::*;

    struct TestConn {
        conn: Connection,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestConn {
        fn new(id: &str) -> Self {
            let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
            Self {
                conn: Connection {
                    peer_id: PeerId::new(id),
                    queue: ClientQueue::new(tx, CancellationToken::new()),
                },
                rx,
            }
        }

        fn recv(&mut self) -> ServerMessage {
            self.rx.try_recv().expect("expected a queued message")
        }

        fn assert_silent(&mut self) {
            assert!(self.rx.try_recv().is_err(), "expected no queued message");
        }
    }

    fn login_as(state: &mut ServerState, conn: &mut TestConn, name: &str) {
        handle_message(
            state,
            &conn.conn,
            ClientMessage::Login {
                username: name.into(),
            },
        );
        match conn.recv() {
            ServerMessage::LoginOk { peer_id } => assert_eq!(peer_id, conn.conn.peer_id),
            other => panic!("login failed: {other:?}"),
        }
    }

    fn create_room_as(state: &mut ServerState, conn: &mut TestConn) -> RoomKey {
        handle_message(state, &conn.conn, ClientMessage::CreateRoom);
        match conn.recv() {
            ServerMessage::RoomCreated { room_key } => room_key,
            other => panic!("create failed: {other:?}"),
        }
    }

    #[test]
    fn s1_host_creates_guest_joins() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");

        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        assert!(voicesync_core::domain::room_key::is_valid(key.as_str()));

        login_as(&mut state, &mut bob, "bob");
        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::JoinRoom {
                room_key: key.to_string(),
            },
        );

        match bob.recv() {
            ServerMessage::RoomJoined { room_key, peers } => {
                assert_eq!(room_key, key);
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].peer_id, alice.conn.peer_id);
                assert_eq!(peers[0].username, "alice");
            }
            other => panic!("unexpected: {other:?}"),
        }
        match alice.recv() {
            ServerMessage::PeerJoined { peer_id, username } => {
                assert_eq!(peer_id, bob.conn.peer_id);
                assert_eq!(username, "bob");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn join_normalizes_key_case() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");

        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::JoinRoom {
                room_key: format!("  {}  ", key.to_string().to_ascii_lowercase()),
            },
        );
        assert!(matches!(bob.recv(), ServerMessage::RoomJoined { .. }));
    }

    #[test]
    fn s2_signal_reaches_exactly_the_target() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        let mut carol = TestConn::new("c");
        login_as(&mut state, &mut alice, "alice");
        login_as(&mut state, &mut bob, "bob");
        login_as(&mut state, &mut carol, "carol");

        let data = serde_json::json!({"kind": "offer", "sdp": "X"});
        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Signal {
                to_peer_id: bob.conn.peer_id.clone(),
                data: data.clone(),
            },
        );

        match bob.recv() {
            ServerMessage::Signal { from_peer_id, data: got } => {
                assert_eq!(from_peer_id, alice.conn.peer_id);
                assert_eq!(got, data);
            }
            other => panic!("unexpected: {other:?}"),
        }
        bob.assert_silent();
        carol.assert_silent();
        alice.assert_silent();
    }

    #[test]
    fn signal_to_unknown_peer_is_dropped_silently() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        login_as(&mut state, &mut alice, "alice");

        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Signal {
                to_peer_id: PeerId::new("ghost"),
                data: serde_json::json!({}),
            },
        );
        alice.assert_silent();
    }

    #[test]
    fn signal_order_is_preserved_per_pair() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        login_as(&mut state, &mut bob, "bob");

        for i in 0..5 {
            handle_message(
                &mut state,
                &alice.conn,
                ClientMessage::Signal {
                    to_peer_id: bob.conn.peer_id.clone(),
                    data: serde_json::json!({ "seq": i }),
                },
            );
        }
        for i in 0..5 {
            match bob.recv() {
                ServerMessage::Signal { data, .. } => assert_eq!(data["seq"], i),
                other => panic!("unexpected: {other:?}"),
            }
        }
    }

    #[test]
    fn s3_duplicate_name_is_rejected() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut impostor = TestConn::new("c");
        login_as(&mut state, &mut alice, "alice");

        handle_message(
            &mut state,
            &impostor.conn,
            ClientMessage::Login {
                username: "ALICE".into(),
            },
        );
        assert!(matches!(impostor.recv(), ServerMessage::LoginError { .. }));
    }

    #[test]
    fn login_rejects_blank_and_truncates_long_names() {
        let mut state = ServerState::new();
        let mut blank = TestConn::new("a");
        handle_message(
            &mut state,
            &blank.conn,
            ClientMessage::Login {
                username: "   ".into(),
            },
        );
        assert!(matches!(blank.recv(), ServerMessage::LoginError { .. }));

        let mut long = TestConn::new("b");
        handle_message(
            &mut state,
            &long.conn,
            ClientMessage::Login {
                username: "x".repeat(80),
            },
        );
        assert!(matches!(long.recv(), ServerMessage::LoginOk { .. }));
        let stored = state.users.find_by_id(&long.conn.peer_id).unwrap();
        assert_eq!(stored.username.len(), 32);
    }

    #[test]
    fn s4_joining_a_nonexistent_room_fails() {
        let mut state = ServerState::new();
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut bob, "bob");

        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::JoinRoom {
                room_key: "ZZZ-ZZZ-ZZZ".into(),
            },
        );
        assert!(matches!(bob.recv(), ServerMessage::JoinError { .. }));
    }

    #[test]
    fn create_requires_login_and_roomlessness() {
        let mut state = ServerState::new();
        let mut anon = TestConn::new("a");
        handle_message(&mut state, &anon.conn, ClientMessage::CreateRoom);
        assert!(matches!(anon.recv(), ServerMessage::CreateError { .. }));

        let mut alice = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        create_room_as(&mut state, &mut alice);
        handle_message(&mut state, &alice.conn, ClientMessage::CreateRoom);
        assert!(matches!(alice.recv(), ServerMessage::CreateError { .. }));
    }

    #[test]
    fn s5_invite_happy_path() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");

        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Invite {
                to_username: "bob".into(),
            },
        );

        match bob.recv() {
            ServerMessage::Invite {
                from_username,
                room_key,
            } => {
                assert_eq!(from_username, "alice");
                assert_eq!(room_key, key);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match alice.recv() {
            ServerMessage::InviteSent { to_username } => assert_eq!(to_username, "bob"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn s6_self_invite_is_rejected() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        login_as(&mut state, &mut alice, "alice");
        create_room_as(&mut state, &mut alice);

        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Invite {
                to_username: "alice".into(),
            },
        );
        assert!(matches!(alice.recv(), ServerMessage::InviteError { .. }));
    }

    #[test]
    fn invite_rejects_offline_and_busy_targets() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        login_as(&mut state, &mut alice, "alice");
        create_room_as(&mut state, &mut alice);

        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Invite {
                to_username: "nobody".into(),
            },
        );
        assert!(matches!(alice.recv(), ServerMessage::InviteError { .. }));

        // Bob is online but already hosting his own room.
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut bob, "bob");
        create_room_as(&mut state, &mut bob);
        handle_message(
            &mut state,
            &alice.conn,
            ClientMessage::Invite {
                to_username: "bob".into(),
            },
        );
        assert!(matches!(alice.recv(), ServerMessage::InviteError { .. }));
        bob.assert_silent();
    }

    #[test]
    fn accept_invite_joins_like_join_room() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");

        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::AcceptInvite {
                room_key: key.to_string(),
            },
        );
        assert!(matches!(bob.recv(), ServerMessage::RoomJoined { .. }));
        assert!(matches!(alice.recv(), ServerMessage::PeerJoined { .. }));
    }

    #[test]
    fn decline_invite_notifies_the_room() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");

        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::DeclineInvite {
                room_key: key.to_string(),
            },
        );
        match alice.recv() {
            ServerMessage::InviteDeclined { username } => assert_eq!(username, "bob"),
            other => panic!("unexpected: {other:?}"),
        }
        bob.assert_silent();
    }

    #[test]
    fn leave_room_is_idempotent_and_fans_out() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");
        handle_message(
            &mut state,
            &bob.conn,
            ClientMessage::JoinRoom {
                room_key: key.to_string(),
            },
        );
        bob.recv(); // room-joined
        alice.recv(); // peer-joined

        handle_message(&mut state, &bob.conn, ClientMessage::LeaveRoom);
        assert!(matches!(bob.recv(), ServerMessage::LeftRoom));
        match alice.recv() {
            ServerMessage::PeerLeft { peer_id, username } => {
                assert_eq!(peer_id, bob.conn.peer_id);
                assert_eq!(username, "bob");
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Not in a room anymore: still confirmed, no fan-out.
        handle_message(&mut state, &bob.conn, ClientMessage::LeaveRoom);
        assert!(matches!(bob.recv(), ServerMessage::LeftRoom));
        alice.assert_silent();

        // Last member out deletes the room.
        handle_message(&mut state, &alice.conn, ClientMessage::LeaveRoom);
        assert!(matches!(alice.recv(), ServerMessage::LeftRoom));
        assert!(state.rooms.get(&key).is_none());
    }

    #[test]
    fn disconnect_produces_the_same_fanout_as_leave() {
        let mut state = ServerState::new();
        let mut alice = TestConn::new("a");
        let mut bob = TestConn::new("b");
        let mut carol = TestConn::new("c");
        login_as(&mut state, &mut alice, "alice");
        let key = create_room_as(&mut state, &mut alice);
        login_as(&mut state, &mut bob, "bob");
        login_as(&mut state, &mut carol, "carol");
        for conn in [&bob.conn, &carol.conn] {
            handle_message(
                &mut state,
                conn,
                ClientMessage::JoinRoom {
                    room_key: key.to_string(),
                },
            );
        }
        // Drain the join traffic.
        while bob.rx.try_recv().is_ok() {}
        while alice.rx.try_recv().is_ok() {}
        while carol.rx.try_recv().is_ok() {}

        handle_disconnect(&mut state, &bob.conn.peer_id);

        for conn in [&mut alice, &mut carol] {
            match conn.recv() {
                ServerMessage::PeerLeft { username, .. } => assert_eq!(username, "bob"),
                other => panic!("unexpected: {other:?}"),
            }
            conn.assert_silent();
        }
        assert!(state.users.find_by_name("bob").is_none());
        // The name frees up for a reconnecting client.
        let mut bob2 = TestConn::new("b2");
        login_as(&mut state, &mut bob2, "bob");
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        let mut state = ServerState::new();
        let mut conn = TestConn::new("a");

        handle_frame(&mut state, &conn.conn, "not json at all");
        conn.assert_silent();

        handle_frame(&mut state, &conn.conn, r#"{"type":"no-such-thing"}"#);
        conn.assert_silent();

        handle_frame(
            &mut state,
            &conn.conn,
            r#"{"type":"login","username":"alice"}"#,
        );
        assert!(matches!(conn.recv(), ServerMessage::LoginOk { .. }));
    }
}
