//! The client session coordinator.
//!
//! A [`Session`] owns one signaling transport, one peer engine, and one
//! audio adapter, and translates the wire protocol into observable
//! participant state. Request methods are async and resolve when the
//! matching server reply arrives; everything else is reactive wiring driven
//! by three background loops (signaling events, peer events, microphone
//! samples).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::domain::error::{RoomError, SessionError, SignalingError};
use crate::domain::identity::{Participant, PeerId};
use crate::domain::room_key::RoomKey;
use crate::domain::signaling::ServerMessage;

use super::pending::PendingRequests;
use super::ports::{AudioAdapter, PeerEngine, PeerEvent, SampleBatch, Signaling, TransportEvent};

/// RMS threshold above which the local participant counts as speaking.
const SPEAKING_RMS_THRESHOLD: f32 = 0.01;

// ---------------------------------------------------------------------------
// Configuration and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long request methods wait for the matching reply.
    pub request_timeout: Duration,
    /// Grace period between sending `leave-room` and dropping the transport.
    pub leave_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            leave_grace: Duration::from_millis(250),
        }
    }
}

/// What a session reports to its observers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The participant set or one of its flags changed.
    ParticipantUpdate(Vec<Participant>),
    /// One batch of local microphone samples (for visualization).
    AudioSamples(SampleBatch),
    Invite {
        from_username: String,
        room_key: RoomKey,
    },
    InviteSent {
        to_username: String,
    },
    InviteDeclined {
        username: String,
    },
    /// The call is over; cleanup already ran.
    Ended,
    Error {
        fatal: bool,
        error: SessionError,
    },
}

#[derive(Default)]
struct SessionState {
    our_peer_id: Option<PeerId>,
    current_room: Option<RoomKey>,
    participants: BTreeMap<PeerId, Participant>,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    username: String,
    signaling: Arc<dyn Signaling>,
    peers: Arc<dyn PeerEngine>,
    audio: Arc<dyn AudioAdapter>,
    config: SessionConfig,
    pending: PendingRequests,
    state: Mutex<SessionState>,
    /// Cleared by the first fatal failure or cleanup so `ended` fires once.
    alive: AtomicBool,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Session {
    /// Build a session and start its reactive loops.
    pub fn spawn(
        signaling: Arc<dyn Signaling>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        peers: Arc<dyn PeerEngine>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        audio: Arc<dyn AudioAdapter>,
        username: String,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(256);
        let session = Arc::new(Self {
            username,
            signaling,
            peers,
            audio,
            config,
            pending: PendingRequests::new(),
            state: Mutex::new(SessionState::default()),
            alive: AtomicBool::new(true),
            events_tx,
        });

        let this = session.clone();
        tokio::spawn(async move { this.run_transport_loop(transport_events).await });
        let this = session.clone();
        tokio::spawn(async move { this.run_peer_loop(peer_events).await });
        let this = session.clone();
        let samples = session.audio.subscribe_samples();
        tokio::spawn(async move { this.run_samples_loop(samples).await });

        session
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Current participant snapshot.
    pub fn participants(&self) -> Vec<Participant> {
        self.state
            .lock()
            .unwrap()
            .participants
            .values()
            .cloned()
            .collect()
    }

    /// The room this session is currently in, if any.
    pub fn current_room(&self) -> Option<RoomKey> {
        self.state.lock().unwrap().current_room.clone()
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Open signaling, log in, and start audio capture.
    pub async fn connect(&self) -> Result<PeerId, SessionError> {
        self.signaling.connect().await?;

        let username = self.username.clone();
        let reply = self
            .pending
            .wait("login-ok", "login-error", self.config.request_timeout, || {
                self.signaling.login(username)
            })
            .await?;
        let ServerMessage::LoginOk { peer_id } = reply else {
            return Err(SignalingError::ws_error("unexpected login reply").into());
        };

        {
            let mut state = self.state.lock().unwrap();
            state.our_peer_id = Some(peer_id.clone());
            state.participants.insert(
                peer_id.clone(),
                Participant::new(peer_id.clone(), self.username.clone(), true),
            );
        }
        self.emit_participants();

        // A missing microphone should not keep the user out of the call.
        if let Err(err) = self.audio.start_capture().await {
            warn!(%err, "audio capture unavailable");
            self.emit(SessionEvent::Error {
                fatal: false,
                error: err.into(),
            });
        }

        Ok(peer_id)
    }

    /// Create a room and become its host.
    pub async fn create_room(&self) -> Result<RoomKey, SessionError> {
        let reply = self
            .pending
            .wait(
                "room-created",
                "create-error",
                self.config.request_timeout,
                || self.signaling.create_room(),
            )
            .await
            .map_err(room_flavored)?;
        let ServerMessage::RoomCreated { room_key } = reply else {
            return Err(SignalingError::ws_error("unexpected create reply").into());
        };

        self.state.lock().unwrap().current_room = Some(room_key.clone());
        Ok(room_key)
    }

    /// Join an existing room and start negotiating toward every member.
    pub async fn join_room(&self, key: &str) -> Result<RoomKey, SessionError> {
        self.enter_room(key, false).await
    }

    /// Accept a pending invite; same join semantics, different wire message.
    pub async fn accept_invite(&self, key: &str) -> Result<RoomKey, SessionError> {
        self.enter_room(key, true).await
    }

    /// Tell the room a received invite was turned down.
    pub fn decline_invite(&self, key: &RoomKey) {
        self.signaling.decline_invite(key.to_string());
    }

    async fn enter_room(&self, key: &str, via_invite: bool) -> Result<RoomKey, SessionError> {
        let key = RoomKey::parse(key)
            .ok_or_else(|| RoomError::other(format!("not a valid room key: {key}")))?;

        let reply = self
            .pending
            .wait("room-joined", "join-error", self.config.request_timeout, || {
                if via_invite {
                    self.signaling.accept_invite(key.to_string());
                } else {
                    self.signaling.join_room(key.to_string());
                }
            })
            .await
            .map_err(room_flavored)?;
        let ServerMessage::RoomJoined { room_key, peers } = reply else {
            return Err(SignalingError::ws_error("unexpected join reply").into());
        };

        {
            let mut state = self.state.lock().unwrap();
            state.current_room = Some(room_key.clone());
            for peer in &peers {
                state.participants.insert(
                    peer.peer_id.clone(),
                    Participant::new(peer.peer_id.clone(), peer.username.clone(), false),
                );
            }
        }
        self.emit_participants();

        // The joiner initiates toward every existing member; they respond.
        // One offer per pair, no glare.
        let track = self.audio.local_track();
        for peer in peers {
            if let Err(err) = self
                .peers
                .create(peer.peer_id.clone(), true, track.clone())
                .await
            {
                warn!(peer_id = %peer.peer_id, %err, "failed to start negotiation");
                self.emit(SessionEvent::Error {
                    fatal: false,
                    error: err.into(),
                });
            }
        }

        Ok(room_key)
    }

    /// Invite a named online user into the current room.
    pub async fn invite(&self, to_username: &str) -> Result<(), SessionError> {
        let to_username = to_username.to_owned();
        self.pending
            .wait("invite-sent", "invite-error", self.config.request_timeout, || {
                self.signaling.invite(to_username)
            })
            .await?;
        Ok(())
    }

    /// Toggle the microphone. Emits one `ParticipantUpdate` per change.
    pub fn set_muted(&self, muted: bool) {
        self.audio.set_muted(muted);
        let changed = {
            let mut state = self.state.lock().unwrap();
            match self_participant(&mut state) {
                Some(me) if me.is_muted != muted => {
                    me.is_muted = muted;
                    if muted {
                        me.is_speaking = false;
                    }
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit_participants();
        }
    }

    /// Leave the room (if any) and shut the session down.
    ///
    /// Cleanup always runs, even when the transport is already gone.
    pub async fn leave(&self) {
        let in_room = self.state.lock().unwrap().current_room.is_some();
        if in_room {
            self.signaling.leave_room();
            // Give the frame a moment to flush before tearing the socket down.
            tokio::time::sleep(self.config.leave_grace).await;
        }
        self.signaling.disconnect().await;
        self.cleanup().await;
    }

    // -----------------------------------------------------------------------
    // Reactive loops
    // -----------------------------------------------------------------------

    async fn run_transport_loop(&self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Message(msg) => {
                    self.pending.offer(&msg);
                    self.react(msg).await;
                }
                TransportEvent::Closed => {
                    let in_room = self.state.lock().unwrap().current_room.is_some();
                    if in_room {
                        self.fail_conn_lost().await;
                    }
                }
                TransportEvent::ConnLost => self.fail_conn_lost().await,
            }
        }
    }

    async fn react(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Connected { peer_id } => {
                self.state.lock().unwrap().our_peer_id = Some(peer_id);
            }
            ServerMessage::PeerJoined { peer_id, username } => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.participants.insert(
                        peer_id.clone(),
                        Participant::new(peer_id.clone(), username, false),
                    );
                }
                self.emit_participants();
                // The newcomer initiates toward us; we only prepare to answer.
                let track = self.audio.local_track();
                if let Err(err) = self.peers.create(peer_id.clone(), false, track).await {
                    warn!(%peer_id, %err, "failed to prepare peer connection");
                    self.emit(SessionEvent::Error {
                        fatal: false,
                        error: err.into(),
                    });
                }
            }
            ServerMessage::PeerLeft { peer_id, .. } => {
                let removed = self
                    .state
                    .lock()
                    .unwrap()
                    .participants
                    .remove(&peer_id)
                    .is_some();
                if removed {
                    self.emit_participants();
                }
                self.peers.destroy(&peer_id).await;
                self.audio.remove_remote(&peer_id).await;
            }
            ServerMessage::Signal { from_peer_id, data } => {
                self.peers.signal(&from_peer_id, data).await;
            }
            ServerMessage::Invite {
                from_username,
                room_key,
            } => self.emit(SessionEvent::Invite {
                from_username,
                room_key,
            }),
            ServerMessage::InviteSent { to_username } => {
                self.emit(SessionEvent::InviteSent { to_username })
            }
            ServerMessage::InviteDeclined { username } => {
                self.emit(SessionEvent::InviteDeclined { username })
            }
            ServerMessage::LeftRoom => {
                self.cleanup().await;
                self.emit(SessionEvent::Ended);
            }
            // Request replies are consumed by the pending table.
            ServerMessage::LoginOk { .. }
            | ServerMessage::LoginError { .. }
            | ServerMessage::RoomCreated { .. }
            | ServerMessage::CreateError { .. }
            | ServerMessage::RoomJoined { .. }
            | ServerMessage::JoinError { .. }
            | ServerMessage::InviteError { .. } => {}
        }
    }

    async fn run_peer_loop(&self, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::Signal { peer_id, data } => {
                    self.signaling.signal(peer_id, data);
                }
                PeerEvent::Track { peer_id, track } => {
                    self.audio.add_remote(peer_id, track).await;
                }
                PeerEvent::Connected { peer_id } => {
                    debug!(%peer_id, "peer media connected");
                }
                PeerEvent::Disconnected { peer_id } => {
                    debug!(%peer_id, "peer media disconnected");
                    self.audio.remove_remote(&peer_id).await;
                }
                PeerEvent::Error { peer_id, error } => {
                    warn!(%peer_id, %error, "peer engine error");
                    self.emit(SessionEvent::Error {
                        fatal: false,
                        error: error.into(),
                    });
                }
            }
        }
    }

    async fn run_samples_loop(&self, mut rx: broadcast::Receiver<SampleBatch>) {
        loop {
            let batch = match rx.recv().await {
                Ok(batch) => batch,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            self.handle_samples(batch);
        }
    }

    fn handle_samples(&self, batch: SampleBatch) {
        let speaking = rms(&batch) > SPEAKING_RMS_THRESHOLD;
        let flipped = {
            let mut state = self.state.lock().unwrap();
            match self_participant(&mut state) {
                Some(me) if me.is_speaking != speaking => {
                    me.is_speaking = speaking;
                    true
                }
                _ => false,
            }
        };
        if flipped {
            self.emit_participants();
        }
        self.emit(SessionEvent::AudioSamples(batch));
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    async fn fail_conn_lost(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        self.emit(SessionEvent::Error {
            fatal: true,
            error: SignalingError::conn_lost().into(),
        });
        self.teardown().await;
        self.emit(SessionEvent::Ended);
    }

    async fn cleanup(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.teardown().await;
    }

    async fn teardown(&self) {
        self.peers.destroy_all().await;
        self.audio.stop().await;
        {
            let mut state = self.state.lock().unwrap();
            state.participants.clear();
            state.current_room = None;
        }
        self.pending.clear();
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_participants(&self) {
        let snapshot = self.participants();
        self.emit(SessionEvent::ParticipantUpdate(snapshot));
    }
}

fn self_participant(state: &mut SessionState) -> Option<&mut Participant> {
    let id = state.our_peer_id.clone()?;
    state.participants.get_mut(&id)
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn room_flavored(err: SignalingError) -> SessionError {
    match err.code {
        crate::domain::error::SignalingCode::RequestFailed => {
            RoomError::other(err.message).into()
        }
        _ => err.into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::timeout;

    use crate::application::ports::{LocalAudioTrack, RemoteAudioTrack};
    use crate::domain::error::{AudioError, PeerError};
    use crate::domain::signaling::{ClientMessage, PeerSummary};

    use super::*;

    struct MockSignaling {
        sent: Mutex<Vec<ClientMessage>>,
    }

    #[async_trait]
    impl Signaling for MockSignaling {
        async fn connect(&self) -> Result<(), SignalingError> {
            Ok(())
        }

        fn send(&self, msg: ClientMessage) {
            self.sent.lock().unwrap().push(msg);
        }

        async fn disconnect(&self) {}
    }

    #[derive(Debug, PartialEq)]
    enum EngineCall {
        Create { peer_id: PeerId, initiator: bool },
        Signal { peer_id: PeerId },
        Destroy { peer_id: PeerId },
        DestroyAll,
    }

    struct MockEngine {
        calls: Mutex<Vec<EngineCall>>,
    }

    #[async_trait]
    impl PeerEngine for MockEngine {
        async fn create(
            &self,
            peer_id: PeerId,
            initiator: bool,
            _local_track: Option<LocalAudioTrack>,
        ) -> Result<(), PeerError> {
            self.calls
                .lock()
                .unwrap()
                .push(EngineCall::Create { peer_id, initiator });
            Ok(())
        }

        async fn signal(&self, peer_id: &PeerId, _data: serde_json::Value) {
            self.calls.lock().unwrap().push(EngineCall::Signal {
                peer_id: peer_id.clone(),
            });
        }

        async fn destroy(&self, peer_id: &PeerId) {
            self.calls.lock().unwrap().push(EngineCall::Destroy {
                peer_id: peer_id.clone(),
            });
        }

        async fn destroy_all(&self) {
            self.calls.lock().unwrap().push(EngineCall::DestroyAll);
        }
    }

    struct MockAudio {
        muted: AtomicBool,
        samples_tx: broadcast::Sender<SampleBatch>,
        removed: Mutex<Vec<PeerId>>,
    }

    impl MockAudio {
        fn new() -> Self {
            let (samples_tx, _) = broadcast::channel(16);
            Self {
                muted: AtomicBool::new(false),
                samples_tx,
                removed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AudioAdapter for MockAudio {
        async fn start_capture(&self) -> Result<(), AudioError> {
            Ok(())
        }

        fn local_track(&self) -> Option<LocalAudioTrack> {
            None
        }

        fn subscribe_samples(&self) -> broadcast::Receiver<SampleBatch> {
            self.samples_tx.subscribe()
        }

        async fn add_remote(&self, _peer_id: PeerId, _track: RemoteAudioTrack) {}

        async fn remove_remote(&self, peer_id: &PeerId) {
            self.removed.lock().unwrap().push(peer_id.clone());
        }

        fn set_muted(&self, muted: bool) {
            self.muted.store(muted, Ordering::SeqCst);
        }

        async fn stop(&self) {}
    }

    struct Harness {
        session: Arc<Session>,
        signaling: Arc<MockSignaling>,
        engine: Arc<MockEngine>,
        audio: Arc<MockAudio>,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
        peer_tx: mpsc::UnboundedSender<PeerEvent>,
    }

    fn harness() -> Harness {
        let signaling = Arc::new(MockSignaling {
            sent: Mutex::new(Vec::new()),
        });
        let engine = Arc::new(MockEngine {
            calls: Mutex::new(Vec::new()),
        });
        let audio = Arc::new(MockAudio::new());
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            signaling.clone(),
            transport_rx,
            engine.clone(),
            peer_rx,
            audio.clone(),
            "alice".into(),
            SessionConfig::default(),
        );
        Harness {
            session,
            signaling,
            engine,
            audio,
            transport_tx,
            peer_tx,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Drives `connect()` to completion by answering the login.
    async fn connected_harness() -> Harness {
        let h = harness();
        let session = h.session.clone();
        let join = tokio::spawn(async move { session.connect().await });
        settle().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::LoginOk {
                peer_id: PeerId::new("self"),
            }))
            .unwrap();
        join.await.unwrap().unwrap();
        h
    }

    #[tokio::test]
    async fn connect_sends_login_and_adds_self() {
        let h = connected_harness().await;
        let sent = h.signaling.sent.lock().unwrap();
        assert!(matches!(
            sent[0],
            ClientMessage::Login { ref username } if username == "alice"
        ));
        drop(sent);
        let participants = h.session.participants();
        assert_eq!(participants.len(), 1);
        assert!(participants[0].is_self);
    }

    #[tokio::test]
    async fn joiner_initiates_toward_existing_members() {
        let h = connected_harness().await;
        let session = h.session.clone();
        let join = tokio::spawn(async move { session.join_room("ACD-EFG-234").await });
        settle().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::RoomJoined {
                room_key: RoomKey::parse("ACD-EFG-234").unwrap(),
                peers: vec![PeerSummary {
                    peer_id: PeerId::new("host"),
                    username: "bob".into(),
                }],
            }))
            .unwrap();
        join.await.unwrap().unwrap();

        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::Create {
            peer_id: PeerId::new("host"),
            initiator: true,
        }));
        drop(calls);
        assert_eq!(h.session.participants().len(), 2);
    }

    #[tokio::test]
    async fn existing_member_responds_to_newcomer() {
        let h = connected_harness().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::PeerJoined {
                peer_id: PeerId::new("newcomer"),
                username: "carol".into(),
            }))
            .unwrap();
        settle().await;

        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::Create {
            peer_id: PeerId::new("newcomer"),
            initiator: false,
        }));
    }

    #[tokio::test]
    async fn peer_left_destroys_connection_and_playback() {
        let h = connected_harness().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::PeerJoined {
                peer_id: PeerId::new("b"),
                username: "bob".into(),
            }))
            .unwrap();
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::PeerLeft {
                peer_id: PeerId::new("b"),
                username: "bob".into(),
            }))
            .unwrap();
        settle().await;

        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::Destroy {
            peer_id: PeerId::new("b"),
        }));
        drop(calls);
        assert!(h.audio.removed.lock().unwrap().contains(&PeerId::new("b")));
        assert_eq!(h.session.participants().len(), 1);
    }

    #[tokio::test]
    async fn inbound_signal_reaches_engine() {
        let h = connected_harness().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::Signal {
                from_peer_id: PeerId::new("b"),
                data: json!({"kind": "offer", "sdp": "X"}),
            }))
            .unwrap();
        settle().await;

        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::Signal {
            peer_id: PeerId::new("b"),
        }));
    }

    #[tokio::test]
    async fn engine_signal_is_relayed_to_server() {
        let h = connected_harness().await;
        h.peer_tx
            .send(PeerEvent::Signal {
                peer_id: PeerId::new("b"),
                data: json!({"kind": "answer", "sdp": "Y"}),
            })
            .unwrap();
        settle().await;

        let sent = h.signaling.sent.lock().unwrap();
        assert!(sent.iter().any(|m| matches!(
            m,
            ClientMessage::Signal { to_peer_id, .. } if to_peer_id.as_str() == "b"
        )));
    }

    #[tokio::test]
    async fn mute_emits_exactly_one_update() {
        let h = connected_harness().await;
        let mut events = h.session.subscribe();
        h.session.set_muted(true);

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::ParticipantUpdate(participants) => {
                assert!(participants[0].is_muted);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(h.audio.muted.load(Ordering::SeqCst));

        // Same value again: no further update.
        h.session.set_muted(true);
        settle().await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_time_out_after_ten_seconds() {
        let h = harness();
        let err = h.session.connect().await.unwrap_err();
        match err {
            SessionError::Signaling(e) => {
                assert_eq!(e.code, crate::domain::error::SignalingCode::Timeout);
                assert!(e.message.contains("login-ok"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_close_mid_call_is_fatal() {
        let h = connected_harness().await;
        let session = h.session.clone();
        let join = tokio::spawn(async move { session.join_room("ACD-EFG-234").await });
        settle().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::RoomJoined {
                room_key: RoomKey::parse("ACD-EFG-234").unwrap(),
                peers: vec![],
            }))
            .unwrap();
        join.await.unwrap().unwrap();

        let mut events = h.session.subscribe();
        h.transport_tx.send(TransportEvent::Closed).unwrap();

        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Error { fatal, error } => {
                assert!(fatal);
                assert_eq!(error.code(), "CONN_LOST");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::Ended));

        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::DestroyAll));
    }

    #[tokio::test]
    async fn speaking_flag_flips_on_rms_threshold() {
        let h = connected_harness().await;
        let mut events = h.session.subscribe();

        let loud: SampleBatch = Arc::new(vec![0.5; 960]);
        h.audio.samples_tx.send(loud.clone()).unwrap();

        // First loud batch flips the flag and emits an update.
        let mut saw_speaking = false;
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::ParticipantUpdate(participants) = event {
                saw_speaking = participants[0].is_speaking;
            }
        }
        assert!(saw_speaking);

        // A second loud batch emits only the samples event.
        h.audio.samples_tx.send(loud).unwrap();
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SessionEvent::AudioSamples(_)));

        // Silence flips it back.
        let quiet: SampleBatch = Arc::new(vec![0.0; 960]);
        h.audio.samples_tx.send(quiet).unwrap();
        let mut flipped_back = true;
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(1), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::ParticipantUpdate(participants) = event {
                flipped_back = !participants[0].is_speaking;
            }
        }
        assert!(flipped_back);
    }

    #[tokio::test]
    async fn leave_sends_leave_room_and_cleans_up() {
        let h = connected_harness().await;
        let session = h.session.clone();
        let join = tokio::spawn(async move { session.join_room("ACD-EFG-234").await });
        settle().await;
        h.transport_tx
            .send(TransportEvent::Message(ServerMessage::RoomJoined {
                room_key: RoomKey::parse("ACD-EFG-234").unwrap(),
                peers: vec![],
            }))
            .unwrap();
        join.await.unwrap().unwrap();

        h.session.leave().await;

        let sent = h.signaling.sent.lock().unwrap();
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::LeaveRoom)));
        drop(sent);
        let calls = h.engine.calls.lock().unwrap();
        assert!(calls.contains(&EngineCall::DestroyAll));
        drop(calls);
        assert!(h.session.participants().is_empty());
        assert!(h.session.current_room().is_none());
    }
}
