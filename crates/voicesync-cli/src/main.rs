//! Terminal client binary.
//!
//! `voicesync start` creates a room and prints its key; `voicesync join
//! <key>` joins one. Either way the process stays in the call, printing
//! participant changes, until Ctrl-C or the call ends.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use voicesync_core::adapters::audio::CpalAudioAdapter;
use voicesync_core::adapters::peer::WebRtcPeerEngine;
use voicesync_core::adapters::ws::{TransportConfig, WsSignalingTransport};
use voicesync_core::{Participant, Session, SessionConfig, SessionEvent};

const DEFAULT_SERVER: &str = "ws://127.0.0.1:3000/ws";

#[derive(Parser)]
#[command(name = "voicesync", about = "Terminal peer-to-peer voice chat")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a room and print its key.
    Start {
        /// Signaling server URL (defaults to $VOICESYNC_SERVER).
        #[arg(short = 's', long)]
        server: Option<String>,
        /// Display name.
        #[arg(short = 'u', long)]
        username: Option<String>,
    },
    /// Join an existing room by key.
    Join {
        /// The room key, e.g. XQK-7M2-TNC.
        room_key: String,
        /// Signaling server URL (defaults to $VOICESYNC_SERVER).
        #[arg(short = 's', long)]
        server: Option<String>,
        /// Display name.
        #[arg(short = 'u', long)]
        username: Option<String>,
    },
}

fn server_url(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("VOICESYNC_SERVER").ok())
        .unwrap_or_else(|| DEFAULT_SERVER.to_owned())
}

fn display_name(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "guest".to_owned())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match Args::parse().command {
        Command::Start { server, username } => {
            run_call(server_url(server), display_name(username), None).await
        }
        Command::Join {
            room_key,
            server,
            username,
        } => {
            run_call(
                server_url(server),
                display_name(username),
                Some(room_key),
            )
            .await
        }
    }
}

async fn run_call(url: String, username: String, join_key: Option<String>) -> anyhow::Result<()> {
    let (transport, transport_rx) = WsSignalingTransport::new(url, TransportConfig::default());
    let (engine, engine_rx) =
        WebRtcPeerEngine::new().context("failed to initialize the peer engine")?;
    let audio = CpalAudioAdapter::new();

    let session = Session::spawn(
        transport,
        transport_rx,
        engine,
        engine_rx,
        audio,
        username,
        SessionConfig::default(),
    );

    session
        .connect()
        .await
        .context("could not reach the signaling server")?;

    match join_key {
        None => {
            let key = session.create_room().await.context("create-room failed")?;
            println!("Room created. Share this key: {key}");
        }
        Some(key) => {
            let key = session.join_room(&key).await.context("join-room failed")?;
            println!("Joined room {key}");
        }
    }
    println!("In call. Press Ctrl-C to leave.");

    let mut events = session.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving...");
                session.leave().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::ParticipantUpdate(participants)) => {
                    print_roster(&participants);
                }
                Ok(SessionEvent::Invite { from_username, room_key }) => {
                    println!("{from_username} invited you to room {room_key} (run `voicesync join {room_key}`)");
                }
                Ok(SessionEvent::InviteSent { to_username }) => {
                    println!("Invite sent to {to_username}");
                }
                Ok(SessionEvent::InviteDeclined { username }) => {
                    println!("{username} declined the invite");
                }
                Ok(SessionEvent::Ended) => {
                    println!("Call ended.");
                    return Ok(());
                }
                Ok(SessionEvent::Error { fatal, error }) => {
                    if fatal {
                        session.leave().await;
                        anyhow::bail!("call failed: {error}");
                    }
                    warn!(%error, "non-fatal session error");
                }
                // Waveform rendering lives in the (out of tree) TUI.
                Ok(SessionEvent::AudioSamples(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

fn print_roster(participants: &[Participant]) {
    let roster: Vec<String> = participants
        .iter()
        .map(|p| {
            let mut label = p.display_name.clone();
            if p.is_self {
                label.push_str(" (you)");
            }
            if p.is_muted {
                label.push_str(" [muted]");
            }
            if p.is_speaking {
                label.push_str(" *");
            }
            label
        })
        .collect();
    println!("Participants: {}", roster.join(", "));
}
