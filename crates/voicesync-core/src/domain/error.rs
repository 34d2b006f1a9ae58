//! Error taxonomy.
//!
//! Every error carries a stable machine-readable code plus a human message.
//! Codes are what observers and tests match on; messages are what users see.

use std::fmt;

use thiserror::Error;

macro_rules! error_codes {
    ($name:ident { $($variant:ident => $code:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $code),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

error_codes!(SignalingCode {
    ConnectFailed => "CONNECT_FAILED",
    WsError => "WS_ERROR",
    ConnLost => "CONN_LOST",
    Timeout => "TIMEOUT",
    RequestFailed => "REQUEST_FAILED",
});

error_codes!(RoomCode {
    RoomNotFound => "ROOM_NOT_FOUND",
    AlreadyInRoom => "ALREADY_IN_ROOM",
    RoomError => "ROOM_ERROR",
});

error_codes!(AudioCode {
    MicOpenFailed => "MIC_OPEN_FAILED",
    MicStreamError => "MIC_STREAM_ERROR",
    AudioError => "AUDIO_ERROR",
});

error_codes!(PeerCode {
    WebrtcError => "WEBRTC_ERROR",
    PeerError => "PEER_ERROR",
});

/// Signaling transport and request/response failures.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct SignalingError {
    pub code: SignalingCode,
    pub message: String,
}

impl SignalingError {
    pub fn connect_failed(message: impl Into<String>) -> Self {
        Self { code: SignalingCode::ConnectFailed, message: message.into() }
    }

    pub fn ws_error(message: impl Into<String>) -> Self {
        Self { code: SignalingCode::WsError, message: message.into() }
    }

    pub fn conn_lost() -> Self {
        Self {
            code: SignalingCode::ConnLost,
            message: "connection to signaling server lost".into(),
        }
    }

    /// Request/response expiry; names the reply that never arrived.
    pub fn timeout(awaited: &str) -> Self {
        Self {
            code: SignalingCode::Timeout,
            message: format!("timed out waiting for {awaited}"),
        }
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self { code: SignalingCode::RequestFailed, message: message.into() }
    }
}

/// Room membership failures.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RoomError {
    pub code: RoomCode,
    pub message: String,
}

impl RoomError {
    pub fn not_found(key: impl fmt::Display) -> Self {
        Self {
            code: RoomCode::RoomNotFound,
            message: format!("room {key} not found"),
        }
    }

    pub fn already_in_room() -> Self {
        Self {
            code: RoomCode::AlreadyInRoom,
            message: "already in a room".into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self { code: RoomCode::RoomError, message: message.into() }
    }
}

/// Microphone and playback failures.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct AudioError {
    pub code: AudioCode,
    pub message: String,
}

impl AudioError {
    pub fn mic_open_failed(message: impl Into<String>) -> Self {
        Self { code: AudioCode::MicOpenFailed, message: message.into() }
    }

    pub fn mic_stream_error(message: impl Into<String>) -> Self {
        Self { code: AudioCode::MicStreamError, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self { code: AudioCode::AudioError, message: message.into() }
    }
}

/// Peer-connection engine failures.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct PeerError {
    pub code: PeerCode,
    pub message: String,
}

impl PeerError {
    pub fn webrtc(message: impl Into<String>) -> Self {
        Self { code: PeerCode::WebrtcError, message: message.into() }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self { code: PeerCode::PeerError, message: message.into() }
    }
}

/// Anything a [`Session`](crate::application::session::Session) method can
/// fail with.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl SessionError {
    /// Stable code string, whichever kind this is.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Signaling(e) => e.code.as_str(),
            Self::Room(e) => e.code.as_str(),
            Self::Audio(e) => e.code.as_str(),
            Self::Peer(e) => e.code.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(SignalingCode::ConnLost.as_str(), "CONN_LOST");
        assert_eq!(RoomCode::RoomNotFound.as_str(), "ROOM_NOT_FOUND");
        assert_eq!(AudioCode::MicOpenFailed.as_str(), "MIC_OPEN_FAILED");
        assert_eq!(PeerCode::WebrtcError.as_str(), "WEBRTC_ERROR");
    }

    #[test]
    fn timeout_names_the_awaited_reply() {
        let err = SignalingError::timeout("room-created");
        assert!(err.message.contains("room-created"));
        assert_eq!(err.code, SignalingCode::Timeout);
    }
}
