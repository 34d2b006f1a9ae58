//! Peer and participant identity types.
//!
//! Pure data, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum display-name length after trimming.
pub const MAX_USERNAME_LEN: usize = 32;

/// Opaque server-assigned connection identifier.
///
/// Unique for the server's lifetime; never reused while the connection is
/// open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim and truncate a raw display name to its canonical form.
///
/// Returns `None` when nothing is left after trimming.
pub fn clean_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut name = trimmed.to_owned();
    if name.len() > MAX_USERNAME_LEN {
        // Truncate on a char boundary so multi-byte names can't panic.
        let mut cut = MAX_USERNAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    Some(name)
}

/// One member of the current room, as seen by the client session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub peer_id: PeerId,
    pub display_name: String,
    pub is_speaking: bool,
    pub is_muted: bool,
    pub is_self: bool,
}

impl Participant {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>, is_self: bool) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            is_speaking: false,
            is_muted: false,
            is_self,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
