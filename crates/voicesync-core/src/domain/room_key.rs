//! Room key generation and validation.
//!
//! Keys look like `XQK-7M2-TNC`: three 3-character segments over a reduced
//! alphanumeric alphabet that drops the easily confused symbols
//! `0 1 5 8 O I L S B`. The key space is 27^9, large enough that fresh keys
//! are drawn without a collision check.

use std::fmt;

use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// The 27 symbols a room key may contain.
pub const ALPHABET: &[u8] = b"ACDEFGHJKMNPQRTUVWXYZ234679";

const SEGMENT_LEN: usize = 3;
const SEGMENTS: usize = 3;

/// A validated room key in canonical (upper-case) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomKey(String);

impl RoomKey {
    /// Draw a fresh key from the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut out = String::with_capacity(SEGMENTS * SEGMENT_LEN + SEGMENTS - 1);
        for segment in 0..SEGMENTS {
            if segment > 0 {
                out.push('-');
            }
            for _ in 0..SEGMENT_LEN {
                let idx = OsRng.gen_range(0..ALPHABET.len());
                out.push(ALPHABET[idx] as char);
            }
        }
        Self(out)
    }

    /// Parse user input: trims, upper-cases, and checks the shape.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized = normalize(input);
        is_valid(&normalized).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim surrounding whitespace and upper-case.
pub fn normalize(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

/// Case-insensitive shape check: `XXX-XXX-XXX` over [`ALPHABET`].
///
/// Tolerates surrounding whitespace, so validity is unchanged by
/// [`normalize`].
pub fn is_valid(input: &str) -> bool {
    let segments: Vec<&str> = input.trim().split('-').collect();
    segments.len() == SEGMENTS
        && segments.iter().all(|s| {
            s.len() == SEGMENT_LEN
                && s.bytes()
                    .all(|b| ALPHABET.contains(&b.to_ascii_uppercase()))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const EXCLUDED: &[u8] = b"0158OILSB";

    #[test]
    fn generated_keys_match_format() {
        for _ in 0..1000 {
            let key = RoomKey::generate();
            assert!(is_valid(key.as_str()), "bad key: {key}");
            assert!(
                !key.as_str()
                    .bytes()
                    .any(|b| EXCLUDED.contains(&b)),
                "excluded symbol in {key}"
            );
        }
    }

    #[test]
    fn generated_keys_are_distinct() {
        let keys: HashSet<String> = (0..1000)
            .map(|_| RoomKey::generate().as_str().to_owned())
            .collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn validator_accepts_canonical_and_lowercase() {
        assert!(is_valid("ACD-EFG-234"));
        assert!(is_valid("acd-efg-234"));
    }

    #[test]
    fn validator_rejects_malformed() {
        assert!(!is_valid(""));
        assert!(!is_valid("ACD-EFG"));
        assert!(!is_valid("ACDE-FG-234"));
        assert!(!is_valid("AC1-EFG-234")); // 1 is excluded
        assert!(!is_valid("ACD_EFG_234"));
        assert!(!is_valid("ACD-EFG-23"));
    }

    #[test]
    fn validation_is_stable_under_normalization() {
        for raw in ["  acd-efg-234 ", "ACD-EFG-234", "zzz-zzz-zzz", "junk", "", " - - "] {
            assert_eq!(is_valid(&normalize(raw)), is_valid(raw));
        }
    }

    #[test]
    fn parse_normalizes() {
        let key = RoomKey::parse(" acd-efg-234\n").unwrap();
        assert_eq!(key.as_str(), "ACD-EFG-234");
        assert!(RoomKey::parse("not a key").is_none());
    }
}
