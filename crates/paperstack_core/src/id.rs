//! Sync identifier.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable, globally-unique identifier joining a local document to its
/// remote counterpart.
///
/// Sync identifiers are canonical lower-case hyphenated UUIDv4 tokens:
/// - Immutable once assigned
/// - Unique across the local store for the lifetime of the installation
/// - Never reused
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SyncId(String);

impl SyncId {
    /// Generates a new random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    /// Parses a token already in canonical form.
    ///
    /// Accepts only the 36-character lower-case hyphenated hexadecimal
    /// form with the version-4 and RFC 4122 variant nibbles. Fails with
    /// [`CoreError::InvalidIdentifier`] otherwise.
    pub fn parse(token: &str) -> CoreResult<Self> {
        if Self::is_valid(token) {
            Ok(Self(token.to_owned()))
        } else {
            Err(CoreError::invalid_identifier(token))
        }
    }

    /// Lower-cases a token and re-validates it.
    pub fn normalize(token: &str) -> CoreResult<Self> {
        Self::parse(&token.to_ascii_lowercase())
    }

    /// Returns true if the token is in canonical form.
    #[must_use]
    pub fn is_valid(token: &str) -> bool {
        let bytes = token.as_bytes();
        if bytes.len() != 36 {
            return false;
        }
        for (i, &c) in bytes.iter().enumerate() {
            match i {
                8 | 13 | 18 | 23 => {
                    if c != b'-' {
                        return false;
                    }
                }
                _ => {
                    if !c.is_ascii_hexdigit() || c.is_ascii_uppercase() {
                        return false;
                    }
                }
            }
        }
        // Version nibble must be 4, variant nibble must be RFC 4122.
        bytes[14] == b'4' && matches!(bytes[19], b'8' | b'9' | b'a' | b'b')
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncId({})", self.0)
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SyncId {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SyncId {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<SyncId> for String {
    fn from(id: SyncId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generate_is_unique_and_valid() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = SyncId::generate();
            assert!(SyncId::is_valid(id.as_str()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn parse_accepts_canonical_form() {
        let id = SyncId::parse("6ba7b811-9dad-41d1-80b4-00c04fd430c8").unwrap();
        assert_eq!(id.as_str(), "6ba7b811-9dad-41d1-80b4-00c04fd430c8");
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        // Too short / too long
        assert!(SyncId::parse("abc").is_err());
        assert!(SyncId::parse("6ba7b811-9dad-41d1-80b4-00c04fd430c8ff").is_err());
        // Missing hyphen
        assert!(SyncId::parse("6ba7b8119dad-41d1-80b4-00c04fd430c88").is_err());
        // Non-hex character
        assert!(SyncId::parse("6ba7b811-9dad-41d1-80b4-00c04fd430cg").is_err());
        // Braced and simple forms are not canonical
        assert!(SyncId::parse("{6ba7b811-9dad-41d1-80b4-00c04fd430c8}").is_err());
        assert!(SyncId::parse("6ba7b8119dad41d180b400c04fd430c8").is_err());
    }

    #[test]
    fn parse_rejects_wrong_version_or_variant() {
        // Version 1 instead of 4
        assert!(SyncId::parse("6ba7b811-9dad-11d1-80b4-00c04fd430c8").is_err());
        // Variant nibble outside 8..b
        assert!(SyncId::parse("6ba7b811-9dad-41d1-c0b4-00c04fd430c8").is_err());
    }

    #[test]
    fn parse_rejects_uppercase() {
        assert!(SyncId::parse("6BA7B811-9DAD-41D1-80B4-00C04FD430C8").is_err());
    }

    #[test]
    fn normalize_lowercases() {
        let id = SyncId::normalize("6BA7B811-9DAD-41D1-80B4-00C04FD430C8").unwrap();
        assert_eq!(id.as_str(), "6ba7b811-9dad-41d1-80b4-00c04fd430c8");
    }

    #[test]
    fn normalize_still_rejects_invalid() {
        assert!(SyncId::normalize("not-an-identifier").is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let id = SyncId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: SyncId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn serde_rejects_invalid_token() {
        let result: Result<SyncId, _> = serde_json::from_str("\"nope\"");
        assert!(result.is_err());
    }
}
