//! Identity types for PARLEY entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::ValidationError;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Row id assigned by the relational store for profiles and personas.
pub type ProfileId = i64;

/// Row id assigned by the relational store for personas.
pub type PersonaId = i64;

/// Row id assigned by the relational store for persisted messages.
pub type MessageRowId = i64;

// ============================================================================
// SESSION ID
// ============================================================================

/// Length of the random hex suffix in a session id.
const SESSION_SUFFIX_LEN: usize = 8;

/// Prefix every session id carries on the wire.
const SESSION_PREFIX: &str = "sess_";

/// Session identifier of the form `sess_{owner}_{8 lower-hex chars}`.
///
/// The owner token is embedded so that routers can recover the owning
/// account from the id alone. The random suffix is always the final
/// `_`-separated component; the owner is everything between the prefix
/// and the last underscore, so owners containing underscores survive a
/// round-trip.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh session id for `owner`.
    ///
    /// The suffix is the first eight hex characters of a random UUID,
    /// matching the wire format `sess_{owner}_{8 lower-hex}`.
    pub fn generate(owner: &str) -> Result<Self, ValidationError> {
        if owner.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "owner".to_string(),
            });
        }
        let suffix = &Uuid::new_v4().simple().to_string()[..SESSION_SUFFIX_LEN];
        Ok(Self(format!("{}{}_{}", SESSION_PREFIX, owner, suffix)))
    }

    /// Parse and validate a wire-form session id.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let rest = raw.strip_prefix(SESSION_PREFIX).ok_or_else(|| {
            ValidationError::InvalidValue {
                field: "session_id".to_string(),
                reason: format!("missing '{}' prefix", SESSION_PREFIX),
            }
        })?;

        let (owner, suffix) =
            rest.rsplit_once('_')
                .ok_or_else(|| ValidationError::InvalidValue {
                    field: "session_id".to_string(),
                    reason: "missing random suffix".to_string(),
                })?;

        if owner.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "session_id".to_string(),
                reason: "empty owner token".to_string(),
            });
        }

        if suffix.len() != SESSION_SUFFIX_LEN
            || !suffix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(ValidationError::InvalidValue {
                field: "session_id".to_string(),
                reason: format!("suffix must be {} lower-hex chars", SESSION_SUFFIX_LEN),
            });
        }

        Ok(Self(raw.to_string()))
    }

    /// The owner token embedded in this id.
    pub fn owner(&self) -> &str {
        let rest = &self.0[SESSION_PREFIX.len()..];
        // Parse guarantees a suffix separator exists.
        rest.rsplit_once('_').map(|(owner, _)| owner).unwrap_or(rest)
    }

    /// The full wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

/// Compute the stable id of a knowledge chunk.
///
/// Sixteen hex chars of `sha256(collection:source:content)` — enough to
/// dedupe within a collection while keeping vector-store point ids short.
pub fn chunk_id(collection: &str, source: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update(b":");
    hasher.update(source.as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_round_trip() {
        let id = SessionId::generate("alice").unwrap();
        let parsed = SessionId::parse(id.as_str()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.owner(), "alice");
    }

    #[test]
    fn test_session_id_owner_with_underscore() {
        let id = SessionId::parse("sess_team_alpha_0123abcd").unwrap();
        assert_eq!(id.owner(), "team_alpha");
    }

    #[test]
    fn test_session_id_rejects_bad_prefix() {
        assert!(SessionId::parse("session_alice_0123abcd").is_err());
    }

    #[test]
    fn test_session_id_rejects_bad_suffix() {
        assert!(SessionId::parse("sess_alice_0123ABCD").is_err());
        assert!(SessionId::parse("sess_alice_0123abc").is_err());
        assert!(SessionId::parse("sess_alice_0123abcde").is_err());
        assert!(SessionId::parse("sess_alice").is_err());
    }

    #[test]
    fn test_session_id_rejects_empty_owner() {
        assert!(SessionId::parse("sess__0123abcd").is_err());
        assert!(SessionId::generate("").is_err());
    }

    #[test]
    fn test_session_id_serde() {
        let id = SessionId::generate("bob").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.starts_with("\"sess_bob_"));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_chunk_id_is_stable() {
        let a = chunk_id("alice_persona_1_rag", "background", "hello");
        let b = chunk_id("alice_persona_1_rag", "background", "hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = chunk_id("alice_persona_1_rag", "background", "other");
        assert_ne!(a, c);
    }

    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// For every generated session id, the embedded owner equals
            /// the owner it was minted for.
            #[test]
            fn prop_owner_survives_round_trip(owner in "[a-z][a-z0-9_]{0,30}") {
                let id = SessionId::generate(&owner).unwrap();
                let parsed = SessionId::parse(id.as_str()).unwrap();
                prop_assert_eq!(parsed.owner(), owner.as_str());
            }
        }
    }
}
