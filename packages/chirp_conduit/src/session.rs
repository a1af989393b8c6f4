//! Session identity for connected endpoints.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque per-connection token.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Source of session tokens.
///
/// Tokens carry no cryptographic strength and no uniqueness guarantee; the
/// pool re-rolls when a token collides with a live endpoint.
pub trait SessionIdGenerator: Send + Sync {
    fn generate(&self) -> SessionId;
}

/// Number of random bits per token (fits the 13 hex digits of a double's mantissa).
const TOKEN_BITS: u32 = 52;

/// Default generator: a random 52-bit value rendered as lowercase hex.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSessionIds;

impl SessionIdGenerator for RandomSessionIds {
    fn generate(&self) -> SessionId {
        let value: u64 = rand::rng().random::<u64>() >> (64 - TOKEN_BITS);
        SessionId(format!("{:x}", value))
    }
}

/// Deterministic generator yielding `{prefix}1`, `{prefix}2`, ...
///
/// Handy for tests and for reproducing traces.
#[derive(Debug)]
pub struct SequentialSessionIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialSessionIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl SessionIdGenerator for SequentialSessionIds {
    fn generate(&self) -> SessionId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        SessionId(format!("{}{}", self.prefix, n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_ids_are_lowercase_hex() {
        let ids = RandomSessionIds;
        for _ in 0..100 {
            let sid = ids.generate();
            assert!(!sid.as_str().is_empty());
            assert!(sid.as_str().len() <= 13);
            assert!(
                sid.as_str()
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            );
        }
    }

    #[test]
    fn random_ids_rarely_repeat() {
        let ids = RandomSessionIds;
        let seen: HashSet<SessionId> = (0..1000).map(|_| ids.generate()).collect();
        // Collisions are allowed in principle, just very unlikely at this size
        assert!(seen.len() > 990);
    }

    #[test]
    fn sequential_ids_count_up() {
        let ids = SequentialSessionIds::new("x");
        assert_eq!(ids.generate().as_str(), "x1");
        assert_eq!(ids.generate().as_str(), "x2");
        assert_eq!(ids.generate().as_str(), "x3");
    }

    #[test]
    fn session_id_serializes_as_plain_string() {
        let sid = SessionId::from("abc123");
        assert_eq!(serde_json::to_string(&sid).unwrap(), "\"abc123\"");
        assert_eq!(sid.to_string(), "abc123");
    }
}
