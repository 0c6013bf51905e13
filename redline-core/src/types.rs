//! Shared identifier types for the synchronization layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum accepted length for a session identifier.
const MAX_SESSION_ID_LEN: usize = 128;

/// Validated session identifier.
///
/// Session ids are opaque strings supplied by callers (or generated on their
/// behalf) that key every per-session structure in the system: the event log,
/// the connection registry, and the gap tracker. Validation happens once at
/// the API boundary so interior code can treat the id as well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validates and wraps a raw session identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError`] when the id is empty, longer than 128
    /// characters, or contains characters outside `[A-Za-z0-9._:-]`.
    pub fn new(raw: impl Into<String>) -> Result<Self, SessionIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SessionIdError::Empty);
        }
        if raw.len() > MAX_SESSION_ID_LEN {
            return Err(SessionIdError::TooLong { length: raw.len() });
        }
        if let Some(ch) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
        {
            return Err(SessionIdError::InvalidCharacter { character: ch });
        }
        Ok(Self(raw))
    }

    /// Generates a fresh random session identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for SessionId {
    type Error = SessionIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors produced while validating a session identifier.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionIdError {
    /// Identifier was empty.
    #[error("session id must not be empty")]
    Empty,

    /// Identifier exceeded the maximum length.
    #[error("session id is {length} characters; maximum is {MAX_SESSION_ID_LEN}")]
    TooLong {
        /// Observed length of the rejected id.
        length: usize,
    },

    /// Identifier contained a character outside the accepted set.
    #[error("session id contains invalid character '{character}'")]
    InvalidCharacter {
        /// First offending character.
        character: char,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        assert!(SessionId::new("review-42").is_ok());
        assert!(SessionId::new("a.b:c_d").is_ok());
        assert!(SessionId::new(uuid::Uuid::new_v4().to_string()).is_ok());
    }

    #[test]
    fn rejects_empty_id() {
        assert_eq!(SessionId::new(""), Err(SessionIdError::Empty));
    }

    #[test]
    fn rejects_overlong_id() {
        let raw = "x".repeat(MAX_SESSION_ID_LEN + 1);
        assert!(matches!(
            SessionId::new(raw),
            Err(SessionIdError::TooLong { length }) if length == MAX_SESSION_ID_LEN + 1
        ));
    }

    #[test]
    fn rejects_invalid_characters() {
        assert_eq!(
            SessionId::new("review/42"),
            Err(SessionIdError::InvalidCharacter { character: '/' })
        );
        assert_eq!(
            SessionId::new("review 42"),
            Err(SessionIdError::InvalidCharacter { character: ' ' })
        );
    }

    #[test]
    fn generated_ids_are_valid_and_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::new(a.as_str()).is_ok());
    }
}
