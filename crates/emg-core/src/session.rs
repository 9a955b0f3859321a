//! Session identity, lifecycle state and metadata

use crate::error::{EmgError, EmgResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Timestamp-derived session identifier.
///
/// Format: `YYYYMMDD_HHMMSS_ffffff_xxxx` (UTC, microseconds, 4 random hex
/// digits). Lexicographic order matches creation order down to the
/// microsecond; the suffix separates ids minted within the same microsecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh id for the current instant
    pub fn mint() -> Self {
        Self::mint_at(Utc::now())
    }

    /// Mint an id for a given instant
    pub fn mint_at(at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        SessionId(format!("{}_{}", at.format("%Y%m%d_%H%M%S_%6f"), &suffix[..4]))
    }

    /// Validate an id received from a client.
    ///
    /// Ids double as file names, so only ASCII alphanumerics, `_` and `-`
    /// are accepted.
    pub fn parse(raw: &str) -> EmgResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if valid {
            Ok(SessionId(raw.to_string()))
        } else {
            Err(EmgError::InvalidSessionId {
                session_id: raw.to_string(),
            })
        }
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

impl TryFrom<String> for SessionId {
    type Error = EmgError;

    fn try_from(value: String) -> EmgResult<Self> {
        SessionId::parse(&value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Lifecycle of one streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Connection accepted, id minted, buffer created
    Open,
    /// Cadence loop active
    Streaming,
    /// Connection ended without a disposition; still pending
    Abandoned,
    /// Flushed to the store and removed from memory
    Saved,
    /// Removed from memory without writing anything
    Discarded,
}

impl SessionState {
    /// Saved and discarded sessions never come back
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Saved | SessionState::Discarded)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Open => "open",
            SessionState::Streaming => "streaming",
            SessionState::Abandoned => "abandoned",
            SessionState::Saved => "saved",
            SessionState::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Free-form label and notes attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub notes: String,
}

impl SessionMetadata {
    pub fn new(label: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            notes: notes.into(),
        }
    }
}

/// Entry returned when listing saved sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub label: String,
    pub notes: String,
}
