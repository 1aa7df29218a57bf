//! Session records and the storage trait.

use std::{fmt, path::PathBuf, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ConversationContext, ConversationKey,
    time::{age_millis, duration_millis},
};

/// Agent backend that issued a session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProvider {
    /// Claude Code.
    Claude,
    /// OpenAI Codex.
    Codex,
}

impl AgentProvider {
    /// Wire name of the provider.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
        }
    }

    /// Parse a provider name, case-insensitively.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            _ => None,
        }
    }
}

impl fmt::Display for AgentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted continuation state for one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Resume handle issued by the agent runtime.
    pub session_id: String,
    /// Context of the turn that created or last updated the session.
    pub context: ConversationContext,
    /// Creation timestamp (Unix epoch milliseconds). Not refreshed on resume.
    pub created_at: i64,
    /// Backend that issued `session_id`.
    pub provider: AgentProvider,
}

impl SessionRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(
        session_id: impl Into<String>,
        context: ConversationContext,
        provider: AgentProvider,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            context,
            created_at: crate::time::unix_millis(),
            provider,
        }
    }

    /// Whether the record is older than `ttl`.
    #[must_use]
    pub fn is_expired(&self, ttl: Duration) -> bool {
        age_millis(self.created_at) > duration_millis(ttl)
    }
}

/// Storage error.
///
/// Only raised where the caller cannot proceed; write failures are
/// absorbed by the backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Trait for session storage backends.
///
/// `get` is served from memory. `save` and `delete` never fail from the
/// caller's point of view: the in-memory value stays authoritative even
/// when persistence does not succeed.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Maximum age of a record.
    fn ttl(&self) -> Duration;

    /// Insert or replace the record for `key`.
    async fn save(&self, key: &ConversationKey, record: SessionRecord);

    /// Look up the record for `key`.
    fn get(&self, key: &ConversationKey) -> Option<SessionRecord>;

    /// Remove the record for `key`. Removing a missing key is a no-op.
    async fn delete(&self, key: &ConversationKey);

    /// Load every persisted, unexpired record into memory.
    ///
    /// Returns the number of records loaded.
    async fn load_all_persisted(&self) -> Result<usize, StorageError>;

    /// Drop every record older than the TTL. Returns how many were removed.
    async fn cleanup_expired(&self) -> usize;
}
