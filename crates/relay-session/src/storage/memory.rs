//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use relay_core::{ConversationKey, SessionRecord, SessionStorage, StorageError};

/// In-memory storage implementation.
///
/// Useful for tests and deployments that accept losing sessions on restart.
pub struct MemoryStorage {
    ttl: Duration,
    sessions: RwLock<HashMap<ConversationKey, SessionRecord>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(relay_core::config::DEFAULT_SESSION_TTL)
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn save(&self, key: &ConversationKey, record: SessionRecord) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), record);
    }

    fn get(&self, key: &ConversationKey) -> Option<SessionRecord> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn delete(&self, key: &ConversationKey) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    async fn load_all_persisted(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, record| !record.is_expired(self.ttl));
        before - sessions.len()
    }
}
