//! Conversation manager: per-conversation turns over a session store.

use std::{fmt, sync::Arc, time::Duration};

use relay_core::{AgentProvider, ConversationContext, ConversationKey, SessionRecord, SessionStorage};
use tokio::{task::JoinHandle, time::MissedTickBehavior};

use crate::lock::{KeyLease, KeyedLock};

/// Serializes agent turns per conversation and owns their session records.
///
/// Every read or write of a conversation's session should happen inside a
/// [`ConversationTurn`], which holds that conversation's key lock.
pub struct ConversationManager<S>
where
    S: SessionStorage,
{
    storage: Arc<S>,
    locks: KeyedLock,
}

impl<S> ConversationManager<S>
where
    S: SessionStorage + 'static,
{
    /// Create a manager with its own lock table.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self::with_locks(storage, KeyedLock::new())
    }

    /// Create a manager sharing an existing lock table.
    #[must_use]
    pub const fn with_locks(storage: Arc<S>, locks: KeyedLock) -> Self {
        Self { storage, locks }
    }

    /// Underlying storage.
    #[must_use]
    pub const fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Underlying lock table.
    #[must_use]
    pub const fn locks(&self) -> &KeyedLock {
        &self.locks
    }

    /// Wait for exclusive access to a conversation.
    pub async fn begin_turn(&self, key: ConversationKey) -> ConversationTurn<'_, S> {
        let lease = self.locks.acquire(key.as_str()).await;
        ConversationTurn {
            manager: self,
            key,
            lease,
        }
    }

    /// Forget the conversation's session.
    ///
    /// Does not wait for the conversation lock and does not interrupt a turn
    /// already in progress; that turn finishes on its own schedule.
    /// Returns whether a session existed.
    pub async fn stop(&self, key: &ConversationKey) -> bool {
        let existed = self.storage.get(key).is_some();
        self.storage.delete(key).await;
        tracing::info!(%key, existed, "conversation stopped");
        existed
    }

    /// Run [`SessionStorage::cleanup_expired`] every `interval`.
    ///
    /// The first sweep happens one interval after the call.
    pub fn spawn_cleanup_task(&self, interval: Duration) -> JoinHandle<()> {
        let storage = Arc::clone(&self.storage);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = storage.cleanup_expired().await;
                tracing::debug!(removed, "session cleanup tick");
            }
        })
    }
}

/// Exclusive access to one conversation's session.
///
/// The conversation lock is released by [`ConversationTurn::finish`] or on drop.
pub struct ConversationTurn<'a, S>
where
    S: SessionStorage,
{
    manager: &'a ConversationManager<S>,
    key: ConversationKey,
    lease: KeyLease,
}

impl<S> fmt::Debug for ConversationTurn<'_, S>
where
    S: SessionStorage,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationTurn")
            .field("key", &self.key)
            .field("held", &self.lease.is_held())
            .finish_non_exhaustive()
    }
}

impl<S> ConversationTurn<'_, S>
where
    S: SessionStorage + 'static,
{
    /// Conversation this turn belongs to.
    #[must_use]
    pub const fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// Current record without validation.
    #[must_use]
    pub fn session(&self) -> Option<SessionRecord> {
        self.manager.storage.get(&self.key)
    }

    /// Session that can be resumed with `provider`.
    ///
    /// A record issued by another provider, or older than the TTL, is
    /// deleted and `None` is returned.
    pub async fn resumable_session(&self, provider: AgentProvider) -> Option<SessionRecord> {
        let storage = &self.manager.storage;
        let record = storage.get(&self.key)?;

        if record.provider != provider {
            tracing::info!(
                key = %self.key,
                stored = %record.provider,
                requested = %provider,
                "discarding session from another provider"
            );
            storage.delete(&self.key).await;
            return None;
        }
        if record.is_expired(storage.ttl()) {
            tracing::info!(key = %self.key, "discarding expired session");
            storage.delete(&self.key).await;
            return None;
        }
        Some(record)
    }

    /// Store the session handle returned by the agent for this turn.
    ///
    /// Resuming the same session keeps its original creation time, so the
    /// TTL bounds the whole conversation rather than its idle time.
    pub async fn record_session(
        &self,
        session_id: impl Into<String>,
        context: ConversationContext,
        provider: AgentProvider,
    ) -> SessionRecord {
        let mut record = SessionRecord::new(session_id, context, provider);
        if let Some(existing) = self.manager.storage.get(&self.key) {
            if existing.session_id == record.session_id && existing.provider == provider {
                record.created_at = existing.created_at;
            }
        }
        self.manager.storage.save(&self.key, record.clone()).await;
        record
    }

    /// Delete the session while holding the lock.
    pub async fn clear(&self) {
        self.manager.storage.delete(&self.key).await;
    }

    /// Release the conversation lock.
    pub fn finish(mut self) {
        self.lease.release();
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;
    use crate::storage::MemoryStorage;

    fn manager(ttl: Duration) -> ConversationManager<MemoryStorage> {
        ConversationManager::new(Arc::new(MemoryStorage::new(ttl)))
    }

    fn key(n: u64) -> ConversationKey {
        ConversationKey::new("acme", "widgets", n)
    }

    fn context(n: u64) -> ConversationContext {
        ConversationContext::new("acme", "widgets", n)
    }

    #[tokio::test]
    async fn test_turns_serialize_per_conversation() {
        let manager = manager(Duration::from_secs(60));
        let turn = manager.begin_turn(key(1)).await;

        let mut same = task::spawn(manager.begin_turn(key(1)));
        let mut other = task::spawn(manager.begin_turn(key(2)));
        assert_pending!(same.poll());
        let other_turn = assert_ready!(other.poll());
        assert_eq!(other_turn.key(), &key(2));
        let rendered = format!("{other_turn:?}");
        assert!(rendered.contains("acme/widgets#2"), "{rendered}");
        assert!(rendered.contains("held: true"), "{rendered}");

        turn.finish();
        let same_turn = assert_ready!(same.poll());
        assert_eq!(same_turn.key(), &key(1));
    }

    #[tokio::test]
    async fn test_resume_same_session_keeps_creation_time() {
        let manager = manager(Duration::from_secs(60));
        let turn = manager.begin_turn(key(1)).await;

        let first = turn
            .record_session("sess-1", context(1), AgentProvider::Claude)
            .await;
        let mut stored = turn.session().unwrap();
        stored.created_at -= 5_000;
        manager.storage().save(&key(1), stored.clone()).await;

        let resumed = turn
            .record_session("sess-1", context(1).with_comment(7), AgentProvider::Claude)
            .await;
        assert_eq!(resumed.created_at, stored.created_at);
        assert_eq!(resumed.context.comment_id, Some(7));

        let replaced = turn
            .record_session("sess-2", context(1), AgentProvider::Claude)
            .await;
        assert!(replaced.created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_provider_mismatch_invalidates_session() {
        let manager = manager(Duration::from_secs(60));
        let turn = manager.begin_turn(key(1)).await;
        turn.record_session("sess-1", context(1), AgentProvider::Claude)
            .await;

        assert!(turn.resumable_session(AgentProvider::Claude).await.is_some());
        assert!(turn.resumable_session(AgentProvider::Codex).await.is_none());
        assert!(turn.session().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_not_resumable() {
        let manager = manager(Duration::from_secs(10));
        let mut record = SessionRecord::new("old", context(1), AgentProvider::Claude);
        record.created_at -= 11_000;
        manager.storage().save(&key(1), record).await;

        let turn = manager.begin_turn(key(1)).await;
        assert!(turn.resumable_session(AgentProvider::Claude).await.is_none());
        assert!(manager.storage().get(&key(1)).is_none());
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_running_turn() {
        let manager = manager(Duration::from_secs(60));
        let turn = manager.begin_turn(key(1)).await;
        turn.record_session("sess-1", context(1), AgentProvider::Claude)
            .await;

        // The turn still holds the lock; stop must complete regardless.
        let stopped = key(1);
        let mut stop = task::spawn(manager.stop(&stopped));
        assert!(assert_ready!(stop.poll()));
        assert!(turn.session().is_none());

        turn.clear().await;
        turn.finish();
        assert!(!manager.stop(&stopped).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_sweeps_on_interval() {
        let manager = manager(Duration::from_secs(10));
        let mut record = SessionRecord::new("old", context(1), AgentProvider::Claude);
        record.created_at -= 60_000;
        manager.storage().save(&key(1), record).await;
        manager
            .storage()
            .save(&key(2), SessionRecord::new("new", context(2), AgentProvider::Claude))
            .await;

        let handle = manager.spawn_cleanup_task(Duration::from_secs(1));
        tokio::task::yield_now().await;
        assert_eq!(manager.storage().len(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(manager.storage().get(&key(1)).is_none());
        assert!(manager.storage().get(&key(2)).is_some());
        handle.abort();
    }
}
