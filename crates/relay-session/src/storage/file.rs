//! File-backed session storage.
//!
//! One JSON file per conversation, named after an escaped form of the
//! conversation key (keys contain `/` and `#`). Writes go to a temporary
//! sibling that is renamed over the destination, so readers never observe a
//! partially written file. Writes to one key are serialized by the store
//! itself, so memory and disk agree after every save whatever the callers do.

use std::{
    collections::HashMap,
    fmt::Write as _,
    io,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock, RwLockWriteGuard},
    time::Duration,
};

use async_trait::async_trait;
use relay_core::{ConversationKey, SessionRecord, SessionStorage, StorageError};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

use crate::lock::KeyedLock;

const FILE_SUFFIX: &str = ".json";
const TEMP_SUFFIX: &str = ".tmp";

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

/// Encoded file stem for a key.
///
/// Lowercase ASCII letters, digits, `-` and `_` are kept and every other byte
/// becomes `%XX`, so two keys never map to names that differ only in letter
/// case. Never contains `.`, `/` or `#`.
#[must_use]
pub fn file_stem(key: &ConversationKey) -> String {
    let raw = key.as_str();
    let mut stem = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_' {
            stem.push(char::from(byte));
        } else {
            let _ = write!(stem, "%{byte:02X}");
        }
    }
    stem
}

/// File name holding the record for `key`.
#[must_use]
pub fn file_name(key: &ConversationKey) -> String {
    format!("{}{FILE_SUFFIX}", file_stem(key))
}

/// Recover the key from a session file name.
#[must_use]
pub fn decode_file_name(name: &str) -> Option<ConversationKey> {
    let stem = name.strip_suffix(FILE_SUFFIX)?;
    let mut bytes = Vec::with_capacity(stem.len());
    let mut rest = stem.as_bytes();
    while let Some((&byte, tail)) = rest.split_first() {
        if byte == b'%' {
            let hex = std::str::from_utf8(tail.get(..2)?).ok()?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            rest = tail.get(2..)?;
        } else {
            bytes.push(byte);
            rest = tail;
        }
    }

    let key = ConversationKey::parse(std::str::from_utf8(&bytes).ok()?)?;
    // Only the exact name this store writes maps back to the key.
    (file_stem(&key) == stem).then_some(key)
}

fn temp_prefix(stem: &str) -> String {
    format!(".{stem}.")
}

/// Write-through session cache backed by a directory of JSON files.
pub struct FileSessionStore {
    dir: PathBuf,
    ttl: Duration,
    sessions: RwLock<HashMap<ConversationKey, SessionRecord>>,
    writes: KeyedLock,
}

impl FileSessionStore {
    /// Open a store rooted at `dir`, creating it owner-only if absent.
    ///
    /// Persisted records are not read until [`SessionStorage::load_all_persisted`].
    ///
    /// # Errors
    /// Returns error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, StorageError> {
        let dir = dir.into();
        create_private_dir(&dir)
            .await
            .map_err(|source| StorageError::Io {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            dir,
            ttl,
            sessions: RwLock::new(HashMap::new()),
            writes: KeyedLock::new(),
        })
    }

    /// Storage directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    #[must_use]
    pub fn path_for(&self, key: &ConversationKey) -> PathBuf {
        self.dir.join(file_name(key))
    }

    /// Number of records in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no records are in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions_mut(&self) -> RwLockWriteGuard<'_, HashMap<ConversationKey, SessionRecord>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self, key: &ConversationKey, record: &SessionRecord) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        let stem = file_stem(key);
        let dest = self.dir.join(format!("{stem}{FILE_SUFFIX}"));
        let temp = self.dir.join(format!(
            "{}{}{TEMP_SUFFIX}",
            temp_prefix(&stem),
            Uuid::new_v4().simple()
        ));

        if let Err(error) = write_private(&temp, &json).await {
            remove_quietly(&temp).await;
            return Err(error);
        }

        if let Err(rename_error) = fs::rename(&temp, &dest).await {
            // Not atomic: a reader may see a truncated file while this runs.
            tracing::debug!(%key, %rename_error, "rename failed, copying session file instead");
            if let Err(error) = copy_over(&temp, &dest).await {
                remove_quietly(&temp).await;
                return Err(error);
            }
        }

        self.remove_stale_temps(&stem).await;
        Ok(())
    }

    async fn remove_stale_temps(&self, stem: &str) {
        let prefix = temp_prefix(stem);
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX) {
                tracing::debug!(file = name, "removing stale session temp file");
                remove_quietly(&entry.path()).await;
            }
        }
    }

    async fn remove_file(&self, key: &ConversationKey) {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(%key, path = %path.display(), %error, "failed to remove session file");
            }
        }
    }
}

#[async_trait]
impl SessionStorage for FileSessionStore {
    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn save(&self, key: &ConversationKey, record: SessionRecord) {
        let _write = self.writes.acquire(key.as_str()).await;
        self.sessions_mut().insert(key.clone(), record.clone());

        if let Err(error) = self.persist(key, &record).await {
            tracing::warn!(%key, %error, "failed to persist session, keeping it in memory only");
        }
    }

    fn get(&self, key: &ConversationKey) -> Option<SessionRecord> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    async fn delete(&self, key: &ConversationKey) {
        let _write = self.writes.acquire(key.as_str()).await;
        self.sessions_mut().remove(key);
        self.remove_file(key).await;
    }

    async fn load_all_persisted(&self) -> Result<usize, StorageError> {
        let io_error = |source| StorageError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(io_error(error)),
        };

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) || !name.ends_with(FILE_SUFFIX) {
                continue;
            }

            let path = entry.path();
            let Some(key) = decode_file_name(name) else {
                tracing::warn!(path = %path.display(), "skipping session file with unrecognised name");
                continue;
            };

            let _write = self.writes.acquire(key.as_str()).await;
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    tracing::warn!(%key, %error, "failed to read session file");
                    continue;
                }
            };
            let record = match serde_json::from_slice::<SessionRecord>(&bytes) {
                Ok(record) => record,
                Err(error) => {
                    tracing::warn!(%key, %error, "removing corrupted session file");
                    remove_quietly(&path).await;
                    continue;
                }
            };
            if record.is_expired(self.ttl) {
                tracing::debug!(%key, "removing expired session file");
                remove_quietly(&path).await;
                continue;
            }

            self.sessions_mut().insert(key, record);
            loaded += 1;
        }

        tracing::info!(loaded, dir = %self.dir.display(), "loaded persisted sessions");
        Ok(loaded)
    }

    async fn cleanup_expired(&self) -> usize {
        let candidates: Vec<ConversationKey> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, record)| record.is_expired(self.ttl))
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in &candidates {
            let _write = self.writes.acquire(key.as_str()).await;
            // A save may have replaced the record since the scan.
            let still_expired = {
                let mut sessions = self.sessions_mut();
                let expired = sessions
                    .get(key)
                    .is_some_and(|record| record.is_expired(self.ttl));
                if expired {
                    sessions.remove(key);
                }
                expired
            };
            if still_expired {
                self.remove_file(key).await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(count = removed, "swept expired sessions");
        }
        removed
    }
}

async fn create_private_dir(dir: &Path) -> io::Result<()> {
    if fs::try_exists(dir).await? {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(DIR_MODE);
    builder.create(dir).await
}

async fn write_private(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(FILE_MODE);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;

    #[cfg(unix)]
    {
        // `mode` only applies when the file is created.
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE)).await?;
    }
    Ok(())
}

async fn copy_over(temp: &Path, dest: &Path) -> io::Result<()> {
    let bytes = fs::read(temp).await?;
    write_private(dest, &bytes).await?;
    fs::remove_file(temp).await
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = fs::remove_file(path).await {
        if error.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), %error, "failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relay_core::{AgentProvider, ConversationContext};
    use tempfile::TempDir;

    use super::*;

    fn key(n: u64) -> ConversationKey {
        ConversationKey::new("acme", "widgets", n)
    }

    fn record(session_id: &str, n: u64) -> SessionRecord {
        SessionRecord::new(
            session_id,
            ConversationContext::new("acme", "widgets", n),
            AgentProvider::Claude,
        )
    }

    fn aged(mut record: SessionRecord, by: Duration) -> SessionRecord {
        record.created_at -= i64::try_from(by.as_millis()).unwrap();
        record
    }

    async fn store(dir: &TempDir, ttl_ms: u64) -> FileSessionStore {
        FileSessionStore::open(dir.path().join("sessions"), Duration::from_millis(ttl_ms))
            .await
            .unwrap()
    }

    fn dir_names(store: &FileSessionStore) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_file_name_roundtrip_is_filesystem_safe() {
        let key = ConversationKey::new("some-org", "repo.name", 1234);
        let name = file_name(&key);
        assert!(name.ends_with(".json"));
        let stem = name.strip_suffix(".json").unwrap();
        assert!(!stem.contains(['/', '#', '.']));
        assert_eq!(decode_file_name(&name), Some(key));
        assert_eq!(decode_file_name("not a key!.json"), None);
        assert_eq!(decode_file_name("abc.txt"), None);
        assert_eq!(decode_file_name("acme%2.json"), None);
    }

    #[test]
    fn test_file_names_distinct_ignoring_case() {
        let upper = ConversationKey::new("Acme", "Widgets", 1);
        let lower = ConversationKey::new("acme", "widgets", 1);
        assert_ne!(
            file_name(&upper).to_lowercase(),
            file_name(&lower).to_lowercase()
        );
        assert_eq!(file_name(&lower), "acme%2Fwidgets%231.json");
        assert_eq!(decode_file_name(&file_name(&upper)), Some(upper));

        // Alternate spellings of the same key are not accepted.
        assert_eq!(decode_file_name("%61cme%2Fwidgets%231.json"), None);
        assert_eq!(decode_file_name("acme%2fwidgets%231.json"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_and_dir_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        store.save(&key(1), record("sess-1", 1)).await;

        let file_mode = std::fs::metadata(store.path_for(&key(1)))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(store.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_file_contents_match_memory() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        store.save(&key(1), record("sess-1", 1)).await;

        let on_disk: SessionRecord =
            serde_json::from_slice(&std::fs::read(store.path_for(&key(1))).unwrap()).unwrap();
        assert_eq!(Some(on_disk), store.get(&key(1)));
        assert_eq!(dir_names(&store), vec![file_name(&key(1))]);
    }

    #[tokio::test]
    async fn test_reload_within_ttl() {
        let tmp = TempDir::new().unwrap();
        store(&tmp, 10_000).await.save(&key(1), record("sess-1", 1)).await;

        let fresh = store(&tmp, 10_000).await;
        assert!(fresh.get(&key(1)).is_none());
        assert_eq!(fresh.load_all_persisted().await.unwrap(), 1);
        assert_eq!(fresh.get(&key(1)).unwrap().session_id, "sess-1");
    }

    #[tokio::test]
    async fn test_expired_session_removed_on_reload() {
        let tmp = TempDir::new().unwrap();
        let first = store(&tmp, 10_000).await;
        first
            .save(&key(1), aged(record("old", 1), Duration::from_secs(20)))
            .await;
        let path = first.path_for(&key(1));
        assert!(path.exists());

        let fresh = store(&tmp, 10_000).await;
        assert_eq!(fresh.load_all_persisted().await.unwrap(), 0);
        assert!(fresh.get(&key(1)).is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_entry_and_file() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        store.save(&key(1), record("live", 1)).await;
        store
            .save(&key(2), aged(record("old", 2), Duration::from_secs(11)))
            .await;

        assert_eq!(store.cleanup_expired().await, 1);
        assert!(store.get(&key(2)).is_none());
        assert!(!store.path_for(&key(2)).exists());
        assert!(store.get(&key(1)).is_some());
        assert!(store.path_for(&key(1)).exists());
        assert_eq!(store.cleanup_expired().await, 0);
    }

    #[tokio::test]
    async fn test_corrupted_file_deleted_on_load() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        let corrupted = store.path_for(&key(3));
        std::fs::write(&corrupted, b"{ not json").unwrap();
        store.save(&key(1), record("good", 1)).await;

        let fresh = FileSessionStore::open(store.dir(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(fresh.load_all_persisted().await.unwrap(), 1);
        assert!(!corrupted.exists());
        assert!(fresh.get(&key(3)).is_none());
        assert!(fresh.get(&key(1)).is_some());
    }

    #[tokio::test]
    async fn test_save_removes_stale_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        let stem = file_stem(&key(1));
        let stale = store.dir().join(format!(".{stem}.interrupted.tmp"));
        let unrelated = store.dir().join(format!(".{}.other.tmp", file_stem(&key(2))));
        std::fs::write(&stale, b"{\"partial\":").unwrap();
        std::fs::write(&unrelated, b"{}").unwrap();

        store.save(&key(1), record("sess-1", 1)).await;
        assert!(!stale.exists());
        assert!(unrelated.exists());
        assert!(store.path_for(&key(1)).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_fallback_replaces_dest_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("session.json");
        let temp = tmp.path().join(".session.pending.tmp");
        std::fs::write(&dest, b"{\"sessionId\":\"previous and longer\"}").unwrap();
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644)).unwrap();
        std::fs::write(&temp, b"{}").unwrap();

        copy_over(&temp, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "{}");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_load_skips_temp_files() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        let temp = store.dir().join(format!(".{}.pending.tmp", file_stem(&key(1))));
        std::fs::write(&temp, serde_json::to_vec(&record("sess-1", 1)).unwrap()).unwrap();

        assert_eq!(store.load_all_persisted().await.unwrap(), 0);
        assert!(store.get(&key(1)).is_none());
        assert!(temp.exists());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        store.save(&key(1), record("sess-1", 1)).await;

        store.delete(&key(1)).await;
        assert!(store.get(&key(1)).is_none());
        assert!(!store.path_for(&key(1)).exists());
        store.delete(&key(1)).await;
        store.delete(&key(9)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_last_write_wins() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        store.save(&key(1), record("first", 1)).await;
        store.save(&key(1), record("second", 1)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(dir_names(&store).len(), 1);
        let fresh = FileSessionStore::open(store.dir(), Duration::from_secs(10))
            .await
            .unwrap();
        fresh.load_all_persisted().await.unwrap();
        assert_eq!(fresh.get(&key(1)).unwrap().session_id, "second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_keep_disk_and_memory_in_step() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store(&tmp, 60_000).await);

        for round in 0..50 {
            let mut handles = Vec::new();
            for writer in 0..4 {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    let saved = record(&format!("sess-{round}-{writer}"), 1);
                    store.save(&key(1), saved).await;
                }));
            }
            for handle in handles {
                handle.await.unwrap();
            }

            let on_disk: SessionRecord =
                serde_json::from_slice(&std::fs::read(store.path_for(&key(1))).unwrap()).unwrap();
            assert_eq!(Some(on_disk), store.get(&key(1)), "round {round}");
        }
        assert_eq!(dir_names(&store), vec![file_name(&key(1))]);
        assert_eq!(store.writes.active_keys(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_save_and_delete_agree() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(store(&tmp, 60_000).await);

        for round in 0..50 {
            let saver = {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.save(&key(1), record(&format!("sess-{round}"), 1)).await;
                })
            };
            let deleter = {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.delete(&key(1)).await })
            };
            saver.await.unwrap();
            deleter.await.unwrap();

            assert_eq!(
                store.get(&key(1)).is_some(),
                store.path_for(&key(1)).exists(),
                "round {round}"
            );
        }
    }

    #[tokio::test]
    async fn test_persist_failure_keeps_memory_value() {
        let tmp = TempDir::new().unwrap();
        let store = store(&tmp, 10_000).await;
        std::fs::remove_dir_all(store.dir()).unwrap();

        store.save(&key(1), record("sess-1", 1)).await;
        assert_eq!(store.get(&key(1)).unwrap().session_id, "sess-1");
        assert_eq!(store.load_all_persisted().await.unwrap(), 0);
    }
}
