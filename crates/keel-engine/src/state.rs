//! State store implementations: in-memory and one JSON file per stack.

use async_trait::async_trait;
use keel_core::stack::{StackState, StateLock};
use keel_core::state::{StateLease, StateStore};
use keel_core::{Error, Result, RunId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn lock_conflict(lock: &StateLock) -> Error {
    Error::Conflict(format!(
        "stack '{}' is locked by {} (run {}, since {})",
        lock.stack, lock.holder, lock.run_id, lock.acquired_at
    ))
}

fn check_version(stack: &str, stored: u64, offered: u64) -> Result<()> {
    if stored != offered {
        return Err(Error::Conflict(format!(
            "stale state for stack '{stack}': stored version {stored}, saving from version {offered}"
        )));
    }
    Ok(())
}

fn next_version(state: &StackState) -> StackState {
    let mut saved = state.clone();
    saved.version = state.version + 1;
    saved.updated_at = chrono::Utc::now();
    saved
}

#[derive(Default)]
struct MemoryEntry {
    state: Option<StackState>,
    lock: Option<StateLock>,
}

/// Process-local state store, used by tests and previews.
#[derive(Default)]
pub struct MemoryStateStore {
    stacks: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn lock(&self, stack: &str, run_id: RunId, holder: &str) -> Result<StateLease> {
        let mut stacks = self.stacks.lock().await;
        let entry = stacks.entry(stack.to_string()).or_default();
        if let Some(lock) = &entry.lock {
            return Err(lock_conflict(lock));
        }
        let lease = StateLease::request(stack, run_id, holder);
        entry.lock = Some(lease.lock().clone());
        Ok(lease)
    }

    async fn unlock(&self, lease: StateLease) -> Result<()> {
        let mut stacks = self.stacks.lock().await;
        let entry = stacks.entry(lease.stack().to_string()).or_default();
        match &entry.lock {
            Some(lock) if lock.lock_id == lease.lock_id() => {
                entry.lock = None;
                Ok(())
            }
            _ => Err(Error::Conflict(format!(
                "lease on stack '{}' is no longer held",
                lease.stack()
            ))),
        }
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        let mut stacks = self.stacks.lock().await;
        Ok(stacks
            .get_mut(stack)
            .and_then(|entry| entry.lock.take())
            .is_some())
    }

    async fn current_lock(&self, stack: &str) -> Result<Option<StateLock>> {
        let stacks = self.stacks.lock().await;
        Ok(stacks.get(stack).and_then(|e| e.lock.clone()))
    }

    async fn load(&self, stack: &str) -> Result<Option<StackState>> {
        let stacks = self.stacks.lock().await;
        Ok(stacks.get(stack).and_then(|e| e.state.clone()))
    }

    async fn save(&self, lease: &StateLease, state: &StackState) -> Result<StackState> {
        let mut stacks = self.stacks.lock().await;
        let entry = stacks.entry(lease.stack().to_string()).or_default();
        match &entry.lock {
            Some(lock) if lock.lock_id == lease.lock_id() => {}
            _ => {
                return Err(Error::Conflict(format!(
                    "cannot save stack '{}' without holding its lock",
                    lease.stack()
                )));
            }
        }
        let stored = entry.state.as_ref().map(|s| s.version).unwrap_or(0);
        check_version(lease.stack(), stored, state.version)?;
        let saved = next_version(state);
        entry.state = Some(saved.clone());
        Ok(saved)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let stacks = self.stacks.lock().await;
        let mut names: Vec<String> = stacks
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// File-backed state store.
///
/// Layout under the state directory:
/// - `<stack>.json`: the latest saved state, replaced atomically by rename
/// - `<stack>.lock`: present while a run holds the stack, created with
///   exclusive-create semantics so only one process can take it
pub struct FileStateStore {
    dir: PathBuf,
}

fn io_err(context: &str, path: &Path, err: std::io::Error) -> Error {
    Error::State(format!("{context} {}: {err}", path.display()))
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn validate_name(stack: &str) -> Result<()> {
        let valid = !stack.is_empty()
            && stack
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
            && !stack.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("invalid stack name '{stack}'")))
        }
    }

    fn state_path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.json"))
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.lock"))
    }

    async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err("creating state directory", &self.dir, e))
    }

    async fn read_lock(&self, stack: &str) -> Result<Option<StateLock>> {
        let path = self.lock_path(stack);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::State(format!("corrupt lock file {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("reading", &path, e)),
        }
    }

    async fn ensure_held(&self, lease: &StateLease) -> Result<()> {
        match self.read_lock(lease.stack()).await? {
            Some(lock) if lock.lock_id == lease.lock_id() => Ok(()),
            Some(lock) => Err(lock_conflict(&lock)),
            None => Err(Error::Conflict(format!(
                "lease on stack '{}' is no longer held",
                lease.stack()
            ))),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn lock(&self, stack: &str, run_id: RunId, holder: &str) -> Result<StateLease> {
        Self::validate_name(stack)?;
        self.ensure_dir().await?;

        let lease = StateLease::request(stack, run_id, holder);
        let path = self.lock_path(stack);
        let body = serde_json::to_vec_pretty(lease.lock())?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(match self.read_lock(stack).await? {
                    Some(lock) => lock_conflict(&lock),
                    None => Error::Conflict(format!("stack '{stack}' is locked")),
                });
            }
            Err(e) => return Err(io_err("creating", &path, e)),
        };
        file.write_all(&body)
            .await
            .map_err(|e| io_err("writing", &path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_err("syncing", &path, e))?;

        debug!(stack = %stack, lock_id = %lease.lock_id(), "Acquired state lock");
        Ok(lease)
    }

    async fn unlock(&self, lease: StateLease) -> Result<()> {
        self.ensure_held(&lease).await?;
        let path = self.lock_path(lease.stack());
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_err("removing", &path, e))?;
        debug!(stack = %lease.stack(), "Released state lock");
        Ok(())
    }

    async fn force_unlock(&self, stack: &str) -> Result<bool> {
        Self::validate_name(stack)?;
        let path = self.lock_path(stack);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                warn!(stack = %stack, "Force-released state lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("removing", &path, e)),
        }
    }

    async fn current_lock(&self, stack: &str) -> Result<Option<StateLock>> {
        Self::validate_name(stack)?;
        self.read_lock(stack).await
    }

    async fn load(&self, stack: &str) -> Result<Option<StackState>> {
        Self::validate_name(stack)?;
        let path = self.state_path(stack);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                Error::State(format!("corrupt state file {}: {e}", path.display()))
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err("reading", &path, e)),
        }
    }

    async fn save(&self, lease: &StateLease, state: &StackState) -> Result<StackState> {
        self.ensure_held(lease).await?;

        let stored = self.load(lease.stack()).await?.map(|s| s.version).unwrap_or(0);
        check_version(lease.stack(), stored, state.version)?;
        let saved = next_version(state);

        let path = self.state_path(lease.stack());
        let tmp = self.dir.join(format!(".{}.json.tmp", lease.stack()));
        let body = serde_json::to_vec_pretty(&saved)?;
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| io_err("creating", &tmp, e))?;
        file.write_all(&body)
            .await
            .map_err(|e| io_err("writing", &tmp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_err("syncing", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_err("replacing", &path, e))?;

        info!(stack = %lease.stack(), version = saved.version, "Saved stack state");
        Ok(saved)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err("listing", &self.dir, e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_err("listing", &self.dir, e))?
        {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stack) = file_name.strip_suffix(".json") {
                if !stack.starts_with('.') {
                    names.push(stack.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn StateStore) {
        let lease = store.lock("app", RunId::new(), "alice").await.unwrap();

        let err = store.lock("app", RunId::new(), "bob").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(m) if m.contains("alice")));

        let saved = store.save(&lease, &StackState::new("app")).await.unwrap();
        assert_eq!(saved.version, 1);

        let stale = StackState::new("app");
        let err = store.save(&lease, &stale).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let saved = store.save(&lease, &saved).await.unwrap();
        assert_eq!(saved.version, 2);
        assert_eq!(store.load("app").await.unwrap().unwrap().version, 2);

        store.unlock(lease.clone()).await.unwrap();
        assert!(store.current_lock("app").await.unwrap().is_none());

        let err = store.save(&lease, &saved).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(store.unlock(lease).await.is_err());

        assert_eq!(store.list().await.unwrap(), vec!["app".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_store_lease_and_versions() {
        exercise_store(&MemoryStateStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_lease_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        exercise_store(&FileStateStore::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let lease = store.lock("app", RunId::new(), "crashed").await.unwrap();
        assert!(store.force_unlock("app").await.unwrap());
        assert!(!store.force_unlock("app").await.unwrap());

        let other = store.lock("app", RunId::new(), "next").await.unwrap();
        assert!(store.save(&lease, &StackState::new("app")).await.is_err());
        store.unlock(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_lockers_get_one_lease() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileStateStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.lock("shared", RunId::new(), &format!("worker-{i}")).await
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_rejects_path_like_stack_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("../etc").await.is_err());
        assert!(store.lock(".hidden", RunId::new(), "x").await.is_err());
    }
}
