//! File-backed secret store for published secret outputs.

use async_trait::async_trait;
use keel_core::secret::{SecretStore, SecretValue};
use keel_core::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Secrets kept in one JSON file, readable only by its owner.
pub struct FileSecretStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process.
    guard: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, SecretValue>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::State(format!("corrupt secret file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::State(format!(
                "reading {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, secrets: &BTreeMap<String, SecretValue>) -> Result<()> {
        let io = |e: std::io::Error| Error::State(format!("writing {}: {e}", self.path.display()));
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(secrets)?;
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp).await.map_err(io)?;
        file.write_all(&body).await.map_err(io)?;
        file.sync_all().await.map_err(io)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, path: &str) -> Result<SecretValue> {
        let _guard = self.guard.lock().await;
        self.read_all()
            .await?
            .remove(path)
            .ok_or_else(|| Error::NotFound(format!("secret {path}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let _guard = self.guard.lock().await;
        Ok(self
            .read_all()
            .await?
            .into_keys()
            .filter(|p| p.starts_with(prefix))
            .collect())
    }

    async fn set(&self, path: &str, value: SecretValue) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut secrets = self.read_all().await?;
        secrets.insert(path.to_string(), value);
        self.write_all(&secrets).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let _guard = self.guard.lock().await;
        let mut secrets = self.read_all().await?;
        if secrets.remove(path).is_some() {
            self.write_all(&secrets).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("nested/secrets.json"));

        store
            .set("stacks/db/outputs/password", SecretValue::String("hunter2".into()))
            .await
            .unwrap();
        store
            .set("stacks/app/outputs/token", SecretValue::String("t0k".into()))
            .await
            .unwrap();

        assert_eq!(
            store.get_key("stacks/db/outputs/password", "").await.unwrap(),
            "hunter2"
        );
        assert_eq!(
            store.list("stacks/db/").await.unwrap(),
            vec!["stacks/db/outputs/password".to_string()]
        );

        store.delete("stacks/db/outputs/password").await.unwrap();
        assert!(matches!(
            store.get("stacks/db/outputs/password").await,
            Err(Error::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = FileSecretStore::new(dir.path().join("secrets.json"));
        store.set("k", SecretValue::String("v".into())).await.unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
