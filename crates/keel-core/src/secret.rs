//! Secret values, secret storage and fingerprinting.
//!
//! Secrets never leave this module in plaintext except through
//! [`Secret::expose`]. Every formatting and serialization path prints the
//! redaction marker instead.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize, Serializer};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::RwLock;

use crate::{Error, Result};

/// Text printed wherever a secret would otherwise appear.
pub const REDACTED: &str = "[secret]";

/// An opaque secret string.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plaintext. Callers must not log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({REDACTED})")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(REDACTED)
    }
}

/// A value held by a secret store (a single string or key-value pairs).
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    String(String),
    Map(HashMap<String, String>),
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretValue::String(_) => write!(f, "SecretValue::String({REDACTED})"),
            SecretValue::Map(m) => {
                let keys: Vec<_> = m.keys().collect();
                write!(f, "SecretValue::Map(keys={keys:?})")
            }
        }
    }
}

impl SecretValue {
    /// Get the value as a string (returns first/only value for maps).
    pub fn as_string(&self) -> Option<&str> {
        match self {
            SecretValue::String(s) => Some(s),
            SecretValue::Map(m) => m.values().next().map(|s| s.as_str()),
        }
    }

    /// Get a specific key from a map secret.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self {
            SecretValue::String(s) if key.is_empty() => Some(s),
            SecretValue::Map(m) => m.get(key).map(|s| s.as_str()),
            _ => None,
        }
    }
}

/// Trait for secret storage backends.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret by path.
    async fn get(&self, path: &str) -> Result<SecretValue>;

    /// Get a specific key from a secret.
    async fn get_key(&self, path: &str, key: &str) -> Result<String> {
        let value = self.get(path).await?;
        value
            .get(key)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound(format!("secret key {key} in {path}")))
    }

    /// List secret paths with a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Set/create a secret.
    async fn set(&self, path: &str, value: SecretValue) -> Result<()>;

    /// Delete a secret.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Process-local secret store.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, SecretValue>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, path: &str) -> Result<SecretValue> {
        self.secrets
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret {path}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self
            .secrets
            .read()
            .await
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn set(&self, path: &str, value: SecretValue) -> Result<()> {
        self.secrets.write().await.insert(path.to_string(), value);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.secrets.write().await.remove(path);
        Ok(())
    }
}

/// Path under which a stack's secret output is published.
pub fn output_secret_path(stack: &str, key: &str) -> String {
    format!("stacks/{stack}/outputs/{key}")
}

/// Salted HMAC-SHA256 fingerprints, recorded in state instead of secret
/// plaintext so changes remain detectable.
#[derive(Clone)]
pub struct Fingerprinter {
    key: Vec<u8>,
}

impl Fingerprinter {
    pub fn new(salt: &str) -> Self {
        Self {
            key: salt.as_bytes().to_vec(),
        }
    }

    pub fn fingerprint(&self, plaintext: &str) -> String {
        // HMAC accepts keys of any length.
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("hmac key length is unrestricted"));
        mac.update(plaintext.as_bytes());
        format!("hmac-sha256:{}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl fmt::Debug for Fingerprinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fingerprinter")
    }
}

/// Replaces known secret values in free-form text (command output, error
/// messages) with the redaction marker.
#[derive(Clone, Default)]
pub struct SecretMasker {
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() && !self.values.contains(&value) {
            self.values.push(value);
            // Longest first so a secret containing another is masked whole.
            self.values.sort_by_key(|v| std::cmp::Reverse(v.len()));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            out = out.replace(value.as_str(), REDACTED);
        }
        out
    }
}

impl fmt::Debug for SecretMasker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretMasker({} values)", self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_never_formats_plaintext() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{secret}"), REDACTED);
        assert!(!format!("{secret:?}").contains("hunter2"));
        let json = serde_json::to_string(&secret).unwrap();
        assert!(!json.contains("hunter2"));
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_fingerprint_is_stable_and_salted() {
        let a = Fingerprinter::new("salt-a");
        let b = Fingerprinter::new("salt-b");
        assert_eq!(a.fingerprint("pw"), a.fingerprint("pw"));
        assert_ne!(a.fingerprint("pw"), b.fingerprint("pw"));
        assert!(!a.fingerprint("pw").contains("pw"));
    }

    #[test]
    fn test_masker_prefers_longest_match() {
        let mut masker = SecretMasker::new();
        masker.add("abc");
        masker.add("abcdef");
        masker.add("");
        assert_eq!(masker.mask("token=abcdef;x=abc"), "token=[secret];x=[secret]");
    }

    #[tokio::test]
    async fn test_memory_secret_store() {
        let store = MemorySecretStore::new();
        store
            .set("stacks/db/outputs/password", SecretValue::String("pw".into()))
            .await
            .unwrap();
        let listed = store.list("stacks/db/").await.unwrap();
        assert_eq!(listed, vec!["stacks/db/outputs/password".to_string()]);
        assert_eq!(
            store.get_key("stacks/db/outputs/password", "").await.unwrap(),
            "pw"
        );
        store.delete("stacks/db/outputs/password").await.unwrap();
        assert!(matches!(
            store.get("stacks/db/outputs/password").await,
            Err(Error::NotFound(_))
        ));
    }
}
