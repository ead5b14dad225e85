//! Per-stack configuration store.
//!
//! Configuration lives in `Keel.<stack>.kdl` beside the stack definition:
//!
//! ```kdl
//! db_name "appdb"
//! replicas "2"
//! api_key secret=#true env="APP_API_KEY"
//! admin_password "s3cr3t" secret=#true
//! ```
//!
//! A value may be given inline or read from an environment variable at load
//! time. Secrets are only reachable through [`StackConfig::require_secret`].

use keel_core::secret::Secret;
use kdl::KdlDocument;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::nodes::{get_bool_prop, get_first_string_arg, get_string_prop};
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

#[derive(Clone)]
enum ConfigEntry {
    Plain(String),
    Secret(Secret),
}

/// Typed accessor over one stack's configuration.
#[derive(Clone, Default)]
pub struct StackConfig {
    stack: String,
    entries: BTreeMap<String, ConfigEntry>,
}

impl std::fmt::Debug for StackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (key, entry) in &self.entries {
            match entry {
                ConfigEntry::Plain(v) => map.entry(key, v),
                ConfigEntry::Secret(s) => map.entry(key, s),
            };
        }
        map.finish()
    }
}

/// Conventional config file path for a stack definition.
pub fn config_path_for(definition: &Path, stack: &str) -> PathBuf {
    let dir = definition.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!("Keel.{stack}.kdl"))
}

impl StackConfig {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Parse a config document, reading `env=` entries from the process
    /// environment.
    pub fn parse(stack: &str, kdl: &str) -> ConfigResult<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_with_env(stack, kdl, &env)
    }

    pub fn parse_with_env(
        stack: &str,
        kdl: &str,
        env: &HashMap<String, String>,
    ) -> ConfigResult<Self> {
        let doc: KdlDocument = kdl.parse()?;
        let mut config = Self::new(stack);

        for node in doc.nodes() {
            let key = node.name().value().to_string();
            if config.entries.contains_key(&key) {
                return Err(ConfigError::Duplicate(format!("config key '{key}'")));
            }

            let value = match get_string_prop(node, "env") {
                Some(var) => env.get(&var).cloned().or_else(|| get_first_string_arg(node)),
                None => get_first_string_arg(node),
            };
            // Unset env-backed keys stay absent so `require` reports them.
            let Some(value) = value else { continue };

            if get_bool_prop(node, "secret").unwrap_or(false) {
                config.set_secret(key, value);
            } else {
                config.set(key, value);
            }
        }

        Ok(config)
    }

    /// Load from a file; a missing file yields an empty store.
    pub fn load(stack: &str, path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(stack, &text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(stack)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), ConfigEntry::Plain(value.into()));
    }

    pub fn set_secret(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries
            .insert(key.into(), ConfigEntry::Secret(Secret::new(value)));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_secret(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(ConfigEntry::Secret(_)))
    }

    /// A plain value, or `MissingConfig`. Secret keys are not returned.
    pub fn require(&self, key: &str) -> ConfigResult<&str> {
        match self.entries.get(key) {
            Some(ConfigEntry::Plain(v)) => Ok(v),
            Some(ConfigEntry::Secret(_)) => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                message: "value is secret; read it with require_secret".to_string(),
            }),
            None => Err(ConfigError::MissingConfig(key.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(ConfigEntry::Plain(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_or_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// A secret value. Fails with `NotSecret` if the key exists but was
    /// stored in plaintext.
    pub fn require_secret(&self, key: &str) -> ConfigResult<Secret> {
        match self.entries.get(key) {
            Some(ConfigEntry::Secret(s)) => Ok(s.clone()),
            Some(ConfigEntry::Plain(_)) => Err(ConfigError::NotSecret(key.to_string())),
            None => Err(ConfigError::MissingConfig(key.to_string())),
        }
    }

    /// Keys in order; secret values are not exposed.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Load every value into a variable context.
    pub fn populate(&self, ctx: &mut VariableContext) {
        for (key, entry) in &self.entries {
            match entry {
                ConfigEntry::Plain(v) => {
                    ctx.config.insert(key.clone(), v.clone());
                }
                ConfigEntry::Secret(s) => {
                    ctx.secrets.insert(key.clone(), s.clone());
                }
            }
        }
    }
}
