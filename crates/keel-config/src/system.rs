//! Workspace configuration parsing (`keel.kdl`).
//!
//! ```kdl
//! state "file" path=".keel/state"
//! secrets path=".keel/secrets.json"
//! parallel 10
//! timeout 300
//! poll-interval 2
//! kube-context "homelab"
//! helm "/usr/local/bin/helm"
//! ```

use kdl::KdlDocument;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::nodes::{get_arg, get_first_string_arg, get_string_prop};
use crate::{ConfigError, ConfigResult};

pub const DEFAULT_PARALLELISM: usize = 10;
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Where stack state is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StateBackendConfig {
    File { path: PathBuf },
    Postgres { url: String },
}

/// Workspace-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    pub state: StateBackendConfig,
    /// File backing the secret store for secret stack outputs.
    pub secrets_path: PathBuf,
    pub parallel: usize,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub kube_context: Option<String>,
    pub helm_binary: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state: StateBackendConfig::File {
                path: PathBuf::from(".keel/state"),
            },
            secrets_path: PathBuf::from(".keel/secrets.json"),
            parallel: DEFAULT_PARALLELISM,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            kube_context: None,
            helm_binary: "helm".to_string(),
        }
    }
}

impl WorkspaceConfig {
    /// Load from a file; a missing file yields the defaults.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => parse_workspace_config(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn positive_int(node: &kdl::KdlNode) -> ConfigResult<u64> {
    let field = node.name().value();
    get_arg(node, 0)
        .and_then(|v| v.as_integer())
        .and_then(|i| u64::try_from(i).ok())
        .filter(|i| *i > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: field.to_string(),
            message: "expected a positive integer".to_string(),
        })
}

/// Parse workspace configuration from KDL text.
pub fn parse_workspace_config(kdl: &str) -> ConfigResult<WorkspaceConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = WorkspaceConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "state" => {
                config.state = match get_first_string_arg(node).as_deref() {
                    Some("file") => StateBackendConfig::File {
                        path: get_string_prop(node, "path")
                            .map(PathBuf::from)
                            .unwrap_or_else(|| PathBuf::from(".keel/state")),
                    },
                    Some("postgres") => {
                        let raw = get_string_prop(node, "url")
                            .ok_or_else(|| ConfigError::MissingField("state url".to_string()))?;
                        let url = url::Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
                            field: "state url".to_string(),
                            message: e.to_string(),
                        })?;
                        if !matches!(url.scheme(), "postgres" | "postgresql") {
                            return Err(ConfigError::InvalidValue {
                                field: "state url".to_string(),
                                message: format!("unsupported scheme '{}'", url.scheme()),
                            });
                        }
                        StateBackendConfig::Postgres { url: raw }
                    }
                    other => {
                        return Err(ConfigError::InvalidValue {
                            field: "state".to_string(),
                            message: format!("unknown backend {other:?}"),
                        });
                    }
                };
            }
            "secrets" => {
                if let Some(path) = get_string_prop(node, "path") {
                    config.secrets_path = PathBuf::from(path);
                }
            }
            "parallel" => {
                config.parallel = positive_int(node)? as usize;
            }
            "timeout" => {
                config.timeout = Duration::from_secs(positive_int(node)?);
            }
            "poll-interval" => {
                config.poll_interval = Duration::from_secs(positive_int(node)?);
            }
            "kube-context" => {
                config.kube_context = get_first_string_arg(node);
            }
            "helm" => {
                if let Some(binary) = get_first_string_arg(node) {
                    config.helm_binary = binary;
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = parse_workspace_config("").unwrap();
        assert_eq!(config, WorkspaceConfig::default());
        assert_eq!(config.parallel, 10);
        assert_eq!(config.timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_full() {
        let config = parse_workspace_config(
            r#"
            state "postgres" url="postgres://keel@db.lan/keel"
            secrets path="/var/lib/keel/secrets.json"
            parallel 4
            timeout 600
            poll-interval 5
            kube-context "homelab"
            helm "/usr/local/bin/helm"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.state,
            StateBackendConfig::Postgres {
                url: "postgres://keel@db.lan/keel".into()
            }
        );
        assert_eq!(config.secrets_path, PathBuf::from("/var/lib/keel/secrets.json"));
        assert_eq!(config.parallel, 4);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.kube_context.as_deref(), Some("homelab"));
        assert_eq!(config.helm_binary, "/usr/local/bin/helm");
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        assert!(matches!(
            parse_workspace_config("parallel 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(parse_workspace_config(r#"state "s3""#).is_err());
        assert!(parse_workspace_config(r#"state "postgres" url="mysql://x""#).is_err());
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig::load(&dir.path().join("keel.kdl")).unwrap();
        assert_eq!(config, WorkspaceConfig::default());
    }
}
