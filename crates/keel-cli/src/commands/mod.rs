//! CLI command implementations.

pub mod bootstrap;
pub mod stack;
pub mod state;

use anyhow::{Context, Result};
use keel_config::store::config_path_for;
use keel_config::{StackConfig, StateBackendConfig, WorkspaceConfig, load_stack};
use keel_core::provider::ProviderRegistry;
use keel_core::secret::SecretStore;
use keel_core::state::StateStore;
use keel_engine::{
    FileSecretStore, FileStateStore, OrchestratorConfig, StackOrchestrator, StackProgram,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// State backend chosen on the command line, overriding `keel.kdl`.
#[derive(Debug, Default)]
pub struct BackendOverride {
    pub state_dir: Option<PathBuf>,
    pub database_url: Option<String>,
}

/// Workspace settings with command-line overrides applied.
pub fn load_workspace(path: &Path, backend: &BackendOverride) -> Result<WorkspaceConfig> {
    let mut workspace = WorkspaceConfig::load(path)
        .with_context(|| format!("Failed to load workspace config: {}", path.display()))?;
    if let Some(dir) = &backend.state_dir {
        workspace.state = StateBackendConfig::File { path: dir.clone() };
    }
    if let Some(url) = &backend.database_url {
        workspace.state = StateBackendConfig::Postgres { url: url.clone() };
    }
    Ok(workspace)
}

pub async fn open_state_store(workspace: &WorkspaceConfig) -> Result<Arc<dyn StateStore>> {
    match &workspace.state {
        StateBackendConfig::File { path } => {
            debug!(path = %path.display(), "Using file state backend");
            Ok(Arc::new(FileStateStore::new(path)))
        }
        StateBackendConfig::Postgres { url } => {
            info!("Connecting to state database...");
            let pool = keel_db::create_pool(url)
                .await
                .context("Failed to connect to state database")?;
            keel_db::run_migrations(&pool)
                .await
                .context("Failed to migrate state database")?;
            Ok(Arc::new(keel_db::PgStateStore::new(pool)))
        }
    }
}

fn open_secret_store(workspace: &WorkspaceConfig) -> Arc<dyn SecretStore> {
    Arc::new(FileSecretStore::new(&workspace.secrets_path))
}

/// Providers for the cluster: Helm releases first, everything else
/// through the Kubernetes API.
async fn cluster_providers(workspace: &WorkspaceConfig) -> Result<ProviderRegistry> {
    let kubernetes = keel_deployer::KubernetesProvider::new(workspace.kube_context.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;
    let helm = keel_deployer::HelmProvider::new(&workspace.helm_binary)
        .with_kube_context(workspace.kube_context.clone());
    Ok(ProviderRegistry::new()
        .with(Arc::new(helm))
        .with(Arc::new(kubernetes)))
}

/// Orchestrator wired to the workspace's state, secrets and cluster.
pub async fn orchestrator(workspace: &WorkspaceConfig) -> Result<StackOrchestrator> {
    let providers = cluster_providers(workspace).await?;
    offline_orchestrator(workspace, providers).await
}

/// Orchestrator for commands that only read state.
pub async fn offline_orchestrator(
    workspace: &WorkspaceConfig,
    providers: ProviderRegistry,
) -> Result<StackOrchestrator> {
    let state = open_state_store(workspace).await?;
    Ok(
        StackOrchestrator::new(providers, state, open_secret_store(workspace))
            .with_config(OrchestratorConfig::from_workspace(workspace)),
    )
}

/// Parse a stack definition with its config store and declare its
/// resources. Missing required configuration fails here, before anything
/// is planned.
pub fn load_program(path: &Path) -> Result<StackProgram> {
    let definition = load_stack(path)
        .with_context(|| format!("Failed to parse stack definition: {}", path.display()))?;
    let config_path = config_path_for(path, &definition.name);
    let config = StackConfig::load(&definition.name, &config_path)
        .with_context(|| format!("Failed to load config store: {}", config_path.display()))?;
    let declared = definition
        .declare(&config)
        .with_context(|| format!("Failed to configure stack '{}'", definition.name))?;
    Ok(StackProgram::from_declared(declared))
}

pub fn validate(path: &Path) -> Result<()> {
    let program = load_program(path)?;
    let graph = program
        .graph()
        .with_context(|| format!("Invalid resource graph in stack '{}'", program.name))?;
    println!(
        "Stack '{}' is valid: {} resources, {} outputs",
        program.name,
        graph.len(),
        program.outputs.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
        stack "web"
        namespace "web"

        config {
            require "greeting"
        }

        resource "settings" api-version="v1" kind="ConfigMap" {
            data { greeting "${config.greeting}" }
        }

        output "greeting" "${resource.settings.data.greeting}"
    "#;

    #[test]
    fn test_backend_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.kdl");
        std::fs::write(&path, "state \"file\" path=\"/var/lib/keel\"\nparallel 4\n").unwrap();

        let workspace = load_workspace(&path, &BackendOverride::default()).unwrap();
        assert_eq!(
            workspace.state,
            StateBackendConfig::File {
                path: PathBuf::from("/var/lib/keel")
            }
        );
        assert_eq!(workspace.parallel, 4);

        let backend = BackendOverride {
            state_dir: None,
            database_url: Some("postgres://keel@db/keel".into()),
        };
        let workspace = load_workspace(&path, &backend).unwrap();
        assert!(matches!(workspace.state, StateBackendConfig::Postgres { .. }));
    }

    #[test]
    fn test_load_program_reads_config_store() {
        let dir = tempfile::tempdir().unwrap();
        let stack = dir.path().join("web.kdl");
        std::fs::write(&stack, STACK).unwrap();
        std::fs::write(dir.path().join("Keel.web.kdl"), "greeting \"hello\"\n").unwrap();

        let program = load_program(&stack).unwrap();
        assert_eq!(program.name, "web");
        assert!(program.graph().unwrap().contains("settings"));
        validate(&stack).unwrap();
    }

    #[test]
    fn test_missing_config_fails_before_planning() {
        let dir = tempfile::tempdir().unwrap();
        let stack = dir.path().join("web.kdl");
        std::fs::write(&stack, STACK).unwrap();

        let err = load_program(&stack).unwrap_err();
        assert!(format!("{err:#}").contains("greeting"));
    }
}
