//! State maintenance commands.

use anyhow::Result;
use std::path::Path;

use super::{BackendOverride, load_workspace, open_state_store};

pub async fn list(workspace_path: &Path, backend: &BackendOverride) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let store = open_state_store(&workspace).await?;
    let stacks = store.list().await?;
    if stacks.is_empty() {
        println!("No stacks found");
        return Ok(());
    }

    println!("{:<24} {:>8} {:>10}  LOCK", "STACK", "VERSION", "RESOURCES");
    for stack in stacks {
        let (version, resources) = match store.load(&stack).await? {
            Some(state) => (state.version, state.resources.len()),
            None => (0, 0),
        };
        let lock = match store.current_lock(&stack).await? {
            Some(lock) => format!("held by {} since {}", lock.holder, lock.acquired_at),
            None => "-".to_string(),
        };
        println!("{stack:<24} {version:>8} {resources:>10}  {lock}");
    }
    Ok(())
}

pub async fn unlock(workspace_path: &Path, backend: &BackendOverride, stack: &str) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let store = open_state_store(&workspace).await?;
    if let Some(lock) = store.current_lock(stack).await? {
        println!("Breaking lock held by {} (run {})", lock.holder, lock.run_id);
    }
    if store.force_unlock(stack).await? {
        println!("Stack '{stack}' unlocked");
    } else {
        println!("Stack '{stack}' was not locked");
    }
    Ok(())
}
