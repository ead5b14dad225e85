//! Stack commands: preview, up, destroy, refresh and outputs.

use anyhow::{Context, Result, bail};
use keel_config::load_stack;
use keel_core::provider::ProviderRegistry;
use keel_core::stack::{ChangeAction, Plan, RunReport, StackRunStatus};
use keel_engine::{RunEvent, RunOptions};
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{BackendOverride, load_program, load_workspace, offline_orchestrator, orchestrator};

fn action_symbol(action: ChangeAction) -> &'static str {
    match action {
        ChangeAction::Create => "+",
        ChangeAction::Update => "~",
        ChangeAction::Replace => "+-",
        ChangeAction::Delete => "-",
        ChangeAction::Same => " ",
        ChangeAction::Read => "<=",
    }
}

fn print_plan(plan: &Plan) {
    println!("Stack '{}':", plan.stack);
    for change in &plan.changes {
        if change.action == ChangeAction::Same {
            continue;
        }
        let drift = if change.drift { " (drift)" } else { "" };
        println!(
            "  {:<2} {} [{}] {}{}",
            action_symbol(change.action),
            change.name,
            change.resource_type,
            change.action,
            drift
        );
        for field in &change.changed_fields {
            println!("       ~ {field}");
        }
    }
    println!("\n{}", plan.summary());
    if plan.requires_approval {
        println!("Drift detected: applying will overwrite changes made outside keel.");
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunStarted {
            run_id,
            stack,
            run_type,
        } => {
            println!("▶ {run_type} of stack '{stack}' (run {run_id})");
        }
        RunEvent::PlanComputed {
            summary,
            requires_approval,
        } => {
            println!("  Plan: {summary}");
            if *requires_approval {
                println!("  Plan contains drift");
            }
        }
        RunEvent::ResourceStarted { resource, action } => {
            println!("  {} {resource}: {action} started", action_symbol(*action));
        }
        RunEvent::ResourceWaiting { resource, detail } => {
            println!("  … {resource}: waiting ({detail})");
        }
        RunEvent::ResourceCompleted { resource, action } => {
            println!("  ✓ {resource}: {action} complete");
        }
        RunEvent::ResourceUnchanged { .. } => {}
        RunEvent::ResourceFailed { resource, message } => {
            println!("  ✗ {resource}: {message}");
        }
        RunEvent::ResourceSkipped { resource, reason } => {
            println!("  ○ {resource}: skipped ({reason})");
        }
        RunEvent::RunCompleted { status } => {
            println!("■ Run {status}");
        }
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "{} of '{}' {}: {} changed, {} unchanged, {} failed, {} skipped",
        report.run_type,
        report.stack,
        report.status,
        report.succeeded.len(),
        report.unchanged.len(),
        report.failed.len(),
        report.skipped.len()
    );
    for (resource, message) in &report.failed {
        println!("  failed  {resource}: {message}");
    }
    for (resource, reason) in &report.skipped {
        println!("  skipped {resource}: {reason}");
    }
}

/// Cancel the run on Ctrl-C. In-flight applies still finish.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for in-flight resources to finish");
            child.cancel();
        }
    });
    token
}

async fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Print events as they arrive, then return the run's report.
async fn follow_run(
    mut events: mpsc::Receiver<RunEvent>,
    handle: JoinHandle<keel_core::Result<RunReport>>,
) -> Result<RunReport> {
    while let Some(event) = events.recv().await {
        print_event(&event);
    }
    let report = handle.await.context("Run task failed")??;
    print_report(&report);
    Ok(report)
}

fn check_status(report: &RunReport) -> Result<()> {
    match report.status {
        StackRunStatus::Succeeded => Ok(()),
        StackRunStatus::NeedsApproval => Err(keel_core::Error::DriftDetected(format!(
            "stack '{}'; review with `keel preview --refresh` and rerun with --yes",
            report.stack
        ))
        .into()),
        StackRunStatus::Cancelled => Err(keel_core::Error::Cancelled.into()),
        status => bail!("run {} finished with status {status}", report.run_id),
    }
}

pub async fn preview(
    workspace_path: &Path,
    backend: &BackendOverride,
    stack_path: &Path,
    refresh: bool,
) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let program = load_program(stack_path)?;
    let orchestrator = orchestrator(&workspace).await?;
    let plan = orchestrator.preview(&program, refresh).await?;
    print_plan(&plan);
    Ok(())
}

pub async fn up(
    workspace_path: &Path,
    backend: &BackendOverride,
    stack_path: &Path,
    yes: bool,
    refresh: bool,
    parallel: Option<usize>,
) -> Result<()> {
    let mut workspace = load_workspace(workspace_path, backend)?;
    if let Some(parallel) = parallel {
        if parallel == 0 {
            bail!("--parallel must be at least 1");
        }
        workspace.parallel = parallel;
    }
    let program = load_program(stack_path)?;
    let orchestrator = orchestrator(&workspace).await?;

    if !yes {
        let plan = orchestrator.preview(&program, refresh).await?;
        print_plan(&plan);
        if plan.is_empty() && !plan.requires_approval {
            println!("No changes.");
            return Ok(());
        }
        if !confirm("Apply these changes?").await? {
            println!("Apply cancelled.");
            return Ok(());
        }
    }

    let options = RunOptions {
        refresh,
        approve: true,
        cancel: cancel_on_ctrl_c(),
    };
    let (events, handle) = orchestrator.up(program, options);
    let report = follow_run(events, handle).await?;
    check_status(&report)
}

pub async fn destroy(
    workspace_path: &Path,
    backend: &BackendOverride,
    stack_path: &Path,
    yes: bool,
) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let definition = load_stack(stack_path)
        .with_context(|| format!("Failed to parse stack definition: {}", stack_path.display()))?;
    let orchestrator = orchestrator(&workspace).await?;

    let Some(state) = orchestrator.state_store().load(&definition.name).await? else {
        println!("Stack '{}' has no recorded state.", definition.name);
        return Ok(());
    };
    println!("Stack '{}' will lose:", definition.name);
    for (name, record) in &state.resources {
        println!("  -  {name} [{}]", record.resource_type);
    }
    if !yes && !confirm("Destroy these resources?").await? {
        println!("Destroy cancelled.");
        return Ok(());
    }

    let options = RunOptions {
        approve: true,
        cancel: cancel_on_ctrl_c(),
        ..Default::default()
    };
    let (events, handle) = orchestrator.destroy(&definition.name, options);
    let report = follow_run(events, handle).await?;
    check_status(&report)
}

pub async fn refresh(
    workspace_path: &Path,
    backend: &BackendOverride,
    stack_path: &Path,
) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let definition = load_stack(stack_path)
        .with_context(|| format!("Failed to parse stack definition: {}", stack_path.display()))?;
    let orchestrator = orchestrator(&workspace).await?;
    let plan = orchestrator.refresh(&definition.name).await?;
    if plan.requires_approval {
        print_plan(&plan);
    } else {
        println!("Stack '{}' matches the cluster.", definition.name);
    }
    Ok(())
}

pub async fn outputs(
    workspace_path: &Path,
    backend: &BackendOverride,
    stack: &str,
    show_secrets: bool,
) -> Result<()> {
    let workspace = load_workspace(workspace_path, backend)?;
    let orchestrator = offline_orchestrator(&workspace, ProviderRegistry::new()).await?;
    let outputs = orchestrator.outputs(stack, show_secrets).await?;
    if outputs.is_empty() {
        println!("Stack '{stack}' has no outputs.");
    }
    for (key, value) in outputs {
        match value {
            serde_json::Value::String(s) => println!("{key} = {s}"),
            other => println!("{key} = {other}"),
        }
    }
    Ok(())
}
