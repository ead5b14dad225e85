//! Bare-metal bootstrap command.

use anyhow::{Context, Result, bail};
use keel_bootstrap::{BootstrapRunner, HostReport, LocalTarget, SshTarget, StepStatus, Target};
use keel_config::bootstrap::load_bootstrap_plan;
use keel_config::{StackConfig, VariableContext};
use std::path::Path;
use std::sync::Arc;

const CONTEXT_NAME: &str = "bootstrap";

fn print_host(report: &HostReport) {
    println!("Host '{}':", report.host);
    for step in &report.steps {
        let marker = match step.status {
            StepStatus::Applied => "✓",
            StepStatus::Skipped => "○",
            StepStatus::Failed => "✗",
            StepStatus::NotRun => " ",
        };
        println!("  {marker} {}", step.step);
    }
    if let Some(failure) = &report.failure {
        println!("  {failure}");
    }
}

pub async fn run(
    plan_path: &Path,
    local: bool,
    host: Option<&str>,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut plan = load_bootstrap_plan(plan_path)
        .with_context(|| format!("Failed to parse bootstrap plan: {}", plan_path.display()))?;

    let mut context = VariableContext::new(CONTEXT_NAME);
    if let Some(path) = config_path {
        let config = StackConfig::load(CONTEXT_NAME, path)
            .with_context(|| format!("Failed to load config store: {}", path.display()))?;
        config.populate(&mut context);
    }
    context.populate_env();

    if let Some(name) = host {
        plan.hosts.retain(|h| h.name == name);
        if plan.hosts.is_empty() {
            bail!("host '{name}' is not in the bootstrap plan");
        }
    }

    let targets: Vec<Arc<dyn Target>> = if local {
        vec![Arc::new(LocalTarget::new("localhost"))]
    } else {
        plan.hosts
            .iter()
            .cloned()
            .map(|h| Arc::new(SshTarget::new(h)) as Arc<dyn Target>)
            .collect()
    };
    if targets.is_empty() {
        bail!("bootstrap plan has no hosts; pass --local to run on this machine");
    }

    let runner = BootstrapRunner::new(plan, context);
    let reports = runner.run(&targets).await;

    let mut failed = Vec::new();
    for report in &reports {
        print_host(report);
        if !report.is_success() {
            failed.push(report.host.clone());
        }
    }
    if !failed.is_empty() {
        bail!("bootstrap failed on {}", failed.join(", "));
    }
    println!("Bootstrapped {} host(s)", reports.len());
    Ok(())
}
