//! Runs a bootstrap plan host by host.
//!
//! Steps run in plan order on each host. A step with an `unless` check is
//! skipped when the check exits 0. The first non-zero exit stops the
//! remaining steps for that host; other hosts continue.

use futures::future::join_all;
use keel_config::VariableContext;
use keel_config::bootstrap::{BootstrapPlan, BootstrapStep, StepAction};
use keel_core::secret::SecretMasker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info};

use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    /// The `unless` check passed.
    Skipped,
    Failed,
    /// An earlier step failed.
    NotRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: String,
    pub status: StepStatus,
}

/// Why a host stopped. Command and output are masked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(
                f,
                "step '{}' failed: `{}` exited with code {code}",
                self.step, self.command
            ),
            None => write!(
                f,
                "step '{}' failed: `{}`: {}",
                self.step, self.command, self.output
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostReport {
    pub host: String,
    pub steps: Vec<StepReport>,
    pub failure: Option<StepFailure>,
    /// Facts gathered on this host.
    pub facts: BTreeMap<String, String>,
}

impl HostReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Outcome of one command within a step.
enum CommandResult {
    Ok(String),
    Failed(StepFailure),
}

/// Executes a bootstrap plan.
pub struct BootstrapRunner {
    plan: BootstrapPlan,
    context: VariableContext,
}

impl BootstrapRunner {
    /// `context` supplies `${secret.*}`, `${config.*}` and `${env.*}`.
    pub fn new(plan: BootstrapPlan, context: VariableContext) -> Self {
        Self { plan, context }
    }

    pub fn plan(&self) -> &BootstrapPlan {
        &self.plan
    }

    /// Run every step on every target. Hosts proceed concurrently.
    pub async fn run(&self, targets: &[Arc<dyn Target>]) -> Vec<HostReport> {
        join_all(targets.iter().map(|t| self.run_host(t.as_ref()))).await
    }

    /// Run every step on one host, stopping at the first failure.
    pub async fn run_host(&self, target: &dyn Target) -> HostReport {
        let host = target.name().to_string();
        let mut context = self.context.clone();
        let masker = self.masker();
        let mut report = HostReport {
            host: host.clone(),
            steps: Vec::with_capacity(self.plan.steps.len()),
            failure: None,
            facts: BTreeMap::new(),
        };

        info!(host = %host, steps = self.plan.steps.len(), "Bootstrapping host");
        for step in &self.plan.steps {
            if report.failure.is_some() {
                report.steps.push(StepReport {
                    step: step.name.clone(),
                    status: StepStatus::NotRun,
                });
                continue;
            }

            let status = match self.run_step(target, step, &mut context, &masker).await {
                Ok(status) => status,
                Err(failure) => {
                    error!(host = %host, step = %step.name, error = %failure, "Bootstrap step failed");
                    report.failure = Some(failure);
                    StepStatus::Failed
                }
            };
            report.steps.push(StepReport {
                step: step.name.clone(),
                status,
            });
        }

        report.facts = context.facts.into_iter().collect();
        if report.is_success() {
            info!(host = %host, "Host bootstrapped");
        }
        report
    }

    /// Masks config secrets and every environment value the plan uses.
    fn masker(&self) -> SecretMasker {
        let mut masker = self.context.secret_masker();
        for step in &self.plan.steps {
            for text in step_texts(step) {
                for name in VariableContext::find_variables_in_string(text, "env") {
                    if let Some(value) = self.context.env.get(&name) {
                        masker.add(value.clone());
                    }
                }
            }
        }
        masker
    }

    async fn run_step(
        &self,
        target: &dyn Target,
        step: &BootstrapStep,
        context: &mut VariableContext,
        masker: &SecretMasker,
    ) -> Result<StepStatus, StepFailure> {
        if let Some(check) = &step.unless {
            let check = interpolate(context, step, check, masker)?;
            match target.run(&check, step.sudo).await {
                Ok(output) if output.success() => {
                    info!(host = %target.name(), step = %step.name, "Check passed; skipping step");
                    return Ok(StepStatus::Skipped);
                }
                Ok(_) => {}
                Err(e) => return Err(spawn_failure(step, &check, &e.to_string(), masker)),
            }
        }

        info!(host = %target.name(), step = %step.name, sudo = step.sudo, "Running step");
        for command in step_commands(step) {
            let script = interpolate(context, step, &command, masker)?;
            match run_command(target, step, &script, masker).await {
                CommandResult::Ok(stdout) => {
                    if let StepAction::Fact { .. } = step.action {
                        context
                            .facts
                            .insert(step.name.clone(), stdout.trim().to_string());
                    }
                }
                CommandResult::Failed(failure) => return Err(failure),
            }
        }
        Ok(StepStatus::Applied)
    }
}

async fn run_command(
    target: &dyn Target,
    step: &BootstrapStep,
    script: &str,
    masker: &SecretMasker,
) -> CommandResult {
    info!(host = %target.name(), step = %step.name, command = %masker.mask(script), "Running command");
    match target.run(script, step.sudo).await {
        Ok(output) if output.success() => CommandResult::Ok(output.stdout),
        Ok(output) => CommandResult::Failed(StepFailure {
            step: step.name.clone(),
            command: masker.mask(script),
            exit_code: output.exit_code,
            output: masker.mask(&output.combined()),
        }),
        Err(e) => CommandResult::Failed(spawn_failure(step, script, &e.to_string(), masker)),
    }
}

fn spawn_failure(step: &BootstrapStep, script: &str, message: &str, masker: &SecretMasker) -> StepFailure {
    StepFailure {
        step: step.name.clone(),
        command: masker.mask(script),
        exit_code: None,
        output: masker.mask(message),
    }
}

fn interpolate(
    context: &VariableContext,
    step: &BootstrapStep,
    text: &str,
    masker: &SecretMasker,
) -> Result<String, StepFailure> {
    context.interpolate(text).map_err(|e| StepFailure {
        step: step.name.clone(),
        command: masker.mask(text),
        exit_code: None,
        output: e.to_string(),
    })
}

/// Raw text of a step that may hold `${...}` variables.
fn step_texts(step: &BootstrapStep) -> Vec<&str> {
    let mut texts: Vec<&str> = match &step.action {
        StepAction::Shell { commands } => commands.iter().map(String::as_str).collect(),
        StepAction::File { dest, content, .. } => vec![dest.as_str(), content.as_str()],
        StepAction::Fact { command } => vec![command.as_str()],
        StepAction::Ppa { source } => vec![source.as_str()],
        StepAction::Packages { .. } => Vec::new(),
    };
    if let Some(check) = &step.unless {
        texts.push(check);
    }
    texts
}

/// Quote for POSIX sh.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Heredoc delimiter that does not occur in the content.
fn heredoc_delimiter(content: &str) -> String {
    let mut delimiter = "KEEL_EOF".to_string();
    while content.lines().any(|l| l == delimiter) {
        delimiter.push('_');
    }
    delimiter
}

/// The shell commands a step runs, before interpolation.
fn step_commands(step: &BootstrapStep) -> Vec<String> {
    const APT_ENV: &str = "DEBIAN_FRONTEND=noninteractive";
    match &step.action {
        StepAction::Shell { commands } => commands.clone(),
        StepAction::Packages { packages, update } => {
            let mut commands = Vec::new();
            if *update {
                commands.push(format!("{APT_ENV} apt-get update"));
            }
            let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
            commands.push(format!("{APT_ENV} apt-get install -y {}", quoted.join(" ")));
            commands
        }
        StepAction::Ppa { source } => {
            vec![format!("add-apt-repository -y {}", shell_quote(source))]
        }
        StepAction::File { dest, content, mode } => {
            let delimiter = heredoc_delimiter(content);
            let mut script = format!(
                "cat > {} <<'{delimiter}'\n{content}\n{delimiter}",
                shell_quote(dest)
            );
            if let Some(mode) = mode {
                script.push_str(&format!("\nchmod {} {}", shell_quote(mode), shell_quote(dest)));
            }
            vec![script]
        }
        StepAction::Fact { command } => vec![command.clone()],
    }
}
