//! Stack orchestrator - applies resource graphs in dependency order.

use chrono::{DateTime, Utc};
use keel_config::{DeclaredStack, WorkspaceConfig};
use keel_core::provider::{
    ApplyRequest, Observed, ProviderRegistry, Readiness, ResourceLocator, ResourceProvider,
    json_lookup,
};
use keel_core::resource::{DeclarationMode, ReadinessPolicy};
use keel_core::secret::{
    Fingerprinter, REDACTED, SecretMasker, SecretStore, SecretValue, output_secret_path,
};
use keel_core::stack::{
    ChangeAction, Plan, PlanSummary, ResourceChange, ResourceRecord, RunReport, StackRunStatus,
    StackRunType, StackState,
};
use keel_core::state::{StateLease, StateStore};
use keel_core::value::{PropertyValue, Reference, SECRET_MARKER};
use keel_core::{Error, ResourceDeclaration, Result, RunId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::diff::changed_fields;
use crate::graph::ResourceGraph;
use crate::plan::{
    DriftReport, detect_drift, needs_replace, plan_changes, plan_destroy, removed_in_delete_order,
};
use crate::references::{
    Resolver, StackOutputs, contains_secret_marker, is_secret_marker, referenced_stacks,
    seal_as_recorded,
};
use crate::transform::Transformations;

/// Event emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        stack: String,
        run_type: StackRunType,
    },
    PlanComputed {
        summary: PlanSummary,
        requires_approval: bool,
    },
    ResourceStarted {
        resource: String,
        action: ChangeAction,
    },
    ResourceWaiting {
        resource: String,
        detail: String,
    },
    ResourceCompleted {
        resource: String,
        action: ChangeAction,
    },
    ResourceUnchanged {
        resource: String,
    },
    ResourceFailed {
        resource: String,
        message: String,
    },
    ResourceSkipped {
        resource: String,
        reason: String,
    },
    RunCompleted {
        status: StackRunStatus,
    },
}

/// Tuning for runs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum concurrent applies.
    pub parallelism: usize,
    /// Default per-resource bound on apply plus readiness.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Recorded in the state lock.
    pub holder: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: keel_config::system::DEFAULT_PARALLELISM,
            timeout: Duration::from_secs(keel_config::system::DEFAULT_TIMEOUT_SECS),
            poll_interval: Duration::from_secs(keel_config::system::DEFAULT_POLL_INTERVAL_SECS),
            holder: default_holder(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_workspace(workspace: &WorkspaceConfig) -> Self {
        Self {
            parallelism: workspace.parallel,
            timeout: workspace.timeout,
            poll_interval: workspace.poll_interval,
            holder: default_holder(),
        }
    }
}

fn default_holder() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "keel".to_string());
    format!("{user} (pid {})", std::process::id())
}

/// A stack ready to be planned or applied.
#[derive(Debug, Clone, Default)]
pub struct StackProgram {
    pub name: String,
    pub resources: Vec<ResourceDeclaration>,
    pub outputs: BTreeMap<String, PropertyValue>,
    pub transformations: Transformations,
}

impl StackProgram {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn from_declared(declared: DeclaredStack) -> Self {
        Self {
            transformations: Transformations::from_specs(&declared.transforms),
            name: declared.name,
            resources: declared.resources,
            outputs: declared.outputs,
        }
    }

    pub fn resource(mut self, decl: ResourceDeclaration) -> Self {
        self.resources.push(decl);
        self
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn transform(
        mut self,
        hook: impl Fn(ResourceDeclaration) -> ResourceDeclaration + Send + Sync + 'static,
    ) -> Self {
        self.transformations = self.transformations.with(hook);
        self
    }

    /// Apply transformations and build the validated graph.
    pub fn graph(&self) -> Result<ResourceGraph> {
        let graph = ResourceGraph::build(self.transformations.apply(self.resources.clone()))?;
        for (key, value) in &self.outputs {
            for reference in value.references() {
                if let Reference::Resource { resource, .. } = reference {
                    if !graph.contains(resource) {
                        return Err(Error::InvalidReference(format!(
                            "output '{key}' references undeclared resource '{resource}'"
                        )));
                    }
                }
            }
        }
        Ok(graph)
    }
}

/// Per-run switches.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Compare recorded state with the remote before planning.
    pub refresh: bool,
    /// Apply even when the plan contains drift.
    pub approve: bool,
    pub cancel: CancellationToken,
}

/// Drain a run's events and wait for its report.
pub async fn wait_for_run(
    mut events: mpsc::Receiver<RunEvent>,
    handle: JoinHandle<Result<RunReport>>,
) -> Result<(RunReport, Vec<RunEvent>)> {
    let collector = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        seen
    });
    let report = handle
        .await
        .map_err(|e| Error::Internal(format!("run task failed: {e}")))??;
    let events = collector
        .await
        .map_err(|e| Error::Internal(format!("event collector failed: {e}")))?;
    Ok((report, events))
}

/// Plans and applies stacks against providers and a state store.
pub struct StackOrchestrator {
    providers: ProviderRegistry,
    state: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    config: OrchestratorConfig,
}

impl StackOrchestrator {
    pub fn new(
        providers: ProviderRegistry,
        state: Arc<dyn StateStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            providers,
            state,
            secrets,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state_store(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Compute the plan without taking the state lease.
    pub async fn preview(&self, program: &StackProgram, refresh: bool) -> Result<Plan> {
        let graph = program.graph()?;
        let state = self
            .state
            .load(&program.name)
            .await?
            .unwrap_or_else(|| StackState::new(&program.name));
        let stacks = self.load_stack_outputs(&graph, &program.outputs).await?;
        let drift = if refresh {
            detect_drift(&state, &self.providers).await?
        } else {
            DriftReport::default()
        };
        Ok(plan_changes(&graph, &state, &stacks, &drift))
    }

    /// Apply a stack, returning a channel of events and a handle to get the
    /// final report.
    pub fn up(
        &self,
        program: StackProgram,
        options: RunOptions,
    ) -> (mpsc::Receiver<RunEvent>, JoinHandle<Result<RunReport>>) {
        let (tx, rx) = mpsc::channel(100);
        let mut run = self.start_run(&program.name, StackRunType::Up, tx);
        let handle = tokio::spawn(async move {
            let result = run.up(program, options).await;
            run.finish(result).await
        });
        (rx, handle)
    }

    /// Delete every recorded resource of a stack, dependents first.
    pub fn destroy(
        &self,
        stack: &str,
        options: RunOptions,
    ) -> (mpsc::Receiver<RunEvent>, JoinHandle<Result<RunReport>>) {
        let (tx, rx) = mpsc::channel(100);
        let mut run = self.start_run(stack, StackRunType::Destroy, tx);
        let handle = tokio::spawn(async move {
            let result = run.destroy(options).await;
            run.finish(result).await
        });
        (rx, handle)
    }

    /// Re-read every recorded resource, update recorded outputs, forget
    /// resources that vanished and report drift.
    pub async fn refresh(&self, stack: &str) -> Result<Plan> {
        let run_id = RunId::new();
        let lease = self
            .state
            .lock(stack, run_id, &self.config.holder)
            .await?;
        info!(stack, run_id = %run_id, run_type = %StackRunType::Refresh, "Run started");
        let result = self.refresh_locked(&lease).await;
        if let Err(e) = self.state.unlock(lease).await {
            error!(stack = %stack, error = %e, "Failed to release state lock");
        }
        result
    }

    async fn refresh_locked(&self, lease: &StateLease) -> Result<Plan> {
        let stack = lease.stack();
        let mut state = self
            .state
            .load(stack)
            .await?
            .ok_or_else(|| Error::NotFound(format!("stack '{stack}' has no recorded state")))?;
        let fingerprinter = Fingerprinter::new(&state.secret_salt);
        let drift = detect_drift(&state, &self.providers).await?;

        let mut changes = Vec::with_capacity(state.resources.len());
        for (name, record) in state.resources.iter_mut() {
            if let Some(observed) = drift.observed.get(name) {
                record.outputs = seal_as_recorded(observed.outputs.clone(), &record.outputs)
                    .to_recorded_json(&fingerprinter);
            }
            let (action, fields, drifted) = if drift.missing.contains(name) {
                (ChangeAction::Delete, Vec::new(), true)
            } else if let Some(fields) = drift.fields.get(name) {
                (ChangeAction::Update, fields.clone(), true)
            } else {
                (ChangeAction::Same, Vec::new(), false)
            };
            changes.push(ResourceChange {
                name: name.clone(),
                resource_type: record.resource_type.clone(),
                action,
                changed_fields: fields,
                drift: drifted,
                before: Some(record.inputs.clone()),
                after: None,
            });
        }
        for name in &drift.missing {
            state.resources.remove(name);
        }
        self.state.save(lease, &state).await?;
        info!(stack = %stack, drifted = drift.fields.len(), missing = drift.missing.len(), "Refresh complete");

        Ok(Plan {
            stack: stack.to_string(),
            changes,
            requires_approval: !drift.is_empty(),
        })
    }

    /// Published outputs of a stack; secret values are redacted unless
    /// `reveal` is set.
    pub async fn outputs(&self, stack: &str, reveal: bool) -> Result<BTreeMap<String, Value>> {
        let state = self
            .state
            .load(stack)
            .await?
            .ok_or_else(|| Error::NotFound(format!("stack '{stack}' has no recorded state")))?;
        let mut outputs = BTreeMap::new();
        for (key, value) in state.outputs {
            let shown = if !is_secret_marker(&value) {
                value
            } else if reveal {
                Value::String(
                    self.secrets
                        .get_key(&output_secret_path(stack, &key), "")
                        .await?,
                )
            } else {
                Value::String(REDACTED.to_string())
            };
            outputs.insert(key, shown);
        }
        Ok(outputs)
    }

    async fn load_stack_outputs(
        &self,
        graph: &ResourceGraph,
        outputs: &BTreeMap<String, PropertyValue>,
    ) -> Result<StackOutputs> {
        let values = graph
            .declarations()
            .iter()
            .flat_map(|d| d.properties.values())
            .chain(outputs.values());
        StackOutputs::load(
            self.state.as_ref(),
            self.secrets.as_ref(),
            referenced_stacks(values),
        )
        .await
    }

    fn start_run(&self, stack: &str, run_type: StackRunType, events: mpsc::Sender<RunEvent>) -> Run {
        Run {
            run_id: RunId::new(),
            stack: stack.to_string(),
            run_type,
            started_at: Utc::now(),
            providers: self.providers.clone(),
            store: self.state.clone(),
            secrets: self.secrets.clone(),
            config: self.config.clone(),
            events,
            masker: SecretMasker::new(),
            succeeded: Vec::new(),
            unchanged: Vec::new(),
            failed: BTreeMap::new(),
            skipped: BTreeMap::new(),
            cancelled: false,
            needs_approval: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Done,
    Failed,
}

/// Outputs of a resource as seen by its dependents.
#[derive(Debug, Clone)]
struct DependencyOutputs {
    locator: ResourceLocator,
    outputs: PropertyValue,
    /// False when taken from recorded state, where secrets are fingerprints.
    live: bool,
}

/// Outputs of the named resources, re-reading live objects whose recorded
/// outputs only hold fingerprints at a referenced path.
async fn materialize(
    providers: &ProviderRegistry,
    upstream: &HashMap<String, DependencyOutputs>,
    references: &[&Reference],
) -> Result<HashMap<String, PropertyValue>> {
    let mut resolved = HashMap::with_capacity(upstream.len());
    for (name, dep) in upstream {
        let needs_read = !dep.live
            && references.iter().any(|r| match r {
                Reference::Resource { resource, path } if resource == name => dep
                    .outputs
                    .lookup(path)
                    .map_or(contains_secret_marker(&dep.outputs), |v| {
                        contains_secret_marker(&v)
                    }),
                _ => false,
            });
        let outputs = if needs_read {
            debug!(resource = %name, "Reading live outputs for secret reference");
            let provider = providers.for_type(&dep.locator.resource_type)?;
            match provider.read(&dep.locator).await? {
                Some(observed) => observed.outputs,
                None => {
                    return Err(Error::UnresolvedReference(format!(
                        "resource '{name}' no longer exists"
                    )));
                }
            }
        } else {
            dep.outputs.clone()
        };
        resolved.insert(name.clone(), outputs);
    }
    Ok(resolved)
}

struct Applied {
    action: ChangeAction,
    /// New record to persist; `None` when the recorded one is current.
    record: Option<ResourceRecord>,
    outputs: DependencyOutputs,
}

/// Everything one resource apply needs, owned so it can run on its own task.
struct ResourceTask {
    stack: String,
    decl: ResourceDeclaration,
    dependencies: Vec<String>,
    record: Option<ResourceRecord>,
    /// Apply even without declared changes (drift approved).
    force: bool,
    upstream: HashMap<String, DependencyOutputs>,
    stacks: Arc<StackOutputs>,
    providers: ProviderRegistry,
    fingerprinter: Fingerprinter,
    masker: SecretMasker,
    timeout: Duration,
    poll_interval: Duration,
    events: mpsc::Sender<RunEvent>,
    /// Tainted record of an object that was applied but is not ready yet.
    pending: Option<ResourceRecord>,
}

/// A failed resource, with the record of anything it left behind.
struct TaskFailure {
    message: String,
    record: Option<ResourceRecord>,
}

impl ResourceTask {
    /// Run the task; errors come back as masked messages.
    async fn run(mut self) -> std::result::Result<Applied, TaskFailure> {
        match self.execute().await {
            Ok(applied) => Ok(applied),
            Err(e) => Err(TaskFailure {
                message: self.masker.mask(&e.to_string()),
                record: self.pending.take(),
            }),
        }
    }

    async fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event).await;
    }

    async fn execute(&mut self) -> Result<Applied> {
        let provider = self.providers.for_type(&self.decl.resource_type)?;

        let references: Vec<&Reference> = self
            .decl
            .properties
            .values()
            .flat_map(|v| v.references())
            .collect();
        let resources = materialize(&self.providers, &self.upstream, &references).await?;
        let resolved = Resolver::new(&resources, &self.stacks)
            .resolve(&PropertyValue::Map(self.decl.properties.clone()))?;
        resolved.collect_secrets(&mut self.masker);
        let inputs = resolved.to_recorded_json(&self.fingerprinter);

        if let DeclarationMode::Lookup { id } = &self.decl.mode {
            let locator =
                ResourceLocator::from_id(&self.decl.name, self.decl.resource_type.clone(), id);
            self.emit(RunEvent::ResourceStarted {
                resource: self.decl.name.clone(),
                action: ChangeAction::Read,
            })
            .await;
            let observed = provider
                .read(&locator)
                .await?
                .ok_or_else(|| Error::NotFound(format!("lookup target {locator} does not exist")))?;
            let observed = self.seal(observed);
            let record = self.new_record(&locator, inputs, &observed, true, false);
            return Ok(Applied {
                action: ChangeAction::Read,
                record: Some(record),
                outputs: DependencyOutputs {
                    locator,
                    outputs: observed.outputs,
                    live: true,
                },
            });
        }

        let locator = ResourceLocator::from_declaration(&self.decl);
        let action = match &self.record {
            None => ChangeAction::Create,
            Some(record) => {
                let changed = changed_fields(
                    &record.inputs,
                    &inputs,
                    &self.decl.options.ignore_changes,
                );
                if needs_replace(record, &self.decl, &changed) {
                    ChangeAction::Replace
                } else if changed.is_empty() && !self.force && !record.tainted {
                    return Ok(self.unchanged(record, locator));
                } else {
                    debug!(resource = %self.decl.name, fields = ?changed, "Changed fields");
                    ChangeAction::Update
                }
            }
        };

        self.emit(RunEvent::ResourceStarted {
            resource: self.decl.name.clone(),
            action,
        })
        .await;
        info!(resource = %self.decl.name, action = %action, target = %locator, "Applying resource");

        if let (ChangeAction::Replace, Some(record)) = (action, &self.record) {
            let old = ResourceLocator::from_record(record);
            self.providers
                .for_type(&old.resource_type)?
                .delete(&old)
                .await?;
        }

        let mut desired = resolved.to_plain_json()?;
        let ignore = &self.decl.options.ignore_changes;
        if action == ChangeAction::Update && !ignore.is_empty() {
            if let Some(live) = provider.read(&locator).await? {
                preserve_ignored(&mut desired, &live.object, ignore);
            }
        }

        let request = ApplyRequest {
            stack: self.stack.clone(),
            locator: locator.clone(),
            properties: desired,
        };
        let timeout = self.decl.options.timeout.unwrap_or(self.timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        let resource = self.decl.name.clone();
        let timed_out = move || Error::ReadinessTimeout {
            resource: resource.clone(),
            timeout,
        };

        let observed =
            match tokio::time::timeout_at(deadline, self.apply(provider.as_ref(), &request)).await
            {
                Ok(result) => result?,
                Err(_) => {
                    // The apply may have landed before the deadline cut it off.
                    if let Ok(Some(observed)) = provider.read(&locator).await {
                        let observed = self.seal(observed);
                        let record = self.new_record(&locator, inputs, &observed, false, true);
                        self.pending = Some(record);
                    }
                    return Err(timed_out());
                }
            };

        // Recorded before waiting so a resource that never becomes ready
        // is still known to destroy.
        let observed = self.seal(observed);
        let record = self.new_record(&locator, inputs.clone(), &observed, false, true);
        self.pending = Some(record);

        let observed = match tokio::time::timeout_at(
            deadline,
            self.wait_ready(provider.as_ref(), &locator, observed),
        )
        .await
        {
            Ok(result) => self.seal(result?),
            Err(_) => return Err(timed_out()),
        };

        self.pending = None;
        let record = self.new_record(&locator, inputs, &observed, false, false);
        Ok(Applied {
            action,
            record: Some(record),
            outputs: DependencyOutputs {
                locator,
                outputs: observed.outputs,
                live: true,
            },
        })
    }

    /// Wrap observed strings that embed a known secret so they are
    /// fingerprinted when recorded.
    fn seal(&self, observed: Observed) -> Observed {
        Observed {
            outputs: seal_known(observed.outputs, &self.masker),
            ..observed
        }
    }

    fn unchanged(&self, record: &ResourceRecord, locator: ResourceLocator) -> Applied {
        let current = ResourceRecord {
            dependencies: self.dependencies.clone(),
            ignore_changes: self.decl.options.ignore_changes.clone(),
            protect: self.decl.options.protect,
            ..record.clone()
        };
        Applied {
            action: ChangeAction::Same,
            record: (current != *record).then_some(current),
            outputs: DependencyOutputs {
                locator,
                outputs: PropertyValue::from_json(record.outputs.clone()),
                live: false,
            },
        }
    }

    async fn apply(
        &self,
        provider: &dyn ResourceProvider,
        request: &ApplyRequest,
    ) -> Result<Observed> {
        provider.apply(request).await.map_err(|e| match e {
            Error::Provider(message) => Error::ApplyFailed {
                resource: self.decl.name.clone(),
                message,
            },
            other => other,
        })
    }

    /// Poll until the readiness policy is met. Callers bound this with the
    /// resource's deadline.
    async fn wait_ready(
        &self,
        provider: &dyn ResourceProvider,
        locator: &ResourceLocator,
        mut observed: Observed,
    ) -> Result<Observed> {
        let name = &self.decl.name;
        let policy = self.decl.effective_readiness();
        let mut last_detail: Option<String> = None;
        loop {
            let readiness = match &policy {
                ReadinessPolicy::SkipAwait => Readiness::Ready,
                ReadinessPolicy::FieldEquals { path, value } => {
                    if json_lookup(&observed.object, path) == Some(value) {
                        Readiness::Ready
                    } else {
                        Readiness::Pending(format!("waiting for {path} = {value}"))
                    }
                }
                ReadinessPolicy::Default => provider.readiness(&locator.resource_type, &observed),
            };
            match readiness {
                Readiness::Ready => {
                    debug!(resource = %name, "Resource ready");
                    return Ok(observed);
                }
                Readiness::Failed(message) => {
                    return Err(Error::ApplyFailed {
                        resource: name.clone(),
                        message,
                    });
                }
                Readiness::Pending(detail) => {
                    if last_detail.as_ref() != Some(&detail) {
                        self.emit(RunEvent::ResourceWaiting {
                            resource: name.clone(),
                            detail: self.masker.mask(&detail),
                        })
                        .await;
                        last_detail = Some(detail);
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
            observed = provider
                .read(locator)
                .await?
                .ok_or_else(|| Error::ApplyFailed {
                    resource: name.clone(),
                    message: "object disappeared while waiting for readiness".to_string(),
                })?;
        }
    }

    fn new_record(
        &self,
        locator: &ResourceLocator,
        inputs: Value,
        observed: &Observed,
        lookup: bool,
        tainted: bool,
    ) -> ResourceRecord {
        ResourceRecord {
            name: self.decl.name.clone(),
            resource_type: locator.resource_type.clone(),
            namespace: locator.namespace.clone(),
            remote_name: locator.remote_name.clone(),
            inputs,
            outputs: observed.outputs.to_recorded_json(&self.fingerprinter),
            dependencies: self.dependencies.clone(),
            ignore_changes: self.decl.options.ignore_changes.clone(),
            protect: self.decl.options.protect,
            lookup,
            tainted,
            updated_at: Utc::now(),
        }
    }
}

fn seal_known(value: PropertyValue, masker: &SecretMasker) -> PropertyValue {
    match value {
        PropertyValue::String(s) if masker.mask(&s) != s => {
            PropertyValue::secret(PropertyValue::String(s))
        }
        PropertyValue::List(items) => {
            PropertyValue::List(items.into_iter().map(|i| seal_known(i, masker)).collect())
        }
        PropertyValue::Map(map) => PropertyValue::Map(
            map.into_iter()
                .map(|(k, v)| (k, seal_known(v, masker)))
                .collect(),
        ),
        other => other,
    }
}

/// Copy live values at ignored paths into the desired object so an update
/// does not revert them.
fn preserve_ignored(desired: &mut Value, live: &Value, ignore: &[String]) {
    for path in ignore {
        if let Some(value) = json_lookup(live, path) {
            set_json_path(desired, path, value.clone());
        }
    }
}

/// One up or destroy run. Owns the event sender; dropping the run closes
/// the event channel.
struct Run {
    run_id: RunId,
    stack: String,
    run_type: StackRunType,
    started_at: DateTime<Utc>,
    providers: ProviderRegistry,
    store: Arc<dyn StateStore>,
    secrets: Arc<dyn SecretStore>,
    config: OrchestratorConfig,
    events: mpsc::Sender<RunEvent>,
    masker: SecretMasker,
    succeeded: Vec<String>,
    unchanged: Vec<String>,
    failed: BTreeMap<String, String>,
    skipped: BTreeMap<String, String>,
    cancelled: bool,
    needs_approval: bool,
}

impl Run {
    async fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event).await;
    }

    async fn skip(&mut self, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        info!(resource = %name, reason = %reason, "Skipping resource");
        self.skipped.insert(name.to_string(), reason.clone());
        self.emit(RunEvent::ResourceSkipped {
            resource: name.to_string(),
            reason,
        })
        .await;
    }

    async fn fail(&mut self, name: &str, message: impl Into<String>) {
        let message = self.masker.mask(&message.into());
        error!(resource = %name, error = %message, "Resource failed");
        self.failed.insert(name.to_string(), message.clone());
        self.emit(RunEvent::ResourceFailed {
            resource: name.to_string(),
            message,
        })
        .await;
    }

    async fn lock(&self) -> Result<StateLease> {
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            stack: self.stack.clone(),
            run_type: self.run_type,
        })
        .await;
        let lease = self
            .store
            .lock(&self.stack, self.run_id, &self.config.holder)
            .await?;
        info!(stack = %self.stack, run_id = %self.run_id, run_type = %self.run_type, "Run started");
        Ok(lease)
    }

    async fn release(&self, lease: StateLease) {
        if let Err(e) = self.store.unlock(lease).await {
            error!(stack = %self.stack, error = %e, "Failed to release state lock");
        }
    }

    async fn finish(self, result: Result<RunReport>) -> Result<RunReport> {
        let status = match &result {
            Ok(report) => report.status,
            Err(e) => {
                error!(stack = %self.stack, error = %self.masker.mask(&e.to_string()), "Run failed");
                StackRunStatus::Failed
            }
        };
        info!(stack = %self.stack, run_id = %self.run_id, status = %status, "Run completed");
        self.emit(RunEvent::RunCompleted { status }).await;
        result
    }

    fn report(&self, state_version: u64) -> RunReport {
        let status = if self.needs_approval {
            StackRunStatus::NeedsApproval
        } else if self.cancelled {
            StackRunStatus::Cancelled
        } else if self.failed.is_empty() && self.skipped.is_empty() {
            StackRunStatus::Succeeded
        } else if !self.succeeded.is_empty() || !self.unchanged.is_empty() {
            StackRunStatus::PartiallySucceeded
        } else {
            StackRunStatus::Failed
        };
        RunReport {
            run_id: self.run_id,
            stack: self.stack.clone(),
            run_type: self.run_type,
            status,
            succeeded: self.succeeded.clone(),
            unchanged: self.unchanged.clone(),
            failed: self.failed.clone(),
            skipped: self.skipped.clone(),
            cancelled: self.cancelled,
            state_version,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }

    async fn up(&mut self, program: StackProgram, options: RunOptions) -> Result<RunReport> {
        let graph = program.graph()?;
        let lease = self.lock().await?;
        let result = self.up_locked(&lease, &graph, &program.outputs, &options).await;
        self.release(lease).await;
        Ok(self.report(result?))
    }

    async fn up_locked(
        &mut self,
        lease: &StateLease,
        graph: &ResourceGraph,
        outputs: &BTreeMap<String, PropertyValue>,
        options: &RunOptions,
    ) -> Result<u64> {
        let mut state = self
            .store
            .load(&self.stack)
            .await?
            .unwrap_or_else(|| StackState::new(&self.stack));
        let fingerprinter = Fingerprinter::new(&state.secret_salt);

        let values = graph
            .declarations()
            .iter()
            .flat_map(|d| d.properties.values())
            .chain(outputs.values());
        let stacks = StackOutputs::load(
            self.store.as_ref(),
            self.secrets.as_ref(),
            referenced_stacks(values),
        )
        .await?;
        for decl in graph.declarations() {
            decl.properties
                .values()
                .for_each(|v| v.collect_secrets(&mut self.masker));
        }
        outputs
            .values()
            .for_each(|v| v.collect_secrets(&mut self.masker));
        stacks.collect_secrets(&mut self.masker);

        let drift = if options.refresh {
            detect_drift(&state, &self.providers).await?
        } else {
            DriftReport::default()
        };
        let plan = plan_changes(graph, &state, &stacks, &drift);
        info!(stack = %self.stack, plan = %plan.summary(), "Plan computed");
        self.emit(RunEvent::PlanComputed {
            summary: plan.summary(),
            requires_approval: plan.requires_approval,
        })
        .await;

        if plan.requires_approval && !options.approve {
            warn!(stack = %self.stack, "Drift detected; approval required before applying");
            self.needs_approval = true;
            return Ok(state.version);
        }

        let forced: HashSet<String> = drift
            .fields
            .keys()
            .chain(drift.missing.iter())
            .cloned()
            .collect();
        let stacks = Arc::new(stacks);
        let live = self
            .apply_graph(lease, &mut state, graph, &stacks, &fingerprinter, &forced, &options.cancel)
            .await?;

        if !self.cancelled {
            self.delete_removed(lease, &mut state, |name| graph.contains(name), &options.cancel)
                .await?;
        }

        self.publish_outputs(&mut state, outputs, &live, &stacks, &fingerprinter)
            .await?;
        state.last_run = Some(self.run_id);
        let saved = self.store.save(lease, &state).await?;
        Ok(saved.version)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_graph(
        &mut self,
        lease: &StateLease,
        state: &mut StackState,
        graph: &ResourceGraph,
        stacks: &Arc<StackOutputs>,
        fingerprinter: &Fingerprinter,
        forced: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, DependencyOutputs>> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks: JoinSet<(String, std::result::Result<Applied, TaskFailure>)> = JoinSet::new();
        let mut nodes: HashMap<String, NodeState> = graph
            .order()
            .map(|name| (name.to_string(), NodeState::Pending))
            .collect();
        let mut outputs: HashMap<String, DependencyOutputs> = HashMap::new();
        let mut fatal: Option<Error> = None;

        loop {
            if cancel.is_cancelled() && !self.cancelled {
                warn!(stack = %self.stack, "Cancellation requested; waiting for in-flight resources");
                self.cancelled = true;
            }

            // Graph order is topological, so skips propagate in one pass.
            if fatal.is_none() && !self.cancelled {
                for name in graph.order() {
                    if nodes[name] != NodeState::Pending {
                        continue;
                    }
                    let deps: Vec<&str> = graph.dependencies(name).collect();
                    if let Some(blocked) = deps.iter().find(|d| nodes[**d] == NodeState::Failed) {
                        let reason = format!("dependency '{blocked}' did not complete");
                        self.skip(name, reason).await;
                        nodes.insert(name.to_string(), NodeState::Failed);
                        continue;
                    }
                    if !deps.iter().all(|d| nodes[*d] == NodeState::Done) {
                        continue;
                    }
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        continue;
                    };
                    let Some(decl) = graph.get(name) else {
                        continue;
                    };

                    let task = ResourceTask {
                        stack: self.stack.clone(),
                        decl: decl.clone(),
                        dependencies: deps.iter().map(|d| d.to_string()).collect(),
                        record: state.resources.get(name).cloned(),
                        force: forced.contains(name),
                        upstream: deps
                            .iter()
                            .filter_map(|d| outputs.get(*d).map(|o| (d.to_string(), o.clone())))
                            .collect(),
                        stacks: stacks.clone(),
                        providers: self.providers.clone(),
                        fingerprinter: fingerprinter.clone(),
                        masker: self.masker.clone(),
                        timeout: self.config.timeout,
                        poll_interval: self.config.poll_interval,
                        events: self.events.clone(),
                        pending: None,
                    };
                    nodes.insert(name.to_string(), NodeState::Running);
                    let task_name = name.to_string();
                    tasks.spawn(async move {
                        let _permit = permit;
                        (task_name, task.run().await)
                    });
                }
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                _ = cancel.cancelled(), if !self.cancelled => None,
                joined = tasks.join_next() => Some(joined),
            };
            let Some(joined) = joined else {
                continue;
            };
            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((name, Ok(applied))) => {
                    if let Some(record) = applied.record {
                        self.record(lease, state, &name, record, &mut fatal).await;
                    }
                    if applied.action == ChangeAction::Same {
                        debug!(resource = %name, "Resource unchanged");
                        self.unchanged.push(name.clone());
                        self.emit(RunEvent::ResourceUnchanged {
                            resource: name.clone(),
                        })
                        .await;
                    } else {
                        info!(resource = %name, action = %applied.action, "Resource ready");
                        self.succeeded.push(name.clone());
                        self.emit(RunEvent::ResourceCompleted {
                            resource: name.clone(),
                            action: applied.action,
                        })
                        .await;
                    }
                    outputs.insert(name.clone(), applied.outputs);
                    nodes.insert(name, NodeState::Done);
                }
                Ok((name, Err(failure))) => {
                    if let Some(record) = failure.record {
                        warn!(resource = %name, "Recording tainted resource");
                        self.record(lease, state, &name, record, &mut fatal).await;
                    }
                    self.fail(&name, failure.message).await;
                    nodes.insert(name, NodeState::Failed);
                }
                Err(e) => {
                    error!(stack = %self.stack, error = %e, "Resource task aborted");
                    fatal.get_or_insert(Error::Internal(format!("resource task aborted: {e}")));
                }
            }
        }

        for name in graph.order() {
            if matches!(nodes[name], NodeState::Pending | NodeState::Running) {
                let reason = match &fatal {
                    Some(e) => format!("run aborted: {e}"),
                    None if self.cancelled => "cancelled".to_string(),
                    None => "not started".to_string(),
                };
                self.skip(name, reason).await;
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    /// Store a resource's record and save state. A failed save stops the run.
    async fn record(
        &mut self,
        lease: &StateLease,
        state: &mut StackState,
        name: &str,
        record: ResourceRecord,
        fatal: &mut Option<Error>,
    ) {
        state.resources.insert(name.to_string(), record);
        if fatal.is_some() {
            return;
        }
        match self.store.save(lease, state).await {
            Ok(saved) => *state = saved,
            Err(e) => {
                error!(stack = %self.stack, error = %e, "Failed to save state; stopping run");
                *fatal = Some(e);
            }
        }
    }

    /// Delete recorded resources that `keep` rejects, dependents first. A
    /// resource whose dependent could not be deleted is left in place.
    async fn delete_removed(
        &mut self,
        lease: &StateLease,
        state: &mut StackState,
        keep: impl Fn(&str) -> bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let order = removed_in_delete_order(state, keep);
        let mut blocked: HashMap<String, String> = HashMap::new();

        for name in order {
            let Some(record) = state.resources.get(&name).cloned() else {
                continue;
            };
            if record.lookup {
                debug!(resource = %name, "Forgetting lookup");
                state.resources.remove(&name);
                *state = self.store.save(lease, state).await?;
                continue;
            }

            let outcome = if cancel.is_cancelled() {
                self.cancelled = true;
                self.skip(&name, "cancelled").await;
                false
            } else if let Some(dependent) = blocked.get(&name).cloned() {
                self.skip(&name, format!("dependent '{dependent}' was not deleted"))
                    .await;
                false
            } else if record.protect {
                self.fail(&name, "resource is protected; remove `protect` to delete it")
                    .await;
                false
            } else {
                self.emit(RunEvent::ResourceStarted {
                    resource: name.clone(),
                    action: ChangeAction::Delete,
                })
                .await;
                let locator = ResourceLocator::from_record(&record);
                info!(resource = %name, target = %locator, "Deleting resource");
                let result = match self.providers.for_type(&record.resource_type) {
                    Ok(provider) => provider.delete(&locator).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok(()) => {
                        state.resources.remove(&name);
                        *state = self.store.save(lease, state).await?;
                        self.succeeded.push(name.clone());
                        self.emit(RunEvent::ResourceCompleted {
                            resource: name.clone(),
                            action: ChangeAction::Delete,
                        })
                        .await;
                        true
                    }
                    Err(e) => {
                        self.fail(&name, e.to_string()).await;
                        false
                    }
                }
            };

            if !outcome {
                for dependency in &record.dependencies {
                    blocked
                        .entry(dependency.clone())
                        .or_insert_with(|| name.clone());
                }
            }
        }
        Ok(())
    }

    /// Resolve declared outputs. Secret values go to the secret store and
    /// only their fingerprint is recorded; unresolvable outputs keep their
    /// previous value.
    async fn publish_outputs(
        &mut self,
        state: &mut StackState,
        declared: &BTreeMap<String, PropertyValue>,
        live: &HashMap<String, DependencyOutputs>,
        stacks: &StackOutputs,
        fingerprinter: &Fingerprinter,
    ) -> Result<()> {
        let mut published = BTreeMap::new();
        for (key, value) in declared {
            let references = value.references();
            let resolved = match materialize(&self.providers, live, &references).await {
                Ok(resources) => Resolver::new(&resources, stacks).resolve(value),
                Err(e) => Err(e),
            };
            match resolved {
                Ok(value) if value.contains_secret() => {
                    let plaintext = match value.to_plain_json()? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let fingerprint = fingerprinter.fingerprint(&plaintext);
                    self.secrets
                        .set(
                            &output_secret_path(&self.stack, key),
                            SecretValue::String(plaintext),
                        )
                        .await?;
                    published.insert(key.clone(), serde_json::json!({ SECRET_MARKER: fingerprint }));
                }
                Ok(value) => {
                    published.insert(key.clone(), value.to_plain_json()?);
                }
                Err(e) => {
                    warn!(
                        stack = %self.stack,
                        output = %key,
                        error = %self.masker.mask(&e.to_string()),
                        "Output unresolved; keeping previous value"
                    );
                    if let Some(previous) = state.outputs.get(key) {
                        published.insert(key.clone(), previous.clone());
                    }
                }
            }
        }

        for (key, previous) in &state.outputs {
            if !declared.contains_key(key) && is_secret_marker(previous) {
                self.secrets
                    .delete(&output_secret_path(&self.stack, key))
                    .await?;
            }
        }
        state.outputs = published;
        Ok(())
    }

    async fn destroy(&mut self, options: RunOptions) -> Result<RunReport> {
        let lease = self.lock().await?;
        let result = self.destroy_locked(&lease, &options.cancel).await;
        self.release(lease).await;
        Ok(self.report(result?))
    }

    async fn destroy_locked(&mut self, lease: &StateLease, cancel: &CancellationToken) -> Result<u64> {
        let Some(mut state) = self.store.load(&self.stack).await? else {
            info!(stack = %self.stack, "Nothing recorded; nothing to destroy");
            return Ok(0);
        };

        let plan = plan_destroy(&state);
        info!(stack = %self.stack, plan = %plan.summary(), "Plan computed");
        self.emit(RunEvent::PlanComputed {
            summary: plan.summary(),
            requires_approval: false,
        })
        .await;

        self.delete_removed(lease, &mut state, |_| false, cancel)
            .await?;

        if state.resources.is_empty() {
            for (key, value) in &state.outputs {
                if is_secret_marker(value) {
                    self.secrets
                        .delete(&output_secret_path(&self.stack, key))
                        .await?;
                }
            }
            state.outputs.clear();
        }
        state.last_run = Some(self.run_id);
        let saved = self.store.save(lease, &state).await?;
        Ok(saved.version)
    }
}
