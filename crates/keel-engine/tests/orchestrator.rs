//! End-to-end runs against the in-memory provider and state store.

use keel_core::provider::{ProviderRegistry, ResourceProvider};
use keel_core::resource::DeclarationMode;
use keel_core::secret::{MemorySecretStore, REDACTED};
use keel_core::stack::{ChangeAction, RunReport, StackRunStatus};
use keel_core::state::StateStore;
use keel_core::value::{PropertyValue, Reference, TemplatePart};
use keel_core::{Error, ResourceDeclaration, ResourceType, RunId};
use keel_deployer::{MemoryEvent, MemoryProvider};
use keel_engine::{
    MemoryStateStore, OrchestratorConfig, RunEvent, RunOptions, StackOrchestrator, StackProgram,
    wait_for_run,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    provider: Arc<MemoryProvider>,
    state: Arc<MemoryStateStore>,
    orchestrator: StackOrchestrator,
}

fn harness() -> Harness {
    harness_with_parallelism(4)
}

fn harness_with_parallelism(parallelism: usize) -> Harness {
    let provider = Arc::new(MemoryProvider::new());
    let state = Arc::new(MemoryStateStore::new());
    let registry = ProviderRegistry::new().with(provider.clone() as Arc<dyn ResourceProvider>);
    let orchestrator = StackOrchestrator::new(
        registry,
        state.clone(),
        Arc::new(MemorySecretStore::new()),
    )
    .with_config(OrchestratorConfig {
        parallelism,
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        holder: "test".to_string(),
    });
    Harness {
        provider,
        state,
        orchestrator,
    }
}

impl Harness {
    async fn up(&self, program: StackProgram, options: RunOptions) -> (RunReport, Vec<RunEvent>) {
        let (events, handle) = self.orchestrator.up(program, options);
        wait_for_run(events, handle).await.unwrap()
    }

    async fn destroy(&self, stack: &str) -> RunReport {
        let (events, handle) = self.orchestrator.destroy(stack, RunOptions::default());
        wait_for_run(events, handle).await.unwrap().0
    }
}

fn config_map() -> ResourceType {
    ResourceType::manifest("v1", "ConfigMap")
}

fn namespace(name: &str) -> ResourceDeclaration {
    ResourceDeclaration::new(name, ResourceType::Namespace)
}

fn config(name: &str, data: serde_json::Value) -> ResourceDeclaration {
    ResourceDeclaration::new(name, config_map())
        .with_namespace("app")
        .with_property("data", PropertyValue::from_json(data))
}

fn resource_ref(resource: &str, path: &str) -> PropertyValue {
    PropertyValue::Ref(Reference::Resource {
        resource: resource.to_string(),
        path: path.to_string(),
    })
}

fn stack_ref(stack: &str, output: &str) -> Reference {
    Reference::Stack {
        stack: stack.to_string(),
        output: output.to_string(),
    }
}

fn secret(value: &str) -> PropertyValue {
    PropertyValue::secret(PropertyValue::string(value))
}

fn basic_program() -> StackProgram {
    StackProgram::new("web")
        .resource(namespace("app"))
        .resource(config("settings", json!({"mode": "production"})).depends_on("app"))
}

#[tokio::test]
async fn test_second_apply_is_a_no_op() {
    let h = harness();
    let (first, _) = h.up(basic_program(), RunOptions::default()).await;
    assert_eq!(first.status, StackRunStatus::Succeeded);
    assert_eq!(first.succeeded.len(), 2);
    let writes = h.provider.writes();
    assert_eq!(writes, 2);

    let (second, events) = h.up(basic_program(), RunOptions::default()).await;
    assert_eq!(second.status, StackRunStatus::Succeeded);
    assert!(second.succeeded.is_empty());
    assert_eq!(second.unchanged.len(), 2);
    assert_eq!(h.provider.writes(), writes);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::PlanComputed { summary, .. } if summary.unchanged == 2 && summary.to_add == 0
    )));

    let plan = h.orchestrator.preview(&basic_program(), true).await.unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_dependents_wait_for_readiness() {
    let h = harness();
    h.provider.ready_after("database", 3);
    let program = StackProgram::new("ordering")
        .resource(config("database", json!({"role": "primary"})))
        .resource(
            config("api", json!({"dsn": "postgres"}))
                .depends_on("database"),
        );

    let (report, events) = h.up(program, RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);

    let ready = h
        .provider
        .position(&MemoryEvent::Ready("database".into()))
        .unwrap();
    let dependent = h
        .provider
        .position(&MemoryEvent::Applied("api".into()))
        .unwrap();
    assert!(ready < dependent);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::ResourceWaiting { resource, .. } if resource == "database"
    )));
}

#[tokio::test]
async fn test_reference_waits_on_referenced_resource() {
    let h = harness();
    h.provider.ready_after("primary", 2);
    let program = StackProgram::new("refs")
        .resource(config("primary", json!({"host": "db.internal"})))
        .resource(
            ResourceDeclaration::new("client", config_map())
                .with_namespace("app")
                .with_property(
                    "data",
                    PropertyValue::Map(
                        [("upstream".to_string(), resource_ref("primary", "data.host"))]
                            .into_iter()
                            .collect(),
                    ),
                ),
        );

    let (report, _) = h.up(program, RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    let client = h.provider.object(&config_map(), Some("app"), "client").unwrap();
    assert_eq!(client["data"]["upstream"], "db.internal");
    assert!(
        h.provider.position(&MemoryEvent::Ready("primary".into()))
            < h.provider.position(&MemoryEvent::Applied("client".into()))
    );
}

fn scaled(image: &str, replicas: i64) -> StackProgram {
    let mut deployment = ResourceDeclaration::new("web", ResourceType::manifest("apps/v1", "Deployment"))
        .with_namespace("app")
        .with_property(
            "spec",
            PropertyValue::from_json(json!({"replicas": replicas, "image": image})),
        );
    deployment.options.ignore_changes = vec!["spec.replicas".to_string()];
    StackProgram::new("scaled").resource(deployment)
}

#[tokio::test]
async fn test_ignored_field_never_diffs_or_drifts() {
    let h = harness();
    let deployment = ResourceType::manifest("apps/v1", "Deployment");
    h.up(scaled("nginx:1.27", 2), RunOptions::default()).await;
    assert!(h.provider.mutate(&deployment, Some("app"), "web", "spec.replicas", json!(5)));
    let writes = h.provider.writes();

    let plan = h.orchestrator.preview(&scaled("nginx:1.27", 3), true).await.unwrap();
    assert!(plan.is_empty());
    assert!(!plan.requires_approval);

    let options = RunOptions {
        refresh: true,
        ..Default::default()
    };
    let (report, _) = h.up(scaled("nginx:1.27", 3), options).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(h.provider.writes(), writes);

    // A real change still keeps the externally managed value.
    let (report, _) = h.up(scaled("nginx:1.28", 3), RunOptions::default()).await;
    assert_eq!(report.succeeded, vec!["web".to_string()]);
    let live = h.provider.object(&deployment, Some("app"), "web").unwrap();
    assert_eq!(live["spec"]["image"], "nginx:1.28");
    assert_eq!(live["spec"]["replicas"], 5);
}

fn credentials(password: &str) -> StackProgram {
    let secret_object = ResourceDeclaration::new("credentials", ResourceType::manifest("v1", "Secret"))
        .with_namespace("app")
        .with_property(
            "stringData",
            PropertyValue::Map(
                [("password".to_string(), secret(password))]
                    .into_iter()
                    .collect(),
            ),
        );
    let dsn = PropertyValue::Template(vec![
        TemplatePart::Literal("postgres://app:".to_string()),
        TemplatePart::Ref(Reference::Resource {
            resource: "credentials".to_string(),
            path: "stringData.password".to_string(),
        }),
        TemplatePart::Literal("@db:5432/app".to_string()),
    ]);
    let consumer = ResourceDeclaration::new("client", config_map())
        .with_namespace("app")
        .with_property(
            "data",
            PropertyValue::Map([("dsn".to_string(), dsn)].into_iter().collect()),
        );
    StackProgram::new("secrets")
        .resource(secret_object)
        .resource(consumer)
        .output("password", resource_ref("credentials", "stringData.password"))
        .output("namespace", "app")
}

#[tokio::test]
async fn test_secrets_never_reach_state_or_plans() {
    let h = harness();
    let plan = h.orchestrator.preview(&credentials("hunter2"), false).await.unwrap();
    assert!(!serde_json::to_string(&plan).unwrap().contains("hunter2"));

    let (report, _) = h.up(credentials("hunter2"), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);

    // The remote gets plaintext; recorded state only fingerprints.
    let client = h.provider.object(&config_map(), Some("app"), "client").unwrap();
    assert_eq!(client["data"]["dsn"], "postgres://app:hunter2@db:5432/app");
    let state = h.state.load("secrets").await.unwrap().unwrap();
    let recorded = serde_json::to_string(&state).unwrap();
    assert!(!recorded.contains("hunter2"));
    assert!(recorded.contains("$secret"));

    let redacted = h.orchestrator.outputs("secrets", false).await.unwrap();
    assert_eq!(redacted["password"], REDACTED);
    assert_eq!(redacted["namespace"], "app");
    let revealed = h.orchestrator.outputs("secrets", true).await.unwrap();
    assert_eq!(revealed["password"], "hunter2");

    // Rotating the secret is a change, and the plan still shows no plaintext.
    let plan = h.orchestrator.preview(&credentials("correct-horse"), false).await.unwrap();
    let rotated = plan.changes.iter().find(|c| c.name == "credentials").unwrap();
    assert_eq!(rotated.action, ChangeAction::Update);
    let text = serde_json::to_string(&plan).unwrap();
    assert!(!text.contains("hunter2"));
    assert!(!text.contains("correct-horse"));
}

#[tokio::test]
async fn test_failure_messages_are_masked() {
    let h = harness();
    h.provider.fail_on("credentials", "admission webhook rejected password hunter2");
    let (report, events) = h.up(credentials("hunter2"), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Failed);
    let message = &report.failed["credentials"];
    assert!(message.contains("admission webhook"));
    assert!(!message.contains("hunter2"));
    assert!(report.skipped.contains_key("client"));
    for event in &events {
        assert!(!format!("{event:?}").contains("hunter2"));
    }
}

fn database_stack() -> StackProgram {
    StackProgram::new("database")
        .resource(config("postgres", json!({"host": "db.svc"})))
        .output("host", resource_ref("postgres", "data.host"))
        .output("port", 5432_i64)
        .output("password", secret("s3cret"))
}

fn app_stack() -> StackProgram {
    let url = PropertyValue::Template(vec![
        TemplatePart::Literal("postgres://".to_string()),
        TemplatePart::Ref(stack_ref("database", "host")),
        TemplatePart::Literal(":".to_string()),
        TemplatePart::Ref(stack_ref("database", "port")),
    ]);
    let data = [
        ("host".to_string(), PropertyValue::Ref(stack_ref("database", "host"))),
        ("port".to_string(), PropertyValue::Ref(stack_ref("database", "port"))),
        ("password".to_string(), PropertyValue::Ref(stack_ref("database", "password"))),
        ("url".to_string(), url),
    ];
    StackProgram::new("app").resource(
        ResourceDeclaration::new("app-config", config_map())
            .with_namespace("app")
            .with_property("data", PropertyValue::Map(data.into_iter().collect())),
    )
}

#[tokio::test]
async fn test_cross_stack_outputs() {
    let h = harness();

    let (report, _) = h.up(app_stack(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Failed);
    assert!(report.failed["app-config"].contains("unresolved reference"));
    assert!(h.provider.applied().is_empty());

    let (report, _) = h.up(database_stack(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);

    let (report, _) = h.up(app_stack(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    let live = h.provider.object(&config_map(), Some("app"), "app-config").unwrap();
    assert_eq!(live["data"]["host"], "db.svc");
    assert_eq!(live["data"]["port"], 5432);
    assert_eq!(live["data"]["url"], "postgres://db.svc:5432");
    assert_eq!(live["data"]["password"], "s3cret");

    let state = h.state.load("app").await.unwrap().unwrap();
    assert!(!serde_json::to_string(&state).unwrap().contains("s3cret"));
}

#[tokio::test]
async fn test_failure_skips_only_its_branch() {
    let h = harness();
    let mut program = StackProgram::new("branches").resource(namespace("app"));
    for branch in ["a", "b", "c"] {
        program = program
            .resource(config(&format!("{branch}1"), json!({})).depends_on("app"))
            .resource(config(&format!("{branch}2"), json!({})).depends_on(format!("{branch}1")));
    }
    h.provider.fail_on("b1", "quota exceeded");

    let (report, _) = h.up(program, RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::PartiallySucceeded);
    assert_eq!(report.failed.keys().collect::<Vec<_>>(), vec!["b1"]);
    assert_eq!(report.skipped.keys().collect::<Vec<_>>(), vec!["b2"]);
    assert!(report.skipped["b2"].contains("b1"));
    for done in ["app", "a1", "a2", "c1", "c2"] {
        assert!(report.succeeded.contains(&done.to_string()), "{done} should succeed");
    }

    let state = h.state.load("branches").await.unwrap().unwrap();
    assert!(state.resources.contains_key("c2"));
    assert!(!state.resources.contains_key("b1"));
    assert!(!state.resources.contains_key("b2"));
}

#[tokio::test]
async fn test_cancel_lets_in_flight_finish() {
    let h = harness();
    h.provider.delay_apply("slow", Duration::from_millis(300));
    let program = StackProgram::new("cancel")
        .resource(config("slow", json!({})))
        .resource(config("after", json!({})).depends_on("slow"));

    let options = RunOptions::default();
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let (report, _) = h.up(program, options).await;
    assert_eq!(report.status, StackRunStatus::Cancelled);
    assert!(report.cancelled);
    assert_eq!(report.succeeded, vec!["slow".to_string()]);
    assert_eq!(report.skipped["after"], "cancelled");

    let state = h.state.load("cancel").await.unwrap().unwrap();
    assert!(state.resources.contains_key("slow"));
    assert!(h.state.current_lock("cancel").await.unwrap().is_none());
}

#[tokio::test]
async fn test_locked_stack_is_refused() {
    let h = harness();
    let lease = h.state.lock("web", RunId::new(), "someone else").await.unwrap();

    let (events, handle) = h.orchestrator.up(basic_program(), RunOptions::default());
    let err = wait_for_run(events, handle).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(err.to_string().contains("someone else"));
    assert!(h.provider.applied().is_empty());

    h.state.unlock(lease).await.unwrap();
    let (report, _) = h.up(basic_program(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
}

#[tokio::test]
async fn test_drift_requires_approval() {
    let h = harness();
    h.up(basic_program(), RunOptions::default()).await;
    h.provider
        .mutate(&config_map(), Some("app"), "settings", "data.mode", json!("debug"));
    let writes = h.provider.writes();

    let refresh = RunOptions {
        refresh: true,
        ..Default::default()
    };
    let (report, _) = h.up(basic_program(), refresh.clone()).await;
    assert_eq!(report.status, StackRunStatus::NeedsApproval);
    assert_eq!(h.provider.writes(), writes);

    let approved = RunOptions {
        approve: true,
        ..refresh
    };
    let (report, events) = h.up(basic_program(), approved).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::ResourceCompleted { resource, action: ChangeAction::Update } if resource == "settings"
    )));
    let live = h.provider.object(&config_map(), Some("app"), "settings").unwrap();
    assert_eq!(live["data"]["mode"], "production");
}

#[tokio::test]
async fn test_refresh_forgets_vanished_resources() {
    let h = harness();
    h.up(basic_program(), RunOptions::default()).await;
    h.provider.remove_object(&config_map(), Some("app"), "settings");

    let plan = h.orchestrator.refresh("web").await.unwrap();
    assert!(plan.requires_approval);
    let change = plan.changes.iter().find(|c| c.name == "settings").unwrap();
    assert_eq!(change.action, ChangeAction::Delete);
    assert!(change.drift);

    let state = h.state.load("web").await.unwrap().unwrap();
    assert!(!state.resources.contains_key("settings"));

    // The next apply recreates it.
    let (report, _) = h.up(basic_program(), RunOptions::default()).await;
    assert_eq!(report.succeeded, vec!["settings".to_string()]);
}

#[tokio::test]
async fn test_removed_resources_are_deleted_dependents_first() {
    let h = harness();
    let program = StackProgram::new("cleanup")
        .resource(namespace("app"))
        .resource(config("db", json!({})).depends_on("app"))
        .resource(config("api", json!({})).depends_on("db"));
    h.up(program, RunOptions::default()).await;

    let (report, _) = h
        .up(StackProgram::new("cleanup").resource(namespace("app")), RunOptions::default())
        .await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(h.provider.deleted(), vec!["api".to_string(), "db".to_string()]);

    let report = h.destroy("cleanup").await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(
        h.provider.deleted(),
        vec!["api".to_string(), "db".to_string(), "app".to_string()]
    );
    let state = h.state.load("cleanup").await.unwrap().unwrap();
    assert!(state.resources.is_empty());
}

#[tokio::test]
async fn test_protected_resource_blocks_its_dependencies() {
    let h = harness();
    let mut guarded = config("guarded", json!({})).depends_on("app");
    guarded.options.protect = true;
    let program = StackProgram::new("protected")
        .resource(namespace("app"))
        .resource(guarded);
    h.up(program, RunOptions::default()).await;

    let report = h.destroy("protected").await;
    assert_eq!(report.status, StackRunStatus::Failed);
    assert!(report.failed["guarded"].contains("protected"));
    assert!(report.skipped["app"].contains("guarded"));
    assert!(h.provider.deleted().is_empty());
}

#[tokio::test]
async fn test_readiness_timeout_fails_resource() {
    let h = harness();
    h.provider.ready_after("stuck", 1_000);
    let mut stuck = config("stuck", json!({}));
    stuck.options.timeout = Some(Duration::from_millis(100));

    let (report, _) = h
        .up(StackProgram::new("timeouts").resource(stuck), RunOptions::default())
        .await;
    assert_eq!(report.status, StackRunStatus::Failed);
    assert!(report.failed["stuck"].contains("not ready after 100ms"));
}

fn stuck_program() -> StackProgram {
    let mut stuck = config("stuck", json!({"phase": "one"}));
    stuck.options.timeout = Some(Duration::from_millis(100));
    StackProgram::new("timeouts").resource(stuck)
}

#[tokio::test]
async fn test_resource_that_never_gets_ready_is_still_destroyed() {
    let h = harness();
    h.provider.ready_after("stuck", 1_000);

    let (report, _) = h.up(stuck_program(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Failed);
    assert!(report.failed.contains_key("stuck"));
    assert!(h.provider.object(&config_map(), Some("app"), "stuck").is_some());

    let state = h.state.load("timeouts").await.unwrap().unwrap();
    assert!(state.resources["stuck"].tainted);

    let report = h.destroy("timeouts").await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(h.provider.deleted(), vec!["stuck".to_string()]);
    assert!(h.provider.object(&config_map(), Some("app"), "stuck").is_none());
    let state = h.state.load("timeouts").await.unwrap().unwrap();
    assert!(state.resources.is_empty());
}

#[tokio::test]
async fn test_tainted_resource_is_reapplied() {
    let h = harness();
    h.provider.ready_after("stuck", 1_000);
    h.up(stuck_program(), RunOptions::default()).await;

    let plan = h.orchestrator.preview(&stuck_program(), false).await.unwrap();
    let change = plan.changes.iter().find(|c| c.name == "stuck").unwrap();
    assert_eq!(change.action, ChangeAction::Update);

    h.provider.ready_after("stuck", 0);
    let (report, _) = h.up(stuck_program(), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(report.succeeded, vec!["stuck".to_string()]);
    assert_eq!(h.provider.applied(), vec!["stuck".to_string(), "stuck".to_string()]);

    let state = h.state.load("timeouts").await.unwrap().unwrap();
    assert!(!state.resources["stuck"].tainted);
    let (report, _) = h.up(stuck_program(), RunOptions::default()).await;
    assert_eq!(report.unchanged, vec!["stuck".to_string()]);
}

fn independent_program(count: usize) -> StackProgram {
    (0..count).fold(StackProgram::new("wide"), |program, i| {
        program.resource(config(&format!("cfg{i}"), json!({})))
    })
}

#[tokio::test]
async fn test_independent_resources_apply_concurrently_up_to_the_limit() {
    let h = harness_with_parallelism(2);
    for i in 0..4 {
        h.provider
            .delay_apply(&format!("cfg{i}"), Duration::from_millis(150));
    }

    let (report, _) = h.up(independent_program(4), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(report.succeeded.len(), 4);
    assert_eq!(h.provider.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_parallelism_of_one_applies_serially() {
    let h = harness_with_parallelism(1);
    for i in 0..3 {
        h.provider
            .delay_apply(&format!("cfg{i}"), Duration::from_millis(30));
    }

    let (report, _) = h.up(independent_program(3), RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    assert_eq!(h.provider.peak_concurrency(), 1);
}

#[tokio::test]
async fn test_lookup_reads_without_owning() {
    let h = harness();
    let secret_kind = ResourceType::manifest("v1", "Secret");
    h.provider.insert_object(
        &secret_kind,
        Some("postgresql"),
        "superuser",
        json!({"metadata": {"name": "superuser"}, "data": {"password": "pg-root"}}),
    );
    let mut lookup = ResourceDeclaration::new("superuser", secret_kind.clone());
    lookup.mode = DeclarationMode::Lookup {
        id: "postgresql/superuser".to_string(),
    };
    let consumer = ResourceDeclaration::new("bootstrap", config_map())
        .with_namespace("app")
        .with_property(
            "data",
            PropertyValue::Map(
                [("root".to_string(), resource_ref("superuser", "data.password"))]
                    .into_iter()
                    .collect(),
            ),
        );
    let program = StackProgram::new("lookups").resource(lookup).resource(consumer);

    let (report, _) = h.up(program, RunOptions::default()).await;
    assert_eq!(report.status, StackRunStatus::Succeeded);
    let live = h.provider.object(&config_map(), Some("app"), "bootstrap").unwrap();
    assert_eq!(live["data"]["root"], "pg-root");
    let state = h.state.load("lookups").await.unwrap().unwrap();
    assert!(state.resources["superuser"].lookup);
    assert!(!serde_json::to_string(&state).unwrap().contains("pg-root"));

    h.destroy("lookups").await;
    assert_eq!(h.provider.deleted(), vec!["bootstrap".to_string()]);
    assert!(h.provider.object(&secret_kind, Some("postgresql"), "superuser").is_some());
}
