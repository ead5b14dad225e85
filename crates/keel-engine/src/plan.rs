//! Planning: compare declarations against recorded state.

use keel_core::provider::{Observed, ProviderRegistry, ResourceLocator};
use keel_core::resource::DeclarationMode;
use keel_core::secret::Fingerprinter;
use keel_core::stack::{ChangeAction, Plan, ResourceChange, ResourceRecord, StackState};
use keel_core::value::PropertyValue;
use keel_core::{ResourceDeclaration, Result};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::diff::{changed_fields, drift_fields, is_ignored};
use crate::graph::{ResourceGraph, order_by_dependencies};
use crate::references::{Resolver, StackOutputs};

/// Remote state gathered by a refresh.
#[derive(Debug, Default)]
pub struct DriftReport {
    /// Resource name to drifted field paths.
    pub fields: BTreeMap<String, Vec<String>>,
    /// Recorded resources whose remote object no longer exists.
    pub missing: Vec<String>,
    /// Freshly observed objects, by resource name.
    pub observed: HashMap<String, Observed>,
}

impl DriftReport {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.missing.is_empty()
    }

    pub fn is_drifted(&self, name: &str) -> bool {
        self.fields.contains_key(name) || self.missing.iter().any(|m| m == name)
    }
}

/// Read every recorded object and compare it with its recorded inputs.
pub async fn detect_drift(state: &StackState, providers: &ProviderRegistry) -> Result<DriftReport> {
    let mut report = DriftReport::default();
    for (name, record) in &state.resources {
        let provider = providers.for_type(&record.resource_type)?;
        let locator = ResourceLocator::from_record(record);
        match provider.read(&locator).await? {
            None => {
                info!(resource = %name, "Recorded resource no longer exists");
                report.missing.push(name.clone());
            }
            Some(observed) => {
                if !record.lookup {
                    let drifted =
                        drift_fields(&record.inputs, &observed.object, &record.ignore_changes);
                    if !drifted.is_empty() {
                        info!(resource = %name, fields = ?drifted, "Drift detected");
                        report.fields.insert(name.clone(), drifted);
                    }
                }
                report.observed.insert(name.clone(), observed);
            }
        }
    }
    Ok(report)
}

/// Whether the change set of a record forces delete-and-recreate.
pub(crate) fn needs_replace(
    record: &ResourceRecord,
    decl: &ResourceDeclaration,
    changed: &[String],
) -> bool {
    let locator = ResourceLocator::from_declaration(decl);
    record.resource_type != decl.resource_type
        || record.remote_name != locator.remote_name
        || record.namespace != locator.namespace
        || changed
            .iter()
            .any(|f| is_ignored(f, &decl.options.replace_on_changes))
}

/// Compute the plan for a stack.
///
/// References to resources that are themselves changing are unknown until
/// apply and show up as `$unknown` in the planned inputs.
pub fn plan_changes(
    graph: &ResourceGraph,
    state: &StackState,
    stacks: &StackOutputs,
    drift: &DriftReport,
) -> Plan {
    let fingerprinter = Fingerprinter::new(&state.secret_salt);
    let mut known: HashMap<String, PropertyValue> = HashMap::new();
    let mut changes = Vec::with_capacity(graph.len());

    for decl in graph.declarations() {
        let record = state.resources.get(&decl.name);
        let resolver = Resolver::new(&known, stacks);
        let after = resolver
            .resolve_partial(&PropertyValue::Map(decl.properties.clone()))
            .to_recorded_json(&fingerprinter);

        let (action, fields, is_drift) = match (&decl.mode, record) {
            (DeclarationMode::Lookup { .. }, _) => (ChangeAction::Read, Vec::new(), false),
            (DeclarationMode::Managed, None) => (ChangeAction::Create, Vec::new(), false),
            (DeclarationMode::Managed, Some(_)) if drift.missing.contains(&decl.name) => {
                (ChangeAction::Create, Vec::new(), true)
            }
            (DeclarationMode::Managed, Some(rec)) => {
                let mut fields = changed_fields(&rec.inputs, &after, &decl.options.ignore_changes);
                let drifted = drift.fields.get(&decl.name);
                if needs_replace(rec, decl, &fields) {
                    (ChangeAction::Replace, fields, false)
                } else if let Some(drifted) = drifted {
                    for f in drifted {
                        if !fields.contains(f) {
                            fields.push(f.clone());
                        }
                    }
                    (ChangeAction::Update, fields, true)
                } else if fields.is_empty() && !rec.tainted {
                    (ChangeAction::Same, fields, false)
                } else {
                    (ChangeAction::Update, fields, false)
                }
            }
        };

        // Apply resolves unchanged resources against recorded outputs too.
        if matches!(action, ChangeAction::Same | ChangeAction::Read) {
            if let Some(record) = record {
                known.insert(
                    decl.name.clone(),
                    PropertyValue::from_json(record.outputs.clone()),
                );
            }
        }

        debug!(resource = %decl.name, action = %action, "Planned");
        changes.push(ResourceChange {
            name: decl.name.clone(),
            resource_type: decl.resource_type.clone(),
            action,
            changed_fields: fields,
            drift: is_drift,
            before: record.map(|r| r.inputs.clone()),
            after: Some(after),
        });
    }

    changes.extend(planned_deletions(state, |name| graph.contains(name)));

    Plan {
        stack: state.stack.clone(),
        requires_approval: !drift.is_empty(),
        changes,
    }
}

/// Plan for tearing down every recorded resource of a stack.
pub fn plan_destroy(state: &StackState) -> Plan {
    Plan {
        stack: state.stack.clone(),
        changes: planned_deletions(state, |_| false),
        requires_approval: false,
    }
}

/// Deletions of recorded resources no longer kept, dependents first.
/// Forgotten lookups are dropped without touching the remote.
fn planned_deletions(state: &StackState, keep: impl Fn(&str) -> bool) -> Vec<ResourceChange> {
    removed_in_delete_order(state, keep)
        .into_iter()
        .filter_map(|name| state.resources.get(&name))
        .filter(|record| !record.lookup)
        .map(|record| ResourceChange {
            name: record.name.clone(),
            resource_type: record.resource_type.clone(),
            action: ChangeAction::Delete,
            changed_fields: Vec::new(),
            drift: false,
            before: Some(record.inputs.clone()),
            after: None,
        })
        .collect()
}

/// Names of recorded resources for which `keep` is false, ordered so every
/// resource comes before the resources it depends on.
pub(crate) fn removed_in_delete_order(
    state: &StackState,
    keep: impl Fn(&str) -> bool,
) -> Vec<String> {
    let removed: HashMap<String, Vec<String>> = state
        .resources
        .iter()
        .filter(|(name, _)| !keep(name))
        .map(|(name, record)| (name.clone(), record.dependencies.clone()))
        .collect();
    let mut order = order_by_dependencies(&removed);
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::ResourceType;
    use keel_core::value::Reference;
    use serde_json::json;

    fn config_map(name: &str, data: serde_json::Value) -> ResourceDeclaration {
        let mut decl = ResourceDeclaration::new(name, ResourceType::manifest("v1", "ConfigMap"));
        decl.properties
            .insert("data".into(), PropertyValue::from_json(data));
        decl
    }

    fn record(name: &str, inputs: serde_json::Value, deps: &[&str]) -> ResourceRecord {
        ResourceRecord {
            name: name.into(),
            resource_type: ResourceType::manifest("v1", "ConfigMap"),
            namespace: None,
            remote_name: name.into(),
            inputs,
            outputs: json!({"data": {"host": "db.svc"}}),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ignore_changes: vec![],
            protect: false,
            lookup: false,
            tainted: false,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_same_update() {
        let mut state = StackState::new("app");
        state
            .resources
            .insert("a".into(), record("a", json!({"data": {"k": "v"}}), &[]));
        state
            .resources
            .insert("b".into(), record("b", json!({"data": {"k": "old"}}), &[]));

        let graph = ResourceGraph::build(vec![
            config_map("a", json!({"k": "v"})),
            config_map("b", json!({"k": "new"})),
            config_map("c", json!({"k": "v"})),
        ])
        .unwrap();

        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        let action = |n: &str| plan.changes.iter().find(|c| c.name == n).unwrap().action;
        assert_eq!(action("a"), ChangeAction::Same);
        assert_eq!(action("b"), ChangeAction::Update);
        assert_eq!(action("c"), ChangeAction::Create);
        let b = plan.changes.iter().find(|c| c.name == "b").unwrap();
        assert_eq!(b.changed_fields, vec!["data.k"]);
        assert!(!plan.requires_approval);
    }

    #[test]
    fn test_tainted_record_plans_update() {
        let mut state = StackState::new("app");
        let mut stuck = record("a", json!({"data": {"k": "v"}}), &[]);
        stuck.tainted = true;
        state.resources.insert("a".into(), stuck);

        let graph = ResourceGraph::build(vec![config_map("a", json!({"k": "v"}))]).unwrap();
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        assert_eq!(plan.changes[0].action, ChangeAction::Update);
        assert!(plan.changes[0].changed_fields.is_empty());
        assert!(!plan.requires_approval);
    }

    #[test]
    fn test_reference_to_unchanged_resource_is_known() {
        let mut state = StackState::new("app");
        state
            .resources
            .insert("db".into(), record("db", json!({"data": {"k": "v"}}), &[]));
        state.resources.insert(
            "app".into(),
            record("app", json!({"data": {"host": "db.svc"}}), &["db"]),
        );

        let mut app = config_map("app", json!({}));
        app.properties.insert(
            "data".into(),
            PropertyValue::Map(
                [(
                    "host".to_string(),
                    PropertyValue::Ref(Reference::Resource {
                        resource: "db".into(),
                        path: "data.host".into(),
                    }),
                )]
                .into(),
            ),
        );
        let graph = ResourceGraph::build(vec![config_map("db", json!({"k": "v"})), app]).unwrap();
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_deletions_in_reverse_dependency_order() {
        let mut state = StackState::new("app");
        state.resources.insert("ns".into(), record("ns", json!({}), &[]));
        state
            .resources
            .insert("db".into(), record("db", json!({}), &["ns"]));
        state
            .resources
            .insert("app".into(), record("app", json!({}), &["db"]));
        let mut lookup = record("found", json!({}), &[]);
        lookup.lookup = true;
        state.resources.insert("found".into(), lookup);

        let graph = ResourceGraph::build(vec![]).unwrap();
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        let names: Vec<&str> = plan.changes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["app", "db", "ns"]);
        assert!(plan.changes.iter().all(|c| c.action == ChangeAction::Delete));
    }

    #[test]
    fn test_replace_on_changes() {
        let mut state = StackState::new("app");
        state
            .resources
            .insert("pvc".into(), record("pvc", json!({"data": {"size": "1Gi"}}), &[]));
        let mut decl = config_map("pvc", json!({"size": "2Gi"}));
        decl.options.replace_on_changes = vec!["data.size".into()];
        let graph = ResourceGraph::build(vec![decl]).unwrap();
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        assert_eq!(plan.changes[0].action, ChangeAction::Replace);
    }

    #[test]
    fn test_drift_requires_approval() {
        let mut state = StackState::new("app");
        state
            .resources
            .insert("a".into(), record("a", json!({"data": {"k": "v"}}), &[]));
        let graph = ResourceGraph::build(vec![config_map("a", json!({"k": "v"}))]).unwrap();
        let drift = DriftReport {
            fields: BTreeMap::from([("a".to_string(), vec!["data.k".to_string()])]),
            ..Default::default()
        };
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &drift);
        assert!(plan.requires_approval);
        assert_eq!(plan.changes[0].action, ChangeAction::Update);
        assert!(plan.changes[0].drift);
    }

    #[test]
    fn test_plan_serialization_has_no_plaintext_secret() {
        let state = StackState::new("app");
        let mut decl = config_map("s", json!({}));
        decl.properties.insert(
            "data".into(),
            PropertyValue::Map(
                [(
                    "password".to_string(),
                    PropertyValue::secret(PropertyValue::from("hunter2")),
                )]
                .into(),
            ),
        );
        let graph = ResourceGraph::build(vec![decl]).unwrap();
        let plan = plan_changes(&graph, &state, &StackOutputs::new(), &DriftReport::default());
        let text = serde_json::to_string(&plan).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("hmac-sha256:"));
    }
}
