//! Reference resolution.
//!
//! `${resource.<name>.<path>}` resolves against outputs of resources in the
//! same stack; `${stack.<stack>.<key>}` against the recorded outputs of
//! another stack, whose secret outputs are read back from the secret store.

use keel_core::secret::{SecretMasker, SecretStore, output_secret_path};
use keel_core::state::StateStore;
use keel_core::value::{PropertyValue, Reference, SECRET_MARKER, TemplatePart};
use keel_core::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Published outputs of other stacks, loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct StackOutputs {
    stacks: HashMap<String, BTreeMap<String, PropertyValue>>,
}

impl StackOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the outputs of every named stack. Stacks without recorded state
    /// are left out so references to them fail at resolution time.
    pub async fn load(
        state: &dyn StateStore,
        secrets: &dyn SecretStore,
        stacks: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let mut loaded = Self::new();
        for stack in stacks.into_iter().collect::<BTreeSet<_>>() {
            let Some(recorded) = state.load(&stack).await? else {
                debug!(stack = %stack, "Referenced stack has no recorded state");
                continue;
            };
            let mut outputs = BTreeMap::new();
            for (key, value) in recorded.outputs {
                if is_secret_marker(&value) {
                    match secrets.get(&output_secret_path(&stack, &key)).await {
                        Ok(secret) => {
                            let plaintext = secret.as_string().unwrap_or_default().to_string();
                            outputs.insert(key, PropertyValue::secret(PropertyValue::String(plaintext)));
                        }
                        Err(Error::NotFound(_)) => {
                            debug!(stack = %stack, output = %key, "Secret output missing from secret store");
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    outputs.insert(key, PropertyValue::from_json(value));
                }
            }
            loaded.stacks.insert(stack, outputs);
        }
        Ok(loaded)
    }

    pub fn insert(&mut self, stack: &str, key: &str, value: PropertyValue) {
        self.stacks
            .entry(stack.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Register every secret output so error messages can be masked.
    pub fn collect_secrets(&self, masker: &mut SecretMasker) {
        for outputs in self.stacks.values() {
            outputs.values().for_each(|v| v.collect_secrets(masker));
        }
    }

    pub fn get(&self, stack: &str, key: &str) -> Result<PropertyValue> {
        let outputs = self.stacks.get(stack).ok_or_else(|| {
            Error::UnresolvedReference(format!(
                "stack.{stack}.{key}: stack '{stack}' has not been applied"
            ))
        })?;
        outputs.get(key).cloned().ok_or_else(|| {
            Error::UnresolvedReference(format!(
                "stack.{stack}.{key}: stack '{stack}' has no output '{key}'"
            ))
        })
    }
}

/// Whether a recorded JSON value is a secret fingerprint marker.
pub fn is_secret_marker(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.len() == 1 && m.contains_key(SECRET_MARKER))
}

/// Whether a property value holds a fingerprint marker read back from state.
pub fn contains_secret_marker(value: &PropertyValue) -> bool {
    match value {
        PropertyValue::Map(map) => {
            (map.len() == 1 && map.contains_key(SECRET_MARKER))
                || map.values().any(contains_secret_marker)
        }
        PropertyValue::List(items) => items.iter().any(contains_secret_marker),
        PropertyValue::Secret(inner) => contains_secret_marker(inner),
        _ => false,
    }
}

/// Re-apply the secrecy of a previous recording: every leaf that was
/// recorded as a fingerprint is wrapped as secret again.
pub fn seal_as_recorded(value: PropertyValue, recorded: &serde_json::Value) -> PropertyValue {
    if is_secret_marker(recorded) {
        return PropertyValue::secret(value);
    }
    match (value, recorded) {
        (PropertyValue::Map(map), serde_json::Value::Object(previous)) => PropertyValue::Map(
            map.into_iter()
                .map(|(k, v)| {
                    let sealed = match previous.get(&k) {
                        Some(p) => seal_as_recorded(v, p),
                        None => v,
                    };
                    (k, sealed)
                })
                .collect(),
        ),
        (PropertyValue::List(items), serde_json::Value::Array(previous)) => PropertyValue::List(
            items
                .into_iter()
                .enumerate()
                .map(|(i, v)| match previous.get(i) {
                    Some(p) => seal_as_recorded(v, p),
                    None => v,
                })
                .collect(),
        ),
        (value, _) => value,
    }
}

/// Every stack named by a `${stack...}` reference in the values.
pub fn referenced_stacks<'a>(values: impl IntoIterator<Item = &'a PropertyValue>) -> BTreeSet<String> {
    values
        .into_iter()
        .flat_map(|v| v.references())
        .filter_map(|r| match r {
            Reference::Stack { stack, .. } => Some(stack.clone()),
            Reference::Resource { .. } => None,
        })
        .collect()
}

/// Resolves references against known outputs.
pub struct Resolver<'a> {
    resources: &'a HashMap<String, PropertyValue>,
    stacks: &'a StackOutputs,
}

impl<'a> Resolver<'a> {
    pub fn new(resources: &'a HashMap<String, PropertyValue>, stacks: &'a StackOutputs) -> Self {
        Self { resources, stacks }
    }

    pub fn resolve_reference(&self, reference: &Reference) -> Result<PropertyValue> {
        match reference {
            Reference::Resource { resource, path } => {
                let outputs = self.resources.get(resource).ok_or_else(|| {
                    Error::UnresolvedReference(format!(
                        "{reference}: resource '{resource}' has no outputs"
                    ))
                })?;
                outputs.lookup(path).ok_or_else(|| {
                    Error::UnresolvedReference(format!(
                        "{reference}: resource '{resource}' has no output at '{path}'"
                    ))
                })
            }
            Reference::Stack { stack, output } => self.stacks.get(stack, output),
        }
    }

    /// Resolve every reference; fails on the first unresolved one.
    pub fn resolve(&self, value: &PropertyValue) -> Result<PropertyValue> {
        Ok(match value {
            PropertyValue::Ref(r) => self.resolve_reference(r)?,
            PropertyValue::Template(parts) => self.render(parts)?,
            PropertyValue::Secret(inner) => PropertyValue::secret(self.resolve(inner)?),
            PropertyValue::List(items) => PropertyValue::List(
                items
                    .iter()
                    .map(|i| self.resolve(i))
                    .collect::<Result<_>>()?,
            ),
            PropertyValue::Map(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Resolve what can be resolved and leave the rest symbolic.
    pub fn resolve_partial(&self, value: &PropertyValue) -> PropertyValue {
        match value {
            PropertyValue::Ref(r) => self
                .resolve_reference(r)
                .unwrap_or_else(|_| value.clone()),
            PropertyValue::Template(parts) => {
                self.render(parts).unwrap_or_else(|_| value.clone())
            }
            PropertyValue::Secret(inner) => PropertyValue::secret(self.resolve_partial(inner)),
            PropertyValue::List(items) => {
                PropertyValue::List(items.iter().map(|i| self.resolve_partial(i)).collect())
            }
            PropertyValue::Map(map) => PropertyValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_partial(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Render a template. The result is secret if any embedded value is.
    fn render(&self, parts: &[TemplatePart]) -> Result<PropertyValue> {
        let mut out = String::new();
        let mut secret = false;
        for part in parts {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Ref(r) => {
                    let mut value = self.resolve_reference(r)?;
                    if let PropertyValue::Secret(inner) = value {
                        secret = true;
                        value = *inner;
                    }
                    match value {
                        PropertyValue::String(s) => out.push_str(&s),
                        PropertyValue::Number(n) => out.push_str(&n.to_string()),
                        PropertyValue::Bool(b) => out.push_str(&b.to_string()),
                        _ => {
                            return Err(Error::InvalidInput(format!(
                                "${{{r}}} is not a scalar and cannot be embedded in a string"
                            )));
                        }
                    }
                }
            }
        }
        let rendered = PropertyValue::String(out);
        Ok(if secret {
            PropertyValue::secret(rendered)
        } else {
            rendered
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::secret::MemorySecretStore;
    use keel_core::secret::SecretValue;
    use keel_core::stack::StackState;
    use keel_core::RunId;
    use serde_json::json;

    use crate::state::MemoryStateStore;

    fn resource_ref(resource: &str, path: &str) -> PropertyValue {
        PropertyValue::Ref(Reference::Resource {
            resource: resource.into(),
            path: path.into(),
        })
    }

    fn stack_ref(stack: &str, output: &str) -> PropertyValue {
        PropertyValue::Ref(Reference::Stack {
            stack: stack.into(),
            output: output.into(),
        })
    }

    #[test]
    fn test_resolve_resource_and_template() {
        let resources = HashMap::from([(
            "db".to_string(),
            PropertyValue::from_json(json!({"status": {"host": "db.svc", "port": 5432}})),
        )]);
        let stacks = StackOutputs::new();
        let resolver = Resolver::new(&resources, &stacks);

        assert_eq!(
            resolver.resolve(&resource_ref("db", "status.host")).unwrap(),
            PropertyValue::from("db.svc")
        );
        let template = PropertyValue::Template(vec![
            TemplatePart::Literal("postgres://".into()),
            TemplatePart::Ref(Reference::Resource {
                resource: "db".into(),
                path: "status.host".into(),
            }),
            TemplatePart::Literal(":".into()),
            TemplatePart::Ref(Reference::Resource {
                resource: "db".into(),
                path: "status.port".into(),
            }),
        ]);
        assert_eq!(
            resolver.resolve(&template).unwrap(),
            PropertyValue::from("postgres://db.svc:5432")
        );
    }

    #[test]
    fn test_secret_taints_template() {
        let mut stacks = StackOutputs::new();
        stacks.insert("db", "password", PropertyValue::secret("hunter2".into()));
        let resources = HashMap::new();
        let resolver = Resolver::new(&resources, &stacks);
        let template = PropertyValue::Template(vec![
            TemplatePart::Literal("pw=".into()),
            TemplatePart::Ref(Reference::Stack {
                stack: "db".into(),
                output: "password".into(),
            }),
        ]);
        let resolved = resolver.resolve(&template).unwrap();
        assert!(resolved.is_secret());
        assert_eq!(resolved.to_plain_json().unwrap(), json!("pw=hunter2"));
    }

    #[test]
    fn test_unresolved_stack_reference() {
        let resources = HashMap::new();
        let stacks = StackOutputs::new();
        let resolver = Resolver::new(&resources, &stacks);
        let err = resolver.resolve(&stack_ref("database", "host")).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference(m) if m.contains("not been applied")));

        let partial = resolver.resolve_partial(&stack_ref("database", "host"));
        assert_eq!(partial, stack_ref("database", "host"));
    }

    #[tokio::test]
    async fn test_load_reads_secret_outputs_from_store() {
        let state = MemoryStateStore::new();
        let secrets = MemorySecretStore::new();

        let lease = state
            .lock("database", RunId::new(), "test")
            .await
            .unwrap();
        let mut db = StackState::new("database");
        db.outputs.insert("host".into(), json!("db.svc"));
        db.outputs
            .insert("password".into(), json!({"$secret": "hmac-sha256:00"}));
        state.save(&lease, &db).await.unwrap();
        state.unlock(lease).await.unwrap();
        secrets
            .set(
                &output_secret_path("database", "password"),
                SecretValue::String("hunter2".into()),
            )
            .await
            .unwrap();

        let outputs = StackOutputs::load(
            &state,
            &secrets,
            vec!["database".to_string(), "absent".to_string()],
        )
        .await
        .unwrap();

        assert_eq!(outputs.get("database", "host").unwrap(), PropertyValue::from("db.svc"));
        let pw = outputs.get("database", "password").unwrap();
        assert!(pw.is_secret());
        assert_eq!(pw.to_plain_json().unwrap(), json!("hunter2"));
        assert!(outputs.get("absent", "x").is_err());
    }

    #[test]
    fn test_contains_secret_marker() {
        let recorded = PropertyValue::from_json(json!({"data": {"pw": {"$secret": "x"}}}));
        assert!(contains_secret_marker(&recorded));
        assert!(!contains_secret_marker(&PropertyValue::from("plain")));
    }

    #[test]
    fn test_referenced_stacks() {
        let values = [stack_ref("database", "host"), stack_ref("database", "port"), resource_ref("a", "")];
        assert_eq!(
            referenced_stacks(values.iter()).into_iter().collect::<Vec<_>>(),
            vec!["database"]
        );
    }
}
