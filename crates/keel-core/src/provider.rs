//! Provider trait: how declared resources become remote objects.
//!
//! Providers manage one family of resource types (Kubernetes objects, Helm
//! releases, ...). The engine owns ordering, diffing and readiness polling;
//! providers only perform the individual remote calls.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::resource::{ResourceDeclaration, ResourceType};
use crate::stack::ResourceRecord;
use crate::value::PropertyValue;
use crate::{Error, Result};

/// A fully resolved apply call.
#[derive(Clone)]
pub struct ApplyRequest {
    pub stack: String,
    pub locator: ResourceLocator,
    /// Plaintext desired properties, secrets included. Never log this.
    pub properties: serde_json::Value,
}

impl fmt::Debug for ApplyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplyRequest")
            .field("stack", &self.stack)
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}

/// Where a remote object lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    /// Declared name within the stack.
    pub name: String,
    pub resource_type: ResourceType,
    pub namespace: Option<String>,
    pub remote_name: String,
}

impl ResourceLocator {
    pub fn from_declaration(decl: &ResourceDeclaration) -> Self {
        Self {
            name: decl.name.clone(),
            resource_type: decl.resource_type.clone(),
            namespace: decl.namespace.clone(),
            remote_name: decl.remote_name(),
        }
    }

    pub fn from_record(record: &ResourceRecord) -> Self {
        Self {
            name: record.name.clone(),
            resource_type: record.resource_type.clone(),
            namespace: record.namespace.clone(),
            remote_name: record.remote_name.clone(),
        }
    }

    /// Locator for a lookup id: `namespace/name` or `name`.
    pub fn from_id(name: &str, resource_type: ResourceType, id: &str) -> Self {
        let (namespace, remote_name) = match id.split_once('/') {
            Some((ns, n)) => (Some(ns.to_string()), n.to_string()),
            None => (None, id.to_string()),
        };
        Self {
            name: name.to_string(),
            resource_type,
            namespace,
            remote_name,
        }
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.resource_type, ns, self.remote_name),
            None => write!(f, "{} {}", self.resource_type, self.remote_name),
        }
    }
}

/// A remote object as last seen.
#[derive(Debug, Clone)]
pub struct Observed {
    /// The live object, used for readiness and drift checks.
    pub object: serde_json::Value,
    /// Values exposed to `${resource.<name>.<path>}` references.
    pub outputs: PropertyValue,
}

impl Observed {
    pub fn new(object: serde_json::Value) -> Self {
        let outputs = PropertyValue::from_json(object.clone());
        Self { object, outputs }
    }
}

/// Result of one readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending(String),
    Failed(String),
}

#[async_trait]
pub trait ResourceProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn handles(&self, resource_type: &ResourceType) -> bool;

    /// Create or update the remote object to match the request.
    async fn apply(&self, request: &ApplyRequest) -> Result<Observed>;

    /// Read the remote object; `None` if it does not exist.
    async fn read(&self, locator: &ResourceLocator) -> Result<Option<Observed>>;

    async fn delete(&self, locator: &ResourceLocator) -> Result<()>;

    /// Type-specific default readiness of an observed object.
    fn readiness(&self, resource_type: &ResourceType, observed: &Observed) -> Readiness;
}

/// Routes resource types to providers; first match wins.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers.push(provider);
    }

    pub fn for_type(&self, resource_type: &ResourceType) -> Result<Arc<dyn ResourceProvider>> {
        self.providers
            .iter()
            .find(|p| p.handles(resource_type))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no provider handles {resource_type}")))
    }
}

/// Look up a dotted path in a JSON value (`status.conditions.0.type`).
pub fn json_lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        serde_json::Value::Object(map) => map.get(segment),
        serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Set a dotted path in a JSON value, creating missing parent objects.
/// Array indexes must already exist. Returns whether the value was set.
pub fn set_json_path(target: &mut serde_json::Value, path: &str, value: serde_json::Value) -> bool {
    use serde_json::Value;

    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let mut current = target;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Default::default())),
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(item) => item,
                None => return false,
            },
            _ => return false,
        };
    }
    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            true
        }
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_lookup() {
        let v = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert_eq!(
            json_lookup(&v, "status.conditions.0.status"),
            Some(&json!("True"))
        );
        assert_eq!(json_lookup(&v, "status.missing"), None);
        assert_eq!(json_lookup(&v, ""), Some(&v));
    }

    #[test]
    fn test_set_json_path() {
        let mut target = json!({});
        assert!(set_json_path(&mut target, "spec.template.replicas", json!(3)));
        assert_eq!(target, json!({"spec": {"template": {"replicas": 3}}}));

        let mut list = json!({"items": [1, 2]});
        assert!(set_json_path(&mut list, "items.1", json!(5)));
        assert!(!set_json_path(&mut list, "items.7", json!(9)));
        assert_eq!(list, json!({"items": [1, 5]}));

        let mut scalar = json!({"data": "flat"});
        assert!(!set_json_path(&mut scalar, "data.key", json!(1)));
        assert_eq!(json_lookup(&scalar, "data"), Some(&json!("flat")));
    }

    #[test]
    fn test_locator_from_id() {
        let loc = ResourceLocator::from_id(
            "superuser",
            ResourceType::manifest("v1", "Secret"),
            "postgresql/postgresql-cluster-superuser",
        );
        assert_eq!(loc.namespace.as_deref(), Some("postgresql"));
        assert_eq!(loc.remote_name, "postgresql-cluster-superuser");
    }

    #[test]
    fn test_apply_request_debug_hides_properties() {
        let req = ApplyRequest {
            stack: "app".into(),
            locator: ResourceLocator::from_id("s", ResourceType::manifest("v1", "Secret"), "ns/s"),
            properties: json!({"stringData": {"token": "plaintext-token"}}),
        };
        assert!(!format!("{req:?}").contains("plaintext-token"));
    }
}
