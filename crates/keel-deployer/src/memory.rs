//! In-process provider for tests and dry runs.
//!
//! Keeps remote objects in memory, records every call in order, and lets
//! callers inject failures, delayed readiness, slow applies and external
//! mutations.

use async_trait::async_trait;
use keel_core::provider::{
    ApplyRequest, Observed, Readiness, ResourceLocator, ResourceProvider, json_lookup,
    set_json_path,
};
use keel_core::value::PropertyValue;
use keel_core::{Error, ResourceType, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryEvent {
    Applied(String),
    Ready(String),
    Deleted(String),
}

#[derive(Default)]
struct Remote {
    /// Keyed by `type namespace/name`.
    objects: BTreeMap<String, Value>,
    log: Vec<MemoryEvent>,
    failures: HashMap<String, String>,
    /// Readiness checks still to answer `Pending`, by remote name.
    pending_checks: HashMap<String, u32>,
    delays: HashMap<String, Duration>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Provider whose "remote" is a map in memory. Handles every type.
#[derive(Default)]
pub struct MemoryProvider {
    remote: Mutex<Remote>,
}

/// Storage key of a remote object.
pub fn object_key(resource_type: &ResourceType, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{resource_type} {ns}/{name}"),
        None => format!("{resource_type} {name}"),
    }
}

fn locator_key(locator: &ResourceLocator) -> String {
    object_key(
        &locator.resource_type,
        locator.namespace.as_deref(),
        &locator.remote_name,
    )
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn remote(&self) -> std::sync::MutexGuard<'_, Remote> {
        // A poisoned lock only means a test panicked mid-call; the data is
        // still usable.
        self.remote
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every apply of the named resource fail.
    pub fn fail_on(&self, name: &str, message: &str) {
        self.remote()
            .failures
            .insert(name.to_string(), message.to_string());
    }

    pub fn clear_failure(&self, name: &str) {
        self.remote().failures.remove(name);
    }

    /// Answer `Pending` to the next `checks` readiness checks of a resource.
    pub fn ready_after(&self, name: &str, checks: u32) {
        self.remote().pending_checks.insert(name.to_string(), checks);
    }

    /// Delay every apply of the named resource.
    pub fn delay_apply(&self, name: &str, delay: Duration) {
        self.remote().delays.insert(name.to_string(), delay);
    }

    /// Place an object as if created outside keel (lookup targets).
    pub fn insert_object(
        &self,
        resource_type: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        object: Value,
    ) {
        self.remote()
            .objects
            .insert(object_key(resource_type, namespace, name), object);
    }

    pub fn object(
        &self,
        resource_type: &ResourceType,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<Value> {
        self.remote()
            .objects
            .get(&object_key(resource_type, namespace, name))
            .cloned()
    }

    /// Change a field of a remote object behind keel's back.
    pub fn mutate(
        &self,
        resource_type: &ResourceType,
        namespace: Option<&str>,
        name: &str,
        path: &str,
        value: Value,
    ) -> bool {
        let key = object_key(resource_type, namespace, name);
        match self.remote().objects.get_mut(&key) {
            Some(object) => set_json_path(object, path, value),
            None => false,
        }
    }

    /// Remove an object behind keel's back.
    pub fn remove_object(&self, resource_type: &ResourceType, namespace: Option<&str>, name: &str) {
        self.remote()
            .objects
            .remove(&object_key(resource_type, namespace, name));
    }

    pub fn log(&self) -> Vec<MemoryEvent> {
        self.remote().log.clone()
    }

    /// Declared names of applied resources, in call order.
    pub fn applied(&self) -> Vec<String> {
        self.remote()
            .log
            .iter()
            .filter_map(|e| match e {
                MemoryEvent::Applied(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.remote()
            .log
            .iter()
            .filter_map(|e| match e {
                MemoryEvent::Deleted(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of applies and deletes performed.
    pub fn writes(&self) -> usize {
        self.remote()
            .log
            .iter()
            .filter(|e| !matches!(e, MemoryEvent::Ready(_)))
            .count()
    }

    /// Most applies that were ever in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.remote().peak_in_flight
    }

    /// Position of an event in the call log.
    pub fn position(&self, event: &MemoryEvent) -> Option<usize> {
        self.remote().log.iter().position(|e| e == event)
    }

    fn observe(resource_type: &ResourceType, object: Value) -> Observed {
        let mut outputs = PropertyValue::from_json(object.clone());
        if resource_type.kind() == Some("Secret") {
            if let PropertyValue::Map(fields) = &mut outputs {
                for field in ["data", "stringData"] {
                    if let Some(PropertyValue::Map(values)) = fields.get_mut(field) {
                        for value in values.values_mut() {
                            *value = PropertyValue::secret(value.clone());
                        }
                    }
                }
            }
        }
        Observed { object, outputs }
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn handles(&self, _resource_type: &ResourceType) -> bool {
        true
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<Observed> {
        let name = request.locator.name.clone();
        let delay = {
            let mut remote = self.remote();
            remote.in_flight += 1;
            remote.peak_in_flight = remote.peak_in_flight.max(remote.in_flight);
            remote.delays.get(&name).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut remote = self.remote();
        remote.in_flight -= 1;
        remote.log.push(MemoryEvent::Applied(name.clone()));
        if let Some(message) = remote.failures.get(&name) {
            return Err(Error::Provider(message.clone()));
        }
        let mut object = request.properties.clone();
        if let Some(map) = object.as_object_mut() {
            let metadata = map
                .entry("metadata".to_string())
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(metadata) = metadata.as_object_mut() {
                metadata.insert(
                    "name".to_string(),
                    Value::String(request.locator.remote_name.clone()),
                );
                if let Some(ns) = &request.locator.namespace {
                    metadata.insert("namespace".to_string(), Value::String(ns.clone()));
                }
            }
        }
        remote
            .objects
            .insert(locator_key(&request.locator), object.clone());
        Ok(Self::observe(&request.locator.resource_type, object))
    }

    async fn read(&self, locator: &ResourceLocator) -> Result<Option<Observed>> {
        Ok(self
            .remote()
            .objects
            .get(&locator_key(locator))
            .cloned()
            .map(|object| Self::observe(&locator.resource_type, object)))
    }

    async fn delete(&self, locator: &ResourceLocator) -> Result<()> {
        let mut remote = self.remote();
        remote.objects.remove(&locator_key(locator));
        remote.log.push(MemoryEvent::Deleted(locator.name.clone()));
        Ok(())
    }

    fn readiness(&self, _resource_type: &ResourceType, observed: &Observed) -> Readiness {
        let Some(name) = json_lookup(&observed.object, "metadata.name").and_then(Value::as_str)
        else {
            return Readiness::Ready;
        };
        let mut remote = self.remote();
        // Keyed by remote name, which equals the declared name unless
        // `metadata.name` overrides it.
        if let Some(left) = remote.pending_checks.get_mut(name) {
            if *left > 0 {
                *left -= 1;
                return Readiness::Pending(format!("{left} checks left"));
            }
        }
        let ready = MemoryEvent::Ready(name.to_string());
        if !remote.log.contains(&ready) {
            remote.log.push(ready);
        }
        Readiness::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(name: &str, properties: Value) -> ApplyRequest {
        ApplyRequest {
            stack: "test".into(),
            locator: ResourceLocator {
                name: name.into(),
                resource_type: ResourceType::manifest("v1", "ConfigMap"),
                namespace: Some("app".into()),
                remote_name: name.into(),
            },
            properties,
        }
    }

    #[tokio::test]
    async fn test_apply_read_delete() {
        let provider = MemoryProvider::new();
        let req = request("cfg", json!({"data": {"k": "v"}}));
        let observed = provider.apply(&req).await.unwrap();
        assert_eq!(observed.object["metadata"]["namespace"], "app");

        let read = provider.read(&req.locator).await.unwrap().unwrap();
        assert_eq!(read.object["data"]["k"], "v");

        provider.delete(&req.locator).await.unwrap();
        assert!(provider.read(&req.locator).await.unwrap().is_none());
        assert_eq!(provider.writes(), 2);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let provider = MemoryProvider::new();
        provider.fail_on("cfg", "quota exceeded");
        let err = provider.apply(&request("cfg", json!({}))).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_peak_concurrency_counts_overlapping_applies() {
        let provider = MemoryProvider::new();
        provider.delay_apply("a", Duration::from_millis(50));
        provider.delay_apply("b", Duration::from_millis(50));
        let (a, b) = (request("a", json!({})), request("b", json!({})));
        let (first, second) = tokio::join!(provider.apply(&a), provider.apply(&b));
        first.unwrap();
        second.unwrap();
        assert_eq!(provider.peak_concurrency(), 2);

        provider.apply(&request("c", json!({}))).await.unwrap();
        assert_eq!(provider.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_delayed_readiness() {
        let provider = MemoryProvider::new();
        provider.ready_after("cfg", 2);
        let observed = provider.apply(&request("cfg", json!({}))).await.unwrap();
        let kind = ResourceType::manifest("v1", "ConfigMap");
        assert!(matches!(provider.readiness(&kind, &observed), Readiness::Pending(_)));
        assert!(matches!(provider.readiness(&kind, &observed), Readiness::Pending(_)));
        assert_eq!(provider.readiness(&kind, &observed), Readiness::Ready);
        assert!(provider.position(&MemoryEvent::Ready("cfg".into())).is_some());
    }

    #[tokio::test]
    async fn test_external_mutation() {
        let provider = MemoryProvider::new();
        let req = request("cfg", json!({"data": {"k": "v"}}));
        provider.apply(&req).await.unwrap();
        let kind = ResourceType::manifest("v1", "ConfigMap");
        assert!(provider.mutate(&kind, Some("app"), "cfg", "data.k", json!("changed")));
        assert_eq!(
            provider.object(&kind, Some("app"), "cfg").unwrap()["data"]["k"],
            "changed"
        );
        assert!(!provider.mutate(&kind, Some("app"), "missing", "data.k", json!(1)));
    }
}
