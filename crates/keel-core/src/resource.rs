//! Resource declarations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::value::{PropertyMap, PropertyValue, Reference, get_path};

/// Annotation that turns off readiness polling for a manifest.
pub const SKIP_AWAIT_ANNOTATION: &str = "keel.dev/skip-await";

/// What kind of remote object a declaration describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceType {
    Namespace,
    HelmRelease,
    Manifest { api_version: String, kind: String },
}

impl ResourceType {
    pub fn manifest(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        ResourceType::Manifest {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Kubernetes kind, if the resource maps onto one.
    pub fn kind(&self) -> Option<&str> {
        match self {
            ResourceType::Namespace => Some("Namespace"),
            ResourceType::HelmRelease => None,
            ResourceType::Manifest { kind, .. } => Some(kind),
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceType::Namespace)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Namespace => write!(f, "kubernetes:v1/Namespace"),
            ResourceType::HelmRelease => write!(f, "helm:release"),
            ResourceType::Manifest { api_version, kind } => {
                write!(f, "kubernetes:{api_version}/{kind}")
            }
        }
    }
}

/// How the engine decides a resource has become usable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Type-specific check supplied by the provider.
    #[default]
    Default,
    /// Ready as soon as the apply call returns.
    SkipAwait,
    /// Ready once the observed object has `value` at `path`.
    FieldEquals {
        path: String,
        value: serde_json::Value,
    },
}

/// Per-resource options that steer planning and apply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceOptions {
    /// Explicit dependencies (names of other resources in the stack).
    pub depends_on: Vec<String>,
    /// Field paths excluded from diff and drift detection.
    pub ignore_changes: Vec<String>,
    /// Field paths whose change forces delete-and-recreate.
    pub replace_on_changes: Vec<String>,
    pub readiness: ReadinessPolicy,
    /// Overrides the run's default apply + readiness timeout.
    pub timeout: Option<Duration>,
    /// Refuse to delete this resource.
    pub protect: bool,
}

/// Whether a declaration owns its remote object or merely reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeclarationMode {
    Managed,
    /// Read an existing object (`namespace/name`); never modified or deleted.
    Lookup { id: String },
}

/// One declared resource: (type, name, desired state).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    pub name: String,
    pub resource_type: ResourceType,
    pub namespace: Option<String>,
    pub properties: PropertyMap,
    pub options: ResourceOptions,
    pub mode: DeclarationMode,
}

impl ResourceDeclaration {
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            name: name.into(),
            resource_type,
            namespace: None,
            properties: PropertyMap::new(),
            options: ResourceOptions::default(),
            mode: DeclarationMode::Managed,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.options.depends_on.push(name.into());
        self
    }

    pub fn is_lookup(&self) -> bool {
        matches!(self.mode, DeclarationMode::Lookup { .. })
    }

    /// Names of same-stack resources referenced from the properties.
    pub fn referenced_resources(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .properties
            .values()
            .flat_map(|v| v.references())
            .filter_map(|r| match r {
                Reference::Resource { resource, .. } => Some(resource.as_str()),
                Reference::Stack { .. } => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Insert `metadata.annotations[key] = value`.
    pub fn annotate(&mut self, key: &str, value: &str) {
        self.metadata_map("annotations")
            .insert(key.to_string(), PropertyValue::string(value));
    }

    /// Insert `metadata.labels[key] = value`.
    pub fn label(&mut self, key: &str, value: &str) {
        self.metadata_map("labels")
            .insert(key.to_string(), PropertyValue::string(value));
    }

    fn metadata_map(&mut self, field: &str) -> &mut PropertyMap {
        let metadata = self
            .properties
            .entry("metadata".to_string())
            .or_insert_with(|| PropertyValue::Map(PropertyMap::new()));
        if !matches!(metadata, PropertyValue::Map(_)) {
            *metadata = PropertyValue::Map(PropertyMap::new());
        }
        let PropertyValue::Map(metadata) = metadata else {
            unreachable!("metadata was just made a map")
        };
        let inner = metadata
            .entry(field.to_string())
            .or_insert_with(|| PropertyValue::Map(PropertyMap::new()));
        if !matches!(inner, PropertyValue::Map(_)) {
            *inner = PropertyValue::Map(PropertyMap::new());
        }
        let PropertyValue::Map(inner) = inner else {
            unreachable!("field was just made a map")
        };
        inner
    }

    /// Readiness after taking the skip-await annotation into account.
    pub fn effective_readiness(&self) -> ReadinessPolicy {
        let annotated = get_path(&self.properties, "metadata.annotations")
            .and_then(|a| a.as_map().and_then(|m| m.get(SKIP_AWAIT_ANNOTATION).cloned()))
            .and_then(|v| v.as_str().map(|s| s == "true"))
            .unwrap_or(false);
        if annotated {
            ReadinessPolicy::SkipAwait
        } else {
            self.options.readiness.clone()
        }
    }

    /// The remote object name: `metadata.name` if set, else the declared name.
    pub fn remote_name(&self) -> String {
        get_path(&self.properties, "metadata.name")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| self.name.clone())
    }
}
