//! Stack definition parsing.
//!
//! A stack file declares one namespace, its chart releases, raw resources,
//! lookups of existing objects, transformation hooks and published outputs.
//! Parsing keeps `${...}` expressions verbatim; [`StackDefinition::declare`]
//! resolves configuration against a [`StackConfig`] and yields the final
//! resource declarations.

use keel_core::resource::{DeclarationMode, ReadinessPolicy, ResourceOptions};
use keel_core::value::{PropertyMap, PropertyValue};
use keel_core::{ResourceDeclaration, ResourceType};
use kdl::{KdlDocument, KdlNode};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::nodes::{
    children_to_map, get_arg, get_bool_prop, get_first_string_arg, get_string_prop, get_u64_prop,
    kdl_scalar, node_to_value,
};
use crate::store::StackConfig;
use crate::variables::VariableContext;
use crate::{ConfigError, ConfigResult};

/// Declared name of the stack's own namespace resource.
pub const NAMESPACE_RESOURCE: &str = "namespace";

/// A parsed, not yet configured, stack file.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDefinition {
    pub name: String,
    pub namespace: Option<NamespaceSpec>,
    pub config: Vec<ConfigRequirement>,
    /// Declarations with `${...}` expressions still in place.
    pub resources: Vec<ResourceDeclaration>,
    pub transforms: Vec<TransformSpec>,
    pub outputs: Vec<OutputSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceSpec {
    pub name: String,
    /// Whether the stack manages the namespace object itself.
    pub create: bool,
    pub labels: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigRequirement {
    Required(String),
    Optional { key: String, default: String },
    Secret(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub value: PropertyValue,
    pub secret: bool,
}

/// Which declarations a transformation applies to. Empty matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub kind: Option<String>,
    /// Declared or remote name; a trailing `*` matches by prefix.
    pub name: Option<String>,
}

impl Selector {
    pub fn matches(&self, decl: &ResourceDeclaration) -> bool {
        let kind_ok = match &self.kind {
            None => true,
            Some(kind) => match &decl.resource_type {
                ResourceType::HelmRelease => kind == "HelmRelease",
                other => other.kind() == Some(kind.as_str()),
            },
        };
        let name_ok = match &self.name {
            None => true,
            Some(pattern) => {
                let remote = decl.remote_name();
                match pattern.strip_suffix('*') {
                    Some(prefix) => decl.name.starts_with(prefix) || remote.starts_with(prefix),
                    None => &decl.name == pattern || &remote == pattern,
                }
            }
        };
        kind_ok && name_ok
    }
}

/// Built-in transformation hooks addressable from a stack file.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformSpec {
    SkipAwait { selector: Selector },
    IgnoreChanges { selector: Selector, fields: Vec<String> },
    Annotate { selector: Selector, key: String, value: String },
    Label { selector: Selector, key: String, value: String },
}

/// A stack with configuration applied, ready for the engine.
#[derive(Debug, Clone)]
pub struct DeclaredStack {
    pub name: String,
    pub namespace: Option<String>,
    pub resources: Vec<ResourceDeclaration>,
    pub transforms: Vec<TransformSpec>,
    pub outputs: BTreeMap<String, PropertyValue>,
}

/// Parse a stack definition from KDL text.
pub fn parse_stack(kdl: &str) -> ConfigResult<StackDefinition> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut namespace = None;
    let mut config = Vec::new();
    let mut resources: Vec<ResourceDeclaration> = Vec::new();
    let mut transforms = Vec::new();
    let mut outputs: Vec<OutputSpec> = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "stack" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("stack name".to_string()))?;
            }
            "namespace" => {
                namespace = Some(parse_namespace(node)?);
            }
            "config" => {
                config.extend(parse_config_requirements(node)?);
            }
            "chart" => resources.push(parse_chart(node)?),
            "resource" => resources.push(parse_manifest(node)?),
            "lookup" => resources.push(parse_lookup(node)?),
            "transform" => transforms.push(parse_transform(node)?),
            "output" => outputs.push(parse_output(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("stack name".to_string()));
    }

    let mut seen = HashSet::new();
    if namespace.as_ref().is_some_and(|ns: &NamespaceSpec| ns.create) {
        seen.insert(NAMESPACE_RESOURCE.to_string());
    }
    for resource in &resources {
        if !seen.insert(resource.name.clone()) {
            return Err(ConfigError::Duplicate(format!(
                "resource '{}'",
                resource.name
            )));
        }
    }

    let mut output_names = HashSet::new();
    for output in &outputs {
        if !output_names.insert(output.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("output '{}'", output.name)));
        }
    }

    Ok(StackDefinition {
        name,
        namespace,
        config,
        resources,
        transforms,
        outputs,
    })
}

/// Read and parse a stack definition file.
pub fn load_stack(path: &Path) -> ConfigResult<StackDefinition> {
    let text = std::fs::read_to_string(path)?;
    parse_stack(&text)
}

fn parse_namespace(node: &KdlNode) -> ConfigResult<NamespaceSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("namespace name".to_string()))?;
    let labels = node
        .children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "labels"))
        .map(children_to_map)
        .transpose()?
        .unwrap_or_default();
    Ok(NamespaceSpec {
        name,
        create: get_bool_prop(node, "create").unwrap_or(true),
        labels,
    })
}

fn parse_config_requirements(node: &KdlNode) -> ConfigResult<Vec<ConfigRequirement>> {
    let mut requirements = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = get_first_string_arg(child).ok_or_else(|| {
                ConfigError::MissingField(format!("config {} key", child.name().value()))
            })?;
            let requirement = match child.name().value() {
                "require" => ConfigRequirement::Required(key),
                "secret" => ConfigRequirement::Secret(key),
                "optional" => ConfigRequirement::Optional {
                    key,
                    default: get_string_prop(child, "default").unwrap_or_default(),
                },
                other => {
                    return Err(ConfigError::InvalidValue {
                        field: "config".to_string(),
                        message: format!("unknown requirement '{other}'"),
                    });
                }
            };
            requirements.push(requirement);
        }
    }
    Ok(requirements)
}

fn resource_name(node: &KdlNode) -> ConfigResult<String> {
    get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("{} name", node.name().value())))
}

/// Every value of a property that may repeat (`depends-on="a" depends-on="b"`).
fn repeated_prop(node: &KdlNode, name: &str) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_some_and(|n| n.value() == name))
        .filter_map(|e| e.value().as_string())
        .map(str::to_string)
        .collect()
}

fn parse_options(node: &KdlNode) -> ConfigResult<ResourceOptions> {
    let readiness = if get_bool_prop(node, "skip-await").unwrap_or(false) {
        ReadinessPolicy::SkipAwait
    } else if let Some(expr) = get_string_prop(node, "ready-when") {
        let (path, value) = expr.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            field: "ready-when".to_string(),
            message: format!("expected path=value, got '{expr}'"),
        })?;
        let value = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
        ReadinessPolicy::FieldEquals {
            path: path.trim().to_string(),
            value,
        }
    } else {
        ReadinessPolicy::Default
    };

    Ok(ResourceOptions {
        depends_on: repeated_prop(node, "depends-on"),
        ignore_changes: repeated_prop(node, "ignore-changes"),
        replace_on_changes: repeated_prop(node, "replace-on-changes"),
        readiness,
        timeout: get_u64_prop(node, "timeout")?.map(Duration::from_secs),
        protect: get_bool_prop(node, "protect").unwrap_or(false),
    })
}

fn parse_chart(node: &KdlNode) -> ConfigResult<ResourceDeclaration> {
    let name = resource_name(node)?;
    let mut decl = ResourceDeclaration::new(&name, ResourceType::HelmRelease);
    decl.namespace = get_string_prop(node, "namespace");
    decl.options = parse_options(node)?;

    let mut chart = None;
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "chart" => {
                    chart = get_first_string_arg(child);
                }
                "repo" | "version" => {
                    if let Some(v) = get_first_string_arg(child) {
                        decl.properties
                            .insert(child.name().value().to_string(), PropertyValue::String(v));
                    }
                }
                "skip-crds" => {
                    let skip = get_arg(child, 0).and_then(|v| v.as_bool()).unwrap_or(true);
                    decl.properties
                        .insert("skip_crds".to_string(), PropertyValue::Bool(skip));
                }
                "values" => {
                    decl.properties
                        .insert("values".to_string(), PropertyValue::Map(children_to_map(child)?));
                }
                _ => {}
            }
        }
    }

    let chart = chart.ok_or_else(|| ConfigError::MissingField(format!("chart '{name}' chart")))?;
    decl.properties
        .insert("chart".to_string(), PropertyValue::String(chart));
    Ok(decl)
}

fn manifest_type(node: &KdlNode, name: &str) -> ConfigResult<ResourceType> {
    let api_version = get_string_prop(node, "api-version")
        .ok_or_else(|| ConfigError::MissingField(format!("'{name}' api-version")))?;
    let kind = get_string_prop(node, "kind")
        .ok_or_else(|| ConfigError::MissingField(format!("'{name}' kind")))?;
    Ok(if api_version == "v1" && kind == "Namespace" {
        ResourceType::Namespace
    } else {
        ResourceType::manifest(api_version, kind)
    })
}

fn parse_manifest(node: &KdlNode) -> ConfigResult<ResourceDeclaration> {
    let name = resource_name(node)?;
    let resource_type = manifest_type(node, &name)?;
    let mut decl = ResourceDeclaration::new(&name, resource_type);
    decl.properties = children_to_map(node)?;
    decl.namespace = get_string_prop(node, "namespace").or_else(|| {
        decl.properties
            .get("metadata")
            .and_then(|m| m.lookup("namespace"))
            .and_then(|v| v.as_str().map(str::to_string))
    });
    decl.options = parse_options(node)?;
    Ok(decl)
}

fn parse_lookup(node: &KdlNode) -> ConfigResult<ResourceDeclaration> {
    let name = resource_name(node)?;
    let resource_type = manifest_type(node, &name)?;
    let id = get_string_prop(node, "id")
        .ok_or_else(|| ConfigError::MissingField(format!("lookup '{name}' id")))?;
    let mut decl = ResourceDeclaration::new(&name, resource_type);
    decl.namespace = id.split_once('/').map(|(ns, _)| ns.to_string());
    decl.options = parse_options(node)?;
    decl.mode = DeclarationMode::Lookup { id };
    Ok(decl)
}

fn parse_transform(node: &KdlNode) -> ConfigResult<TransformSpec> {
    let selector = Selector {
        kind: get_string_prop(node, "kind"),
        name: get_string_prop(node, "name"),
    };
    let required = |prop: &str| {
        get_string_prop(node, prop)
            .ok_or_else(|| ConfigError::MissingField(format!("transform {prop}")))
    };

    match get_first_string_arg(node).as_deref() {
        Some("skip-await") => Ok(TransformSpec::SkipAwait { selector }),
        Some("ignore-changes") => {
            let fields = repeated_prop(node, "fields");
            if fields.is_empty() {
                return Err(ConfigError::MissingField("transform fields".to_string()));
            }
            Ok(TransformSpec::IgnoreChanges { selector, fields })
        }
        Some("annotate") => Ok(TransformSpec::Annotate {
            selector,
            key: required("key")?,
            value: required("value")?,
        }),
        Some("label") => Ok(TransformSpec::Label {
            selector,
            key: required("key")?,
            value: required("value")?,
        }),
        other => Err(ConfigError::InvalidValue {
            field: "transform".to_string(),
            message: format!("unknown transform {other:?}"),
        }),
    }
}

fn parse_output(node: &KdlNode) -> ConfigResult<OutputSpec> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("output name".to_string()))?;
    let value = match get_arg(node, 1) {
        Some(v) => kdl_scalar(v)?,
        None if node.children().is_some() => node_to_value(node)?,
        None => return Err(ConfigError::MissingField(format!("output '{name}' value"))),
    };
    Ok(OutputSpec {
        name,
        value,
        secret: get_bool_prop(node, "secret").unwrap_or(false),
    })
}

impl StackDefinition {
    /// Check configuration requirements and build the interpolation context.
    /// Every missing key is reported at once.
    pub fn variable_context(&self, config: &StackConfig) -> ConfigResult<VariableContext> {
        let mut ctx = VariableContext::new(&self.name);
        ctx.namespace = self.namespace.as_ref().map(|ns| ns.name.clone());
        config.populate(&mut ctx);

        let mut missing = Vec::new();
        for requirement in &self.config {
            match requirement {
                ConfigRequirement::Required(key) => match config.require(key) {
                    Ok(_) => {}
                    Err(ConfigError::MissingConfig(k)) => missing.push(k),
                    Err(e) => return Err(e),
                },
                ConfigRequirement::Secret(key) => match config.require_secret(key) {
                    Ok(_) => {}
                    Err(ConfigError::MissingConfig(k)) => missing.push(k),
                    Err(e) => return Err(e),
                },
                ConfigRequirement::Optional { key, default } => {
                    if !config.contains(key) {
                        ctx.config.insert(key.clone(), default.clone());
                    }
                }
            }
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingConfig(missing.join(", ")));
        }
        Ok(ctx)
    }

    /// Resolve configuration and produce the declarations of this stack.
    pub fn declare(&self, config: &StackConfig) -> ConfigResult<DeclaredStack> {
        let ctx = self.variable_context(config)?;
        let stack_namespace = self.namespace.as_ref().map(|ns| ns.name.clone());
        let managed_namespace = self.namespace.as_ref().filter(|ns| ns.create);

        let mut resources = Vec::with_capacity(self.resources.len() + 1);
        if let Some(ns) = managed_namespace {
            let mut metadata = PropertyMap::new();
            metadata.insert("name".to_string(), PropertyValue::String(ns.name.clone()));
            if !ns.labels.is_empty() {
                metadata.insert("labels".to_string(), ctx.interpolate_tree(&PropertyValue::Map(ns.labels.clone()))?);
            }
            let mut decl = ResourceDeclaration::new(NAMESPACE_RESOURCE, ResourceType::Namespace);
            decl.properties
                .insert("metadata".to_string(), PropertyValue::Map(metadata));
            resources.push(decl);
        }

        for raw in &self.resources {
            let mut decl = raw.clone();
            decl.properties = ctx.interpolate_map(&raw.properties)?;
            if let DeclarationMode::Lookup { id } = &raw.mode {
                decl.mode = DeclarationMode::Lookup {
                    id: ctx.interpolate(id)?,
                };
            }
            if decl.namespace.is_none() && decl.resource_type.is_namespaced() {
                decl.namespace = stack_namespace.clone();
            }

            let in_managed_namespace = managed_namespace
                .is_some_and(|ns| decl.namespace.as_deref() == Some(ns.name.as_str()));
            if in_managed_namespace
                && decl.resource_type.is_namespaced()
                && !decl.options.depends_on.iter().any(|d| d == NAMESPACE_RESOURCE)
            {
                decl.options.depends_on.push(NAMESPACE_RESOURCE.to_string());
            }
            resources.push(decl);
        }

        let mut outputs = BTreeMap::new();
        for output in &self.outputs {
            let value = ctx.interpolate_tree(&output.value)?;
            let value = if output.secret {
                PropertyValue::secret(value)
            } else {
                value
            };
            outputs.insert(output.name.clone(), value);
        }

        Ok(DeclaredStack {
            name: self.name.clone(),
            namespace: stack_namespace,
            resources,
            transforms: self.transforms.clone(),
            outputs,
        })
    }
}
