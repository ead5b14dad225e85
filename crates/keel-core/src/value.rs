//! Property value trees.
//!
//! A [`PropertyValue`] is the desired state of one resource field. Besides
//! plain JSON-like data it can hold secrets, symbolic references to other
//! resources' outputs or other stacks' outputs, and string templates that
//! embed such references. References stay symbolic until apply time.

use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

use crate::secret::{Fingerprinter, REDACTED, SecretMasker};
use crate::{Error, Result};

pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Marker key of a fingerprinted secret in recorded state.
pub const SECRET_MARKER: &str = "$secret";
/// Marker key of a not-yet-resolved reference in recorded values.
pub const UNKNOWN_MARKER: &str = "$unknown";

#[derive(Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<PropertyValue>),
    Map(PropertyMap),
    Secret(Box<PropertyValue>),
    Ref(Reference),
    Template(Vec<TemplatePart>),
}

/// A symbolic pointer to a value produced elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    /// An output of another resource in the same stack. An empty path
    /// refers to all of its outputs.
    Resource { resource: String, path: String },
    /// A published output of another stack.
    Stack { stack: String, output: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Literal(String),
    Ref(Reference),
}

impl Reference {
    /// Parse `resource.<name>[.<path>]` or `stack.<name>.<key>`.
    pub fn parse(expr: &str) -> Option<Self> {
        let (scope, rest) = expr.split_once('.')?;
        match scope {
            "resource" => {
                let (resource, path) = match rest.split_once('.') {
                    Some((r, p)) => (r, p),
                    None => (rest, ""),
                };
                if resource.is_empty() {
                    return None;
                }
                Some(Reference::Resource {
                    resource: resource.to_string(),
                    path: path.to_string(),
                })
            }
            "stack" => {
                let (stack, output) = rest.split_once('.')?;
                if stack.is_empty() || output.is_empty() {
                    return None;
                }
                Some(Reference::Stack {
                    stack: stack.to_string(),
                    output: output.to_string(),
                })
            }
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Resource { resource, path } if path.is_empty() => {
                write!(f, "resource.{resource}")
            }
            Reference::Resource { resource, path } => write!(f, "resource.{resource}.{path}"),
            Reference::Stack { stack, output } => write!(f, "stack.{stack}.{output}"),
        }
    }
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        PropertyValue::String(s.into())
    }

    pub fn secret(inner: PropertyValue) -> Self {
        match inner {
            already @ PropertyValue::Secret(_) => already,
            other => PropertyValue::Secret(Box::new(other)),
        }
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(b),
            serde_json::Value::Number(n) => PropertyValue::Number(n),
            serde_json::Value::String(s) => PropertyValue::String(s),
            serde_json::Value::Array(items) => {
                PropertyValue::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => PropertyValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&PropertyMap> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, PropertyValue::Secret(_))
    }

    /// Whether any part of the tree is secret.
    pub fn contains_secret(&self) -> bool {
        match self {
            PropertyValue::Secret(_) => true,
            PropertyValue::List(items) => items.iter().any(Self::contains_secret),
            PropertyValue::Map(map) => map.values().any(Self::contains_secret),
            _ => false,
        }
    }

    /// All references in the tree, in traversal order.
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            PropertyValue::Ref(r) => out.push(r),
            PropertyValue::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Ref(r) = part {
                        out.push(r);
                    }
                }
            }
            PropertyValue::Secret(inner) => inner.collect_references(out),
            PropertyValue::List(items) => items.iter().for_each(|i| i.collect_references(out)),
            PropertyValue::Map(map) => map.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    /// Look up a dotted path (`status.loadBalancer.ingress.0.ip`). Values
    /// reached through a secret are returned wrapped as secret.
    pub fn lookup(&self, path: &str) -> Option<PropertyValue> {
        if path.is_empty() {
            return Some(self.clone());
        }
        let (head, rest) = match path.split_once('.') {
            Some((h, r)) => (h, r),
            None => (path, ""),
        };
        match self {
            PropertyValue::Secret(inner) => inner.lookup(path).map(PropertyValue::secret),
            PropertyValue::Map(map) => map.get(head)?.lookup(rest),
            PropertyValue::List(items) => {
                let idx: usize = head.parse().ok()?;
                items.get(idx)?.lookup(rest)
            }
            _ => None,
        }
    }

    /// Plain JSON with secrets unwrapped, for handing to providers.
    /// Fails if a reference is still unresolved.
    pub fn to_plain_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Number(n) => serde_json::Value::Number(n.clone()),
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(Self::to_plain_json)
                    .collect::<Result<_>>()?,
            ),
            PropertyValue::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_plain_json()?)))
                    .collect::<Result<_>>()?,
            ),
            PropertyValue::Secret(inner) => inner.to_plain_json()?,
            PropertyValue::Ref(r) => return Err(Error::UnresolvedReference(r.to_string())),
            PropertyValue::Template(parts) => {
                let unresolved = parts.iter().find_map(|p| match p {
                    TemplatePart::Ref(r) => Some(r.to_string()),
                    TemplatePart::Literal(_) => None,
                });
                match unresolved {
                    Some(r) => return Err(Error::UnresolvedReference(r)),
                    None => serde_json::Value::String(render_literals(parts)),
                }
            }
        })
    }

    /// The form persisted in state: secrets become salted fingerprints and
    /// unresolved references become `$unknown` markers.
    pub fn to_recorded_json(&self, fingerprinter: &Fingerprinter) -> serde_json::Value {
        match self {
            PropertyValue::Secret(inner) => {
                let plaintext = match inner.to_plain_json() {
                    Ok(serde_json::Value::String(s)) => s,
                    Ok(other) => other.to_string(),
                    Err(_) => {
                        return serde_json::json!({ UNKNOWN_MARKER: inner.to_redacted_json() });
                    }
                };
                serde_json::json!({ SECRET_MARKER: fingerprinter.fingerprint(&plaintext) })
            }
            PropertyValue::Ref(r) => serde_json::json!({ UNKNOWN_MARKER: r.to_string() }),
            PropertyValue::Template(_) => match self.to_plain_json() {
                Ok(v) => v,
                Err(_) => serde_json::json!({ UNKNOWN_MARKER: self.to_redacted_json() }),
            },
            PropertyValue::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|i| i.to_recorded_json(fingerprinter))
                    .collect(),
            ),
            PropertyValue::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_recorded_json(fingerprinter)))
                    .collect(),
            ),
            scalar => scalar.to_redacted_json(),
        }
    }

    /// Human-facing JSON: secrets redacted, references shown as `${...}`.
    pub fn to_redacted_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => serde_json::Value::Bool(*b),
            PropertyValue::Number(n) => serde_json::Value::Number(n.clone()),
            PropertyValue::String(s) => serde_json::Value::String(s.clone()),
            PropertyValue::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_redacted_json).collect())
            }
            PropertyValue::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_redacted_json()))
                    .collect(),
            ),
            PropertyValue::Secret(_) => serde_json::Value::String(REDACTED.to_string()),
            PropertyValue::Ref(r) => serde_json::Value::String(format!("${{{r}}}")),
            PropertyValue::Template(parts) => {
                let rendered: String = parts
                    .iter()
                    .map(|p| match p {
                        TemplatePart::Literal(s) => s.clone(),
                        TemplatePart::Ref(r) => format!("${{{r}}}"),
                    })
                    .collect();
                serde_json::Value::String(rendered)
            }
        }
    }

    /// Register the plaintext of every secret string in the tree.
    pub fn collect_secrets(&self, masker: &mut SecretMasker) {
        match self {
            PropertyValue::Secret(inner) => match inner.to_plain_json() {
                Ok(serde_json::Value::String(s)) => masker.add(s),
                Ok(serde_json::Value::Object(map)) => {
                    for v in map.values() {
                        if let serde_json::Value::String(s) = v {
                            masker.add(s.clone());
                        }
                    }
                }
                Ok(other) => masker.add(other.to_string()),
                Err(_) => {}
            },
            PropertyValue::List(items) => items.iter().for_each(|i| i.collect_secrets(masker)),
            PropertyValue::Map(map) => map.values().for_each(|v| v.collect_secrets(masker)),
            _ => {}
        }
    }
}

fn render_literals(parts: &[TemplatePart]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            TemplatePart::Literal(s) => Some(s.as_str()),
            TemplatePart::Ref(_) => None,
        })
        .collect()
}

/// Set a dotted path inside a property map, creating intermediate maps.
/// Non-map intermediates are replaced.
pub fn set_path(map: &mut PropertyMap, path: &str, value: PropertyValue) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| PropertyValue::Map(PropertyMap::new()));
            if !matches!(entry, PropertyValue::Map(_)) {
                *entry = PropertyValue::Map(PropertyMap::new());
            }
            if let PropertyValue::Map(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

/// Look up a dotted path in a property map.
pub fn get_path(map: &PropertyMap, path: &str) -> Option<PropertyValue> {
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, r),
        None => (path, ""),
    };
    map.get(head)?.lookup(rest)
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_redacted_json().serialize(serializer)
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_redacted_json())
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n.into())
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}
