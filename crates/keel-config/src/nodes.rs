//! Helpers for pulling values out of KDL nodes.

use keel_core::value::{PropertyMap, PropertyValue};
use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

pub(crate) fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// The positional argument at `index`, whatever its type.
pub(crate) fn get_arg(node: &KdlNode, index: usize) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .nth(index)
        .map(|e| e.value())
}

pub(crate) fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

pub(crate) fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    match node.get(name) {
        None => Ok(None),
        Some(v) => v
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: name.to_string(),
                message: format!("expected a non-negative integer, got {v}"),
            }),
    }
}

/// All values of a repeatable property (`needs="a" needs="b"`), falling
/// back to a child node of the same name carrying the values as arguments.
pub(crate) fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();

    for entry in node.entries() {
        if let Some(entry_name) = entry.name() {
            if entry_name.value() == name {
                if let Some(s) = entry.value().as_string() {
                    result.push(s.to_string());
                }
            }
        }
    }

    if !result.is_empty() {
        return result;
    }

    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                return get_all_string_args(child);
            }
        }
    }

    Vec::new()
}

pub(crate) fn kdl_scalar(value: &KdlValue) -> ConfigResult<PropertyValue> {
    if let Some(s) = value.as_string() {
        return Ok(PropertyValue::String(s.to_string()));
    }
    if let Some(b) = value.as_bool() {
        return Ok(PropertyValue::Bool(b));
    }
    if let Some(i) = value.as_integer() {
        let i = i64::try_from(i).map_err(|_| ConfigError::InvalidValue {
            field: "integer".to_string(),
            message: format!("{i} does not fit in 64 bits"),
        })?;
        return Ok(PropertyValue::Number(i.into()));
    }
    if let Some(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(PropertyValue::Number)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "float".to_string(),
                message: format!("{f} is not a finite number"),
            });
    }
    Ok(PropertyValue::Null)
}

/// Convert a node into a value tree.
///
/// - children all named `-` form a list
/// - other children form a map keyed by node name
/// - a single argument is a scalar, several arguments a list of scalars
pub(crate) fn node_to_value(node: &KdlNode) -> ConfigResult<PropertyValue> {
    if let Some(children) = node.children() {
        let nodes = children.nodes();
        if !nodes.is_empty() && nodes.iter().all(|n| n.name().value() == "-") {
            let items = nodes
                .iter()
                .map(node_to_value)
                .collect::<ConfigResult<Vec<_>>>()?;
            return Ok(PropertyValue::List(items));
        }
        return Ok(PropertyValue::Map(children_to_map(node)?));
    }

    let args: Vec<&KdlValue> = node
        .entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
        .collect();
    match args.as_slice() {
        [] => Ok(PropertyValue::Null),
        [single] => kdl_scalar(single),
        many => Ok(PropertyValue::List(
            many.iter()
                .map(|v| kdl_scalar(v))
                .collect::<ConfigResult<Vec<_>>>()?,
        )),
    }
}

/// Children of a node as a map; duplicate keys are rejected.
pub(crate) fn children_to_map(node: &KdlNode) -> ConfigResult<PropertyMap> {
    let mut map = PropertyMap::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if map.contains_key(&key) {
                return Err(ConfigError::Duplicate(format!(
                    "key '{}' under '{}'",
                    key,
                    node.name().value()
                )));
            }
            map.insert(key, node_to_value(child)?);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;
    use serde_json::json;

    fn first(kdl: &str) -> KdlNode {
        let doc: KdlDocument = kdl.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_value_tree_conversion() {
        let node = first(
            r#"
            values {
                replicaCount 1
                auth { database "app" }
                accessModes { - "ReadWriteOnce" }
                ports 80 443
                enabled #false
            }
            "#,
        );
        let value = node_to_value(&node).unwrap();
        assert_eq!(
            value.to_plain_json().unwrap(),
            json!({
                "replicaCount": 1,
                "auth": {"database": "app"},
                "accessModes": ["ReadWriteOnce"],
                "ports": [80, 443],
                "enabled": false,
            })
        );
    }

    #[test]
    fn test_list_of_maps() {
        let node = first(
            r#"
            ports {
                - { port 8000; targetPort 8000 }
                - { port 9000 }
            }
            "#,
        );
        let value = node_to_value(&node).unwrap();
        assert_eq!(
            value.to_plain_json().unwrap(),
            json!([{"port": 8000, "targetPort": 8000}, {"port": 9000}])
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let node = first(r#"values { a 1; a 2 }"#);
        assert!(matches!(node_to_value(&node), Err(ConfigError::Duplicate(_))));
    }

    #[test]
    fn test_repeated_props() {
        let node = first(r#"chart "x" depends-on="a" depends-on="b""#);
        assert_eq!(get_string_list_prop(&node, "depends-on"), vec!["a", "b"]);
    }
}
