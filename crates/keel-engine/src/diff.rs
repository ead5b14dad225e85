//! Field-level diffing of recorded values.
//!
//! Values are compared in their recorded JSON form (secrets fingerprinted),
//! flattened into dotted paths. Secret and unknown marker objects are
//! compared as single leaves.

use keel_core::provider::json_lookup;
use keel_core::value::{SECRET_MARKER, UNKNOWN_MARKER};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

fn is_marker(map: &serde_json::Map<String, Value>) -> bool {
    map.len() == 1 && (map.contains_key(SECRET_MARKER) || map.contains_key(UNKNOWN_MARKER))
}

/// Flatten a JSON value into leaf paths. Empty containers are leaves.
pub fn flatten(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() && !is_marker(map) => {
            for (k, v) in map {
                flatten_into(v, join_path(&prefix, k), out);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(v, join_path(&prefix, &i.to_string()), out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

/// Whether `path` is covered by an ignore entry (the entry or a sub-path).
pub fn is_ignored(path: &str, ignore: &[String]) -> bool {
    ignore.iter().any(|p| {
        path == p
            || path
                .strip_prefix(p.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

/// Whether a recorded value contains an unresolved marker.
pub fn contains_unknown(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.contains_key(UNKNOWN_MARKER) || map.values().any(contains_unknown)
        }
        Value::Array(items) => items.iter().any(contains_unknown),
        _ => false,
    }
}

/// Paths whose value differs between two recorded values, ignore-set
/// excluded.
pub fn changed_fields(before: &Value, after: &Value, ignore: &[String]) -> Vec<String> {
    let before = flatten(before);
    let after = flatten(after);
    let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    paths
        .into_iter()
        .filter(|p| !is_ignored(p, ignore))
        .filter(|p| before.get(*p) != after.get(*p))
        .cloned()
        .collect()
}

/// Paths where the observed remote object no longer matches the recorded
/// inputs. Only declared paths are compared; fields whose top-level key
/// the remote never reports (such as write-only `stringData`) and
/// fingerprinted or unknown leaves are not comparable and are skipped.
pub fn drift_fields(recorded: &Value, observed: &Value, ignore: &[String]) -> Vec<String> {
    flatten(recorded)
        .into_iter()
        .filter(|(path, _)| !is_ignored(path, ignore))
        .filter(|(_, leaf)| !matches!(leaf, Value::Object(m) if is_marker(m)))
        .filter(|(path, _)| {
            let top = path.split('.').next().unwrap_or_default();
            observed.get(top).is_some()
        })
        .filter(|(path, leaf)| json_lookup(observed, path) != Some(leaf))
        .map(|(path, _)| path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_paths() {
        let flat = flatten(&json!({
            "spec": {"replicas": 2, "ports": [{"port": 80}]},
            "data": {"token": {"$secret": "hmac-sha256:ab"}},
            "labels": {}
        }));
        assert_eq!(flat["spec.replicas"], json!(2));
        assert_eq!(flat["spec.ports.0.port"], json!(80));
        assert_eq!(flat["data.token"], json!({"$secret": "hmac-sha256:ab"}));
        assert_eq!(flat["labels"], json!({}));
    }

    #[test]
    fn test_changed_fields_only_reports_changes() {
        let before = json!({"spec": {"replicas": 1, "image": "nginx:1"}});
        let after = json!({"spec": {"replicas": 1, "image": "nginx:2"}, "extra": true});
        assert_eq!(
            changed_fields(&before, &after, &[]),
            vec!["extra".to_string(), "spec.image".to_string()]
        );
        assert!(changed_fields(&before, &before, &[]).is_empty());
    }

    #[test]
    fn test_ignore_covers_sub_paths() {
        let before = json!({"rules": [{"verbs": ["get"]}], "spec": {"replicas": 1}});
        let after = json!({"rules": [{"verbs": ["get", "list"]}], "spec": {"replicas": 3}});
        let ignore = vec!["rules".to_string(), "spec.replicas".to_string()];
        assert!(changed_fields(&before, &after, &ignore).is_empty());
        assert!(is_ignored("rules.0.verbs", &ignore));
        assert!(!is_ignored("rulesets", &ignore));
    }

    #[test]
    fn test_secret_change_is_visible_without_plaintext() {
        let before = json!({"data": {"pw": {"$secret": "hmac-sha256:aa"}}});
        let after = json!({"data": {"pw": {"$secret": "hmac-sha256:bb"}}});
        assert_eq!(changed_fields(&before, &after, &[]), vec!["data.pw".to_string()]);
    }

    #[test]
    fn test_drift_restricted_to_declared_paths() {
        let recorded = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}},
            "spec": {"replicas": 2},
            "stringData": {"k": "v"}
        });
        let observed = json!({
            "metadata": {"name": "web", "labels": {"app": "web"}, "uid": "123"},
            "spec": {"replicas": 5, "paused": false},
            "status": {"readyReplicas": 5}
        });
        assert_eq!(drift_fields(&recorded, &observed, &[]), vec!["spec.replicas"]);
        assert!(drift_fields(&recorded, &observed, &["spec.replicas".to_string()]).is_empty());
    }

    #[test]
    fn test_removed_field_is_drift() {
        let recorded = json!({"metadata": {"labels": {"app": "web"}}});
        let observed = json!({"metadata": {"labels": {}}});
        assert_eq!(
            drift_fields(&recorded, &observed, &[]),
            vec!["metadata.labels.app"]
        );
    }

    #[test]
    fn test_contains_unknown() {
        assert!(contains_unknown(&json!({"a": [{"$unknown": "resource.db"}]})));
        assert!(!contains_unknown(&json!({"a": [{"$secret": "x"}]})));
    }
}
