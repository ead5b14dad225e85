//! Default readiness rules per resource kind.

use keel_core::provider::{Readiness, json_lookup};
use serde_json::Value;

fn int_at(object: &Value, path: &str) -> i64 {
    json_lookup(object, path)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn str_at<'a>(object: &'a Value, path: &str) -> Option<&'a str> {
    json_lookup(object, path).and_then(Value::as_str)
}

fn condition<'a>(object: &'a Value, kind: &str) -> Option<&'a Value> {
    json_lookup(object, "status.conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
}

fn condition_is_true(object: &Value, kind: &str) -> bool {
    condition(object, kind)
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        == Some("True")
}

/// True once the controller has seen the latest spec.
fn generation_observed(object: &Value) -> bool {
    let generation = int_at(object, "metadata.generation");
    generation == 0 || int_at(object, "status.observedGeneration") >= generation
}

/// Readiness of a Kubernetes object by kind.
pub fn kubernetes_readiness(kind: &str, object: &Value) -> Readiness {
    match kind {
        "Deployment" | "StatefulSet" => rollout_readiness(object),
        "DaemonSet" => daemon_set_readiness(object),
        "PersistentVolumeClaim" => match str_at(object, "status.phase") {
            Some("Bound") => Readiness::Ready,
            Some("Lost") => Readiness::Failed("volume claim lost its volume".to_string()),
            phase => Readiness::Pending(format!(
                "claim phase {}",
                phase.unwrap_or("unknown")
            )),
        },
        "Namespace" => match str_at(object, "status.phase") {
            Some("Active") | None => Readiness::Ready,
            Some(phase) => Readiness::Pending(format!("namespace phase {phase}")),
        },
        "Job" => job_readiness(object),
        "Service" => service_readiness(object),
        "Pod" => match str_at(object, "status.phase") {
            Some("Failed") => Readiness::Failed("pod failed".to_string()),
            _ if condition_is_true(object, "Ready") => Readiness::Ready,
            Some("Succeeded") => Readiness::Ready,
            _ => Readiness::Pending("waiting for pod to become ready".to_string()),
        },
        _ => generic_readiness(object),
    }
}

fn rollout_readiness(object: &Value) -> Readiness {
    if !generation_observed(object) {
        return Readiness::Pending("waiting for controller to observe update".to_string());
    }
    let desired = json_lookup(object, "spec.replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let updated = int_at(object, "status.updatedReplicas");
    let ready = json_lookup(object, "status.availableReplicas")
        .or_else(|| json_lookup(object, "status.readyReplicas"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if updated >= desired && ready >= desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{ready}/{desired} replicas available"))
    }
}

fn daemon_set_readiness(object: &Value) -> Readiness {
    if !generation_observed(object) {
        return Readiness::Pending("waiting for controller to observe update".to_string());
    }
    let desired = int_at(object, "status.desiredNumberScheduled");
    let ready = int_at(object, "status.numberReady");
    let updated = int_at(object, "status.updatedNumberScheduled");
    if ready >= desired && updated >= desired {
        Readiness::Ready
    } else {
        Readiness::Pending(format!("{ready}/{desired} scheduled pods ready"))
    }
}

fn job_readiness(object: &Value) -> Readiness {
    if condition_is_true(object, "Failed") {
        let reason = condition(object, "Failed")
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("job failed");
        return Readiness::Failed(reason.to_string());
    }
    if condition_is_true(object, "Complete") || int_at(object, "status.succeeded") > 0 {
        Readiness::Ready
    } else {
        Readiness::Pending("waiting for job to complete".to_string())
    }
}

fn service_readiness(object: &Value) -> Readiness {
    if str_at(object, "spec.type") != Some("LoadBalancer") {
        return Readiness::Ready;
    }
    let has_ingress = json_lookup(object, "status.loadBalancer.ingress")
        .and_then(Value::as_array)
        .is_some_and(|i| !i.is_empty());
    if has_ingress {
        Readiness::Ready
    } else {
        Readiness::Pending("waiting for load balancer address".to_string())
    }
}

/// Custom resources: honour a `Ready` condition when one is reported,
/// otherwise ready as soon as the object exists.
fn generic_readiness(object: &Value) -> Readiness {
    match condition(object, "Ready") {
        None => Readiness::Ready,
        Some(c) => match c.get("status").and_then(Value::as_str) {
            Some("True") => Readiness::Ready,
            _ => Readiness::Pending(
                c.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("waiting for Ready condition")
                    .to_string(),
            ),
        },
    }
}

/// Readiness of a Helm release from its observed status.
pub fn helm_readiness(object: &Value) -> Readiness {
    match str_at(object, "info.status") {
        Some("deployed") => Readiness::Ready,
        Some("failed") => Readiness::Failed(
            str_at(object, "info.description")
                .unwrap_or("release failed")
                .to_string(),
        ),
        Some(status) => Readiness::Pending(format!("release status {status}")),
        None => Readiness::Pending("release status unknown".to_string()),
    }
}
