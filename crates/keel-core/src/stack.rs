//! Stack state, plans and run reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::RunId;
use crate::resource::ResourceType;

/// Stack run type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackRunType {
    Up,
    Destroy,
    Refresh,
}

impl std::fmt::Display for StackRunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackRunType::Up => write!(f, "up"),
            StackRunType::Destroy => write!(f, "destroy"),
            StackRunType::Refresh => write!(f, "refresh"),
        }
    }
}

/// Stack run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackRunStatus {
    NeedsApproval,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for StackRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackRunStatus::NeedsApproval => write!(f, "needs_approval"),
            StackRunStatus::Succeeded => write!(f, "succeeded"),
            StackRunStatus::PartiallySucceeded => write!(f, "partially_succeeded"),
            StackRunStatus::Failed => write!(f, "failed"),
            StackRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What was recorded for one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub name: String,
    pub resource_type: ResourceType,
    pub namespace: Option<String>,
    /// Remote object name (`metadata.name` or release name).
    pub remote_name: String,
    /// Desired properties as applied, secrets fingerprinted.
    pub inputs: serde_json::Value,
    /// Observed outputs after apply, secrets fingerprinted.
    pub outputs: serde_json::Value,
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    #[serde(default)]
    pub protect: bool,
    #[serde(default)]
    pub lookup: bool,
    /// Applied but never reached ready; the next `up` re-applies it.
    #[serde(default)]
    pub tainted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// `namespace/name` or bare name for cluster-scoped objects.
    pub fn remote_id(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.remote_name),
            None => self.remote_name.clone(),
        }
    }
}

/// Versioned snapshot of a stack's recorded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    pub stack: String,
    /// Incremented by every successful save.
    pub version: u64,
    pub lineage: String,
    /// Key for secret fingerprints; stable for the life of the stack.
    pub secret_salt: String,
    pub resources: BTreeMap<String, ResourceRecord>,
    /// Published outputs; secret ones hold a fingerprint marker.
    pub outputs: BTreeMap<String, serde_json::Value>,
    pub last_run: Option<RunId>,
    pub updated_at: DateTime<Utc>,
}

impl StackState {
    pub fn new(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            version: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            secret_salt: uuid::Uuid::new_v4().simple().to_string(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            last_run: None,
            updated_at: Utc::now(),
        }
    }
}

/// Holder information for an exclusive state lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateLock {
    pub lock_id: String,
    pub stack: String,
    pub run_id: RunId,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Planned action for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Replace,
    Delete,
    Same,
    Read,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::Create => write!(f, "create"),
            ChangeAction::Update => write!(f, "update"),
            ChangeAction::Replace => write!(f, "replace"),
            ChangeAction::Delete => write!(f, "delete"),
            ChangeAction::Same => write!(f, "same"),
            ChangeAction::Read => write!(f, "read"),
        }
    }
}

/// A resource change in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub name: String,
    pub resource_type: ResourceType,
    pub action: ChangeAction,
    /// Dotted paths of changed fields (updates and drift).
    pub changed_fields: Vec<String>,
    /// True when the change stems from remote mutation rather than the
    /// declaration.
    pub drift: bool,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
}

/// Planned changes for a stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub stack: String,
    pub changes: Vec<ResourceChange>,
    pub requires_approval: bool,
}

impl Plan {
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// True when applying would touch nothing.
    pub fn is_empty(&self) -> bool {
        self.changes
            .iter()
            .all(|c| matches!(c.action, ChangeAction::Same | ChangeAction::Read))
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            to_add: self.count(ChangeAction::Create),
            to_change: self.count(ChangeAction::Update),
            to_replace: self.count(ChangeAction::Replace),
            to_destroy: self.count(ChangeAction::Delete),
            unchanged: self.count(ChangeAction::Same),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub to_add: usize,
    pub to_change: usize,
    pub to_replace: usize,
    pub to_destroy: usize,
    pub unchanged: usize,
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to replace, {} to destroy, {} unchanged",
            self.to_add, self.to_change, self.to_replace, self.to_destroy, self.unchanged
        )
    }
}

/// Outcome of one apply/destroy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub stack: String,
    pub run_type: StackRunType,
    pub status: StackRunStatus,
    /// Resources created, updated, replaced, deleted or read.
    pub succeeded: Vec<String>,
    pub unchanged: Vec<String>,
    /// Resource name to error message (secrets masked).
    pub failed: BTreeMap<String, String>,
    /// Resource name to skip reason.
    pub skipped: BTreeMap<String, String>,
    pub cancelled: bool,
    pub state_version: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(name: &str, action: ChangeAction) -> ResourceChange {
        ResourceChange {
            name: name.into(),
            resource_type: ResourceType::Namespace,
            action,
            changed_fields: vec![],
            drift: false,
            before: None,
            after: None,
        }
    }

    #[test]
    fn test_plan_summary_counts() {
        let plan = Plan {
            stack: "app".into(),
            changes: vec![
                change("a", ChangeAction::Create),
                change("b", ChangeAction::Same),
                change("c", ChangeAction::Update),
                change("d", ChangeAction::Delete),
            ],
            requires_approval: false,
        };
        let summary = plan.summary();
        assert_eq!(summary.to_add, 1);
        assert_eq!(summary.to_change, 1);
        assert_eq!(summary.to_destroy, 1);
        assert_eq!(summary.unchanged, 1);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_only_same_and_read_is_empty() {
        let plan = Plan {
            stack: "app".into(),
            changes: vec![change("a", ChangeAction::Same), change("b", ChangeAction::Read)],
            requires_approval: false,
        };
        assert!(plan.is_empty());
    }

    #[test]
    fn test_fresh_state_has_distinct_salt() {
        let a = StackState::new("a");
        let b = StackState::new("a");
        assert_ne!(a.secret_salt, b.secret_salt);
        assert_eq!(a.version, 0);
    }
}
