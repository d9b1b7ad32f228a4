//! Resource model for the Keel control plane.
//!
//! A `ResourceType` declares a schema; a `Resource` is an instance of a type
//! with a user-declared desired state. Reconcilers drive resources toward
//! their spec and record every attempt as a `HistoryEntry`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::condition::Conditions;

/// Coarse lifecycle phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pending,
    Reconciling,
    Ready,
    Failed,
    Deleting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reconciling => "reconciling",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "reconciling" => Some(Self::Reconciling),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceTypeStatus {
    #[default]
    Active,
    Deprecated,
}

impl ResourceTypeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

/// A registered schema declaration, immutable under its `(name, version)` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceType {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub schema: Value,
    pub description: Option<String>,
    pub status: ResourceTypeStatus,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The central entity: a desired-state declaration plus its observed state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: i64,
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
    pub outputs: Value,
    pub finalizers: Vec<String>,
    pub status: Phase,
    pub status_message: Option<String>,
    pub generation: i64,
    pub observed_generation: i64,
    pub spec_hash: String,
    pub retry_count: i32,
    pub last_reconcile_time: Option<DateTime<Utc>>,
    pub next_reconcile_time: Option<DateTime<Utc>>,
    pub conditions: Conditions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Resource {
    /// A soft-deleted resource is on the destroy path until its finalizers
    /// clear and the store hard-deletes it.
    pub fn is_deleting(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }
}

/// Input for creating a resource. The store assigns id, hash, generation,
/// and timestamps.
#[derive(Debug, Clone)]
pub struct NewResource {
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
    pub finalizers: Vec<String>,
}

/// Why a reconciliation attempt ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    SpecChange,
    Drift,
    Manual,
    Retry,
    Delete,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpecChange => "spec_change",
            Self::Drift => "drift",
            Self::Manual => "manual",
            Self::Retry => "retry",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "spec_change" => Some(Self::SpecChange),
            "drift" => Some(Self::Drift),
            "manual" => Some(Self::Manual),
            "retry" => Some(Self::Retry),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded reconciliation attempt, append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub resource_id: i64,
    pub generation: i64,
    pub success: bool,
    pub phase: Phase,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub error_message: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
    pub duration_seconds: Option<f64>,
    pub trigger_reason: TriggerReason,
    pub drift_detected: bool,
    pub reconcile_time: DateTime<Utc>,
}

/// Input for appending a history entry.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub resource_id: i64,
    pub generation: i64,
    pub success: bool,
    pub phase: Phase,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub error_message: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
    pub duration_seconds: Option<f64>,
    pub trigger_reason: TriggerReason,
    pub drift_detected: bool,
}

impl NewHistoryEntry {
    /// A minimal entry; callers fill in outputs and counters as needed.
    pub fn new(
        resource_id: i64,
        generation: i64,
        success: bool,
        phase: Phase,
        trigger_reason: TriggerReason,
    ) -> Self {
        Self {
            resource_id,
            generation,
            success,
            phase,
            plan_output: None,
            apply_output: None,
            error_message: None,
            resources_created: 0,
            resources_updated: 0,
            resources_deleted: 0,
            duration_seconds: None,
            trigger_reason,
            drift_detected: false,
        }
    }
}

/// Whether a webhook mutates or only validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookType {
    Mutating,
    Validating,
}

impl WebhookType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mutating => "mutating",
            Self::Validating => "validating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mutating" => Some(Self::Mutating),
            "validating" => Some(Self::Validating),
            _ => None,
        }
    }
}

/// What happens when a webhook call fails at the transport level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    #[default]
    Fail,
    Ignore,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "Fail",
            Self::Ignore => "Ignore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Fail" => Some(Self::Fail),
            "Ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

/// Write operation a webhook can intercept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(Self::Create),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered admission webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionWebhook {
    pub id: i64,
    pub name: String,
    pub resource_type_name: Option<String>,
    pub resource_type_version: Option<String>,
    pub webhook_url: String,
    pub webhook_type: WebhookType,
    pub operations: Vec<Operation>,
    pub timeout_seconds: i32,
    pub failure_policy: FailurePolicy,
    pub ordering: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdmissionWebhook {
    /// Whether this webhook applies to the given type, version, and operation.
    pub fn matches(&self, type_name: &str, type_version: &str, operation: Operation) -> bool {
        if !self.operations.contains(&operation) {
            return false;
        }
        match (&self.resource_type_name, &self.resource_type_version) {
            (None, _) => true,
            (Some(n), None) => n == type_name,
            (Some(n), Some(v)) => n == type_name && v == type_version,
        }
    }
}

/// Input for registering a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub name: String,
    pub resource_type_name: Option<String>,
    pub resource_type_version: Option<String>,
    pub webhook_url: String,
    pub webhook_type: WebhookType,
    pub operations: Vec<Operation>,
    pub timeout_seconds: i32,
    pub failure_policy: FailurePolicy,
    pub ordering: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            Phase::Pending,
            Phase::Reconciling,
            Phase::Ready,
            Phase::Failed,
            Phase::Deleting,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("unknown"), None);
    }

    #[test]
    fn operation_serializes_uppercase() {
        let json = serde_json::to_string(&Operation::Create).unwrap();
        assert_eq!(json, "\"CREATE\"");
        let back: Operation = serde_json::from_str("\"DELETE\"").unwrap();
        assert_eq!(back, Operation::Delete);
    }

    #[test]
    fn webhook_match_respects_type_filter_and_operation() {
        let mut webhook = AdmissionWebhook {
            id: 1,
            name: "wh".into(),
            resource_type_name: Some("Bucket".into()),
            resource_type_version: Some("v1".into()),
            webhook_url: "http://example.invalid/admit".into(),
            webhook_type: WebhookType::Validating,
            operations: vec![Operation::Create, Operation::Update],
            timeout_seconds: 10,
            failure_policy: FailurePolicy::Fail,
            ordering: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(webhook.matches("Bucket", "v1", Operation::Create));
        assert!(!webhook.matches("Bucket", "v2", Operation::Create));
        assert!(!webhook.matches("Queue", "v1", Operation::Create));
        assert!(!webhook.matches("Bucket", "v1", Operation::Delete));

        // No version filter matches every version of the type.
        webhook.resource_type_version = None;
        assert!(webhook.matches("Bucket", "v2", Operation::Update));

        // No type filter matches everything.
        webhook.resource_type_name = None;
        assert!(webhook.matches("Queue", "v9", Operation::Create));
    }
}
