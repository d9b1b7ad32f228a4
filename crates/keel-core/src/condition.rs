//! Named boolean conditions with transition timestamps.
//!
//! Conditions are the fine-grained companion to the coarse phase: a keyed
//! set of `{type, status, reason, message, lastTransitionTime,
//! observedGeneration}` records. The set is unique by `type` and preserves
//! insertion order for output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

/// A single condition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    pub observed_generation: i64,
}

impl Condition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            observed_generation,
        }
    }
}

/// Ordered set of conditions, unique by `type`.
///
/// Output order is insertion order: a condition keeps its slot when updated,
/// new types append at the end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a condition into the set, keyed by `type`.
    ///
    /// `lastTransitionTime` only advances when the status value actually
    /// changes; reason, message, and `observedGeneration` always take the
    /// incoming values.
    pub fn upsert(&mut self, incoming: Condition) {
        match self
            .0
            .iter_mut()
            .find(|c| c.condition_type == incoming.condition_type)
        {
            Some(existing) => {
                let transition_time = if existing.status == incoming.status {
                    existing.last_transition_time
                } else {
                    incoming.last_transition_time
                };
                *existing = Condition {
                    last_transition_time: transition_time,
                    ..incoming
                };
            }
            None => self.0.push(incoming),
        }
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Condition>> for Conditions {
    fn from(conditions: Vec<Condition>) -> Self {
        Self(conditions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cond(status: ConditionStatus, reason: &str, generation: i64) -> Condition {
        Condition::new("Ready", status, reason, "", generation)
    }

    #[test]
    fn upsert_preserves_transition_time_when_status_unchanged() {
        let mut conditions = Conditions::new();
        let mut first = cond(ConditionStatus::True, "ReconcileSuccess", 1);
        first.last_transition_time = Utc::now() - Duration::seconds(300);
        let original_time = first.last_transition_time;
        conditions.upsert(first);

        conditions.upsert(cond(ConditionStatus::True, "ReconcileSuccess", 2));

        let ready = conditions.get("Ready").unwrap();
        assert_eq!(ready.last_transition_time, original_time);
        assert_eq!(ready.observed_generation, 2);
    }

    #[test]
    fn upsert_advances_transition_time_on_status_change() {
        let mut conditions = Conditions::new();
        let mut first = cond(ConditionStatus::True, "ReconcileSuccess", 1);
        first.last_transition_time = Utc::now() - Duration::seconds(300);
        let original_time = first.last_transition_time;
        conditions.upsert(first);

        conditions.upsert(cond(ConditionStatus::False, "ReconcileFailed", 2));

        let ready = conditions.get("Ready").unwrap();
        assert!(ready.last_transition_time > original_time);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ReconcileFailed");
    }

    #[test]
    fn insertion_order_is_stable_across_updates() {
        let mut conditions = Conditions::new();
        conditions.upsert(Condition::new("Ready", ConditionStatus::Unknown, "a", "", 1));
        conditions.upsert(Condition::new(
            "Reconciling",
            ConditionStatus::True,
            "b",
            "",
            1,
        ));
        conditions.upsert(Condition::new("Degraded", ConditionStatus::False, "c", "", 1));

        // Updating the first entry must not move it.
        conditions.upsert(Condition::new("Ready", ConditionStatus::True, "d", "", 2));

        let order: Vec<&str> = conditions
            .iter()
            .map(|c| c.condition_type.as_str())
            .collect();
        assert_eq!(order, vec!["Ready", "Reconciling", "Degraded"]);
    }

    #[test]
    fn serializes_with_kubernetes_field_names() {
        let mut conditions = Conditions::new();
        conditions.upsert(Condition::new("Ready", ConditionStatus::True, "r", "m", 3));
        let json = serde_json::to_value(&conditions).unwrap();
        let entry = &json[0];
        assert_eq!(entry["type"], "Ready");
        assert_eq!(entry["status"], "True");
        assert!(entry.get("lastTransitionTime").is_some());
        assert_eq!(entry["observedGeneration"], 3);
    }
}
