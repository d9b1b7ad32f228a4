//! The status engine: standard conditions for lifecycle transitions.
//!
//! Three conditions track every resource: `Ready` (is the external state in
//! sync), `Reconciling` (is an attempt running), and `Degraded` (did the
//! last attempt fail). A transition only touches the conditions listed for
//! it; the store's merge preserves `lastTransitionTime` whenever a status
//! value is unchanged.

use keel_core::condition::{Condition, ConditionStatus};
use keel_core::resource::Phase;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_RECONCILING: &str = "Reconciling";
pub const CONDITION_DEGRADED: &str = "Degraded";

/// Lifecycle moments the engine computes conditions for.
#[derive(Debug, Clone)]
pub enum StatusTransition {
    /// An attempt is starting.
    ReconcileStarted,
    /// The attempt succeeded.
    ReconcileSucceeded,
    /// The attempt failed; `reason` is machine-readable, `message` human.
    ReconcileFailed { reason: String, message: String },
    /// The resource entered the destroy path.
    DeletingStarted,
}

impl StatusTransition {
    pub fn failed(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ReconcileFailed {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// The transition implied by a phase write, used when reconcilers
    /// report status through the context rather than the scheduler.
    pub fn for_phase(phase: Phase, message: Option<&str>) -> Option<Self> {
        match phase {
            Phase::Reconciling => Some(Self::ReconcileStarted),
            Phase::Ready => Some(Self::ReconcileSucceeded),
            Phase::Failed => Some(Self::failed(
                "ReconcileFailed",
                message.unwrap_or("Reconciliation failed"),
            )),
            Phase::Deleting => Some(Self::DeletingStarted),
            Phase::Pending => None,
        }
    }
}

/// The condition updates for a transition, in a stable order. Conditions
/// not listed for a transition are deliberately left untouched.
pub fn conditions_for(transition: &StatusTransition, generation: i64) -> Vec<Condition> {
    match transition {
        StatusTransition::ReconcileStarted => vec![
            Condition::new(
                CONDITION_READY,
                ConditionStatus::Unknown,
                "ReconcileStarted",
                "Reconciliation in progress",
                generation,
            ),
            Condition::new(
                CONDITION_RECONCILING,
                ConditionStatus::True,
                "InProgress",
                "Reconciliation has started",
                generation,
            ),
        ],
        StatusTransition::ReconcileSucceeded => vec![
            Condition::new(
                CONDITION_READY,
                ConditionStatus::True,
                "ReconcileSuccess",
                "Resource reconciled successfully",
                generation,
            ),
            Condition::new(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "ReconcileComplete",
                "Reconciliation completed",
                generation,
            ),
            Condition::new(
                CONDITION_DEGRADED,
                ConditionStatus::False,
                "NoErrors",
                "",
                generation,
            ),
        ],
        StatusTransition::ReconcileFailed { reason, message } => vec![
            Condition::new(
                CONDITION_READY,
                ConditionStatus::False,
                reason.clone(),
                message.clone(),
                generation,
            ),
            Condition::new(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "ReconcileComplete",
                "",
                generation,
            ),
            Condition::new(
                CONDITION_DEGRADED,
                ConditionStatus::True,
                reason.clone(),
                message.clone(),
                generation,
            ),
        ],
        StatusTransition::DeletingStarted => vec![
            Condition::new(
                CONDITION_READY,
                ConditionStatus::Unknown,
                "Deleting",
                "Resource is being deleted",
                generation,
            ),
            Condition::new(
                CONDITION_RECONCILING,
                ConditionStatus::False,
                "Deleting",
                "Resource is being deleted",
                generation,
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::condition::Conditions;

    fn apply(conditions: &mut Conditions, transition: &StatusTransition, generation: i64) {
        for condition in conditions_for(transition, generation) {
            conditions.upsert(condition);
        }
    }

    #[test]
    fn success_sets_all_three_conditions() {
        let mut conditions = Conditions::new();
        apply(&mut conditions, &StatusTransition::ReconcileStarted, 1);
        apply(&mut conditions, &StatusTransition::ReconcileSucceeded, 1);

        assert_eq!(
            conditions.get(CONDITION_READY).unwrap().status,
            ConditionStatus::True
        );
        assert_eq!(
            conditions.get(CONDITION_RECONCILING).unwrap().status,
            ConditionStatus::False
        );
        assert_eq!(
            conditions.get(CONDITION_DEGRADED).unwrap().status,
            ConditionStatus::False
        );
    }

    #[test]
    fn failure_reports_the_error_reason() {
        let mut conditions = Conditions::new();
        apply(
            &mut conditions,
            &StatusTransition::failed("QuotaExceeded", "boom"),
            3,
        );

        let degraded = conditions.get(CONDITION_DEGRADED).unwrap();
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, "QuotaExceeded");
        assert_eq!(degraded.message, "boom");
        assert_eq!(degraded.observed_generation, 3);

        let ready = conditions.get(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "QuotaExceeded");
    }

    #[test]
    fn degraded_is_untouched_on_start_and_delete() {
        let mut conditions = Conditions::new();
        apply(&mut conditions, &StatusTransition::failed("X", "boom"), 1);
        let degraded_before = conditions.get(CONDITION_DEGRADED).unwrap().clone();

        apply(&mut conditions, &StatusTransition::ReconcileStarted, 2);
        assert_eq!(
            conditions.get(CONDITION_DEGRADED).unwrap(),
            &degraded_before
        );

        apply(&mut conditions, &StatusTransition::DeletingStarted, 2);
        assert_eq!(
            conditions.get(CONDITION_DEGRADED).unwrap(),
            &degraded_before
        );
        assert_eq!(
            conditions.get(CONDITION_READY).unwrap().status,
            ConditionStatus::Unknown
        );
    }

    #[test]
    fn repeated_success_keeps_transition_times() {
        let mut conditions = Conditions::new();
        apply(&mut conditions, &StatusTransition::ReconcileSucceeded, 1);
        let first = conditions.get(CONDITION_READY).unwrap().last_transition_time;

        apply(&mut conditions, &StatusTransition::ReconcileSucceeded, 2);
        let ready = conditions.get(CONDITION_READY).unwrap();
        assert_eq!(ready.last_transition_time, first);
        assert_eq!(ready.observed_generation, 2);
    }

    #[test]
    fn phase_writes_map_to_transitions() {
        assert!(matches!(
            StatusTransition::for_phase(Phase::Ready, None),
            Some(StatusTransition::ReconcileSucceeded)
        ));
        assert!(matches!(
            StatusTransition::for_phase(Phase::Failed, Some("boom")),
            Some(StatusTransition::ReconcileFailed { message, .. }) if message == "boom"
        ));
        assert!(StatusTransition::for_phase(Phase::Pending, None).is_none());
    }
}
