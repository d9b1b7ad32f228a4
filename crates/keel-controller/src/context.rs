//! The façade handed to reconciler plugins.
//!
//! A reconciler never touches the store, the status engine, or the event
//! bus directly; everything flows through this context. Publishing events
//! stays the scheduler's responsibility, so a reconciler reporting status
//! mid-attempt cannot emit half-finished snapshots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use keel_core::condition::Condition;
use keel_core::resource::{NewHistoryEntry, Phase, Resource, TriggerReason};
use keel_store::{Store, StoreError};

use crate::reconciler::{ActionPlugin, ReconcileResult};
use crate::registry::ActionRegistry;
use crate::status::{conditions_for, StatusTransition};

pub struct ReconcilerContext {
    store: Arc<dyn Store>,
    actions: Arc<ActionRegistry>,
    drift_interval: Duration,
    shutdown: broadcast::Sender<()>,
}

impl ReconcilerContext {
    pub fn new(
        store: Arc<dyn Store>,
        actions: Arc<ActionRegistry>,
        drift_interval: Duration,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            store,
            actions,
            drift_interval,
            shutdown,
        }
    }

    /// Resources of the given types matching the selection predicate,
    /// without claiming them.
    pub async fn get_resources_needing_reconciliation(
        &self,
        resource_types: &[String],
        limit: i64,
    ) -> Result<Vec<Resource>, StoreError> {
        self.store
            .resources_needing_reconciliation(resource_types, limit, self.drift_interval)
            .await
    }

    /// Write phase and message through the store and the status engine.
    /// Does not publish; the scheduler emits RECONCILED after the attempt.
    pub async fn update_status(
        &self,
        resource_id: i64,
        phase: Phase,
        message: Option<&str>,
        observed_generation: Option<i64>,
    ) -> Result<(), StoreError> {
        self.store
            .update_status(resource_id, phase, message, observed_generation)
            .await?;

        if let Some(transition) = StatusTransition::for_phase(phase, message) {
            let generation = self
                .store
                .get_resource_any(resource_id)
                .await?
                .map(|r| r.generation)
                .unwrap_or_default();
            for condition in conditions_for(&transition, generation) {
                self.store.set_condition(resource_id, condition).await?;
            }
        }
        Ok(())
    }

    /// Merge a domain-specific condition, keyed by type, under the same
    /// transition-time rule as the standard conditions.
    pub async fn set_condition(
        &self,
        resource_id: i64,
        condition: Condition,
    ) -> Result<(), StoreError> {
        self.store.set_condition(resource_id, condition).await
    }

    /// Append a history entry for an attempt this reconciler ran itself.
    pub async fn record_reconciliation(
        &self,
        resource_id: i64,
        result: &ReconcileResult,
        trigger_reason: TriggerReason,
    ) -> Result<(), StoreError> {
        let generation = self
            .store
            .get_resource_any(resource_id)
            .await?
            .map(|r| r.generation)
            .unwrap_or_default();

        let entry = match result {
            Ok(outcome) => {
                let mut entry = NewHistoryEntry::new(
                    resource_id,
                    generation,
                    true,
                    Phase::Ready,
                    trigger_reason,
                );
                entry.plan_output = outcome.plan_output.clone();
                entry.apply_output = outcome.apply_output.clone();
                entry.resources_created = outcome.resources_created;
                entry.resources_updated = outcome.resources_updated;
                entry.resources_deleted = outcome.resources_deleted;
                entry.drift_detected = outcome.drift_detected;
                entry
            }
            Err(err) => {
                let mut entry = NewHistoryEntry::new(
                    resource_id,
                    generation,
                    false,
                    Phase::Failed,
                    trigger_reason,
                );
                entry.error_message = Some(err.0.clone());
                entry
            }
        };
        self.store.append_history(entry).await?;
        Ok(())
    }

    pub async fn get_finalizers(&self, resource_id: i64) -> Result<Vec<String>, StoreError> {
        self.store.get_finalizers(resource_id).await
    }

    pub async fn remove_finalizer(
        &self,
        resource_id: i64,
        finalizer: &str,
    ) -> Result<(), StoreError> {
        self.store.remove_finalizer(resource_id, finalizer).await
    }

    /// Permanently delete; fails with `FinalizersPresent` while blocked.
    pub async fn hard_delete_resource(&self, resource_id: i64) -> Result<(), StoreError> {
        self.store.hard_delete_resource(resource_id).await
    }

    /// Opaque action-plugin handle lookup.
    pub fn get_action_plugin(&self, name: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.actions.get(name)
    }

    /// Signal observed by reconciler loops; fires once at shutdown.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::condition::ConditionStatus;
    use keel_core::resource::NewResource;
    use keel_store::testing::MemStore;
    use serde_json::json;

    fn context(store: Arc<MemStore>) -> ReconcilerContext {
        let (shutdown, _) = broadcast::channel(1);
        ReconcilerContext::new(
            store,
            Arc::new(ActionRegistry::new()),
            Duration::from_secs(300),
            shutdown,
        )
    }

    async fn seed(store: &MemStore) -> Resource {
        store
            .create_resource(NewResource {
                name: "r1".to_string(),
                resource_type_name: "bucket".to_string(),
                resource_type_version: "v1".to_string(),
                spec: json!({"a": 1}),
                finalizers: vec!["terraform".to_string()],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn update_status_writes_phase_and_conditions() {
        let store = Arc::new(MemStore::new());
        let resource = seed(&store).await;
        let ctx = context(store.clone());

        ctx.update_status(resource.id, Phase::Ready, Some("done"), Some(1))
            .await
            .unwrap();

        let stored = store.get_resource(resource.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Phase::Ready);
        assert_eq!(stored.observed_generation, 1);
        assert_eq!(
            stored.conditions.get("Ready").unwrap().status,
            ConditionStatus::True
        );
        assert_eq!(stored.conditions.get("Ready").unwrap().observed_generation, 1);
    }

    #[tokio::test]
    async fn record_reconciliation_captures_failure_details() {
        let store = Arc::new(MemStore::new());
        let resource = seed(&store).await;
        let ctx = context(store.clone());

        let result: ReconcileResult = Err(crate::reconciler::ReconcileError::new("boom"));
        ctx.record_reconciliation(resource.id, &result, TriggerReason::Retry)
            .await
            .unwrap();

        let history = store.list_history(resource.id, 10, 0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert_eq!(history[0].error_message.as_deref(), Some("boom"));
        assert_eq!(history[0].trigger_reason, TriggerReason::Retry);
        assert_eq!(history[0].generation, resource.generation);
    }

    #[tokio::test]
    async fn finalizer_passthrough_keeps_the_guard() {
        let store = Arc::new(MemStore::new());
        let resource = seed(&store).await;
        let ctx = context(store.clone());

        store.soft_delete_resource(resource.id).await.unwrap();
        assert!(matches!(
            ctx.hard_delete_resource(resource.id).await.unwrap_err(),
            StoreError::FinalizersPresent
        ));

        ctx.remove_finalizer(resource.id, "terraform").await.unwrap();
        assert!(ctx.get_finalizers(resource.id).await.unwrap().is_empty());
        ctx.hard_delete_resource(resource.id).await.unwrap();
    }
}
