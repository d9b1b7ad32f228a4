//! The reconciliation scheduler.
//!
//! One tick loop wakes every `reconcile_interval`, atomically claims a
//! batch of resources needing work, and spawns a task per claim. Per-
//! resource mutual exclusion is the claim's `pending -> reconciling` flip
//! plus an in-process active-id set; overall parallelism is bounded by a
//! semaphore sized to `max_concurrent_reconciles`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use keel_core::bus::EventBus;
use keel_core::config::ControllerConfig;
use keel_core::event::{EventType, ResourceEvent};
use keel_core::resource::{NewHistoryEntry, Phase, Resource, TriggerReason};
use keel_store::{ClaimedResource, Store, StoreError};

use crate::context::ReconcilerContext;
use crate::error::Result;
use crate::reconciler::ReconcileOutcome;
use crate::registry::ReconcilerRegistry;
use crate::status::{conditions_for, StatusTransition};

#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    registry: Arc<ReconcilerRegistry>,
    context: Arc<ReconcilerContext>,
    config: ControllerConfig,
    semaphore: Arc<Semaphore>,
    active: Arc<Mutex<HashSet<i64>>>,
    shutdown: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        registry: Arc<ReconcilerRegistry>,
        context: Arc<ReconcilerContext>,
        config: ControllerConfig,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_reconciles.max(1)));
        Self {
            store,
            bus,
            registry,
            context,
            config,
            semaphore,
            active: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
        }
    }

    /// Tick until shutdown, then wait out in-flight work within the grace
    /// period.
    pub async fn run(&self) {
        info!(
            interval_sec = self.config.reconcile_interval_sec,
            max_concurrent = self.config.max_concurrent_reconciles,
            drift_interval_sec = self.config.drift_interval_sec,
            "Scheduler started"
        );

        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.drain().await;
        info!("Scheduler stopped");
    }

    /// One scheduling pass: claim what fits into the free permits and
    /// spawn a task per claim. Returns how many tasks were started.
    pub async fn tick(&self) -> Result<usize> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            debug!("All reconcile slots busy; skipping tick");
            return Ok(0);
        }

        let exclude: Vec<i64> = self.active.lock().iter().copied().collect();
        let batch = self
            .store
            .claim_reconcile_batch(available, self.config.drift_interval(), &exclude)
            .await?;
        if batch.is_empty() {
            return Ok(0);
        }
        info!(count = batch.len(), "Claimed resources for reconciliation");

        let mut started = 0;
        for claimed in batch {
            let id = claimed.resource.id;
            // Re-entry guard; the claim exclusion list normally prevents
            // this, but a claim raced against task teardown fails fast here.
            if !self.active.lock().insert(id) {
                debug!(resource = id, "Already reconciling in this process");
                continue;
            }
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.active.lock().remove(&id);
                    break;
                }
            };

            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.reconcile_one(claimed).await;
                scheduler.active.lock().remove(&id);
                drop(permit);
            });
            started += 1;
        }
        Ok(started)
    }

    async fn drain(&self) {
        let permits = self.config.max_concurrent_reconciles.max(1) as u32;
        match tokio::time::timeout(
            self.config.shutdown_grace(),
            self.semaphore.acquire_many(permits),
        )
        .await
        {
            Ok(_) => debug!("All reconciliation tasks finished"),
            Err(_) => warn!(
                grace_sec = self.config.shutdown_grace_sec,
                "In-flight reconciliations did not finish within the grace period"
            ),
        }
    }

    /// Why this claim happened, derived from the generation gap and the
    /// pre-claim phase. A spec the reconciler has not caught up with wins
    /// over everything else, including deletion and retries.
    fn trigger_reason(claimed: &ClaimedResource) -> TriggerReason {
        let resource = &claimed.resource;
        if resource.generation > resource.observed_generation {
            TriggerReason::SpecChange
        } else if resource.deleted_at.is_some() || claimed.previous_phase == Phase::Deleting {
            TriggerReason::Delete
        } else if claimed.previous_phase == Phase::Failed {
            TriggerReason::Retry
        } else if claimed.previous_phase == Phase::Ready {
            TriggerReason::Drift
        } else {
            TriggerReason::Manual
        }
    }

    /// Exponential failure backoff: `min(base * 2^(retry-1), cap)`.
    fn backoff_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).clamp(0, 30) as u32;
        let delay = self
            .config
            .backoff_base_sec
            .saturating_mul(1u64 << exponent)
            .min(self.config.backoff_cap_sec);
        Duration::from_secs(delay)
    }

    /// Run one attempt end to end: status transitions, the reconciler
    /// call, history, and the RECONCILED event.
    #[instrument(skip(self, claimed), fields(resource = %claimed.resource.name, id = claimed.resource.id))]
    async fn reconcile_one(&self, claimed: ClaimedResource) {
        let trigger = Self::trigger_reason(&claimed);
        let resource = claimed.resource;
        let delete_path = resource.deleted_at.is_some();
        let start = Instant::now();

        let Some(reconciler) = self.registry.reconciler_for(&resource.resource_type_name) else {
            // Write-time checks make this unreachable in practice; a plugin
            // unloaded between restarts can still get us here.
            error!(
                resource_type = %resource.resource_type_name,
                "No reconciler for claimed resource"
            );
            self.finish_failure(
                &resource,
                "NoReconciler",
                &format!(
                    "no reconciler registered for resource type '{}'",
                    resource.resource_type_name
                ),
                trigger,
                start.elapsed().as_secs_f64(),
            )
            .await;
            return;
        };

        self.record_attempt_start(&resource, delete_path).await;

        let mut shutdown = self.shutdown.subscribe();
        let result = tokio::select! {
            result = reconciler.reconcile(&resource, self.context.clone()) => result,
            _ = shutdown.recv() => {
                // Canceled attempts exit silently without a history entry.
                debug!("Reconciliation cancelled by shutdown");
                return;
            }
        };
        let duration = start.elapsed().as_secs_f64();

        match result {
            Ok(outcome) if delete_path => {
                self.finish_destroy(&resource, outcome, trigger, duration).await;
            }
            Ok(outcome) => {
                self.finish_success(&resource, outcome, trigger, duration)
                    .await;
            }
            Err(err) => {
                self.finish_failure(&resource, "ReconcileFailed", &err.0, trigger, duration)
                    .await;
            }
        }
    }

    async fn record_attempt_start(&self, resource: &Resource, delete_path: bool) {
        let transition = if delete_path {
            // Phase stays `deleting`; only the conditions move.
            StatusTransition::DeletingStarted
        } else {
            if let Err(e) = self
                .store
                .update_status(
                    resource.id,
                    Phase::Reconciling,
                    Some("Starting reconciliation"),
                    None,
                )
                .await
            {
                warn!(error = %e, "Failed to mark resource reconciling");
            }
            StatusTransition::ReconcileStarted
        };
        self.apply_conditions(resource.id, &transition, resource.generation)
            .await;
    }

    async fn apply_conditions(&self, id: i64, transition: &StatusTransition, generation: i64) {
        for condition in conditions_for(transition, generation) {
            if let Err(e) = self.store.set_condition(id, condition).await {
                warn!(resource = id, error = %e, "Failed to write condition");
            }
        }
    }

    async fn finish_success(
        &self,
        resource: &Resource,
        outcome: ReconcileOutcome,
        trigger: TriggerReason,
        duration: f64,
    ) {
        let id = resource.id;
        let generation = resource.generation;
        let message = outcome
            .message
            .clone()
            .unwrap_or_else(|| "Reconciliation successful".to_string());

        if let Err(e) = self
            .store
            .update_status(id, Phase::Ready, Some(&message), Some(generation))
            .await
        {
            warn!(error = %e, "Failed to write success status");
        }
        self.apply_conditions(id, &StatusTransition::ReconcileSucceeded, generation)
            .await;

        if let Some(outputs) = &outcome.outputs {
            if let Err(e) = self.store.set_outputs(id, outputs.clone()).await {
                warn!(error = %e, "Failed to persist outputs");
            }
        }

        let requeue = outcome
            .requeue_after
            .unwrap_or_else(|| self.config.drift_interval());
        let next = Utc::now()
            + chrono::Duration::from_std(requeue).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.store.set_next_reconcile(id, next).await {
            warn!(error = %e, "Failed to schedule next reconcile");
        }

        let mut entry = NewHistoryEntry::new(id, generation, true, Phase::Ready, trigger);
        entry.plan_output = outcome.plan_output;
        entry.apply_output = outcome.apply_output;
        entry.resources_created = outcome.resources_created;
        entry.resources_updated = outcome.resources_updated;
        entry.resources_deleted = outcome.resources_deleted;
        entry.duration_seconds = Some(duration);
        entry.drift_detected = outcome.drift_detected;
        if let Err(e) = self.store.append_history(entry).await {
            warn!(error = %e, "Failed to append history");
        }

        if outcome.drift_detected {
            info!(trigger = %trigger, "Drift detected and corrected");
        }
        info!(duration_sec = duration, "Reconciled successfully");
        self.publish_reconciled(id).await;
    }

    async fn finish_failure(
        &self,
        resource: &Resource,
        reason: &str,
        message: &str,
        trigger: TriggerReason,
        duration: f64,
    ) {
        let id = resource.id;
        let generation = resource.generation;
        // A failed destroy leaves the resource in `deleting` with the cause
        // in status_message; it stays eligible and is retried next tick.
        let phase = if resource.deleted_at.is_some() {
            Phase::Deleting
        } else {
            Phase::Failed
        };

        if let Err(e) = self
            .store
            .update_status(id, phase, Some(message), None)
            .await
        {
            warn!(error = %e, "Failed to write failure status");
        }
        self.apply_conditions(
            id,
            &StatusTransition::failed(reason, message),
            generation,
        )
        .await;

        if phase == Phase::Failed {
            // The status write incremented retry_count; read it back for
            // the backoff exponent.
            let retry_count = match self.store.get_resource_any(id).await {
                Ok(Some(updated)) => updated.retry_count,
                _ => resource.retry_count + 1,
            };
            let delay = self.backoff_delay(retry_count);
            if let Err(e) = self
                .store
                .set_next_reconcile(
                    id,
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                )
                .await
            {
                warn!(error = %e, "Failed to schedule retry");
            }
            warn!(
                reason,
                retry_count,
                backoff_sec = delay.as_secs(),
                "Reconciliation failed"
            );
        } else {
            warn!(reason, "Destroy attempt failed; resource stays in deleting");
        }

        let mut entry = NewHistoryEntry::new(id, generation, false, phase, trigger);
        entry.error_message = Some(message.to_string());
        entry.duration_seconds = Some(duration);
        if let Err(e) = self.store.append_history(entry).await {
            warn!(error = %e, "Failed to append history");
        }

        self.publish_reconciled(id).await;
    }

    /// Successful destroy: the reconciler has torn down the external state
    /// and removed its own finalizer. Hard-delete if nothing else blocks.
    async fn finish_destroy(
        &self,
        resource: &Resource,
        outcome: ReconcileOutcome,
        trigger: TriggerReason,
        duration: f64,
    ) {
        let id = resource.id;

        match self.store.hard_delete_resource(id).await {
            Ok(()) => {
                info!(duration_sec = duration, "Destroyed and deleted resource");
                // The row is gone; announce with the last known snapshot.
                self.bus
                    .publish(&ResourceEvent::from_resource(EventType::Reconciled, resource));
            }
            Err(StoreError::FinalizersPresent) => {
                let remaining = self.store.get_finalizers(id).await.unwrap_or_default();
                info!(?remaining, "Destroy complete; waiting on finalizers");

                let mut entry = NewHistoryEntry::new(
                    id,
                    resource.generation,
                    true,
                    Phase::Deleting,
                    trigger,
                );
                entry.apply_output = outcome.apply_output;
                entry.resources_deleted = outcome.resources_deleted;
                entry.duration_seconds = Some(duration);
                if let Err(e) = self.store.append_history(entry).await {
                    warn!(error = %e, "Failed to append history");
                }
                self.publish_reconciled(id).await;
            }
            Err(e) => warn!(error = %e, "Hard delete failed"),
        }
    }

    /// RECONCILED is emitted once the store reflects the attempt outcome.
    async fn publish_reconciled(&self, id: i64) {
        match self.store.get_resource_any(id).await {
            Ok(Some(resource)) => {
                self.bus
                    .publish(&ResourceEvent::from_resource(EventType::Reconciled, &resource));
            }
            Ok(None) => {}
            Err(e) => warn!(resource = id, error = %e, "Failed to load resource for event"),
        }
    }
}
