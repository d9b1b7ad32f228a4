//! Durable storage for the Keel control plane.
//!
//! The [`Store`] trait is the contract every other component programs
//! against: resource types, resources, finalizers, reconciliation history,
//! and admission webhooks, with the transactional guards the deletion
//! protocol depends on. [`PgStore`] is the PostgreSQL implementation;
//! [`testing::MemStore`] is an in-memory double for tests.

pub mod error;
pub mod migrations;
pub mod postgres;
pub mod testing;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use keel_core::condition::Condition;
use keel_core::resource::{
    AdmissionWebhook, HistoryEntry, NewHistoryEntry, NewResource, NewWebhook, Operation, Phase,
    Resource, ResourceType, ResourceTypeStatus, WebhookType,
};

pub use error::{Result, StoreError};
pub use postgres::PgStore;

/// Input for registering a resource type.
#[derive(Debug, Clone)]
pub struct NewResourceType {
    pub name: String,
    pub version: String,
    pub schema: Value,
    pub description: Option<String>,
    pub metadata: Value,
}

/// Partial update of a resource type. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ResourceTypeUpdate {
    pub schema: Option<Value>,
    pub description: Option<String>,
    pub status: Option<ResourceTypeStatus>,
    pub metadata: Option<Value>,
}

/// A resource handed out by `claim_reconcile_batch`, paired with the phase
/// it was claimed from. The claim flips live resources to `reconciling`, so
/// the pre-claim phase is what trigger-reason derivation needs.
#[derive(Debug, Clone)]
pub struct ClaimedResource {
    pub resource: Resource,
    pub previous_phase: Phase,
}

/// Partial update of an admission webhook. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    pub webhook_url: Option<String>,
    pub webhook_type: Option<WebhookType>,
    pub operations: Option<Vec<Operation>>,
    pub resource_type_name: Option<Option<String>>,
    pub resource_type_version: Option<Option<String>>,
    pub timeout_seconds: Option<i32>,
    pub failure_policy: Option<keel_core::resource::FailurePolicy>,
    pub ordering: Option<i32>,
}

/// The durable store contract.
///
/// Each operation is atomic. Reads exclude soft-deleted resources unless
/// the method says otherwise; the deletion path uses the `_any` variants.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- resource types ----

    /// Register a resource type; rejects a duplicate `(name, version)`.
    async fn create_resource_type(&self, new: NewResourceType) -> Result<ResourceType>;

    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>>;

    async fn get_resource_type(&self, name: &str, version: &str)
        -> Result<Option<ResourceType>>;

    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>>;

    async fn update_resource_type(
        &self,
        id: i64,
        update: ResourceTypeUpdate,
    ) -> Result<ResourceType>;

    /// Delete a type; fails with `Conflict` while live resources reference it.
    async fn delete_resource_type(&self, id: i64) -> Result<()>;

    // ---- resources ----

    /// Create a resource in `pending` with `generation = 1`; rejects a
    /// duplicate name with `DuplicateName`.
    async fn create_resource(&self, new: NewResource) -> Result<Resource>;

    async fn get_resource(&self, id: i64) -> Result<Option<Resource>>;

    /// Deletion-path read that also returns soft-deleted resources.
    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>>;

    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>>;

    async fn list_resources(&self, status: Option<Phase>, limit: i64) -> Result<Vec<Resource>>;

    /// Replace the spec. Recomputes the canonical hash; when it changes the
    /// generation is bumped, the phase resets to `pending`, and
    /// `next_reconcile_time` is cleared. An identical spec is a no-op apart
    /// from the stored document.
    async fn update_resource_spec(&self, id: i64, spec: Value) -> Result<Resource>;

    /// Mark for deletion: sets `deleted_at` and flips the phase to
    /// `deleting`. Idempotent.
    async fn soft_delete_resource(&self, id: i64) -> Result<Resource>;

    /// Remove the row, succeeding only when the resource is soft-deleted
    /// and its finalizer set is empty; otherwise `FinalizersPresent`.
    async fn hard_delete_resource(&self, id: i64) -> Result<()>;

    /// Set semantics; redundant adds are no-ops.
    async fn add_finalizer(&self, id: i64, finalizer: &str) -> Result<()>;

    /// Set semantics; removing an absent finalizer is a no-op.
    async fn remove_finalizer(&self, id: i64, finalizer: &str) -> Result<()>;

    /// Apply adds then removes in one atomic step, returning the resulting
    /// set.
    async fn patch_finalizers(
        &self,
        id: i64,
        add: &[String],
        remove: &[String],
    ) -> Result<Vec<String>>;

    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>>;

    /// Write phase and message. `ready` resets `retry_count`; `failed`
    /// increments it; both stamp `last_reconcile_time`.
    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<&str>,
        observed_generation: Option<i64>,
    ) -> Result<()>;

    /// Merge a condition into the resource's set, keyed by type, with the
    /// transition-time rule applied against the stored value.
    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()>;

    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()>;

    async fn set_next_reconcile(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Manual trigger: `next_reconcile_time = now`, phase to `pending`.
    /// A resource currently `reconciling` is left untouched.
    async fn mark_for_reconcile(&self, id: i64) -> Result<()>;

    /// Atomically claim up to `limit` resources needing work, flipping
    /// live candidates `-> reconciling` (destroy-path candidates keep
    /// `deleting`). Ids in `exclude` are skipped so in-flight work is never
    /// claimed twice.
    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        drift_interval: Duration,
        exclude: &[i64],
    ) -> Result<Vec<ClaimedResource>>;

    /// Non-claiming variant of the selection predicate, filtered by type.
    /// Used by reconcilers that watch their own types.
    async fn resources_needing_reconciliation(
        &self,
        type_names: &[String],
        limit: i64,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>>;

    // ---- history ----

    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry>;

    /// Newest first.
    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>>;

    // ---- admission webhooks ----

    async fn create_webhook(&self, new: NewWebhook) -> Result<AdmissionWebhook>;

    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>>;

    async fn list_webhooks(
        &self,
        type_name: Option<&str>,
        webhook_type: Option<WebhookType>,
    ) -> Result<Vec<AdmissionWebhook>>;

    async fn update_webhook(&self, id: i64, update: WebhookUpdate) -> Result<AdmissionWebhook>;

    async fn delete_webhook(&self, id: i64) -> Result<()>;

    /// Webhooks applicable to one admission decision, ordered by
    /// `ordering ASC, id ASC`.
    async fn webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>>;
}
