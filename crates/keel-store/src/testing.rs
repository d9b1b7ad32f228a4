//! In-memory [`Store`] for tests.
//!
//! `MemStore` mirrors the PostgreSQL semantics — generation bumps keyed on
//! the canonical spec hash, the finalizer-guarded hard delete, the claim
//! predicate and its priority ordering — so scheduler, gateway, and context
//! tests run without a database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use keel_core::condition::{Condition, Conditions};
use keel_core::hash::spec_hash;
use keel_core::resource::{
    AdmissionWebhook, HistoryEntry, NewHistoryEntry, NewResource, NewWebhook, Operation, Phase,
    Resource, ResourceType, ResourceTypeStatus, WebhookType,
};

use crate::error::{Result, StoreError};
use crate::{ClaimedResource, NewResourceType, ResourceTypeUpdate, Store, WebhookUpdate};

#[derive(Default)]
struct Inner {
    resource_types: Vec<ResourceType>,
    resources: Vec<Resource>,
    history: Vec<HistoryEntry>,
    webhooks: Vec<AdmissionWebhook>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn resource_mut(&mut self, id: i64) -> Result<&mut Resource> {
        self.resources
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)
    }
}

/// In-memory store double with PostgreSQL-equivalent semantics.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn drift_elapsed(r: &Resource, now: DateTime<Utc>, drift: Duration) -> bool {
    let drift = chrono::Duration::from_std(drift).unwrap_or_else(|_| chrono::Duration::zero());
    r.last_reconcile_time.is_some_and(|t| t + drift <= now)
}

fn needs_work(r: &Resource, now: DateTime<Utc>, drift: Duration) -> bool {
    if r.deleted_at.is_some() {
        return r.status == Phase::Deleting;
    }
    if r.status == Phase::Reconciling {
        return false;
    }
    if r.status == Phase::Pending {
        return true;
    }
    if r.status == Phase::Failed && r.next_reconcile_time.is_some_and(|t| t <= now) {
        return true;
    }
    if r.status == Phase::Ready && drift_elapsed(r, now, drift) {
        return true;
    }
    r.generation > r.observed_generation
}

fn claim_priority(r: &Resource) -> i32 {
    match r.status {
        Phase::Deleting => 0,
        Phase::Pending => 1,
        Phase::Failed => 2,
        _ => 3,
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_resource_type(&self, new: NewResourceType) -> Result<ResourceType> {
        let mut inner = self.inner.lock();
        if inner
            .resource_types
            .iter()
            .any(|rt| rt.name == new.name && rt.version == new.version)
        {
            return Err(StoreError::DuplicateName(format!(
                "{}/{}",
                new.name, new.version
            )));
        }
        let now = Utc::now();
        let rt = ResourceType {
            id: inner.next_id(),
            name: new.name,
            version: new.version,
            schema: new.schema,
            description: new.description,
            status: ResourceTypeStatus::Active,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        inner.resource_types.push(rt.clone());
        Ok(rt)
    }

    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>> {
        Ok(self
            .inner
            .lock()
            .resource_types
            .iter()
            .find(|rt| rt.id == id)
            .cloned())
    }

    async fn get_resource_type(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ResourceType>> {
        Ok(self
            .inner
            .lock()
            .resource_types
            .iter()
            .find(|rt| rt.name == name && rt.version == version)
            .cloned())
    }

    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>> {
        let mut types: Vec<ResourceType> = self
            .inner
            .lock()
            .resource_types
            .iter()
            .filter(|rt| name.is_none_or(|n| rt.name == n))
            .cloned()
            .collect();
        types.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));
        Ok(types)
    }

    async fn update_resource_type(
        &self,
        id: i64,
        update: ResourceTypeUpdate,
    ) -> Result<ResourceType> {
        let mut inner = self.inner.lock();
        let rt = inner
            .resource_types
            .iter_mut()
            .find(|rt| rt.id == id)
            .ok_or(StoreError::NotFound)?;
        if let Some(schema) = update.schema {
            rt.schema = schema;
        }
        if let Some(description) = update.description {
            rt.description = Some(description);
        }
        if let Some(status) = update.status {
            rt.status = status;
        }
        if let Some(metadata) = update.metadata {
            rt.metadata = metadata;
        }
        rt.updated_at = Utc::now();
        Ok(rt.clone())
    }

    async fn delete_resource_type(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let rt = inner
            .resource_types
            .iter()
            .find(|rt| rt.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)?;
        let referencing = inner
            .resources
            .iter()
            .filter(|r| {
                r.deleted_at.is_none()
                    && r.resource_type_name == rt.name
                    && r.resource_type_version == rt.version
            })
            .count();
        if referencing > 0 {
            return Err(StoreError::Conflict(format!(
                "{referencing} resources still reference type {}/{}",
                rt.name, rt.version
            )));
        }
        inner.resource_types.retain(|rt| rt.id != id);
        Ok(())
    }

    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let mut inner = self.inner.lock();
        if inner.resources.iter().any(|r| r.name == new.name) {
            return Err(StoreError::DuplicateName(new.name));
        }
        let now = Utc::now();
        let resource = Resource {
            id: inner.next_id(),
            name: new.name,
            resource_type_name: new.resource_type_name,
            resource_type_version: new.resource_type_version,
            spec_hash: spec_hash(&new.spec),
            spec: new.spec,
            outputs: Value::Object(Default::default()),
            finalizers: new.finalizers,
            status: Phase::Pending,
            status_message: None,
            generation: 1,
            observed_generation: 0,
            retry_count: 0,
            last_reconcile_time: None,
            next_reconcile_time: Some(now),
            conditions: Conditions::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.resources.push(resource.clone());
        Ok(resource)
    }

    async fn get_resource(&self, id: i64) -> Result<Option<Resource>> {
        Ok(self
            .inner
            .lock()
            .resources
            .iter()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .cloned())
    }

    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>> {
        Ok(self
            .inner
            .lock()
            .resources
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        Ok(self
            .inner
            .lock()
            .resources
            .iter()
            .find(|r| {
                r.deleted_at.is_none()
                    && r.name == name
                    && r.resource_type_name == type_name
                    && r.resource_type_version == type_version
            })
            .cloned())
    }

    async fn list_resources(&self, status: Option<Phase>, limit: i64) -> Result<Vec<Resource>> {
        let mut resources: Vec<Resource> = self
            .inner
            .lock()
            .resources
            .iter()
            .filter(|r| r.deleted_at.is_none() && status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        resources.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        resources.truncate(limit.max(0) as usize);
        Ok(resources)
    }

    async fn update_resource_spec(&self, id: i64, spec: Value) -> Result<Resource> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        if resource.deleted_at.is_some() {
            return Err(StoreError::NotFound);
        }
        let new_hash = spec_hash(&spec);
        if new_hash != resource.spec_hash {
            resource.spec_hash = new_hash;
            resource.generation += 1;
            resource.status = Phase::Pending;
            resource.status_message = None;
            resource.next_reconcile_time = None;
        }
        resource.spec = spec;
        resource.updated_at = Utc::now();
        Ok(resource.clone())
    }

    async fn soft_delete_resource(&self, id: i64) -> Result<Resource> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        let now = Utc::now();
        resource.deleted_at.get_or_insert(now);
        resource.status = Phase::Deleting;
        resource.next_reconcile_time = Some(now);
        resource.updated_at = now;
        Ok(resource.clone())
    }

    async fn hard_delete_resource(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner
            .resources
            .iter()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound)?;
        if resource.deleted_at.is_none() || !resource.finalizers.is_empty() {
            return Err(StoreError::FinalizersPresent);
        }
        inner.resources.retain(|r| r.id != id);
        inner.history.retain(|h| h.resource_id != id);
        Ok(())
    }

    async fn add_finalizer(&self, id: i64, finalizer: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        if !resource.finalizers.iter().any(|f| f == finalizer) {
            resource.finalizers.push(finalizer.to_string());
            resource.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn remove_finalizer(&self, id: i64, finalizer: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        resource.finalizers.retain(|f| f != finalizer);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn patch_finalizers(
        &self,
        id: i64,
        add: &[String],
        remove: &[String],
    ) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        for finalizer in add {
            if !resource.finalizers.contains(finalizer) {
                resource.finalizers.push(finalizer.clone());
            }
        }
        resource.finalizers.retain(|f| !remove.contains(f));
        resource.updated_at = Utc::now();
        Ok(resource.finalizers.clone())
    }

    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        Ok(inner.resource_mut(id)?.finalizers.clone())
    }

    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<&str>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        let now = Utc::now();
        resource.status = phase;
        resource.status_message = message.map(str::to_string);
        if let Some(observed) = observed_generation {
            resource.observed_generation = observed;
        }
        match phase {
            Phase::Failed => {
                resource.retry_count += 1;
                resource.last_reconcile_time = Some(now);
            }
            Phase::Ready => {
                resource.retry_count = 0;
                resource.last_reconcile_time = Some(now);
            }
            _ => {}
        }
        resource.updated_at = now;
        Ok(())
    }

    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        resource.conditions.upsert(condition);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        resource.outputs = outputs;
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn set_next_reconcile(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner.resource_mut(id)?;
        resource.next_reconcile_time = Some(at);
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_for_reconcile(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let resource = inner
            .resources
            .iter_mut()
            .find(|r| r.id == id && r.deleted_at.is_none())
            .ok_or(StoreError::NotFound)?;
        if resource.status == Phase::Reconciling {
            return Ok(());
        }
        resource.status = Phase::Pending;
        resource.next_reconcile_time = Some(Utc::now());
        resource.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        drift_interval: Duration,
        exclude: &[i64],
    ) -> Result<Vec<ClaimedResource>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        let mut candidates: Vec<(i32, Option<DateTime<Utc>>, i64)> = inner
            .resources
            .iter()
            .filter(|r| !exclude.contains(&r.id) && needs_work(r, now, drift_interval))
            .map(|r| (claim_priority(r), r.next_reconcile_time, r.id))
            .collect();
        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0).then_with(|| match (a.1, b.1) {
                (None, None) => std::cmp::Ordering::Equal,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (Some(_), None) => std::cmp::Ordering::Greater,
                (Some(x), Some(y)) => x.cmp(&y),
            })
        });
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            let resource = inner.resource_mut(id)?;
            let previous_phase = resource.status;
            if resource.deleted_at.is_none() {
                resource.status = Phase::Reconciling;
            }
            resource.updated_at = now;
            claimed.push(ClaimedResource {
                resource: resource.clone(),
                previous_phase,
            });
        }
        Ok(claimed)
    }

    async fn resources_needing_reconciliation(
        &self,
        type_names: &[String],
        limit: i64,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>> {
        let now = Utc::now();
        let mut matching: Vec<Resource> = self
            .inner
            .lock()
            .resources
            .iter()
            .filter(|r| {
                type_names.contains(&r.resource_type_name) && needs_work(r, now, drift_interval)
            })
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.next_reconcile_time);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let mut inner = self.inner.lock();
        if !inner.resources.iter().any(|r| r.id == entry.resource_id) {
            return Err(StoreError::NotFound);
        }
        let record = HistoryEntry {
            id: inner.next_id(),
            resource_id: entry.resource_id,
            generation: entry.generation,
            success: entry.success,
            phase: entry.phase,
            plan_output: entry.plan_output,
            apply_output: entry.apply_output,
            error_message: entry.error_message,
            resources_created: entry.resources_created,
            resources_updated: entry.resources_updated,
            resources_deleted: entry.resources_deleted,
            duration_seconds: entry.duration_seconds,
            trigger_reason: entry.trigger_reason,
            drift_detected: entry.drift_detected,
            reconcile_time: Utc::now(),
        };
        inner.history.push(record.clone());
        Ok(record)
    }

    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .inner
            .lock()
            .history
            .iter()
            .filter(|h| h.resource_id == resource_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.reconcile_time.cmp(&a.reconcile_time).then(b.id.cmp(&a.id)));
        entries
            .drain(..offset.clamp(0, entries.len() as i64) as usize)
            .for_each(drop);
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<AdmissionWebhook> {
        let mut inner = self.inner.lock();
        if inner.webhooks.iter().any(|w| w.name == new.name) {
            return Err(StoreError::DuplicateName(new.name));
        }
        let now = Utc::now();
        let webhook = AdmissionWebhook {
            id: inner.next_id(),
            name: new.name,
            resource_type_name: new.resource_type_name,
            resource_type_version: new.resource_type_version,
            webhook_url: new.webhook_url,
            webhook_type: new.webhook_type,
            operations: new.operations,
            timeout_seconds: new.timeout_seconds,
            failure_policy: new.failure_policy,
            ordering: new.ordering,
            created_at: now,
            updated_at: now,
        };
        inner.webhooks.push(webhook.clone());
        Ok(webhook)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>> {
        Ok(self
            .inner
            .lock()
            .webhooks
            .iter()
            .find(|w| w.id == id)
            .cloned())
    }

    async fn list_webhooks(
        &self,
        type_name: Option<&str>,
        webhook_type: Option<WebhookType>,
    ) -> Result<Vec<AdmissionWebhook>> {
        let mut webhooks: Vec<AdmissionWebhook> = self
            .inner
            .lock()
            .webhooks
            .iter()
            .filter(|w| {
                type_name.is_none_or(|n| w.resource_type_name.as_deref() == Some(n))
                    && webhook_type.is_none_or(|t| w.webhook_type == t)
            })
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| (w.ordering, w.id));
        Ok(webhooks)
    }

    async fn update_webhook(&self, id: i64, update: WebhookUpdate) -> Result<AdmissionWebhook> {
        let mut inner = self.inner.lock();
        let webhook = inner
            .webhooks
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(StoreError::NotFound)?;
        if let Some(url) = update.webhook_url {
            webhook.webhook_url = url;
        }
        if let Some(webhook_type) = update.webhook_type {
            webhook.webhook_type = webhook_type;
        }
        if let Some(operations) = update.operations {
            webhook.operations = operations;
        }
        if let Some(type_name) = update.resource_type_name {
            webhook.resource_type_name = type_name;
        }
        if let Some(type_version) = update.resource_type_version {
            webhook.resource_type_version = type_version;
        }
        if let Some(timeout) = update.timeout_seconds {
            webhook.timeout_seconds = timeout;
        }
        if let Some(policy) = update.failure_policy {
            webhook.failure_policy = policy;
        }
        if let Some(ordering) = update.ordering {
            webhook.ordering = ordering;
        }
        webhook.updated_at = Utc::now();
        Ok(webhook.clone())
    }

    async fn delete_webhook(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.webhooks.len();
        inner.webhooks.retain(|w| w.id != id);
        if inner.webhooks.len() == before {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>> {
        let mut webhooks: Vec<AdmissionWebhook> = self
            .inner
            .lock()
            .webhooks
            .iter()
            .filter(|w| {
                w.webhook_type == webhook_type && w.matches(type_name, type_version, operation)
            })
            .cloned()
            .collect();
        webhooks.sort_by_key(|w| (w.ordering, w.id));
        Ok(webhooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_resource(name: &str) -> NewResource {
        NewResource {
            name: name.to_string(),
            resource_type_name: "bucket".to_string(),
            resource_type_version: "v1".to_string(),
            spec: json!({"a": 1}),
            finalizers: vec!["terraform".to_string()],
        }
    }

    #[tokio::test]
    async fn create_starts_pending_at_generation_one() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        assert_eq!(r.generation, 1);
        assert_eq!(r.observed_generation, 0);
        assert_eq!(r.status, Phase::Pending);
        assert_eq!(r.finalizers, vec!["terraform"]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let store = MemStore::new();
        store.create_resource(new_resource("r1")).await.unwrap();
        let err = store.create_resource(new_resource("r1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn generation_bumps_iff_canonical_spec_changes() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();

        // Same content, different key order: no bump.
        let same: Value = serde_json::from_str(r#"{"a": 1}"#).unwrap();
        let updated = store.update_resource_spec(r.id, same).await.unwrap();
        assert_eq!(updated.generation, 1);

        let changed = store
            .update_resource_spec(r.id, json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(changed.generation, 2);
        assert_eq!(changed.status, Phase::Pending);
        assert!(changed.next_reconcile_time.is_none());
        assert_ne!(changed.spec_hash, r.spec_hash);
    }

    #[tokio::test]
    async fn finalizer_add_remove_round_trips() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        let original = store.get_finalizers(r.id).await.unwrap();

        store.add_finalizer(r.id, "ext").await.unwrap();
        store.add_finalizer(r.id, "ext").await.unwrap();
        assert_eq!(
            store.get_finalizers(r.id).await.unwrap(),
            vec!["terraform", "ext"]
        );

        store.remove_finalizer(r.id, "ext").await.unwrap();
        store.remove_finalizer(r.id, "ext").await.unwrap();
        assert_eq!(store.get_finalizers(r.id).await.unwrap(), original);
    }

    #[tokio::test]
    async fn hard_delete_requires_soft_delete_and_no_finalizers() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();

        // Not soft-deleted yet.
        assert!(matches!(
            store.hard_delete_resource(r.id).await.unwrap_err(),
            StoreError::FinalizersPresent
        ));

        let deleted = store.soft_delete_resource(r.id).await.unwrap();
        assert_eq!(deleted.status, Phase::Deleting);
        assert!(deleted.deleted_at.is_some());

        // Finalizer still present.
        assert!(matches!(
            store.hard_delete_resource(r.id).await.unwrap_err(),
            StoreError::FinalizersPresent
        ));

        store.remove_finalizer(r.id, "terraform").await.unwrap();
        store.hard_delete_resource(r.id).await.unwrap();
        assert!(store.get_resource_any(r.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_is_idempotent() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        let first = store.soft_delete_resource(r.id).await.unwrap();
        let second = store.soft_delete_resource(r.id).await.unwrap();
        assert_eq!(first.deleted_at, second.deleted_at);
    }

    #[tokio::test]
    async fn claim_flips_pending_to_reconciling_exactly_once() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();

        let first = store
            .claim_reconcile_batch(10, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].resource.status, Phase::Reconciling);
        assert_eq!(first[0].previous_phase, Phase::Pending);

        // A second tick must not see the same candidate.
        let second = store
            .claim_reconcile_batch(10, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert!(second.is_empty());

        let stored = store.get_resource(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Phase::Reconciling);
    }

    #[tokio::test]
    async fn claim_prioritizes_deleting_over_pending() {
        let store = MemStore::new();
        let keep = store.create_resource(new_resource("keep")).await.unwrap();
        let gone = store.create_resource(new_resource("gone")).await.unwrap();
        store.soft_delete_resource(gone.id).await.unwrap();

        let claimed = store
            .claim_reconcile_batch(1, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert_eq!(claimed[0].resource.id, gone.id);
        assert_eq!(claimed[0].resource.status, Phase::Deleting);

        let claimed = store
            .claim_reconcile_batch(1, Duration::from_secs(300), &[gone.id])
            .await
            .unwrap();
        assert_eq!(claimed[0].resource.id, keep.id);
    }

    #[tokio::test]
    async fn failed_resources_wait_for_their_backoff() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        store
            .update_status(r.id, Phase::Failed, Some("boom"), None)
            .await
            .unwrap();
        store
            .set_next_reconcile(r.id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();

        let claimed = store
            .claim_reconcile_batch(10, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert!(claimed.is_empty());

        store.set_next_reconcile(r.id, Utc::now()).await.unwrap();
        let claimed = store
            .claim_reconcile_batch(10, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn ready_resources_are_reclaimed_after_drift_interval() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        store
            .update_status(r.id, Phase::Ready, None, Some(1))
            .await
            .unwrap();

        let claimed = store
            .claim_reconcile_batch(10, Duration::from_secs(300), &[])
            .await
            .unwrap();
        assert!(claimed.is_empty(), "drift interval has not elapsed");

        let claimed = store
            .claim_reconcile_batch(10, Duration::from_secs(0), &[])
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn update_status_tracks_retry_count() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();

        store
            .update_status(r.id, Phase::Failed, Some("boom"), None)
            .await
            .unwrap();
        store
            .update_status(r.id, Phase::Failed, Some("boom"), None)
            .await
            .unwrap();
        let failed = store.get_resource(r.id).await.unwrap().unwrap();
        assert_eq!(failed.retry_count, 2);

        store
            .update_status(r.id, Phase::Ready, None, Some(1))
            .await
            .unwrap();
        let ready = store.get_resource(r.id).await.unwrap().unwrap();
        assert_eq!(ready.retry_count, 0);
        assert_eq!(ready.observed_generation, 1);
        assert!(ready.last_reconcile_time.is_some());
    }

    #[tokio::test]
    async fn manual_trigger_is_a_noop_mid_reconcile() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        store
            .claim_reconcile_batch(1, Duration::from_secs(300), &[])
            .await
            .unwrap();

        store.mark_for_reconcile(r.id).await.unwrap();
        let stored = store.get_resource(r.id).await.unwrap().unwrap();
        assert_eq!(stored.status, Phase::Reconciling);
    }

    #[tokio::test]
    async fn history_is_newest_first_with_offset() {
        let store = MemStore::new();
        let r = store.create_resource(new_resource("r1")).await.unwrap();
        for i in 0..3 {
            store
                .append_history(NewHistoryEntry::new(
                    r.id,
                    i + 1,
                    true,
                    Phase::Ready,
                    keel_core::resource::TriggerReason::SpecChange,
                ))
                .await
                .unwrap();
        }
        let page = store.list_history(r.id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].generation, 3);
        let rest = store.list_history(r.id, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].generation, 1);
    }

    #[tokio::test]
    async fn webhooks_for_orders_by_ordering_then_id() {
        let store = MemStore::new();
        for (name, ordering) in [("b", 20), ("a", 10), ("c", 20)] {
            store
                .create_webhook(NewWebhook {
                    name: name.to_string(),
                    resource_type_name: None,
                    resource_type_version: None,
                    webhook_url: "http://example.invalid".to_string(),
                    webhook_type: WebhookType::Mutating,
                    operations: vec![Operation::Create],
                    timeout_seconds: 10,
                    failure_policy: keel_core::resource::FailurePolicy::Fail,
                    ordering,
                })
                .await
                .unwrap();
        }
        let hooks = store
            .webhooks_for("bucket", "v1", Operation::Create, WebhookType::Mutating)
            .await
            .unwrap();
        let names: Vec<&str> = hooks.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn resource_type_delete_is_blocked_while_referenced() {
        let store = MemStore::new();
        let rt = store
            .create_resource_type(NewResourceType {
                name: "bucket".to_string(),
                version: "v1".to_string(),
                schema: json!({"type": "object"}),
                description: None,
                metadata: json!({}),
            })
            .await
            .unwrap();
        let r = store.create_resource(new_resource("r1")).await.unwrap();

        assert!(matches!(
            store.delete_resource_type(rt.id).await.unwrap_err(),
            StoreError::Conflict(_)
        ));

        store.soft_delete_resource(r.id).await.unwrap();
        store.remove_finalizer(r.id, "terraform").await.unwrap();
        store.hard_delete_resource(r.id).await.unwrap();
        store.delete_resource_type(rt.id).await.unwrap();
    }
}
