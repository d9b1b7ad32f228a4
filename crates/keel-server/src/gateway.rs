//! The write gateway: operation glue for every mutation.
//!
//! CREATE/UPDATE run schema validation, then the admission chain, then the
//! store mutation, then publish the change event, in that order. DELETE is
//! soft-delete only; the reconciler drives the destroy path from there.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use keel_admission::{AdmissionChain, AdmissionResource};
use keel_controller::ReconcilerRegistry;
use keel_core::bus::EventBus;
use keel_core::event::{EventType, ResourceEvent};
use keel_core::resource::{NewResource, Operation, Resource, ResourceType};
use keel_core::schema::{self, SchemaViolation};
use keel_core::validation::{validate_name, validate_version};
use keel_store::{NewResourceType, ResourceTypeUpdate, Store};

use crate::error::ApiError;
use crate::types::{
    CreateResourceRequest, CreateResourceTypeRequest, FinalizersPatch, UpdateResourceTypeRequest,
};

/// Result of a finalizer PATCH on a deleting resource.
pub enum FinalizersOutcome {
    Updated(Resource),
    /// The patch emptied the set on a soft-deleted resource and the
    /// gateway hard-deleted it immediately.
    HardDeleted,
}

pub struct WriteGateway {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    admission: Arc<AdmissionChain>,
    registry: Arc<ReconcilerRegistry>,
}

impl WriteGateway {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<EventBus>,
        admission: Arc<AdmissionChain>,
        registry: Arc<ReconcilerRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            admission,
            registry,
        }
    }

    pub async fn create_resource_type(
        &self,
        req: CreateResourceTypeRequest,
    ) -> Result<ResourceType, ApiError> {
        validate_name(&req.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        validate_version(&req.version).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        schema::check_schema(&req.schema).map_err(violations_to_bad_request)?;

        let created = self
            .store
            .create_resource_type(NewResourceType {
                name: req.name,
                version: req.version,
                schema: req.schema,
                description: req.description,
                metadata: req.metadata.unwrap_or_else(|| Value::Object(Default::default())),
            })
            .await?;
        info!(name = %created.name, version = %created.version, "Created resource type");
        Ok(created)
    }

    pub async fn update_resource_type(
        &self,
        id: i64,
        req: UpdateResourceTypeRequest,
    ) -> Result<ResourceType, ApiError> {
        if let Some(schema) = &req.schema {
            schema::check_schema(schema).map_err(violations_to_bad_request)?;
        }
        let updated = self
            .store
            .update_resource_type(
                id,
                ResourceTypeUpdate {
                    schema: req.schema,
                    description: req.description,
                    status: req.status,
                    metadata: req.metadata,
                },
            )
            .await?;
        Ok(updated)
    }

    pub async fn create_resource(
        &self,
        req: CreateResourceRequest,
    ) -> Result<Resource, ApiError> {
        validate_name(&req.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let resource_type = self
            .store
            .get_resource_type(&req.resource_type_name, &req.resource_type_version)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "resource type {}/{} not found",
                    req.resource_type_name, req.resource_type_version
                ))
            })?;

        let spec =
            schema::validate(&resource_type.schema, &req.spec).map_err(violations_to_bad_request)?;

        let reconciler = self
            .registry
            .reconciler_for(&req.resource_type_name)
            .ok_or_else(|| {
                ApiError::BadRequest(format!(
                    "no reconciler registered for resource type '{}'",
                    req.resource_type_name
                ))
            })?;

        let spec = self
            .admission
            .run(
                Operation::Create,
                AdmissionResource {
                    name: req.name.clone(),
                    resource_type_name: req.resource_type_name.clone(),
                    resource_type_version: req.resource_type_version.clone(),
                    spec,
                },
                None,
            )
            .await?;

        let created = self
            .store
            .create_resource(NewResource {
                name: req.name,
                resource_type_name: req.resource_type_name,
                resource_type_version: req.resource_type_version,
                spec,
                finalizers: vec![reconciler.name().to_string()],
            })
            .await?;

        info!(
            name = %created.name,
            resource_type = %created.resource_type_name,
            "Created resource"
        );
        self.bus
            .publish(&ResourceEvent::from_resource(EventType::Created, &created));
        Ok(created)
    }

    pub async fn update_resource(&self, id: i64, spec: Value) -> Result<Resource, ApiError> {
        let current = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;

        let resource_type = self
            .store
            .get_resource_type(&current.resource_type_name, &current.resource_type_version)
            .await?
            .ok_or_else(|| {
                ApiError::NotFound(format!(
                    "resource type {}/{} not found",
                    current.resource_type_name, current.resource_type_version
                ))
            })?;

        let spec =
            schema::validate(&resource_type.schema, &spec).map_err(violations_to_bad_request)?;

        let old_doc = serde_json::to_value(&current).unwrap_or(Value::Null);
        let spec = self
            .admission
            .run(
                Operation::Update,
                AdmissionResource {
                    name: current.name.clone(),
                    resource_type_name: current.resource_type_name.clone(),
                    resource_type_version: current.resource_type_version.clone(),
                    spec,
                },
                Some(&old_doc),
            )
            .await?;

        let updated = self.store.update_resource_spec(id, spec).await?;
        info!(
            name = %updated.name,
            generation = updated.generation,
            "Updated resource spec"
        );
        self.bus
            .publish(&ResourceEvent::from_resource(EventType::Modified, &updated));
        Ok(updated)
    }

    pub async fn delete_resource(&self, id: i64) -> Result<Resource, ApiError> {
        let resource = self
            .store
            .get_resource(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;

        self.admission
            .run(
                Operation::Delete,
                AdmissionResource {
                    name: resource.name.clone(),
                    resource_type_name: resource.resource_type_name.clone(),
                    resource_type_version: resource.resource_type_version.clone(),
                    spec: resource.spec.clone(),
                },
                None,
            )
            .await?;

        let deleted = self.store.soft_delete_resource(id).await?;
        info!(name = %deleted.name, "Resource marked for deletion");
        self.bus
            .publish(&ResourceEvent::from_resource(EventType::Deleted, &deleted));
        Ok(deleted)
    }

    /// Apply a finalizer patch. Does not trigger reconciliation, but a
    /// deleting resource whose set empties is hard-deleted on the spot.
    pub async fn patch_finalizers(
        &self,
        id: i64,
        patch: FinalizersPatch,
    ) -> Result<FinalizersOutcome, ApiError> {
        for finalizer in patch.add.iter().chain(patch.remove.iter()) {
            validate_name(finalizer).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        }

        let resource = self
            .store
            .get_resource_any(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;

        let remaining = self
            .store
            .patch_finalizers(id, &patch.add, &patch.remove)
            .await?;

        if resource.is_deleting() && remaining.is_empty() {
            self.store.hard_delete_resource(id).await?;
            info!(name = %resource.name, "All finalizers removed; resource deleted");
            return Ok(FinalizersOutcome::HardDeleted);
        }

        let updated = self
            .store
            .get_resource_any(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;
        Ok(FinalizersOutcome::Updated(updated))
    }

    /// Manual trigger; a no-op while the resource is mid-reconcile.
    pub async fn trigger_reconcile(&self, id: i64) -> Result<(), ApiError> {
        self.store.mark_for_reconcile(id).await?;
        info!(resource = id, "Reconciliation triggered manually");
        Ok(())
    }
}

fn violations_to_bad_request(violations: Vec<SchemaViolation>) -> ApiError {
    let detail = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    ApiError::BadRequest(format!("Spec validation failed: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use keel_controller::{ReconcileOutcome, Reconciler, ReconcilerContext};
    use keel_core::resource::Phase;
    use keel_store::testing::MemStore;
    use serde_json::json;

    struct NoopReconciler;

    #[async_trait]
    impl Reconciler for NoopReconciler {
        fn name(&self) -> &str {
            "noop"
        }

        fn resource_types(&self) -> Vec<String> {
            vec!["bucket".to_string()]
        }

        async fn reconcile(
            &self,
            _resource: &keel_core::resource::Resource,
            _ctx: Arc<ReconcilerContext>,
        ) -> Result<ReconcileOutcome, keel_controller::ReconcileError> {
            Ok(ReconcileOutcome::default())
        }
    }

    struct Fixture {
        store: Arc<MemStore>,
        bus: Arc<EventBus>,
        gateway: WriteGateway,
    }

    fn fixture() -> Fixture {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let bus = Arc::new(EventBus::default());
        let mut registry = ReconcilerRegistry::new();
        registry.register(Arc::new(NoopReconciler)).unwrap();
        let admission = Arc::new(AdmissionChain::new(store.clone()));
        let gateway = WriteGateway::new(
            store.clone(),
            bus.clone(),
            admission,
            Arc::new(registry),
        );
        Fixture {
            store,
            bus,
            gateway,
        }
    }

    async fn seed_type(f: &Fixture) {
        f.gateway
            .create_resource_type(CreateResourceTypeRequest {
                name: "bucket".to_string(),
                version: "v1".to_string(),
                schema: json!({
                    "type": "object",
                    "required": ["a"],
                    "properties": {
                        "a": {"type": "integer"},
                        "tier": {"type": "string", "default": "standard"}
                    }
                }),
                description: None,
                metadata: None,
            })
            .await
            .unwrap();
    }

    fn create_req(name: &str, spec: Value) -> CreateResourceRequest {
        CreateResourceRequest {
            name: name.to_string(),
            resource_type_name: "bucket".to_string(),
            resource_type_version: "v1".to_string(),
            spec,
        }
    }

    #[tokio::test]
    async fn create_pipeline_validates_defaults_and_publishes() {
        let f = fixture();
        seed_type(&f).await;
        let (_, mut events) = f.bus.subscribe(None);

        let created = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(created.status, Phase::Pending);
        assert_eq!(created.generation, 1);
        // Schema defaults were applied before persistence.
        assert_eq!(created.spec["tier"], "standard");
        // The claimed reconciler's finalizer is pre-inserted.
        assert_eq!(created.finalizers, vec!["noop"]);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::Created);
        assert_eq!(event.resource_name, "r1");
    }

    #[tokio::test]
    async fn create_rejects_unknown_type_bad_spec_and_unclaimed_type() {
        let f = fixture();

        // Type missing entirely: 404.
        let err = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        seed_type(&f).await;

        // Spec fails the schema: 400.
        let err = f
            .gateway
            .create_resource(create_req("r1", json!({"a": "one"})))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("expected integer"));

        // Type exists but nothing reconciles it: 400.
        f.gateway
            .create_resource_type(CreateResourceTypeRequest {
                name: "queue".to_string(),
                version: "v1".to_string(),
                schema: json!({"type": "object"}),
                description: None,
                metadata: None,
            })
            .await
            .unwrap();
        let err = f
            .gateway
            .create_resource(CreateResourceRequest {
                name: "q1".to_string(),
                resource_type_name: "queue".to_string(),
                resource_type_version: "v1".to_string(),
                spec: json!({}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("no reconciler"));
    }

    #[tokio::test]
    async fn duplicate_name_is_conflict() {
        let f = fixture();
        seed_type(&f).await;
        f.gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap();
        let err = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 2})))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn update_republishes_and_respects_generation_semantics() {
        let f = fixture();
        seed_type(&f).await;
        let created = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap();
        let (_, mut events) = f.bus.subscribe(None);

        // Identical spec (defaults included): no generation bump.
        let same = f
            .gateway
            .update_resource(created.id, json!({"a": 1, "tier": "standard"}))
            .await
            .unwrap();
        assert_eq!(same.generation, 1);

        let changed = f
            .gateway
            .update_resource(created.id, json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(changed.generation, 2);
        assert_eq!(changed.status, Phase::Pending);

        // Both updates publish MODIFIED.
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Modified);
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Modified);
    }

    #[tokio::test]
    async fn delete_is_soft_and_publishes_deleted() {
        let f = fixture();
        seed_type(&f).await;
        let created = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap();
        let (_, mut events) = f.bus.subscribe(None);

        let deleted = f.gateway.delete_resource(created.id).await.unwrap();
        assert_eq!(deleted.status, Phase::Deleting);
        assert!(deleted.deleted_at.is_some());
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Deleted);

        // Live reads no longer see it.
        assert!(f.store.get_resource(created.id).await.unwrap().is_none());
        // But it is still present pending finalizers.
        assert!(f.store.get_resource_any(created.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn finalizer_patch_fast_path_hard_deletes() {
        let f = fixture();
        seed_type(&f).await;
        let created = f
            .gateway
            .create_resource(create_req("r1", json!({"a": 1})))
            .await
            .unwrap();
        f.gateway
            .patch_finalizers(
                created.id,
                FinalizersPatch {
                    add: vec!["ext".to_string()],
                    remove: vec![],
                },
            )
            .await
            .unwrap();
        f.gateway.delete_resource(created.id).await.unwrap();

        // Removing only one finalizer keeps the resource.
        let outcome = f
            .gateway
            .patch_finalizers(
                created.id,
                FinalizersPatch {
                    add: vec![],
                    remove: vec!["noop".to_string()],
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizersOutcome::Updated(ref r) if r.finalizers == ["ext"]));

        // Emptying the set on a deleting resource deletes immediately.
        let outcome = f
            .gateway
            .patch_finalizers(
                created.id,
                FinalizersPatch {
                    add: vec![],
                    remove: vec!["ext".to_string()],
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizersOutcome::HardDeleted));
        assert!(f.store.get_resource_any(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resource_type_with_bad_schema_is_rejected() {
        let f = fixture();
        let err = f
            .gateway
            .create_resource_type(CreateResourceTypeRequest {
                name: "bucket".to_string(),
                version: "v1".to_string(),
                schema: json!({"type": "object", "properties": {"x": {"type": "tuple"}}}),
                description: None,
                metadata: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("unsupported type"));
    }
}
