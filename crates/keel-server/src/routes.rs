//! REST routes and SSE streaming.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::info;
use validator::Validate;

use keel_core::bus::{EventBus, EventFilter};
use keel_core::config::ApiConfig;
use keel_core::event::ResourceEvent;
use keel_core::resource::{NewWebhook, Phase, WebhookType};
use keel_store::{Store, WebhookUpdate};

use crate::error::ApiError;
use crate::gateway::{FinalizersOutcome, WriteGateway};
use crate::types::{
    CreateResourceRequest, CreateResourceTypeRequest, CreateWebhookRequest, EventsQuery,
    FinalizersPatch, HistoryQuery, ListResourceTypesQuery, ListResourcesQuery, ListWebhooksQuery,
    UpdateResourceRequest, UpdateResourceTypeRequest, UpdateWebhookRequest,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub bus: Arc<EventBus>,
    pub gateway: Arc<WriteGateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/resource-types",
            post(create_resource_type).get(list_resource_types),
        )
        .route(
            "/api/v1/resource-types/{id}",
            get(get_resource_type_by_id)
                .put(update_resource_type)
                .delete(delete_resource_type),
        )
        .route(
            "/api/v1/resource-types/{name}/{version}",
            get(get_resource_type_by_key),
        )
        .route("/api/v1/resources", post(create_resource).get(list_resources))
        .route(
            "/api/v1/resources/{id}",
            get(get_resource).put(update_resource).delete(delete_resource),
        )
        .route(
            "/api/v1/resources/by-name/{type}/{version}/{name}",
            get(get_resource_by_name),
        )
        .route("/api/v1/resources/{id}/reconcile", post(trigger_reconcile))
        .route("/api/v1/resources/{id}/history", get(get_history))
        .route("/api/v1/resources/{id}/outputs", get(get_outputs))
        .route("/api/v1/resources/{id}/finalizers", put(patch_finalizers))
        .route("/api/v1/resources/{id}/events", get(stream_resource_events))
        .route(
            "/api/v1/admission-webhooks",
            post(create_webhook).get(list_webhooks),
        )
        .route(
            "/api/v1/admission-webhooks/{id}",
            get(get_webhook).put(update_webhook).delete(delete_webhook),
        )
        .route("/api/v1/events", get(stream_events))
        .with_state(state)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    state: AppState,
    config: &ApiConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(config.server_address()).await?;
    info!(address = %config.server_address(), "API server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ---- resource types ----

async fn create_resource_type(
    State(state): State<AppState>,
    Json(req): Json<CreateResourceTypeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let created = state.gateway.create_resource_type(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_resource_types(
    State(state): State<AppState>,
    Query(query): Query<ListResourceTypesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let types = state.store.list_resource_types(query.name.as_deref()).await?;
    Ok(Json(types))
}

async fn get_resource_type_by_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let resource_type = state
        .store
        .get_resource_type_by_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("resource type not found".to_string()))?;
    Ok(Json(resource_type))
}

async fn get_resource_type_by_key(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let resource_type = state
        .store
        .get_resource_type(&name, &version)
        .await?
        .ok_or_else(|| ApiError::NotFound("resource type not found".to_string()))?;
    Ok(Json(resource_type))
}

async fn update_resource_type(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateResourceTypeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.gateway.update_resource_type(id, req).await?;
    Ok(Json(updated))
}

async fn delete_resource_type(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_resource_type(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- resources ----

async fn create_resource(
    State(state): State<AppState>,
    Json(req): Json<CreateResourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let created = state.gateway.create_resource(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_resources(
    State(state): State<AppState>,
    Query(query): Query<ListResourcesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            Phase::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let resources = state.store.list_resources(status, query.limit).await?;
    Ok(Json(resources))
}

async fn get_resource(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state
        .store
        .get_resource(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;
    Ok(Json(resource))
}

async fn get_resource_by_name(
    State(state): State<AppState>,
    Path((type_name, type_version, name)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state
        .store
        .get_resource_by_name(&type_name, &type_version, &name)
        .await?
        .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;
    Ok(Json(resource))
}

async fn update_resource(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateResourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state.gateway.update_resource(id, req.spec).await?;
    Ok(Json(updated))
}

async fn delete_resource(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.gateway.delete_resource(id).await?;
    Ok(Json(deleted))
}

async fn trigger_reconcile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.trigger_reconcile(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"message": "Reconciliation triggered", "resource_id": id})),
    ))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if state.store.get_resource_any(id).await?.is_none() {
        return Err(ApiError::NotFound("resource not found".to_string()));
    }
    let history = state.store.list_history(id, query.limit, query.offset).await?;
    Ok(Json(history))
}

async fn get_outputs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let resource = state
        .store
        .get_resource(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("resource not found".to_string()))?;
    Ok(Json(json!({"outputs": resource.outputs})))
}

async fn patch_finalizers(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<FinalizersPatch>,
) -> Result<impl IntoResponse, ApiError> {
    match state.gateway.patch_finalizers(id, patch).await? {
        FinalizersOutcome::Updated(resource) => Ok(Json(resource).into_response()),
        FinalizersOutcome::HardDeleted => Ok(Json(json!({
            "message": "All finalizers removed, resource deleted",
            "resource_id": id,
        }))
        .into_response()),
    }
}

// ---- admission webhooks ----

async fn create_webhook(
    State(state): State<AppState>,
    Json(req): Json<CreateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let created = state
        .store
        .create_webhook(NewWebhook {
            name: req.name,
            resource_type_name: req.resource_type_name,
            resource_type_version: req.resource_type_version,
            webhook_url: req.webhook_url,
            webhook_type: req.webhook_type,
            operations: req.operations,
            timeout_seconds: req.timeout_seconds,
            failure_policy: req.failure_policy,
            ordering: req.ordering,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook_type = match query.webhook_type.as_deref() {
        Some(raw) => Some(
            WebhookType::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unknown webhook type '{raw}'")))?,
        ),
        None => None,
    };
    let webhooks = state
        .store
        .list_webhooks(query.resource_type_name.as_deref(), webhook_type)
        .await?;
    Ok(Json(webhooks))
}

async fn get_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = state
        .store
        .get_webhook(id)
        .await?
        .ok_or_else(|| ApiError::NotFound("admission webhook not found".to_string()))?;
    Ok(Json(webhook))
}

async fn update_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateWebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let updated = state
        .store
        .update_webhook(
            id,
            WebhookUpdate {
                webhook_url: req.webhook_url,
                webhook_type: req.webhook_type,
                operations: req.operations,
                resource_type_name: req.resource_type_name,
                resource_type_version: req.resource_type_version,
                timeout_seconds: req.timeout_seconds,
                failure_policy: req.failure_policy,
                ordering: req.ordering,
            },
        )
        .await?;
    Ok(Json(updated))
}

async fn delete_webhook(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_webhook(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- event streams ----

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let filter: Option<EventFilter> = query.resource_type.map(|type_name| {
        Box::new(move |event: &ResourceEvent| event.resource_type_name == type_name)
            as EventFilter
    });
    sse_response(&state.bus, filter)
}

async fn stream_resource_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if state.store.get_resource_any(id).await?.is_none() {
        return Err(ApiError::NotFound("resource not found".to_string()));
    }
    let filter: EventFilter = Box::new(move |event: &ResourceEvent| event.resource_id == id);
    Ok(sse_response(&state.bus, Some(filter)))
}

fn sse_response(
    bus: &EventBus,
    filter: Option<EventFilter>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (_, stream) = bus.subscribe(filter);
    let stream = stream.map(|event| {
        Ok(SseEvent::default()
            .event(event.event_type.as_str())
            .data(serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string())))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}
