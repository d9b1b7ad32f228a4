//! The reconciler capability interface.
//!
//! A reconciler claims one or more resource types and drives their
//! instances toward the declared spec. Implementations are registered at
//! startup; the scheduler dispatches claimed resources to them and owns all
//! bookkeeping (status, history, events), so a reconcile call only has to
//! do the domain work and report what happened.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use keel_core::resource::Resource;

use crate::context::ReconcilerContext;

/// A failed reconciliation attempt. Retried with exponential backoff;
/// never crashes the scheduler.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ReconcileError(pub String);

impl ReconcileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a successful attempt reports back.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Human-readable summary for `status_message`.
    pub message: Option<String>,
    /// Ask to be re-checked sooner than the drift interval.
    pub requeue_after: Option<std::time::Duration>,
    /// The external world had diverged from the spec.
    pub drift_detected: bool,
    /// Outputs document to persist, surfaced read-only through the API.
    pub outputs: Option<Value>,
    pub plan_output: Option<String>,
    pub apply_output: Option<String>,
    pub resources_created: i32,
    pub resources_updated: i32,
    pub resources_deleted: i32,
}

pub type ReconcileResult = std::result::Result<ReconcileOutcome, ReconcileError>;

/// A pluggable worker owning the reconciliation logic for its types.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Unique identifier; also the finalizer pre-inserted on every resource
    /// of a claimed type.
    fn name(&self) -> &str;

    /// Resource type names this reconciler claims. Claims are exclusive.
    fn resource_types(&self) -> Vec<String>;

    /// Optional long-running loop for reconcilers that watch on their own
    /// cadence. The default parks until shutdown; the scheduler dispatches
    /// work regardless.
    async fn start(&self, ctx: Arc<ReconcilerContext>) {
        let mut shutdown = ctx.shutdown_signal();
        let _ = shutdown.recv().await;
    }

    /// Drive one resource toward its spec.
    ///
    /// For a soft-deleted resource this is the destroy path: tear down the
    /// external state and, only after a successful destroy, remove this
    /// reconciler's own finalizer through the context. On a failed destroy
    /// leave the finalizer in place and return the error.
    async fn reconcile(&self, resource: &Resource, ctx: Arc<ReconcilerContext>)
        -> ReconcileResult;

    /// Graceful shutdown hook.
    async fn stop(&self) {}
}

/// An opaque action executor reconcilers can look up by name.
///
/// Action plugins live entirely outside the core: the payload and result
/// documents are a private contract between a reconciler and its plugin.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        action: &str,
        payload: &Value,
    ) -> std::result::Result<Value, ReconcileError>;
}
