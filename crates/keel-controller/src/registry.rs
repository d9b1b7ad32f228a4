//! Reconciler and action-plugin registries.
//!
//! Both are populated once at startup and then shared immutably. A
//! resource type may be claimed by at most one reconciler; a second claim
//! is a startup-fatal [`ControllerError::ResourceTypeConflict`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::context::ReconcilerContext;
use crate::error::{ControllerError, Result};
use crate::reconciler::{ActionPlugin, Reconciler};

/// Registry mapping resource types to their claimed reconciler.
#[derive(Default)]
pub struct ReconcilerRegistry {
    reconcilers: HashMap<String, Arc<dyn Reconciler>>,
    by_type: HashMap<String, String>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reconciler, claiming all of its resource types.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) -> Result<()> {
        let name = reconciler.name().to_string();
        let resource_types = reconciler.resource_types();

        for resource_type in &resource_types {
            if let Some(existing) = self.by_type.get(resource_type) {
                if existing != &name {
                    return Err(ControllerError::ResourceTypeConflict {
                        resource_type: resource_type.clone(),
                        existing: existing.clone(),
                    });
                }
            }
        }

        if self.reconcilers.contains_key(&name) {
            warn!(reconciler = %name, "Overwriting existing reconciler registration");
        }
        for resource_type in &resource_types {
            self.by_type.insert(resource_type.clone(), name.clone());
        }
        info!(
            reconciler = %name,
            resource_types = ?resource_types,
            "Registered reconciler"
        );
        self.reconcilers.insert(name, reconciler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Reconciler>> {
        self.reconcilers.get(name).cloned()
    }

    pub fn reconciler_for(&self, resource_type: &str) -> Option<Arc<dyn Reconciler>> {
        let name = self.by_type.get(resource_type)?;
        self.reconcilers.get(name).cloned()
    }

    pub fn has_reconciler_for(&self, resource_type: &str) -> bool {
        self.by_type.contains_key(resource_type)
    }

    pub fn names(&self) -> Vec<String> {
        self.reconcilers.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.reconcilers.is_empty()
    }

    /// Launch each reconciler's own loop in its own task.
    pub fn start_all(&self, ctx: Arc<ReconcilerContext>) -> Vec<(String, JoinHandle<()>)> {
        self.reconcilers
            .iter()
            .map(|(name, reconciler)| {
                let reconciler = reconciler.clone();
                let ctx = ctx.clone();
                let task_name = name.clone();
                info!(reconciler = %name, "Starting reconciler loop");
                (
                    name.clone(),
                    tokio::spawn(async move {
                        reconciler.start(ctx).await;
                        info!(reconciler = %task_name, "Reconciler loop exited");
                    }),
                )
            })
            .collect()
    }

    /// Stop every reconciler and await their loops within `grace`.
    ///
    /// The shutdown signal is expected to have fired already; this calls
    /// each `stop` hook and bounds how long exits may take.
    pub async fn stop_all(&self, handles: Vec<(String, JoinHandle<()>)>, grace: Duration) {
        for (name, reconciler) in &self.reconcilers {
            reconciler.stop().await;
            info!(reconciler = %name, "Stopped reconciler");
        }

        for (name, handle) in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(reconciler = %name, error = %e, "Reconciler task panicked"),
                Err(_) => {
                    warn!(reconciler = %name, "Reconciler did not exit within grace period");
                }
            }
        }
    }
}

/// Action plugins, registered by string name and handed out as opaque
/// capability handles.
#[derive(Default)]
pub struct ActionRegistry {
    plugins: HashMap<String, Arc<dyn ActionPlugin>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn ActionPlugin>) {
        let name = plugin.name().to_string();
        if self.plugins.insert(name.clone(), plugin).is_some() {
            warn!(plugin = %name, "Overwriting existing action plugin");
        } else {
            info!(plugin = %name, "Registered action plugin");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }
}
