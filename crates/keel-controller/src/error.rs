use thiserror::Error;

use keel_store::StoreError;

#[derive(Error, Debug)]
pub enum ControllerError {
    /// Two reconcilers claimed the same resource type. Startup-fatal.
    #[error("resource type '{resource_type}' is already claimed by reconciler '{existing}'")]
    ResourceTypeConflict {
        resource_type: String,
        existing: String,
    },

    /// No reconciler is registered for the resource type.
    #[error("no reconciler registered for resource type '{0}'")]
    NoReconciler(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
