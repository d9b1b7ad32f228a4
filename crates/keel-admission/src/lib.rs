//! Admission webhooks: an ordered pipeline of external HTTP callbacks that
//! mutate and validate every write before persistence.
//!
//! Mutating webhooks run first and may return JSON Patch operations against
//! the spec; validating webhooks run afterwards and can only deny. Both
//! tiers execute strictly in `ordering, id` order, one attempt per webhook
//! per request.

pub mod chain;
pub mod patch;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use keel_store::StoreError;

pub use chain::AdmissionChain;
pub use patch::{apply_patches, PatchError, PatchOp};

/// Errors from the admission chain.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// A webhook denied the write (or a failure-policy `Fail` webhook could
    /// not be reached). The message is surfaced to the API client.
    #[error("{0}")]
    Denied(String),

    /// The webhook registry could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

/// The resource document webhooks see.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionResource {
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
}

/// Response body expected from a webhook endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionResponse {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub patches: Vec<PatchOp>,
}
