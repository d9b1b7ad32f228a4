//! The reconciliation core of the Keel control plane.
//!
//! The [`Scheduler`] selects resources needing work and dispatches each to
//! its claimed [`Reconciler`] under a per-resource lock, with exponential
//! backoff on failure, drift-triggered re-checks, and the finalizer-guarded
//! deletion protocol. The [`status`] module keeps the coarse phase and the
//! condition set consistent across every transition via
//! [`StatusTransition`] and [`status::conditions_for`], and the
//! [`ReconcilerContext`] is the only surface third-party reconcilers touch.

pub mod context;
pub mod error;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod status;

pub use context::ReconcilerContext;
pub use error::{ControllerError, Result};
pub use reconciler::{ActionPlugin, ReconcileError, ReconcileOutcome, ReconcileResult, Reconciler};
pub use registry::{ActionRegistry, ReconcilerRegistry};
pub use scheduler::Scheduler;
pub use status::StatusTransition;
