//! HTTP surface of the Keel control plane.
//!
//! A thin axum translation layer: handlers parse and validate payloads,
//! the [`WriteGateway`] runs the write pipeline (schema validation, the
//! admission chain, the store mutation, the change event), and reads go
//! straight to the store. Event streams are served as SSE with periodic
//! keepalive comments.

pub mod error;
pub mod gateway;
pub mod routes;
pub mod types;

pub use error::ApiError;
pub use gateway::WriteGateway;
pub use routes::{router, serve, AppState};
