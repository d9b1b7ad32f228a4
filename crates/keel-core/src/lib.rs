//! Core types for the Keel control plane.
//!
//! This crate carries everything the other crates agree on: the resource
//! data model, the condition set, resource events and the in-process event
//! bus, canonical spec hashing, the OpenAPI-subset spec validator, and
//! configuration loaded from the environment.

pub mod bus;
pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod resource;
pub mod schema;
pub mod validation;

pub use bus::{EventBus, EventStream, SubscriberId};
pub use condition::{Condition, ConditionStatus, Conditions};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{EventType, ResourceEvent};
pub use resource::{
    AdmissionWebhook, FailurePolicy, HistoryEntry, NewHistoryEntry, NewResource, NewWebhook,
    Operation, Phase, Resource, ResourceType, ResourceTypeStatus, TriggerReason, WebhookType,
};
