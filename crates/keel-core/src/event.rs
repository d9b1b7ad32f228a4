//! Resource change events.
//!
//! Every committed store mutation on a resource emits one of these through
//! the in-process bus; the API relays them to SSE subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::Resource;

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Created,
    Modified,
    Deleted,
    Reconciled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Modified => "MODIFIED",
            Self::Deleted => "DELETED",
            Self::Reconciled => "RECONCILED",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted when a resource changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceEvent {
    pub event_type: EventType,
    pub resource_id: i64,
    pub resource_name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub resource_data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ResourceEvent {
    /// Build an event carrying a full snapshot of the resource.
    pub fn from_resource(event_type: EventType, resource: &Resource) -> Self {
        Self {
            event_type,
            resource_id: resource.id,
            resource_name: resource.name.clone(),
            resource_type_name: resource.resource_type_name.clone(),
            resource_type_version: resource.resource_type_version.clone(),
            resource_data: serde_json::to_value(resource).unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }
}
