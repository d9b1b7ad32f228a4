//! Request payloads for the REST API.
//!
//! Name and version formats are checked with the shared validation rules;
//! everything else the schema can express is left to the resource type's
//! own schema and the admission chain.

use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use keel_core::resource::{FailurePolicy, Operation, ResourceTypeStatus, WebhookType};

#[derive(Debug, Deserialize, Validate)]
pub struct CreateResourceTypeRequest {
    pub name: String,
    pub version: String,
    pub schema: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateResourceTypeRequest {
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<ResourceTypeStatus>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateResourceRequest {
    pub name: String,
    pub resource_type_name: String,
    pub resource_type_version: String,
    pub spec: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateResourceRequest {
    pub spec: Value,
}

/// Body of `PUT /api/v1/resources/{id}/finalizers`.
#[derive(Debug, Default, Deserialize)]
pub struct FinalizersPatch {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateWebhookRequest {
    pub name: String,
    #[serde(default)]
    pub resource_type_name: Option<String>,
    #[serde(default)]
    pub resource_type_version: Option<String>,
    #[validate(url(message = "webhook_url must be a valid URL"))]
    pub webhook_url: String,
    pub webhook_type: WebhookType,
    pub operations: Vec<Operation>,
    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1, max = 300, message = "timeout must be 1-300 seconds"))]
    pub timeout_seconds: i32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub ordering: i32,
}

fn default_timeout_seconds() -> i32 {
    10
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct UpdateWebhookRequest {
    #[serde(default)]
    #[validate(url(message = "webhook_url must be a valid URL"))]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_type: Option<WebhookType>,
    #[serde(default)]
    pub operations: Option<Vec<Operation>>,
    #[serde(default, with = "double_option")]
    pub resource_type_name: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub resource_type_version: Option<Option<String>>,
    #[serde(default)]
    #[validate(range(min = 1, max = 300, message = "timeout must be 1-300 seconds"))]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub ordering: Option<i32>,
}

/// Distinguishes an absent field (keep) from an explicit null (clear).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListResourceTypesQuery {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListResourcesQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_list_limit")]
    pub limit: i64,
}

fn default_list_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_history_limit() -> i64 {
    20
}

#[derive(Debug, Default, Deserialize)]
pub struct ListWebhooksQuery {
    pub resource_type_name: Option<String>,
    pub webhook_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub resource_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_request_defaults_and_bounds() {
        let req: CreateWebhookRequest = serde_json::from_value(serde_json::json!({
            "name": "wh",
            "webhook_url": "http://example.com/admit",
            "webhook_type": "mutating",
            "operations": ["CREATE"]
        }))
        .unwrap();
        assert_eq!(req.timeout_seconds, 10);
        assert_eq!(req.failure_policy, FailurePolicy::Fail);
        assert_eq!(req.ordering, 0);
        assert!(req.validate().is_ok());

        let bad: CreateWebhookRequest = serde_json::from_value(serde_json::json!({
            "name": "wh",
            "webhook_url": "not a url",
            "webhook_type": "validating",
            "operations": ["DELETE"],
            "timeout_seconds": 0
        }))
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn unknown_operation_fails_to_parse() {
        let result: Result<CreateWebhookRequest, _> = serde_json::from_value(serde_json::json!({
            "name": "wh",
            "webhook_url": "http://example.com/",
            "webhook_type": "mutating",
            "operations": ["PATCH"]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn webhook_update_distinguishes_absent_from_null() {
        let untouched: UpdateWebhookRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(untouched.resource_type_name, None);

        let cleared: UpdateWebhookRequest =
            serde_json::from_value(serde_json::json!({"resource_type_name": null})).unwrap();
        assert_eq!(cleared.resource_type_name, Some(None));

        let set: UpdateWebhookRequest =
            serde_json::from_value(serde_json::json!({"resource_type_name": "bucket"})).unwrap();
        assert_eq!(set.resource_type_name, Some(Some("bucket".to_string())));
    }
}
