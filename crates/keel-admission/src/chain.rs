//! Ordered execution of admission webhooks.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use keel_core::resource::{AdmissionWebhook, FailurePolicy, Operation, WebhookType};
use keel_store::Store;

use crate::patch::apply_patches;
use crate::{AdmissionError, AdmissionResource, AdmissionResponse, Result};

/// Fallback when a webhook row carries a non-positive timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs matching webhooks against a write: mutating first, then validating,
/// each tier in `ordering, id` order. The chain is serial and makes exactly
/// one attempt per webhook.
pub struct AdmissionChain {
    store: Arc<dyn Store>,
    client: reqwest::Client,
}

impl AdmissionChain {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }

    /// Run the chain for one write, returning the (possibly mutated) spec.
    pub async fn run(
        &self,
        operation: Operation,
        mut resource: AdmissionResource,
        old_resource: Option<&Value>,
    ) -> Result<Value> {
        let mutating = self
            .store
            .webhooks_for(
                &resource.resource_type_name,
                &resource.resource_type_version,
                operation,
                WebhookType::Mutating,
            )
            .await?;
        let validating = self
            .store
            .webhooks_for(
                &resource.resource_type_name,
                &resource.resource_type_version,
                operation,
                WebhookType::Validating,
            )
            .await?;

        if mutating.is_empty() && validating.is_empty() {
            return Ok(resource.spec);
        }

        for webhook in &mutating {
            match self.call(webhook, operation, &resource, old_resource).await {
                Ok(response) => {
                    if !response.allowed {
                        return Err(denied(&response, webhook));
                    }
                    if !response.patches.is_empty() {
                        debug!(
                            webhook = %webhook.name,
                            patches = response.patches.len(),
                            "Applying admission patches"
                        );
                        resource.spec = apply_patches(&resource.spec, &response.patches)
                            .map_err(|e| AdmissionError::Denied(format!("invalid patch: {e}")))?;
                    }
                }
                Err(cause) => self.handle_failure(webhook, &cause)?,
            }
        }

        for webhook in &validating {
            match self.call(webhook, operation, &resource, old_resource).await {
                Ok(response) => {
                    if !response.allowed {
                        return Err(denied(&response, webhook));
                    }
                    if !response.patches.is_empty() {
                        warn!(
                            webhook = %webhook.name,
                            "Validating webhook returned patches; ignoring"
                        );
                    }
                }
                Err(cause) => self.handle_failure(webhook, &cause)?,
            }
        }

        Ok(resource.spec)
    }

    fn handle_failure(&self, webhook: &AdmissionWebhook, cause: &str) -> Result<()> {
        match webhook.failure_policy {
            FailurePolicy::Ignore => {
                warn!(webhook = %webhook.name, cause, "Admission webhook failed; ignoring");
                Ok(())
            }
            FailurePolicy::Fail => Err(AdmissionError::Denied(format!(
                "webhook {} failed: {cause}",
                webhook.name
            ))),
        }
    }

    /// One POST to a webhook endpoint; any transport-level problem or
    /// non-2xx status is reported as a failure string for the policy check.
    async fn call(
        &self,
        webhook: &AdmissionWebhook,
        operation: Operation,
        resource: &AdmissionResource,
        old_resource: Option<&Value>,
    ) -> std::result::Result<AdmissionResponse, String> {
        let payload = json!({
            "operation": operation,
            "resource": resource,
            "old_resource": old_resource,
        });

        let timeout = if webhook.timeout_seconds > 0 {
            Duration::from_secs(webhook.timeout_seconds as u64)
        } else {
            DEFAULT_TIMEOUT
        };

        let response = self
            .client
            .post(&webhook.webhook_url)
            .timeout(timeout)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("webhook returned HTTP {status}"));
        }

        response
            .json::<AdmissionResponse>()
            .await
            .map_err(|e| format!("invalid webhook response: {e}"))
    }
}

fn denied(response: &AdmissionResponse, webhook: &AdmissionWebhook) -> AdmissionError {
    if response.message.is_empty() {
        AdmissionError::Denied(format!(
            "Denied by {} webhook {}",
            webhook.webhook_type.as_str(),
            webhook.name
        ))
    } else {
        AdmissionError::Denied(response.message.clone())
    }
}
