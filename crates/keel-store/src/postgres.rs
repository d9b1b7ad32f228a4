//! PostgreSQL implementation of the [`Store`] contract.
//!
//! Connection pooling via deadpool-postgres. Every multi-invariant mutation
//! (spec replacement, condition merge, hard delete, claim batch) runs in a
//! single transaction; the claim batch uses `FOR UPDATE SKIP LOCKED` so
//! concurrent claimants never hand out the same resource twice.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use serde_json::Value;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};

use keel_core::condition::{Condition, Conditions};
use keel_core::config::DbConfig;
use keel_core::hash::spec_hash;
use keel_core::resource::{
    AdmissionWebhook, FailurePolicy, HistoryEntry, NewHistoryEntry, NewResource, NewWebhook,
    Operation, Phase, Resource, ResourceType, ResourceTypeStatus, TriggerReason, WebhookType,
};

use crate::error::{Result, StoreError};
use crate::migrations::run_migrations;
use crate::{ClaimedResource, NewResourceType, ResourceTypeUpdate, Store, WebhookUpdate};

/// PostgreSQL-backed store.
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build the pool and verify connectivity.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let mut pg = deadpool_postgres::Config::new();
        pg.host = Some(config.host.clone());
        pg.port = Some(config.port);
        pg.dbname = Some(config.name.clone());
        pg.user = Some(config.user.clone());
        pg.password = Some(config.password.clone());
        pg.pool = Some(deadpool_postgres::PoolConfig::new(config.pool_size));

        let pool = pg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Transient(format!("pool creation failed: {e}")))?;

        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        info!(
            host = %config.host,
            port = config.port,
            database = %config.name,
            pool_size = config.pool_size,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> Result<usize> {
        run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

fn decode<E: std::fmt::Display>(what: &str) -> impl Fn(E) -> StoreError + '_ {
    move |e| StoreError::Decode(format!("{what}: {e}"))
}

fn resource_type_from_row(row: &Row) -> Result<ResourceType> {
    let status: String = row.get("status");
    Ok(ResourceType {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        schema: row.get("schema"),
        description: row.get("description"),
        status: ResourceTypeStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown resource type status '{status}'")))?,
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn resource_from_row(row: &Row) -> Result<Resource> {
    let status: String = row.get("status");
    let finalizers: Value = row.get("finalizers");
    let conditions: Value = row.get("conditions");
    Ok(Resource {
        id: row.get("id"),
        name: row.get("name"),
        resource_type_name: row.get("resource_type_name"),
        resource_type_version: row.get("resource_type_version"),
        spec: row.get("spec"),
        outputs: row.get("outputs"),
        finalizers: serde_json::from_value(finalizers).map_err(decode("finalizers"))?,
        status: Phase::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("unknown phase '{status}'")))?,
        status_message: row.get("status_message"),
        generation: row.get("generation"),
        observed_generation: row.get("observed_generation"),
        spec_hash: row.get("spec_hash"),
        retry_count: row.get("retry_count"),
        last_reconcile_time: row.get("last_reconcile_time"),
        next_reconcile_time: row.get("next_reconcile_time"),
        conditions: serde_json::from_value(conditions).map_err(decode("conditions"))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn history_from_row(row: &Row) -> Result<HistoryEntry> {
    let phase: String = row.get("phase");
    let trigger: String = row.get("trigger_reason");
    Ok(HistoryEntry {
        id: row.get("id"),
        resource_id: row.get("resource_id"),
        generation: row.get("generation"),
        success: row.get("success"),
        phase: Phase::parse(&phase)
            .ok_or_else(|| StoreError::Decode(format!("unknown phase '{phase}'")))?,
        plan_output: row.get("plan_output"),
        apply_output: row.get("apply_output"),
        error_message: row.get("error_message"),
        resources_created: row.get("resources_created"),
        resources_updated: row.get("resources_updated"),
        resources_deleted: row.get("resources_deleted"),
        duration_seconds: row.get("duration_seconds"),
        trigger_reason: TriggerReason::parse(&trigger)
            .ok_or_else(|| StoreError::Decode(format!("unknown trigger reason '{trigger}'")))?,
        drift_detected: row.get("drift_detected"),
        reconcile_time: row.get("reconcile_time"),
    })
}

fn webhook_from_row(row: &Row) -> Result<AdmissionWebhook> {
    let webhook_type: String = row.get("webhook_type");
    let failure_policy: String = row.get("failure_policy");
    let operations: Value = row.get("operations");
    Ok(AdmissionWebhook {
        id: row.get("id"),
        name: row.get("name"),
        resource_type_name: row.get("resource_type_name"),
        resource_type_version: row.get("resource_type_version"),
        webhook_url: row.get("webhook_url"),
        webhook_type: WebhookType::parse(&webhook_type)
            .ok_or_else(|| StoreError::Decode(format!("unknown webhook type '{webhook_type}'")))?,
        operations: serde_json::from_value(operations).map_err(decode("operations"))?,
        timeout_seconds: row.get("timeout_seconds"),
        failure_policy: FailurePolicy::parse(&failure_policy).ok_or_else(|| {
            StoreError::Decode(format!("unknown failure policy '{failure_policy}'"))
        })?,
        ordering: row.get("ordering"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn operations_json(operations: &[Operation]) -> Value {
    Value::Array(
        operations
            .iter()
            .map(|op| Value::String(op.as_str().to_string()))
            .collect(),
    )
}

#[async_trait]
impl Store for PgStore {
    async fn create_resource_type(&self, new: NewResourceType) -> Result<ResourceType> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO resource_types (name, version, schema, description, metadata)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING *",
                &[
                    &new.name,
                    &new.version,
                    &new.schema,
                    &new.description,
                    &new.metadata,
                ],
            )
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => {
                    StoreError::DuplicateName(format!("{}/{}", new.name, new.version))
                }
                other => other,
            })?;
        debug!(name = %new.name, version = %new.version, "Created resource type");
        resource_type_from_row(&row)
    }

    async fn get_resource_type_by_id(&self, id: i64) -> Result<Option<ResourceType>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM resource_types WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(resource_type_from_row).transpose()
    }

    async fn get_resource_type(
        &self,
        name: &str,
        version: &str,
    ) -> Result<Option<ResourceType>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM resource_types WHERE name = $1 AND version = $2",
                &[&name, &version],
            )
            .await?;
        row.as_ref().map(resource_type_from_row).transpose()
    }

    async fn list_resource_types(&self, name: Option<&str>) -> Result<Vec<ResourceType>> {
        let client = self.pool.get().await?;
        let rows = match name {
            Some(name) => {
                client
                    .query(
                        "SELECT * FROM resource_types WHERE name = $1 ORDER BY name, version",
                        &[&name],
                    )
                    .await?
            }
            None => {
                client
                    .query("SELECT * FROM resource_types ORDER BY name, version", &[])
                    .await?
            }
        };
        rows.iter().map(resource_type_from_row).collect()
    }

    async fn update_resource_type(
        &self,
        id: i64,
        update: ResourceTypeUpdate,
    ) -> Result<ResourceType> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt("SELECT * FROM resource_types WHERE id = $1 FOR UPDATE", &[&id])
            .await?
            .ok_or(StoreError::NotFound)?;
        let current = resource_type_from_row(&row)?;

        let schema = update.schema.unwrap_or(current.schema);
        let description = update.description.or(current.description);
        let status = update.status.unwrap_or(current.status);
        let metadata = update.metadata.unwrap_or(current.metadata);

        let row = tx
            .query_one(
                "UPDATE resource_types
                 SET schema = $2, description = $3, status = $4, metadata = $5,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING *",
                &[&id, &schema, &description, &status.as_str(), &metadata],
            )
            .await?;
        tx.commit().await?;
        resource_type_from_row(&row)
    }

    async fn delete_resource_type(&self, id: i64) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT name, version FROM resource_types WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let name: String = row.get("name");
        let version: String = row.get("version");

        let referencing: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM resources
                 WHERE resource_type_name = $1 AND resource_type_version = $2
                   AND deleted_at IS NULL",
                &[&name, &version],
            )
            .await?
            .get(0);
        if referencing > 0 {
            return Err(StoreError::Conflict(format!(
                "{referencing} resources still reference type {name}/{version}"
            )));
        }

        tx.execute("DELETE FROM resource_types WHERE id = $1", &[&id])
            .await?;
        tx.commit().await?;
        debug!(name = %name, version = %version, "Deleted resource type");
        Ok(())
    }

    async fn create_resource(&self, new: NewResource) -> Result<Resource> {
        let hash = spec_hash(&new.spec);
        let finalizers = serde_json::to_value(&new.finalizers)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO resources
                     (name, resource_type_name, resource_type_version, spec,
                      spec_hash, finalizers, status, next_reconcile_time)
                 VALUES ($1, $2, $3, $4, $5, $6, 'pending', NOW())
                 RETURNING *",
                &[
                    &new.name,
                    &new.resource_type_name,
                    &new.resource_type_version,
                    &new.spec,
                    &hash,
                    &finalizers,
                ],
            )
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::DuplicateName(new.name.clone()),
                other => other,
            })?;
        debug!(name = %new.name, "Created resource");
        resource_from_row(&row)
    }

    async fn get_resource(&self, id: i64) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM resources WHERE id = $1 AND deleted_at IS NULL",
                &[&id],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn get_resource_any(&self, id: i64) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM resources WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn get_resource_by_name(
        &self,
        type_name: &str,
        type_version: &str,
        name: &str,
    ) -> Result<Option<Resource>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT * FROM resources
                 WHERE name = $1 AND resource_type_name = $2
                   AND resource_type_version = $3 AND deleted_at IS NULL",
                &[&name, &type_name, &type_version],
            )
            .await?;
        row.as_ref().map(resource_from_row).transpose()
    }

    async fn list_resources(&self, status: Option<Phase>, limit: i64) -> Result<Vec<Resource>> {
        let client = self.pool.get().await?;
        let rows = match status {
            Some(status) => {
                client
                    .query(
                        "SELECT * FROM resources
                         WHERE deleted_at IS NULL AND status = $1
                         ORDER BY created_at DESC LIMIT $2",
                        &[&status.as_str(), &limit],
                    )
                    .await?
            }
            None => {
                client
                    .query(
                        "SELECT * FROM resources WHERE deleted_at IS NULL
                         ORDER BY created_at DESC LIMIT $1",
                        &[&limit],
                    )
                    .await?
            }
        };
        rows.iter().map(resource_from_row).collect()
    }

    async fn update_resource_spec(&self, id: i64, spec: Value) -> Result<Resource> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT spec_hash FROM resources
                 WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let current_hash: String = row.get("spec_hash");
        let new_hash = spec_hash(&spec);

        let row = if new_hash != current_hash {
            tx.query_one(
                "UPDATE resources
                 SET spec = $2, spec_hash = $3, generation = generation + 1,
                     status = 'pending', status_message = NULL,
                     next_reconcile_time = NULL, updated_at = NOW()
                 WHERE id = $1
                 RETURNING *",
                &[&id, &spec, &new_hash],
            )
            .await?
        } else {
            // Same canonical content, possibly different key order; keep the
            // stored document current without bumping the generation.
            tx.query_one(
                "UPDATE resources SET spec = $2, updated_at = NOW()
                 WHERE id = $1 RETURNING *",
                &[&id, &spec],
            )
            .await?
        };
        tx.commit().await?;
        resource_from_row(&row)
    }

    async fn soft_delete_resource(&self, id: i64) -> Result<Resource> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "UPDATE resources
                 SET deleted_at = COALESCE(deleted_at, NOW()), status = 'deleting',
                     next_reconcile_time = NOW(), updated_at = NOW()
                 WHERE id = $1
                 RETURNING *",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        debug!(resource = id, "Marked resource for deletion");
        resource_from_row(&row)
    }

    async fn hard_delete_resource(&self, id: i64) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT deleted_at, finalizers FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let deleted_at: Option<DateTime<Utc>> = row.get("deleted_at");
        let finalizers: Value = row.get("finalizers");
        let finalizers: Vec<String> =
            serde_json::from_value(finalizers).map_err(decode("finalizers"))?;

        if deleted_at.is_none() || !finalizers.is_empty() {
            return Err(StoreError::FinalizersPresent);
        }

        tx.execute("DELETE FROM resources WHERE id = $1", &[&id])
            .await?;
        tx.commit().await?;
        info!(resource = id, "Hard-deleted resource");
        Ok(())
    }

    async fn add_finalizer(&self, id: i64, finalizer: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources
                 SET finalizers = CASE
                         WHEN NOT finalizers @> to_jsonb($2::text)
                         THEN finalizers || to_jsonb($2::text)
                         ELSE finalizers
                     END,
                     updated_at = NOW()
                 WHERE id = $1",
                &[&id, &finalizer],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn remove_finalizer(&self, id: i64, finalizer: &str) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources
                 SET finalizers = COALESCE(
                         (SELECT jsonb_agg(elem)
                          FROM jsonb_array_elements(finalizers) AS elem
                          WHERE elem #>> '{}' != $2),
                         '[]'::jsonb
                     ),
                     updated_at = NOW()
                 WHERE id = $1",
                &[&id, &finalizer],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn patch_finalizers(
        &self,
        id: i64,
        add: &[String],
        remove: &[String],
    ) -> Result<Vec<String>> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT finalizers FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let stored: Value = row.get("finalizers");
        let mut finalizers: Vec<String> =
            serde_json::from_value(stored).map_err(decode("finalizers"))?;

        for finalizer in add {
            if !finalizers.contains(finalizer) {
                finalizers.push(finalizer.clone());
            }
        }
        finalizers.retain(|f| !remove.contains(f));

        let updated =
            serde_json::to_value(&finalizers).map_err(|e| StoreError::Decode(e.to_string()))?;
        tx.execute(
            "UPDATE resources SET finalizers = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &updated],
        )
        .await?;
        tx.commit().await?;
        Ok(finalizers)
    }

    async fn get_finalizers(&self, id: i64) -> Result<Vec<String>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT finalizers FROM resources WHERE id = $1", &[&id])
            .await?
            .ok_or(StoreError::NotFound)?;
        let finalizers: Value = row.get("finalizers");
        serde_json::from_value(finalizers).map_err(decode("finalizers"))
    }

    async fn update_status(
        &self,
        id: i64,
        phase: Phase,
        message: Option<&str>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources
                 SET status = $2,
                     status_message = $3,
                     observed_generation = COALESCE($4, observed_generation),
                     retry_count = CASE
                         WHEN $2 = 'failed' THEN retry_count + 1
                         WHEN $2 = 'ready' THEN 0
                         ELSE retry_count
                     END,
                     last_reconcile_time = CASE
                         WHEN $2 IN ('ready', 'failed') THEN NOW()
                         ELSE last_reconcile_time
                     END,
                     updated_at = NOW()
                 WHERE id = $1",
                &[&id, &phase.as_str(), &message, &observed_generation],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_condition(&self, id: i64, condition: Condition) -> Result<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT conditions FROM resources WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let stored: Value = row.get("conditions");
        let mut conditions: Conditions =
            serde_json::from_value(stored).map_err(decode("conditions"))?;
        conditions.upsert(condition);

        let conditions =
            serde_json::to_value(&conditions).map_err(|e| StoreError::Decode(e.to_string()))?;
        tx.execute(
            "UPDATE resources SET conditions = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &conditions],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_outputs(&self, id: i64, outputs: Value) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources SET outputs = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &outputs],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_next_reconcile(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources SET next_reconcile_time = $2, updated_at = NOW()
                 WHERE id = $1",
                &[&id, &at],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_for_reconcile(&self, id: i64) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE resources
                 SET next_reconcile_time = NOW(), status = 'pending', updated_at = NOW()
                 WHERE id = $1 AND deleted_at IS NULL AND status <> 'reconciling'",
                &[&id],
            )
            .await?;
        if updated == 0 {
            // Either absent or mid-reconcile; the latter is a documented no-op.
            let exists = client
                .query_opt(
                    "SELECT 1 FROM resources WHERE id = $1 AND deleted_at IS NULL",
                    &[&id],
                )
                .await?
                .is_some();
            if !exists {
                return Err(StoreError::NotFound);
            }
        }
        Ok(())
    }

    async fn claim_reconcile_batch(
        &self,
        limit: usize,
        drift_interval: Duration,
        exclude: &[i64],
    ) -> Result<Vec<ClaimedResource>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = limit as i64;
        let drift_secs = drift_interval.as_secs_f64();
        let exclude: Vec<i64> = exclude.to_vec();

        let client = self.pool.get().await?;
        let rows = client
            .query(
                "UPDATE resources
                 SET status = CASE WHEN resources.deleted_at IS NOT NULL THEN 'deleting'
                                   ELSE 'reconciling' END,
                     updated_at = NOW()
                 FROM (
                     SELECT id, status AS prev_status FROM resources
                     WHERE NOT (id = ANY($3))
                       AND (
                         (deleted_at IS NULL AND status <> 'reconciling' AND (
                             status = 'pending'
                             OR (status = 'failed' AND next_reconcile_time IS NOT NULL
                                 AND next_reconcile_time <= NOW())
                             OR (status = 'ready' AND last_reconcile_time IS NOT NULL
                                 AND last_reconcile_time + make_interval(secs => $2) <= NOW())
                             OR generation > observed_generation
                         ))
                         OR (deleted_at IS NOT NULL AND status = 'deleting')
                       )
                     ORDER BY
                         CASE status
                             WHEN 'deleting' THEN 0
                             WHEN 'pending' THEN 1
                             WHEN 'failed' THEN 2
                             ELSE 3
                         END,
                         next_reconcile_time ASC NULLS FIRST
                     LIMIT $1
                     FOR UPDATE SKIP LOCKED
                 ) AS claimed
                 WHERE resources.id = claimed.id
                 RETURNING resources.*, claimed.prev_status",
                &[&limit, &drift_secs, &exclude],
            )
            .await?;
        rows.iter()
            .map(|row| {
                let prev: String = row.get("prev_status");
                Ok(ClaimedResource {
                    resource: resource_from_row(row)?,
                    previous_phase: Phase::parse(&prev)
                        .ok_or_else(|| StoreError::Decode(format!("unknown phase '{prev}'")))?,
                })
            })
            .collect()
    }

    async fn resources_needing_reconciliation(
        &self,
        type_names: &[String],
        limit: i64,
        drift_interval: Duration,
    ) -> Result<Vec<Resource>> {
        let drift_secs = drift_interval.as_secs_f64();
        let type_names: Vec<String> = type_names.to_vec();
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM resources
                 WHERE resource_type_name = ANY($3)
                   AND (
                     (deleted_at IS NULL AND status <> 'reconciling' AND (
                         status = 'pending'
                         OR (status = 'failed' AND next_reconcile_time IS NOT NULL
                             AND next_reconcile_time <= NOW())
                         OR (status = 'ready' AND last_reconcile_time IS NOT NULL
                             AND last_reconcile_time + make_interval(secs => $2) <= NOW())
                         OR generation > observed_generation
                     ))
                     OR (deleted_at IS NOT NULL AND status = 'deleting')
                   )
                 ORDER BY next_reconcile_time ASC NULLS FIRST
                 LIMIT $1",
                &[&limit, &drift_secs, &type_names],
            )
            .await?;
        rows.iter().map(resource_from_row).collect()
    }

    async fn append_history(&self, entry: NewHistoryEntry) -> Result<HistoryEntry> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "INSERT INTO reconciliation_history
                     (resource_id, generation, success, phase, plan_output,
                      apply_output, error_message, resources_created,
                      resources_updated, resources_deleted, duration_seconds,
                      trigger_reason, drift_detected)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 RETURNING *",
                &[
                    &entry.resource_id,
                    &entry.generation,
                    &entry.success,
                    &entry.phase.as_str(),
                    &entry.plan_output,
                    &entry.apply_output,
                    &entry.error_message,
                    &entry.resources_created,
                    &entry.resources_updated,
                    &entry.resources_deleted,
                    &entry.duration_seconds,
                    &entry.trigger_reason.as_str(),
                    &entry.drift_detected,
                ],
            )
            .await?;
        history_from_row(&row)
    }

    async fn list_history(
        &self,
        resource_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<HistoryEntry>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM reconciliation_history
                 WHERE resource_id = $1
                 ORDER BY reconcile_time DESC
                 LIMIT $2 OFFSET $3",
                &[&resource_id, &limit, &offset],
            )
            .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn create_webhook(&self, new: NewWebhook) -> Result<AdmissionWebhook> {
        let client = self.pool.get().await?;
        let operations = operations_json(&new.operations);
        let row = client
            .query_one(
                "INSERT INTO admission_webhooks
                     (name, resource_type_name, resource_type_version, webhook_url,
                      webhook_type, operations, timeout_seconds, failure_policy, ordering)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                 RETURNING *",
                &[
                    &new.name,
                    &new.resource_type_name,
                    &new.resource_type_version,
                    &new.webhook_url,
                    &new.webhook_type.as_str(),
                    &operations,
                    &new.timeout_seconds,
                    &new.failure_policy.as_str(),
                    &new.ordering,
                ],
            )
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Conflict(_) => StoreError::DuplicateName(new.name.clone()),
                other => other,
            })?;
        webhook_from_row(&row)
    }

    async fn get_webhook(&self, id: i64) -> Result<Option<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM admission_webhooks WHERE id = $1", &[&id])
            .await?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    async fn list_webhooks(
        &self,
        type_name: Option<&str>,
        webhook_type: Option<WebhookType>,
    ) -> Result<Vec<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let webhook_type = webhook_type.map(|t| t.as_str());
        let rows = client
            .query(
                "SELECT * FROM admission_webhooks
                 WHERE ($1::text IS NULL OR resource_type_name = $1)
                   AND ($2::text IS NULL OR webhook_type = $2)
                 ORDER BY ordering ASC, id ASC",
                &[&type_name, &webhook_type],
            )
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn update_webhook(&self, id: i64, update: WebhookUpdate) -> Result<AdmissionWebhook> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                "SELECT * FROM admission_webhooks WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await?
            .ok_or(StoreError::NotFound)?;
        let current = webhook_from_row(&row)?;

        let webhook_url = update.webhook_url.unwrap_or(current.webhook_url);
        let webhook_type = update.webhook_type.unwrap_or(current.webhook_type);
        let operations = operations_json(&update.operations.unwrap_or(current.operations));
        let resource_type_name = update
            .resource_type_name
            .unwrap_or(current.resource_type_name);
        let resource_type_version = update
            .resource_type_version
            .unwrap_or(current.resource_type_version);
        let timeout_seconds = update.timeout_seconds.unwrap_or(current.timeout_seconds);
        let failure_policy = update.failure_policy.unwrap_or(current.failure_policy);
        let ordering = update.ordering.unwrap_or(current.ordering);

        let row = tx
            .query_one(
                "UPDATE admission_webhooks
                 SET webhook_url = $2, webhook_type = $3, operations = $4,
                     resource_type_name = $5, resource_type_version = $6,
                     timeout_seconds = $7, failure_policy = $8, ordering = $9,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING *",
                &[
                    &id,
                    &webhook_url,
                    &webhook_type.as_str(),
                    &operations,
                    &resource_type_name,
                    &resource_type_version,
                    &timeout_seconds,
                    &failure_policy.as_str(),
                    &ordering,
                ],
            )
            .await?;
        tx.commit().await?;
        webhook_from_row(&row)
    }

    async fn delete_webhook(&self, id: i64) -> Result<()> {
        let client = self.pool.get().await?;
        let deleted = client
            .execute("DELETE FROM admission_webhooks WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn webhooks_for(
        &self,
        type_name: &str,
        type_version: &str,
        operation: Operation,
        webhook_type: WebhookType,
    ) -> Result<Vec<AdmissionWebhook>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT * FROM admission_webhooks
                 WHERE webhook_type = $1
                   AND operations @> to_jsonb($2::text)
                   AND (resource_type_name IS NULL
                        OR (resource_type_name = $3
                            AND (resource_type_version IS NULL
                                 OR resource_type_version = $4)))
                 ORDER BY ordering ASC, id ASC",
                &[
                    &webhook_type.as_str(),
                    &operation.as_str(),
                    &type_name,
                    &type_version,
                ],
            )
            .await?;
        rows.iter().map(webhook_from_row).collect()
    }
}
