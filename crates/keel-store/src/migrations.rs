//! Forward-only schema migrations.
//!
//! Migrations are embedded in the binary and applied in order, each in its
//! own transaction, with an audit row per applied version. Already-applied
//! versions are skipped, so startup is idempotent.

use deadpool_postgres::Pool;
use tracing::info;

use crate::error::{Result, StoreError};

/// Ordered list of `(version, name, sql)` migrations.
const MIGRATIONS: &[(&str, &str, &str)] =
    &[("001", "init", include_str!("../migrations/001_init.sql"))];

/// Apply all pending migrations. Returns how many ran.
pub async fn run_migrations(pool: &Pool) -> Result<usize> {
    let client = pool.get().await?;
    client
        .execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                id BIGSERIAL PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            &[],
        )
        .await?;

    let applied: Vec<String> = client
        .query("SELECT version FROM schema_migrations", &[])
        .await?
        .into_iter()
        .map(|row| row.get(0))
        .collect();
    drop(client);

    let mut count = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.iter().any(|v| v == version) {
            continue;
        }

        let mut client = pool.get().await?;
        let tx = client.transaction().await?;
        tx.batch_execute(sql)
            .await
            .map_err(|e| StoreError::Transient(format!("migration {version}_{name}: {e}")))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[version, name],
        )
        .await?;
        tx.commit().await?;

        info!(version, name, "Applied migration");
        count += 1;
    }

    if count == 0 {
        info!("Database schema is up to date");
    } else {
        info!(applied = count, "Database schema initialized");
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::MIGRATIONS;

    #[test]
    fn migrations_are_ordered_and_unique() {
        let mut versions: Vec<&str> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        let original = versions.clone();
        versions.sort();
        versions.dedup();
        assert_eq!(versions, original);
    }

    #[test]
    fn init_migration_creates_every_table() {
        let sql = MIGRATIONS[0].2;
        for table in [
            "resource_types",
            "resources",
            "reconciliation_history",
            "admission_webhooks",
            "locks",
        ] {
            assert!(sql.contains(table), "missing table {table}");
        }
    }
}
