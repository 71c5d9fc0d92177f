//! Legacy tenant-id migration.

use crate::EXIT_DRIFT;
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

/// Tables that historically carried `tenant_id` instead of `org_id`
const TABLES: &[&str] = &["sluice_event_audit", "sluice_dlq", "sluice_schedule"];

/// Copy `tenant_id` into `org_id` wherever `org_id` is unset.
///
/// With `dry_run` the command only reports the affected row counts and
/// exits 2 when any table has drift.
pub async fn org_id_from_tenant_id(pool: &MySqlPool, dry_run: bool) -> Result<u8, GatewayError> {
    let mut drift = false;

    for table in TABLES {
        if !has_column(pool, table, "tenant_id").await? {
            println!("{table}: no legacy tenant_id column, skipping");
            continue;
        }

        let pending: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS n FROM `{table}` \
             WHERE tenant_id IS NOT NULL AND (org_id IS NULL OR org_id = 0)"
        ))
        .fetch_one(pool)
        .await?
        .try_get("n")
        .unwrap_or(0);

        if pending == 0 {
            println!("{table}: up to date");
            continue;
        }
        drift = true;

        if dry_run {
            println!("{table}: {pending} row(s) would be migrated");
            continue;
        }

        let result = sqlx::query(&format!(
            "UPDATE `{table}` SET org_id = tenant_id \
             WHERE tenant_id IS NOT NULL AND (org_id IS NULL OR org_id = 0)"
        ))
        .execute(pool)
        .await?;
        println!("{table}: migrated {} row(s)", result.rows_affected());
    }

    Ok(if dry_run && drift { EXIT_DRIFT } else { 0 })
}

async fn has_column(pool: &MySqlPool, table: &str, column: &str) -> Result<bool, GatewayError> {
    let count: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM information_schema.columns \
         WHERE table_schema = DATABASE() AND table_name = ? AND column_name = ?",
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?
    .try_get("n")
    .unwrap_or(0);
    Ok(count > 0)
}
