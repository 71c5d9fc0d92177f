//! Canonical index management.

use crate::EXIT_DRIFT;
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

/// Canonical index set: (table, index name, definition)
const CANONICAL: &[(&str, &str, &str)] = &[
    (
        "sluice_event_audit",
        "uq_audit_dedup_key",
        "CREATE UNIQUE INDEX uq_audit_dedup_key ON sluice_event_audit (dedup_key)",
    ),
    (
        "sluice_event_audit",
        "ix_audit_org_status_received",
        "CREATE INDEX ix_audit_org_status_received ON sluice_event_audit (org_id, status, received_at DESC)",
    ),
    (
        "sluice_event_audit",
        "ix_audit_expires",
        "CREATE INDEX ix_audit_expires ON sluice_event_audit (expires_at)",
    ),
    (
        "sluice_dlq",
        "ix_dlq_scan",
        "CREATE INDEX ix_dlq_scan ON sluice_dlq (status, next_attempt_at)",
    ),
    (
        "sluice_dlq",
        "ix_dlq_org_created",
        "CREATE INDEX ix_dlq_org_created ON sluice_dlq (org_id, created_at DESC)",
    ),
    (
        "sluice_schedule",
        "ix_schedule_due",
        "CREATE INDEX ix_schedule_due ON sluice_schedule (status, scheduled_for)",
    ),
    (
        "sluice_schedule",
        "ix_schedule_subject",
        "CREATE INDEX ix_schedule_subject ON sluice_schedule (org_id, event_type, subject_key)",
    ),
    (
        "sluice_execution_log",
        "ix_log_integration_started",
        "CREATE INDEX ix_log_integration_started ON sluice_execution_log (integration_id, started_at DESC)",
    ),
    (
        "sluice_delivery_attempt",
        "ix_attempt_trace",
        "CREATE INDEX ix_attempt_trace ON sluice_delivery_attempt (delivery_log_id, attempt_number)",
    ),
];

/// Index names from earlier releases that should no longer exist
const LEGACY: &[(&str, &str)] = &[
    ("sluice_event_audit", "ix_audit_tenant"),
    ("sluice_dlq", "ix_dlq_tenant_status"),
];

/// Drop legacy indexes and create any missing canonical ones.
pub async fn rebuild(pool: &MySqlPool, dry_run: bool) -> Result<u8, GatewayError> {
    let mut drift = false;

    for (table, name) in LEGACY {
        if index_exists(pool, table, name).await? {
            drift = true;
            if dry_run {
                println!("{table}: legacy index {name} would be dropped");
            } else {
                sqlx::query(&format!("DROP INDEX `{name}` ON `{table}`"))
                    .execute(pool)
                    .await?;
                println!("{table}: dropped legacy index {name}");
            }
        }
    }

    for (table, name, ddl) in CANONICAL {
        if index_exists(pool, table, name).await? {
            continue;
        }
        drift = true;
        if dry_run {
            println!("{table}: index {name} is missing");
        } else {
            sqlx::query(ddl).execute(pool).await?;
            println!("{table}: created index {name}");
        }
    }

    if !drift {
        println!("indexes are canonical");
    }
    Ok(if dry_run && drift { EXIT_DRIFT } else { 0 })
}

async fn index_exists(pool: &MySqlPool, table: &str, name: &str) -> Result<bool, GatewayError> {
    let count: i64 = sqlx::query(
        "SELECT COUNT(*) AS n FROM information_schema.statistics \
         WHERE table_schema = DATABASE() AND table_name = ? AND index_name = ?",
    )
    .bind(table)
    .bind(name)
    .fetch_one(pool)
    .await?
    .try_get("n")
    .unwrap_or(0);
    Ok(count > 0)
}
