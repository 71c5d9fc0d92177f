//! Default event-source config seeding.

use crate::EXIT_DRIFT;
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use sqlx::Row;

/// Create one default source config for every org that has none.
///
/// The default points at the shared `event_queue` table with the standard
/// column mapping and the documented polling defaults.
pub async fn event_source_configs(pool: &MySqlPool, dry_run: bool) -> Result<u8, GatewayError> {
    let rows = sqlx::query(
        r"
        SELECT o.id AS org_id
        FROM sluice_org o
        LEFT JOIN sluice_source_config s ON s.org_id = o.id
        WHERE s.org_id IS NULL
        ",
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        println!("every org has a source config");
        return Ok(0);
    }

    if dry_run {
        for row in &rows {
            let org_id: i64 = row.try_get("org_id").unwrap_or(0);
            println!("org {org_id}: would seed default source config");
        }
        return Ok(EXIT_DRIFT);
    }

    let mapping = serde_json::json!({
        "id": "id",
        "org_id": "org_id",
        "org_unit_id": "org_unit_id",
        "event_type": "event_type",
        "payload": "payload",
        "timestamp": "created_at",
    })
    .to_string();

    let mut seeded = 0u64;
    for row in rows {
        let org_id: i64 = row.try_get("org_id").unwrap_or(0);
        if org_id == 0 {
            continue;
        }
        sqlx::query(
            r"
            INSERT INTO sluice_source_config
                (name, org_id, source_table, column_mapping,
                 poll_interval_secs, batch_size, db_timeout_secs, pool_size, created_at)
            VALUES (?, ?, 'event_queue', ?, 5, 10, 30, 5, NOW())
            ",
        )
        .bind(format!("default-{org_id}"))
        .bind(org_id)
        .bind(&mapping)
        .execute(pool)
        .await?;
        seeded += 1;
        println!("org {org_id}: seeded default source config");
    }

    println!("seeded {seeded} config(s)");
    Ok(0)
}
