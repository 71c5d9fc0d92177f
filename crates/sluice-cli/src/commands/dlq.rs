//! DLQ inspection and replay.

use chrono::Utc;
use sluice_delivery::dlq::{DlqStore, MySqlDlqStore};
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use uuid::Uuid;

/// Print DLQ statistics by status and failure kind.
pub async fn stats(pool: &MySqlPool) -> Result<u8, GatewayError> {
    let store = MySqlDlqStore::new(pool.clone());
    let stats = store.stats().await?;
    println!("{stats}");
    let mut kinds: Vec<(&String, &usize)> = stats.by_kind.iter().collect();
    kinds.sort_by(|a, b| b.1.cmp(a.1));
    for (kind, count) in kinds {
        println!("  {kind}: {count}");
    }
    Ok(0)
}

/// List entries, optionally filtered by status.
pub async fn list(pool: &MySqlPool, limit: u32, status: Option<&str>) -> Result<u8, GatewayError> {
    let query = match status {
        Some(_) => {
            "SELECT document FROM sluice_dlq WHERE status = ? ORDER BY updated_at DESC LIMIT ?"
        },
        None => "SELECT document FROM sluice_dlq ORDER BY updated_at DESC LIMIT ?",
    };
    let mut q = sqlx::query_as::<_, (String,)>(query);
    if let Some(status) = status {
        q = q.bind(status);
    }
    let rows = q.bind(i64::from(limit)).fetch_all(pool).await?;

    if rows.is_empty() {
        println!("no entries");
        return Ok(0);
    }
    for (document,) in rows {
        let entry: sluice_delivery::DlqEntry = serde_json::from_str(&document)?;
        println!(
            "{}  {:>9}  attempts={}  {}  {}",
            entry.id,
            entry.status.as_str(),
            entry.attempts,
            entry.error.kind,
            entry.error.message.chars().take(80).collect::<String>(),
        );
    }
    Ok(0)
}

/// Show a single entry as pretty JSON.
pub async fn show(pool: &MySqlPool, id: Uuid) -> Result<u8, GatewayError> {
    let store = MySqlDlqStore::new(pool.clone());
    match store.get(id).await? {
        Some(entry) => {
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(0)
        },
        None => {
            eprintln!("no DLQ entry {id}");
            Ok(1)
        },
    }
}

/// Queue an entry for immediate pickup by the gateway's DLQ worker.
pub async fn replay(pool: &MySqlPool, id: Uuid) -> Result<u8, GatewayError> {
    let store = MySqlDlqStore::new(pool.clone());
    let Some(entry) = store.get(id).await? else {
        eprintln!("no DLQ entry {id}");
        return Ok(1);
    };
    store.requeue(id, entry.attempts, Utc::now()).await?;
    println!("entry {id} queued for replay");
    Ok(0)
}
