//! Event audit store: durable per-event record with idempotent insert.
//!
//! `try_insert` is the exactly-once gate for the whole pipeline: it is
//! unique on the event's dedup key, so replays after a poller crash and
//! races between concurrent workers collapse onto the first record.
//! Every lifecycle transition appends a timeline entry; a janitor flags
//! records stuck in `PROCESSING`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sluice_core::event::{EventStatus, GatewayEvent, TimelineEntry};
use sluice_error::IngestError;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use uuid::Uuid;

/// Retention for audit records
pub const AUDIT_TTL_DAYS: i64 = 90;
/// Default window after which `PROCESSING` records are flagged `STUCK`
pub const DEFAULT_STUCK_AFTER_MINUTES: i64 = 10;

/// A stored audit record
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// The event as first ingested
    pub event:      GatewayEvent,
    /// Lifecycle timeline, oldest first
    pub timeline:   Vec<TimelineEntry>,
    /// When the record expires
    pub expires_at: DateTime<Utc>,
    /// Last transition time, used by the stuck janitor
    pub updated_at: DateTime<Utc>,
}

/// Result of an idempotent insert
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// The event is new; the caller owns processing it
    Inserted,
    /// An event with the same dedup key already exists
    Duplicate(Box<GatewayEvent>),
}

impl InsertOutcome {
    /// Whether the event was inserted.
    #[must_use]
    pub const fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Abstraction for the durable event audit store.
#[async_trait]
pub trait EventAuditStore: Send + Sync {
    /// Insert the event if its dedup key is unseen.
    async fn try_insert(&self, event: &GatewayEvent) -> Result<InsertOutcome, IngestError>;

    /// Transition an event's lifecycle status, appending a timeline entry.
    /// Transitions out of terminal states are ignored.
    async fn transition(
        &self,
        event_id: Uuid,
        status: EventStatus,
        details: Option<String>,
    ) -> Result<(), IngestError>;

    /// Fetch a record by event id.
    async fn get(&self, event_id: Uuid) -> Result<Option<AuditRecord>, IngestError>;

    /// Flag records stuck in `PROCESSING` longer than `stuck_after`.
    /// Returns the number of records flagged.
    async fn sweep_stuck(
        &self,
        now: DateTime<Utc>,
        stuck_after: Duration,
    ) -> Result<u64, IngestError>;
}

/// In-memory audit store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    by_key: DashMap<String, Uuid>,
    by_id:  DashMap<Uuid, AuditRecord>,
}

impl MemoryAuditStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[async_trait]
impl EventAuditStore for MemoryAuditStore {
    async fn try_insert(&self, event: &GatewayEvent) -> Result<InsertOutcome, IngestError> {
        let key = event.dedup_key().cache_key();

        match self.by_key.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                let existing_id = *existing.get();
                let existing_event = self
                    .by_id
                    .get(&existing_id)
                    .map(|record| record.event.clone())
                    .ok_or_else(|| IngestError::Audit {
                        reason: "dedup index points at a missing record".to_string(),
                    })?;
                Ok(InsertOutcome::Duplicate(Box::new(existing_event)))
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let now = Utc::now();
                let record = AuditRecord {
                    event:      event.clone(),
                    timeline:   vec![TimelineEntry {
                        ts:      now,
                        stage:   EventStatus::Received.as_str().to_string(),
                        details: None,
                    }],
                    expires_at: now + Duration::days(AUDIT_TTL_DAYS),
                    updated_at: now,
                };
                slot.insert(event.event_id);
                self.by_id.insert(event.event_id, record);
                Ok(InsertOutcome::Inserted)
            },
        }
    }

    async fn transition(
        &self,
        event_id: Uuid,
        status: EventStatus,
        details: Option<String>,
    ) -> Result<(), IngestError> {
        let Some(mut record) = self.by_id.get_mut(&event_id) else {
            return Err(IngestError::Audit {
                reason: format!("unknown event {event_id}"),
            });
        };
        if record.event.status.is_terminal() {
            return Ok(());
        }
        let now = Utc::now();
        record.event.status = status;
        record.updated_at = now;
        record.timeline.push(TimelineEntry {
            ts: now,
            stage: status.as_str().to_string(),
            details,
        });
        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<AuditRecord>, IngestError> {
        Ok(self.by_id.get(&event_id).map(|record| record.clone()))
    }

    async fn sweep_stuck(
        &self,
        now: DateTime<Utc>,
        stuck_after: Duration,
    ) -> Result<u64, IngestError> {
        let mut flagged = 0u64;
        for mut entry in self.by_id.iter_mut() {
            if entry.event.status == EventStatus::Processing
                && now - entry.updated_at > stuck_after
            {
                entry.event.status = EventStatus::Stuck;
                entry.updated_at = now;
                entry.timeline.push(TimelineEntry {
                    ts:      now,
                    stage:   EventStatus::Stuck.as_str().to_string(),
                    details: Some("processing exceeded stuck window".to_string()),
                });
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}

/// MySQL-backed audit store.
///
/// The table carries a unique index on `dedup_key`; `INSERT IGNORE`
/// detects duplicates without a read-modify-write race. The timeline is a
/// JSON column appended with `JSON_ARRAY_APPEND`.
#[derive(Clone)]
pub struct MySqlAuditStore {
    pool: MySqlPool,
}

impl MySqlAuditStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventAuditStore for MySqlAuditStore {
    async fn try_insert(&self, event: &GatewayEvent) -> Result<InsertOutcome, IngestError> {
        let key = event.dedup_key().cache_key();
        let payload = serde_json::to_string(&event.payload).map_err(|e| IngestError::Audit {
            reason: format!("payload serialization failed: {e}"),
        })?;
        let timeline = serde_json::json!([{
            "ts": Utc::now().to_rfc3339(),
            "stage": EventStatus::Received.as_str(),
        }])
        .to_string();

        let result = sqlx::query(
            r"
            INSERT IGNORE INTO sluice_event_audit
                (event_id, dedup_key, source_name, source_id, org_id, org_unit_id,
                 event_type, payload, payload_hash, status, timeline,
                 received_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NOW(), DATE_ADD(NOW(), INTERVAL ? DAY))
            ",
        )
        .bind(event.event_id.to_string())
        .bind(&key)
        .bind(&event.source)
        .bind(event.source_id)
        .bind(event.org_id)
        .bind(event.org_unit_id)
        .bind(&event.event_type)
        .bind(&payload)
        .bind(&event.payload_hash)
        .bind(EventStatus::Received.as_str())
        .bind(&timeline)
        .bind(event.received_at)
        .bind(AUDIT_TTL_DAYS)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }

        let existing = self.fetch_by_dedup_key(&key).await?;
        match existing {
            Some(event) => Ok(InsertOutcome::Duplicate(Box::new(event))),
            // The winning insert is not visible yet; report a duplicate of
            // the incoming event rather than failing the batch.
            None => Ok(InsertOutcome::Duplicate(Box::new(event.clone()))),
        }
    }

    async fn transition(
        &self,
        event_id: Uuid,
        status: EventStatus,
        details: Option<String>,
    ) -> Result<(), IngestError> {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "stage": status.as_str(),
            "details": details,
        })
        .to_string();

        sqlx::query(
            r"
            UPDATE sluice_event_audit
            SET status = ?,
                timeline = JSON_ARRAY_APPEND(timeline, '$', CAST(? AS JSON)),
                updated_at = NOW()
            WHERE event_id = ?
              AND status NOT IN ('DELIVERED', 'SKIPPED', 'FAILED')
            ",
        )
        .bind(status.as_str())
        .bind(&entry)
        .bind(event_id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, event_id: Uuid) -> Result<Option<AuditRecord>, IngestError> {
        let row = sqlx::query(
            r"
            SELECT event_id, source_name, source_id, org_id, org_unit_id, event_type,
                   payload, payload_hash, status, timeline, received_at, updated_at, expires_at
            FROM sluice_event_audit
            WHERE event_id = ?
            ",
        )
        .bind(event_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    async fn sweep_stuck(
        &self,
        _now: DateTime<Utc>,
        stuck_after: Duration,
    ) -> Result<u64, IngestError> {
        let entry = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "stage": EventStatus::Stuck.as_str(),
            "details": "processing exceeded stuck window",
        })
        .to_string();

        let result = sqlx::query(
            r"
            UPDATE sluice_event_audit
            SET status = 'STUCK',
                timeline = JSON_ARRAY_APPEND(timeline, '$', CAST(? AS JSON)),
                updated_at = NOW()
            WHERE status = 'PROCESSING'
              AND updated_at < DATE_SUB(NOW(), INTERVAL ? MINUTE)
            ",
        )
        .bind(&entry)
        .bind(stuck_after.num_minutes().max(1))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl MySqlAuditStore {
    async fn fetch_by_dedup_key(&self, key: &str) -> Result<Option<GatewayEvent>, IngestError> {
        let row = sqlx::query(
            r"
            SELECT event_id, source_name, source_id, org_id, org_unit_id, event_type,
                   payload, payload_hash, status, timeline, received_at, updated_at, expires_at
            FROM sluice_event_audit
            WHERE dedup_key = ?
            ",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| record_from_row(&row).map(|r| r.event)).transpose()
    }
}

fn record_from_row(row: &sqlx::mysql::MySqlRow) -> Result<AuditRecord, IngestError> {
    let parse_err = |reason: String| IngestError::Audit { reason };

    let event_id: String = row.try_get("event_id").map_err(|e| parse_err(e.to_string()))?;
    let payload: String = row.try_get("payload").map_err(|e| parse_err(e.to_string()))?;
    let timeline: String = row.try_get("timeline").map_err(|e| parse_err(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| parse_err(e.to_string()))?;

    let status = match status.as_str() {
        "RECEIVED" => EventStatus::Received,
        "PROCESSING" => EventStatus::Processing,
        "DELIVERED" => EventStatus::Delivered,
        "SKIPPED" => EventStatus::Skipped,
        "FAILED" => EventStatus::Failed,
        "STUCK" => EventStatus::Stuck,
        other => return Err(parse_err(format!("unknown status '{other}'"))),
    };

    let event = GatewayEvent {
        event_id: Uuid::parse_str(&event_id).map_err(|e| parse_err(e.to_string()))?,
        source: row.try_get("source_name").map_err(|e| parse_err(e.to_string()))?,
        source_id: row.try_get("source_id").map_err(|e| parse_err(e.to_string()))?,
        org_id: row.try_get("org_id").map_err(|e| parse_err(e.to_string()))?,
        org_unit_id: row.try_get("org_unit_id").map_err(|e| parse_err(e.to_string()))?,
        event_type: row.try_get("event_type").map_err(|e| parse_err(e.to_string()))?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        received_at: row.try_get("received_at").map_err(|e| parse_err(e.to_string()))?,
        payload_hash: row.try_get("payload_hash").map_err(|e| parse_err(e.to_string()))?,
        status,
    };

    Ok(AuditRecord {
        event,
        timeline: serde_json::from_str(&timeline).unwrap_or_default(),
        expires_at: row.try_get("expires_at").map_err(|e| parse_err(e.to_string()))?,
        updated_at: row.try_get("updated_at").map_err(|e| parse_err(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(source_id: i64) -> GatewayEvent {
        GatewayEvent::new(
            "orders-queue".to_string(),
            Some(source_id),
            100,
            Some(7),
            "ORDER_CREATED".to_string(),
            json!({"orderId": source_id}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_try_insert_is_idempotent_per_dedup_key() {
        let store = MemoryAuditStore::new();
        let first = event(42);
        assert!(store.try_insert(&first).await.unwrap().is_inserted());

        // Same (source, source_id): duplicate, returns the original event
        let replay = event(42);
        match store.try_insert(&replay).await.unwrap() {
            InsertOutcome::Duplicate(existing) => {
                assert_eq!(existing.event_id, first.event_id);
            },
            InsertOutcome::Inserted => panic!("expected duplicate"),
        }

        // Different row id inserts fine
        assert!(store.try_insert(&event(43)).await.unwrap().is_inserted());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_transition_appends_timeline() {
        let store = MemoryAuditStore::new();
        let e = event(1);
        store.try_insert(&e).await.unwrap();

        store
            .transition(e.event_id, EventStatus::Processing, None)
            .await
            .unwrap();
        store
            .transition(e.event_id, EventStatus::Delivered, Some("trace abc".to_string()))
            .await
            .unwrap();

        let record = store.get(e.event_id).await.unwrap().unwrap();
        assert_eq!(record.event.status, EventStatus::Delivered);
        let stages: Vec<&str> = record.timeline.iter().map(|t| t.stage.as_str()).collect();
        assert_eq!(stages, vec!["RECEIVED", "PROCESSING", "DELIVERED"]);
    }

    #[tokio::test]
    async fn test_terminal_states_do_not_transition() {
        let store = MemoryAuditStore::new();
        let e = event(1);
        store.try_insert(&e).await.unwrap();
        store
            .transition(e.event_id, EventStatus::Delivered, None)
            .await
            .unwrap();
        store
            .transition(e.event_id, EventStatus::Failed, None)
            .await
            .unwrap();

        let record = store.get(e.event_id).await.unwrap().unwrap();
        assert_eq!(record.event.status, EventStatus::Delivered);
        assert_eq!(record.timeline.len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_janitor() {
        let store = MemoryAuditStore::new();
        let e = event(1);
        store.try_insert(&e).await.unwrap();
        store
            .transition(e.event_id, EventStatus::Processing, None)
            .await
            .unwrap();

        // Not yet past the window
        let flagged = store
            .sweep_stuck(Utc::now(), Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(flagged, 0);

        // An hour later it is
        let flagged = store
            .sweep_stuck(Utc::now() + Duration::hours(1), Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(flagged, 1);
        let record = store.get(e.event_id).await.unwrap().unwrap();
        assert_eq!(record.event.status, EventStatus::Stuck);
    }

    #[tokio::test]
    async fn test_fallback_key_dedups_without_source_id() {
        let store = MemoryAuditStore::new();
        let mut a = event(0);
        a.source_id = None;
        let mut b = a.clone();
        b.event_id = Uuid::new_v4();

        assert!(store.try_insert(&a).await.unwrap().is_inserted());
        assert!(!store.try_insert(&b).await.unwrap().is_inserted());
    }
}
