//! Scheduled-entry persistence with row-level leases.
//!
//! Workers acquire due entries by flipping `PENDING → PROCESSING` with a
//! lease (`leased_by`, `leased_until`) in one guarded update, so an entry
//! can never be dispatched by two workers at once, across processes or
//! restarts.

use crate::entry::{CancellationInfo, SchedStatus, ScheduledEntry};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sluice_error::ScheduleError;
use sqlx::mysql::MySqlPool;
use std::collections::HashMap;
use uuid::Uuid;

/// Durable storage for scheduled entries.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Insert a new entry.
    async fn insert(&self, entry: &ScheduledEntry) -> Result<(), ScheduleError>;

    /// Atomically lease up to `limit` dispatchable entries due by
    /// `now + skew`, marking them `PROCESSING`.
    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        skew: Duration,
        worker_id: &str,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<ScheduledEntry>, ScheduleError>;

    /// Mark an entry `SENT`.
    async fn mark_sent(&self, id: Uuid) -> Result<(), ScheduleError>;

    /// Mark an entry `FAILED`.
    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<(), ScheduleError>;

    /// Return a leased entry to `PENDING` with a new scheduled time.
    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempt_count: u32,
    ) -> Result<(), ScheduleError>;

    /// Cancel pending entries matching (org, event type, subject).
    /// Returns the number cancelled.
    async fn cancel_matching(
        &self,
        org_id: i64,
        event_type: &str,
        subject_key: &str,
        reason: &str,
    ) -> Result<u64, ScheduleError>;

    /// Relabel pending entries past the overdue window. Returns the count.
    async fn mark_overdue(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, ScheduleError>;

    /// Return entries whose lease expired to `PENDING`. Returns the count.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, ScheduleError>;

    /// Fetch by id.
    async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, ScheduleError>;
}

/// In-memory schedule store.
#[derive(Default)]
pub struct MemoryScheduleStore {
    entries: Mutex<HashMap<Uuid, ScheduledEntry>>,
}

impl MemoryScheduleStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, for assertions in tests.
    #[must_use]
    pub fn all(&self) -> Vec<ScheduledEntry> {
        self.entries.lock().values().cloned().collect()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn insert(&self, entry: &ScheduledEntry) -> Result<(), ScheduleError> {
        self.entries.lock().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        skew: Duration,
        worker_id: &str,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<ScheduledEntry>, ScheduleError> {
        let horizon = now + skew;
        let mut entries = self.entries.lock();
        let mut due: Vec<Uuid> = entries
            .values()
            .filter(|e| e.status.is_dispatchable() && e.scheduled_for <= horizon)
            .map(|e| e.id)
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut leased = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = entries.get_mut(&id) {
                entry.status = SchedStatus::Processing;
                entry.leased_by = Some(worker_id.to_string());
                entry.leased_until = Some(now + lease);
                leased.push(entry.clone());
            }
        }
        Ok(leased)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), ScheduleError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = SchedStatus::Sent;
            entry.leased_by = None;
            entry.leased_until = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, _reason: &str) -> Result<(), ScheduleError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = SchedStatus::Failed;
            entry.leased_by = None;
            entry.leased_until = None;
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempt_count: u32,
    ) -> Result<(), ScheduleError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = SchedStatus::Pending;
            entry.scheduled_for = at;
            entry.attempt_count = attempt_count;
            entry.leased_by = None;
            entry.leased_until = None;
        }
        Ok(())
    }

    async fn cancel_matching(
        &self,
        org_id: i64,
        event_type: &str,
        subject_key: &str,
        reason: &str,
    ) -> Result<u64, ScheduleError> {
        let now = Utc::now();
        let mut cancelled = 0;
        for entry in self.entries.lock().values_mut() {
            if entry.status.is_dispatchable()
                && entry.org_id == org_id
                && entry.event_type == event_type
                && entry.subject_key.as_deref() == Some(subject_key)
            {
                entry.status = SchedStatus::Cancelled;
                entry.cancellation = Some(CancellationInfo {
                    cancelled_at: now,
                    reason:       reason.to_string(),
                });
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn mark_overdue(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, ScheduleError> {
        let mut flagged = 0;
        for entry in self.entries.lock().values_mut() {
            if entry.status == SchedStatus::Pending && now - entry.scheduled_for > window {
                entry.status = SchedStatus::Overdue;
                flagged += 1;
            }
        }
        Ok(flagged)
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, ScheduleError> {
        let mut released = 0;
        for entry in self.entries.lock().values_mut() {
            if entry.status == SchedStatus::Processing
                && entry.leased_until.is_some_and(|until| until < now)
            {
                entry.status = SchedStatus::Pending;
                entry.leased_by = None;
                entry.leased_until = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, ScheduleError> {
        Ok(self.entries.lock().get(&id).cloned())
    }
}

/// MySQL-backed schedule store: one row per entry with a JSON document
/// plus indexed columns; leases use a claim-marker update so the
/// pop is race-free across workers.
#[derive(Clone)]
pub struct MySqlScheduleStore {
    pool: MySqlPool,
}

impl MySqlScheduleStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn load(&self, id: Uuid) -> Result<Option<ScheduledEntry>, ScheduleError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM sluice_schedule WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(document,)| {
            serde_json::from_str(&document).map_err(|e| ScheduleError::Store {
                reason: format!("corrupt schedule document: {e}"),
            })
        })
        .transpose()
    }

    async fn persist(&self, entry: &ScheduledEntry) -> Result<(), ScheduleError> {
        let document = serde_json::to_string(entry).map_err(|e| ScheduleError::Store {
            reason: format!("entry serialization failed: {e}"),
        })?;
        sqlx::query(
            r"
            INSERT INTO sluice_schedule
                (id, integration_id, org_id, event_type, subject_key, status,
                 scheduled_for, leased_until, document, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NOW())
            ON DUPLICATE KEY UPDATE
                status = VALUES(status),
                scheduled_for = VALUES(scheduled_for),
                leased_until = VALUES(leased_until),
                document = VALUES(document),
                updated_at = NOW()
            ",
        )
        .bind(entry.id.to_string())
        .bind(entry.integration_id.to_string())
        .bind(entry.org_id)
        .bind(&entry.event_type)
        .bind(&entry.subject_key)
        .bind(entry.status.as_str())
        .bind(entry.scheduled_for)
        .bind(entry.leased_until)
        .bind(&document)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MySqlScheduleStore {
    async fn insert(&self, entry: &ScheduledEntry) -> Result<(), ScheduleError> {
        self.persist(entry).await
    }

    async fn acquire_due(
        &self,
        now: DateTime<Utc>,
        skew: Duration,
        worker_id: &str,
        lease: Duration,
        limit: u32,
    ) -> Result<Vec<ScheduledEntry>, ScheduleError> {
        let claim_marker = Uuid::new_v4().to_string();
        sqlx::query(
            r"
            UPDATE sluice_schedule
            SET status = 'PROCESSING', leased_by = ?, leased_until = ?, claim_marker = ?
            WHERE status IN ('PENDING', 'OVERDUE')
              AND scheduled_for <= ?
            ORDER BY scheduled_for ASC
            LIMIT ?
            ",
        )
        .bind(worker_id)
        .bind(now + lease)
        .bind(&claim_marker)
        .bind(now + skew)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT document FROM sluice_schedule WHERE claim_marker = ?")
                .bind(&claim_marker)
                .fetch_all(&self.pool)
                .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (document,) in rows {
            let mut entry: ScheduledEntry =
                serde_json::from_str(&document).map_err(|e| ScheduleError::Store {
                    reason: format!("corrupt schedule document: {e}"),
                })?;
            entry.status = SchedStatus::Processing;
            entry.leased_by = Some(worker_id.to_string());
            entry.leased_until = Some(now + lease);
            self.persist(&entry).await?;
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<(), ScheduleError> {
        if let Some(mut entry) = self.load(id).await? {
            entry.status = SchedStatus::Sent;
            entry.leased_by = None;
            entry.leased_until = None;
            self.persist(&entry).await?;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, _reason: &str) -> Result<(), ScheduleError> {
        if let Some(mut entry) = self.load(id).await? {
            entry.status = SchedStatus::Failed;
            entry.leased_by = None;
            entry.leased_until = None;
            self.persist(&entry).await?;
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempt_count: u32,
    ) -> Result<(), ScheduleError> {
        if let Some(mut entry) = self.load(id).await? {
            entry.status = SchedStatus::Pending;
            entry.scheduled_for = at;
            entry.attempt_count = attempt_count;
            entry.leased_by = None;
            entry.leased_until = None;
            self.persist(&entry).await?;
        }
        Ok(())
    }

    async fn cancel_matching(
        &self,
        org_id: i64,
        event_type: &str,
        subject_key: &str,
        reason: &str,
    ) -> Result<u64, ScheduleError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r"
            SELECT document FROM sluice_schedule
            WHERE org_id = ? AND event_type = ? AND subject_key = ?
              AND status IN ('PENDING', 'OVERDUE')
            ",
        )
        .bind(org_id)
        .bind(event_type)
        .bind(subject_key)
        .fetch_all(&self.pool)
        .await?;

        let mut cancelled = 0;
        for (document,) in rows {
            let mut entry: ScheduledEntry =
                serde_json::from_str(&document).map_err(|e| ScheduleError::Store {
                    reason: format!("corrupt schedule document: {e}"),
                })?;
            entry.status = SchedStatus::Cancelled;
            entry.cancellation = Some(CancellationInfo {
                cancelled_at: Utc::now(),
                reason:       reason.to_string(),
            });
            self.persist(&entry).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn mark_overdue(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<u64, ScheduleError> {
        let result = sqlx::query(
            "UPDATE sluice_schedule SET status = 'OVERDUE' \
             WHERE status = 'PENDING' AND scheduled_for < ?",
        )
        .bind(now - window)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<u64, ScheduleError> {
        let result = sqlx::query(
            "UPDATE sluice_schedule SET status = 'PENDING', leased_by = NULL, leased_until = NULL \
             WHERE status = 'PROCESSING' AND leased_until < ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScheduledEntry>, ScheduleError> {
        self.load(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::integration::HttpMethod;

    pub(crate) fn entry(scheduled_for: DateTime<Utc>) -> ScheduledEntry {
        ScheduledEntry {
            id:                Uuid::new_v4(),
            integration_id:    Uuid::new_v4(),
            org_id:            100,
            original_event_id: Uuid::new_v4(),
            event_type:        "APPOINTMENT_CREATED".to_string(),
            subject_key:       Some("p-1:1700000000".to_string()),
            scheduled_for,
            status:            SchedStatus::Pending,
            payload:           serde_json::json!({"reminder": true}),
            target_url:        "https://api.example.com/remind".to_string(),
            http_method:       HttpMethod::Post,
            attempt_count:     0,
            recurring:         None,
            cancellation:      None,
            leased_by:         None,
            leased_until:      None,
            created_at:        Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_acquire_due_respects_time_and_skew() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store.insert(&entry(now - Duration::minutes(1))).await.unwrap();
        store.insert(&entry(now + Duration::seconds(30))).await.unwrap(); // within skew
        store.insert(&entry(now + Duration::minutes(10))).await.unwrap(); // not due

        let leased = store
            .acquire_due(now, Duration::seconds(60), "w1", Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 2);
        for entry in &leased {
            assert_eq!(entry.status, SchedStatus::Processing);
            assert_eq!(entry.leased_by.as_deref(), Some("w1"));
        }
    }

    #[tokio::test]
    async fn test_leased_entries_are_not_reacquired() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store.insert(&entry(now - Duration::minutes(1))).await.unwrap();

        let first = store
            .acquire_due(now, Duration::seconds(60), "w1", Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // A second worker sees nothing
        let second = store
            .acquire_due(now, Duration::seconds(60), "w2", Duration::seconds(60), 10)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_expired_leases_are_released() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store.insert(&entry(now - Duration::minutes(1))).await.unwrap();

        let leased = store
            .acquire_due(now, Duration::seconds(60), "w1", Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);

        // Lease expires; entry returns to PENDING and is acquirable again
        let released = store.release_expired(now + Duration::minutes(2)).await.unwrap();
        assert_eq!(released, 1);
        let reacquired = store
            .acquire_due(
                now + Duration::minutes(2),
                Duration::seconds(60),
                "w2",
                Duration::seconds(60),
                10,
            )
            .await
            .unwrap();
        assert_eq!(reacquired.len(), 1);
        assert_eq!(reacquired[0].leased_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_cancel_matching() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let target = entry(now + Duration::hours(1));
        store.insert(&target).await.unwrap();
        let mut other = entry(now + Duration::hours(1));
        other.subject_key = Some("p-2:1700000000".to_string());
        store.insert(&other).await.unwrap();

        let cancelled = store
            .cancel_matching(100, "APPOINTMENT_CREATED", "p-1:1700000000", "visit cancelled")
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let loaded = store.get(target.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SchedStatus::Cancelled);
        assert!(loaded.cancellation.is_some());
        assert_eq!(
            store.get(other.id).await.unwrap().unwrap().status,
            SchedStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_overdue_janitor() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        store.insert(&entry(now - Duration::minutes(5))).await.unwrap();
        store.insert(&entry(now + Duration::hours(1))).await.unwrap();

        let flagged = store.mark_overdue(now, Duration::seconds(60)).await.unwrap();
        assert_eq!(flagged, 1);

        // Overdue entries are still dispatchable
        let leased = store
            .acquire_due(now, Duration::seconds(60), "w1", Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn test_reschedule_resets_lease() {
        let store = MemoryScheduleStore::new();
        let now = Utc::now();
        let e = entry(now - Duration::minutes(1));
        store.insert(&e).await.unwrap();
        store
            .acquire_due(now, Duration::seconds(60), "w1", Duration::seconds(60), 10)
            .await
            .unwrap();

        store.reschedule(e.id, now + Duration::seconds(30), 1).await.unwrap();
        let loaded = store.get(e.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SchedStatus::Pending);
        assert_eq!(loaded.attempt_count, 1);
        assert!(loaded.leased_by.is_none());
    }
}
