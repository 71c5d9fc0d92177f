//! Dead-letter queue: durable parking for failed deliveries.
//!
//! Transient failures that exhausted their in-line retries are parked as
//! `queued` with a `next_attempt_at`; a ticker re-invokes the delivery
//! engine for due entries and marks them `replayed` on success.
//! Non-retryable failures are parked as `abandoned` for manual replay.

use crate::engine::DeliveryEngine;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sluice_core::integration::Direction;
use sluice_core::registry::IntegrationRegistry;
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// DLQ entry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    /// Waiting for its next automatic attempt
    Queued,
    /// Claimed by a worker, replay in flight
    Retrying,
    /// Out of automatic attempts (or never retryable); manual replay only
    Abandoned,
    /// A replay succeeded
    Replayed,
}

impl DlqStatus {
    /// String form as persisted.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
            Self::Abandoned => "abandoned",
            Self::Replayed => "replayed",
        }
    }
}

/// Error details carried by an entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    /// Human-readable message
    pub message:     String,
    /// Failure kind (see [`ErrorKind`])
    pub kind:        String,
    /// HTTP status, when there was a response
    pub status_code: Option<u16>,
}

/// One parked delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Entry id
    pub id:              Uuid,
    /// Trace of the failed execution
    pub trace_id:        Uuid,
    /// Source event, when the delivery was event-triggered
    pub event_id:        Option<Uuid>,
    /// Integration
    pub integration_id:  Uuid,
    /// Tenant
    pub org_id:          i64,
    /// Direction of the failed delivery
    pub direction:       Direction,
    /// Index of the failed action within the integration
    pub action_index:    u32,
    /// Transformed request payload, replayed verbatim
    pub payload:         serde_json::Value,
    /// Failure details
    pub error:           DlqError,
    /// Automatic replay budget
    pub max_retries:     u32,
    /// Next automatic attempt, for queued entries
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Automatic attempts so far
    pub attempts:        u32,
    /// Lifecycle status
    pub status:          DlqStatus,
    /// When the entry was parked
    pub created_at:      DateTime<Utc>,
    /// Last status change
    pub updated_at:      DateTime<Utc>,
}

/// Aggregate DLQ statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct DlqStats {
    /// Total entries
    pub total:     usize,
    /// Entries by status
    pub by_status: HashMap<String, usize>,
    /// Entries by failure kind
    pub by_kind:   HashMap<String, usize>,
}

impl std::fmt::Display for DlqStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DLQ: {} entries", self.total)?;
        if !self.by_status.is_empty() {
            let mut parts: Vec<String> = self
                .by_status
                .iter()
                .map(|(status, count)| format!("{status}: {count}"))
                .collect();
            parts.sort();
            write!(f, " ({})", parts.join(", "))?;
        }
        Ok(())
    }
}

/// Durable DLQ storage.
#[async_trait]
pub trait DlqStore: Send + Sync {
    /// Park an entry.
    async fn enqueue(&self, entry: &DlqEntry) -> Result<(), GatewayError>;

    /// Atomically claim up to `limit` due queued entries, marking them
    /// `retrying`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, GatewayError>;

    /// Mark an entry replayed.
    async fn mark_replayed(&self, id: Uuid) -> Result<(), GatewayError>;

    /// Mark an entry abandoned.
    async fn mark_abandoned(&self, id: Uuid, reason: &str) -> Result<(), GatewayError>;

    /// Requeue a claimed entry for another automatic attempt.
    async fn requeue(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    /// Fetch by entry id.
    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, GatewayError>;

    /// Fetch entries by originating trace id.
    async fn by_trace(&self, trace_id: Uuid) -> Result<Vec<DlqEntry>, GatewayError>;

    /// Aggregate statistics.
    async fn stats(&self) -> Result<DlqStats, GatewayError>;
}

/// In-memory DLQ store.
#[derive(Default)]
pub struct MemoryDlqStore {
    entries: Mutex<HashMap<Uuid, DlqEntry>>,
}

impl MemoryDlqStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn enqueue(&self, entry: &DlqEntry) -> Result<(), GatewayError> {
        self.entries.lock().insert(entry.id, entry.clone());
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, GatewayError> {
        let mut entries = self.entries.lock();
        let mut due: Vec<Uuid> = entries
            .values()
            .filter(|e| {
                e.status == DlqStatus::Queued
                    && e.next_attempt_at.is_none_or(|at| at <= now)
            })
            .map(|e| e.id)
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(entry) = entries.get_mut(&id) {
                entry.status = DlqStatus::Retrying;
                entry.updated_at = now;
                claimed.push(entry.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<(), GatewayError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = DlqStatus::Replayed;
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_abandoned(&self, id: Uuid, reason: &str) -> Result<(), GatewayError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = DlqStatus::Abandoned;
            entry.error.message = format!("{} (abandoned: {reason})", entry.error.message);
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.status = DlqStatus::Queued;
            entry.attempts = attempts;
            entry.next_attempt_at = Some(next_attempt_at);
            entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, GatewayError> {
        Ok(self.entries.lock().get(&id).cloned())
    }

    async fn by_trace(&self, trace_id: Uuid) -> Result<Vec<DlqEntry>, GatewayError> {
        Ok(self
            .entries
            .lock()
            .values()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<DlqStats, GatewayError> {
        let entries = self.entries.lock();
        let mut stats = DlqStats {
            total: entries.len(),
            ..DlqStats::default()
        };
        for entry in entries.values() {
            *stats
                .by_status
                .entry(entry.status.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_kind.entry(entry.error.kind.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

/// MySQL-backed DLQ store. Entries are one row each with the full entry
/// as a JSON document plus indexed columns for the scan.
#[derive(Clone)]
pub struct MySqlDlqStore {
    pool: MySqlPool,
}

impl MySqlDlqStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    async fn fetch_documents(
        &self,
        query: &str,
        bind: &str,
    ) -> Result<Vec<DlqEntry>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as(query).bind(bind).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|(document,)| serde_json::from_str(&document).map_err(GatewayError::from))
            .collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        entry: Option<&DlqEntry>,
        status: DlqStatus,
    ) -> Result<(), GatewayError> {
        // Keep the JSON document in step with the indexed status column.
        if let Some(entry) = entry {
            let mut updated = entry.clone();
            updated.status = status;
            updated.updated_at = Utc::now();
            let document = serde_json::to_string(&updated)?;
            sqlx::query(
                "UPDATE sluice_dlq SET status = ?, document = ?, updated_at = NOW() WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(&document)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query("UPDATE sluice_dlq SET status = ?, updated_at = NOW() WHERE id = ?")
                .bind(status.as_str())
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DlqStore for MySqlDlqStore {
    async fn enqueue(&self, entry: &DlqEntry) -> Result<(), GatewayError> {
        let document = serde_json::to_string(entry)?;
        sqlx::query(
            r"
            INSERT INTO sluice_dlq
                (id, trace_id, integration_id, org_id, status, next_attempt_at,
                 document, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, NOW())
            ON DUPLICATE KEY UPDATE
                status = VALUES(status),
                next_attempt_at = VALUES(next_attempt_at),
                document = VALUES(document),
                updated_at = NOW()
            ",
        )
        .bind(entry.id.to_string())
        .bind(entry.trace_id.to_string())
        .bind(entry.integration_id.to_string())
        .bind(entry.org_id)
        .bind(entry.status.as_str())
        .bind(entry.next_attempt_at)
        .bind(&document)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DlqEntry>, GatewayError> {
        // Two-step claim: flip a batch to retrying with a claim marker,
        // then read the claimed documents back.
        let claim_marker = Uuid::new_v4().to_string();
        sqlx::query(
            r"
            UPDATE sluice_dlq
            SET status = 'retrying', claim_marker = ?, updated_at = NOW()
            WHERE status = 'queued'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY next_attempt_at ASC
            LIMIT ?
            ",
        )
        .bind(&claim_marker)
        .bind(now)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;

        self.fetch_documents(
            "SELECT document FROM sluice_dlq WHERE claim_marker = ?",
            &claim_marker,
        )
        .await
    }

    async fn mark_replayed(&self, id: Uuid) -> Result<(), GatewayError> {
        let entry = self.get(id).await?;
        self.update_status(id, entry.as_ref(), DlqStatus::Replayed).await
    }

    async fn mark_abandoned(&self, id: Uuid, _reason: &str) -> Result<(), GatewayError> {
        let entry = self.get(id).await?;
        self.update_status(id, entry.as_ref(), DlqStatus::Abandoned).await
    }

    async fn requeue(
        &self,
        id: Uuid,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let Some(mut entry) = self.get(id).await? else {
            return Ok(());
        };
        entry.status = DlqStatus::Queued;
        entry.attempts = attempts;
        entry.next_attempt_at = Some(next_attempt_at);
        entry.updated_at = Utc::now();
        self.enqueue(&entry).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, GatewayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM sluice_dlq WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(document,)| serde_json::from_str(&document).map_err(GatewayError::from))
            .transpose()
    }

    async fn by_trace(&self, trace_id: Uuid) -> Result<Vec<DlqEntry>, GatewayError> {
        self.fetch_documents(
            "SELECT document FROM sluice_dlq WHERE trace_id = ?",
            &trace_id.to_string(),
        )
        .await
    }

    async fn stats(&self) -> Result<DlqStats, GatewayError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM sluice_dlq GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = DlqStats::default();
        for (status, count) in rows {
            stats.total += count.max(0) as usize;
            stats.by_status.insert(status, count.max(0) as usize);
        }
        Ok(stats)
    }
}

/// Ticker that replays due DLQ entries through the delivery engine.
pub struct DlqWorker {
    store:    Arc<dyn DlqStore>,
    engine:   Arc<DeliveryEngine>,
    registry: Arc<IntegrationRegistry>,
    tick:     Duration,
    batch:    u32,
}

impl DlqWorker {
    /// Assemble a worker with the default cadence (30s tick, batches of 20).
    #[must_use]
    pub fn new(
        store: Arc<dyn DlqStore>,
        engine: Arc<DeliveryEngine>,
        registry: Arc<IntegrationRegistry>,
    ) -> Self {
        Self {
            store,
            engine,
            registry,
            tick: Duration::from_secs(30),
            batch: 20,
        }
    }

    /// Override the tick interval.
    #[must_use]
    pub const fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Run until shutdown.
    pub async fn run_with_shutdown(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("DLQ worker starting");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {},
                _ = shutdown.recv() => {
                    info!("DLQ worker stopping");
                    return;
                },
            }
            if let Err(e) = self.drain_once(Utc::now()).await {
                warn!(error = %e, "DLQ drain failed");
            }
        }
    }

    /// Claim and process one batch of due entries.
    pub async fn drain_once(&self, now: DateTime<Utc>) -> Result<usize, GatewayError> {
        let claimed = self.store.claim_due(now, self.batch).await?;
        let count = claimed.len();
        for entry in claimed {
            self.process(entry, now).await;
        }
        Ok(count)
    }

    async fn process(&self, entry: DlqEntry, now: DateTime<Utc>) {
        let Some(integration) = self.registry.get(entry.integration_id) else {
            let _ = self
                .store
                .mark_abandoned(entry.id, "integration no longer exists")
                .await;
            return;
        };

        match self.engine.redeliver(&entry, &integration).await {
            Ok(()) => {
                debug!(dlq_id = %entry.id, "DLQ entry replayed");
                let _ = self.store.mark_replayed(entry.id).await;
            },
            Err(e) if e.is_transient() && entry.attempts + 1 < entry.max_retries => {
                let policy = RetryPolicy::with_max_retries(entry.max_retries);
                let delay = policy.delay(entry.attempts + 1, None);
                let next = now
                    + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(60));
                let _ = self.store.requeue(entry.id, entry.attempts + 1, next).await;
            },
            Err(e) => {
                let _ = self.store.mark_abandoned(entry.id, &e.to_string()).await;
            },
        }
    }

    /// Manual replay by DLQ entry id. Runs regardless of entry status and
    /// links the fresh trace to the original via `parent_trace_id`.
    pub async fn replay(&self, dlq_id: Uuid) -> Result<(), GatewayError> {
        let Some(entry) = self.store.get(dlq_id).await? else {
            return Err(GatewayError::Internal {
                reason: format!("no DLQ entry {dlq_id}"),
            });
        };
        let Some(integration) = self.registry.get(entry.integration_id) else {
            return Err(GatewayError::Internal {
                reason: format!("integration {} no longer exists", entry.integration_id),
            });
        };
        self.engine.redeliver(&entry, &integration).await?;
        self.store.mark_replayed(entry.id).await
    }

    /// Manual replay of every entry parked for a trace.
    pub async fn replay_trace(&self, trace_id: Uuid) -> Result<usize, GatewayError> {
        let entries = self.store.by_trace(trace_id).await?;
        let mut replayed = 0;
        for entry in entries {
            self.replay(entry.id).await?;
            replayed += 1;
        }
        Ok(replayed)
    }
}

/// Build a DLQ entry for a failed action.
#[must_use]
pub fn entry_for_failure(
    trace_id: Uuid,
    event_id: Option<Uuid>,
    integration_id: Uuid,
    org_id: i64,
    direction: Direction,
    action_index: u32,
    payload: serde_json::Value,
    error: &sluice_error::DeliveryError,
    max_retries: u32,
    next_attempt_at: Option<DateTime<Utc>>,
) -> DlqEntry {
    let now = Utc::now();
    let status = if error.should_abandon() {
        DlqStatus::Abandoned
    } else {
        DlqStatus::Queued
    };
    DlqEntry {
        id: Uuid::new_v4(),
        trace_id,
        event_id,
        integration_id,
        org_id,
        direction,
        action_index,
        payload,
        error: DlqError {
            message:     error.to_string(),
            kind:        error.kind().as_str().to_string(),
            status_code: error.response_status(),
        },
        max_retries,
        next_attempt_at,
        attempts: 0,
        status,
        created_at: now,
        updated_at: now,
    }
}
