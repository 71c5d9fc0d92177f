//! Cursor-based source poller.
//!
//! One poller task runs per (source, org) stream. Rows are fetched
//! strictly after the checkpoint in ascending id order, normalized into
//! events, and pushed through the audit store's idempotent insert before
//! the cursor advances. Malformed rows are reported on an error channel
//! and skipped so one poison row can never wedge the stream. Transient
//! database errors pause the loop with exponential backoff capped at 60s.
//!
//! The checkpoint is persisted after the audit store has durably accepted
//! the batch, never after delivery, so the poller does not block on
//! downstream health.

use crate::audit::EventAuditStore;
use crate::checkpoint::CheckpointStore;
use crate::dedup::Deduplicator;
use crate::source::SourceConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sluice_core::event::GatewayEvent;
use sluice_error::IngestError;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Ceiling for the transient-error backoff
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// One raw row from a source table
#[derive(Debug, Clone)]
pub struct SourceRow {
    /// Monotonic row id (checkpoint cursor)
    pub id:          i64,
    /// Parent tenant
    pub org_id:      i64,
    /// Leaf tenant
    pub org_unit_id: Option<i64>,
    /// Event type
    pub event_type:  String,
    /// Raw payload text
    pub payload:     String,
    /// Row timestamp, when the table has a usable one
    pub occurred_at: Option<DateTime<Utc>>,
}

/// A row the poller had to skip
#[derive(Debug, Clone)]
pub struct PoisonRow {
    /// Source name
    pub source: String,
    /// Row id
    pub row_id: i64,
    /// Why normalization failed
    pub reason: String,
}

/// Pluggable row source. The MySQL event-queue table is the primary
/// backend; Mongo/HTTP sources implement the same trait.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Fetch up to `limit` rows with id strictly greater than `after_id`,
    /// in ascending id order.
    async fn fetch_rows(&self, after_id: i64, limit: u32) -> Result<Vec<SourceRow>, IngestError>;
}

/// MySQL event-queue backend driven by a column mapping.
pub struct MySqlSourceBackend {
    pool:       MySqlPool,
    config:     SourceConfig,
    db_timeout: Duration,
}

impl MySqlSourceBackend {
    /// Create a backend. The config must have been validated; the column
    /// mapping is interpolated into the query text.
    #[must_use]
    pub fn new(pool: MySqlPool, config: SourceConfig) -> Self {
        let db_timeout = Duration::from_secs(config.db_timeout_secs);
        Self {
            pool,
            config,
            db_timeout,
        }
    }

    fn query_text(&self) -> String {
        let m = &self.config.column_mapping;
        let unit = m
            .org_unit_id
            .as_deref()
            .map_or_else(|| "NULL AS org_unit_id".to_string(), |c| format!("`{c}` AS org_unit_id"));
        format!(
            "SELECT `{id}` AS id, `{org}` AS org_id, {unit}, \
             `{event_type}` AS event_type, `{payload}` AS payload, `{ts}` AS occurred_at \
             FROM `{table}` WHERE `{id}` > ? ORDER BY `{id}` ASC LIMIT ?",
            id = m.id,
            org = m.org_id,
            unit = unit,
            event_type = m.event_type,
            payload = m.payload,
            ts = m.timestamp,
            table = self.config.table,
        )
    }
}

#[async_trait]
impl SourceBackend for MySqlSourceBackend {
    async fn fetch_rows(&self, after_id: i64, limit: u32) -> Result<Vec<SourceRow>, IngestError> {
        let query = self.query_text();
        let fetch = sqlx::query(&query)
            .bind(after_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool);

        let rows = tokio::time::timeout(self.db_timeout, fetch)
            .await
            .map_err(|_| IngestError::Database {
                reason: format!("source query exceeded {}s", self.db_timeout.as_secs()),
            })??;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SourceRow {
                id:          row.try_get("id").map_err(|e| IngestError::Database {
                    reason: format!("id column: {e}"),
                })?,
                org_id:      row.try_get("org_id").unwrap_or(self.config.org_id),
                org_unit_id: row.try_get("org_unit_id").unwrap_or(None),
                event_type:  row.try_get("event_type").unwrap_or_default(),
                payload:     row.try_get("payload").unwrap_or_default(),
                occurred_at: row.try_get("occurred_at").unwrap_or(None),
            });
        }
        Ok(out)
    }
}

/// Normalize a raw row into a gateway event.
fn normalize(row: &SourceRow, source: &str) -> Result<GatewayEvent, IngestError> {
    if row.event_type.trim().is_empty() {
        return Err(IngestError::MalformedRow {
            source_name: source.to_string(),
            row_id: row.id,
            reason: "empty event type".to_string(),
        });
    }
    if row.org_id <= 0 {
        return Err(IngestError::MalformedRow {
            source_name: source.to_string(),
            row_id: row.id,
            reason: format!("invalid org id {}", row.org_id),
        });
    }

    let payload: serde_json::Value =
        serde_json::from_str(&row.payload).map_err(|e| IngestError::MalformedRow {
            source_name: source.to_string(),
            row_id: row.id,
            reason: format!("payload is not valid JSON: {e}"),
        })?;

    Ok(GatewayEvent::new(
        source.to_string(),
        Some(row.id),
        row.org_id,
        row.org_unit_id,
        row.event_type.clone(),
        payload,
        Utc::now(),
    ))
}

/// Cursor-based polling loop for one (source, org) stream.
pub struct SourcePoller {
    backend:     Arc<dyn SourceBackend>,
    audit:       Arc<dyn EventAuditStore>,
    dedup:       Arc<Deduplicator>,
    checkpoints: Arc<dyn CheckpointStore>,
    config:      SourceConfig,
    events_tx:   mpsc::Sender<GatewayEvent>,
    poison_tx:   Option<mpsc::Sender<PoisonRow>>,
}

impl SourcePoller {
    /// Assemble a poller.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SourceBackend>,
        audit: Arc<dyn EventAuditStore>,
        dedup: Arc<Deduplicator>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: SourceConfig,
        events_tx: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        Self {
            backend,
            audit,
            dedup,
            checkpoints,
            config,
            events_tx,
            poison_tx: None,
        }
    }

    /// Attach a channel receiving skipped rows.
    #[must_use]
    pub fn with_poison_channel(mut self, tx: mpsc::Sender<PoisonRow>) -> Self {
        self.poison_tx = Some(tx);
        self
    }

    /// Run until the shutdown signal fires. The final checkpoint is
    /// persisted before returning.
    pub async fn run_with_shutdown(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), IngestError> {
        let source = self.config.name.clone();
        let org_id = self.config.org_id;
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);

        let mut cursor = self.checkpoints.load(&source, org_id).await?.unwrap_or(0);
        info!(source = %source, org_id, cursor, "source poller starting");

        let mut backoff = poll_interval;

        loop {
            if shutdown.try_recv().is_ok() {
                info!(source = %source, cursor, "shutdown signal received, stopping poller");
                self.checkpoints.save(&source, org_id, cursor).await?;
                return Ok(());
            }

            let rows = match self.backend.fetch_rows(cursor, self.config.batch_size).await {
                Ok(rows) => {
                    backoff = poll_interval;
                    rows
                },
                Err(e) if e.is_transient() => {
                    warn!(source = %source, error = %e, "transient source error, backing off");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    if Self::sleep_or_shutdown(backoff, &mut shutdown).await {
                        self.checkpoints.save(&source, org_id, cursor).await?;
                        return Ok(());
                    }
                    continue;
                },
                Err(e) => return Err(e),
            };

            if rows.is_empty() {
                if Self::sleep_or_shutdown(poll_interval, &mut shutdown).await {
                    self.checkpoints.save(&source, org_id, cursor).await?;
                    return Ok(());
                }
                continue;
            }

            debug!(source = %source, count = rows.len(), cursor, "processing batch");
            let mut accepted_any = false;
            let mut store_degraded = false;

            for row in &rows {
                let event = match normalize(row, &source) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(source = %source, row_id = row.id, error = %e, "skipping malformed row");
                        if let Some(tx) = &self.poison_tx {
                            let _ = tx
                                .send(PoisonRow {
                                    source: source.clone(),
                                    row_id: row.id,
                                    reason: e.to_string(),
                                })
                                .await;
                        }
                        cursor = row.id;
                        continue;
                    },
                };

                let key = event.dedup_key();
                if self.dedup.seen_recently(&key) {
                    cursor = row.id;
                    continue;
                }

                match self.audit.try_insert(&event).await {
                    Ok(outcome) => {
                        self.dedup.remember(&key);
                        if outcome.is_inserted() {
                            accepted_any = true;
                            if self.events_tx.send(event).await.is_err() {
                                // Delivery side is gone; persist progress and stop.
                                self.checkpoints.save(&source, org_id, cursor).await?;
                                return Err(IngestError::ChannelClosed);
                            }
                        }
                        cursor = row.id;
                    },
                    Err(e) => {
                        // Do not advance past a row the store never accepted.
                        warn!(source = %source, row_id = row.id, error = %e, "audit insert failed, backing off");
                        store_degraded = true;
                        break;
                    },
                }
            }

            // Checkpoint after the audit store accepted the batch, never
            // after delivery.
            self.checkpoints.save(&source, org_id, cursor).await?;
            if accepted_any {
                debug!(source = %source, cursor, "checkpoint advanced");
            }
            if store_degraded {
                backoff = (backoff * 2).min(MAX_BACKOFF);
                if Self::sleep_or_shutdown(backoff, &mut shutdown).await {
                    self.checkpoints.save(&source, org_id, cursor).await?;
                    return Ok(());
                }
            }
        }
    }

    /// Sleep, returning true when shutdown fired instead.
    async fn sleep_or_shutdown(
        duration: Duration,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown.recv() => true,
        }
    }
}
