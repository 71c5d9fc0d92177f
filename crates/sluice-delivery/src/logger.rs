//! Execution logging: persistent traces and per-try delivery attempts.
//!
//! Logging is best-effort with at-least-once step writes: a store failure
//! is logged and swallowed, never surfaced to the delivery path.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sluice_core::trace::{DeliveryAttempt, ExecutionTrace, StepStatus, TraceStatus, TraceStep};
use sluice_error::GatewayError;
use sqlx::mysql::MySqlPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Persistent store for execution traces.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Persist a trace (insert or full update).
    async fn save(&self, trace: &ExecutionTrace) -> Result<(), GatewayError>;

    /// Fetch a trace by id.
    async fn get(&self, trace_id: Uuid) -> Result<Option<ExecutionTrace>, GatewayError>;

    /// List recent traces for an integration, newest first.
    async fn recent_for_integration(
        &self,
        integration_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ExecutionTrace>, GatewayError>;
}

/// Persistent store for delivery attempts.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Persist one attempt.
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), GatewayError>;

    /// Attempts for a trace, in attempt order.
    async fn for_trace(&self, trace_id: Uuid) -> Result<Vec<DeliveryAttempt>, GatewayError>;
}

/// In-memory trace store for tests and small deployments.
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    traces: DashMap<Uuid, ExecutionTrace>,
}

impl MemoryTraceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn save(&self, trace: &ExecutionTrace) -> Result<(), GatewayError> {
        self.traces.insert(trace.trace_id, trace.clone());
        Ok(())
    }

    async fn get(&self, trace_id: Uuid) -> Result<Option<ExecutionTrace>, GatewayError> {
        Ok(self.traces.get(&trace_id).map(|t| t.clone()))
    }

    async fn recent_for_integration(
        &self,
        integration_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ExecutionTrace>, GatewayError> {
        let mut traces: Vec<ExecutionTrace> = self
            .traces
            .iter()
            .filter(|t| t.integration_id == integration_id)
            .map(|t| t.clone())
            .collect();
        traces.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        traces.truncate(limit as usize);
        Ok(traces)
    }
}

/// In-memory attempt store.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    attempts: DashMap<Uuid, Vec<DeliveryAttempt>>,
}

impl MemoryAttemptStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), GatewayError> {
        self.attempts
            .entry(attempt.delivery_log_id)
            .or_default()
            .push(attempt.clone());
        Ok(())
    }

    async fn for_trace(&self, trace_id: Uuid) -> Result<Vec<DeliveryAttempt>, GatewayError> {
        Ok(self
            .attempts
            .get(&trace_id)
            .map(|a| a.clone())
            .unwrap_or_default())
    }
}

/// MySQL-backed trace store. Traces are stored as one row with JSON
/// columns for steps and snapshots, upserted on every save.
#[derive(Clone)]
pub struct MySqlTraceStore {
    pool: MySqlPool,
}

impl MySqlTraceStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TraceStore for MySqlTraceStore {
    async fn save(&self, trace: &ExecutionTrace) -> Result<(), GatewayError> {
        let document = serde_json::to_string(trace)?;
        sqlx::query(
            r"
            INSERT INTO sluice_execution_log
                (trace_id, integration_id, org_id, status, document, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, NOW())
            ON DUPLICATE KEY UPDATE
                status = VALUES(status),
                document = VALUES(document),
                updated_at = NOW()
            ",
        )
        .bind(trace.trace_id.to_string())
        .bind(trace.integration_id.to_string())
        .bind(trace.org_id)
        .bind(serde_json::to_string(&trace.status)?.trim_matches('"').to_string())
        .bind(&document)
        .bind(trace.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, trace_id: Uuid) -> Result<Option<ExecutionTrace>, GatewayError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT document FROM sluice_execution_log WHERE trace_id = ?")
                .bind(trace_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(document,)| serde_json::from_str(&document).map_err(GatewayError::from))
            .transpose()
    }

    async fn recent_for_integration(
        &self,
        integration_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ExecutionTrace>, GatewayError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT document FROM sluice_execution_log \
             WHERE integration_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(integration_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(document,)| serde_json::from_str(&document).map_err(GatewayError::from))
            .collect()
    }
}

/// MySQL-backed attempt store (TTL-pruned by a timestamp index).
#[derive(Clone)]
pub struct MySqlAttemptStore {
    pool: MySqlPool,
}

impl MySqlAttemptStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttemptStore for MySqlAttemptStore {
    async fn record(&self, attempt: &DeliveryAttempt) -> Result<(), GatewayError> {
        sqlx::query(
            r"
            INSERT INTO sluice_delivery_attempt
                (delivery_log_id, attempt_number, status, response_status,
                 response_time_ms, error_message, request_payload, attempted_at, retry_reason)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(attempt.delivery_log_id.to_string())
        .bind(attempt.attempt_number)
        .bind(match attempt.status {
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        })
        .bind(attempt.response_status)
        .bind(attempt.response_time_ms as i64)
        .bind(&attempt.error_message)
        .bind(serde_json::to_string(&attempt.request_payload)?)
        .bind(attempt.attempted_at)
        .bind(&attempt.retry_reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_trace(&self, trace_id: Uuid) -> Result<Vec<DeliveryAttempt>, GatewayError> {
        let rows: Vec<(u32, String, Option<u16>, i64, Option<String>, String)> = sqlx::query_as(
            "SELECT attempt_number, status, response_status, response_time_ms, \
             error_message, request_payload \
             FROM sluice_delivery_attempt WHERE delivery_log_id = ? ORDER BY attempt_number ASC",
        )
        .bind(trace_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(attempt_number, status, response_status, response_time_ms, error_message, payload)| {
                    DeliveryAttempt {
                        delivery_log_id: trace_id,
                        attempt_number,
                        status: match status.as_str() {
                            "success" => StepStatus::Success,
                            "skipped" => StepStatus::Skipped,
                            _ => StepStatus::Failed,
                        },
                        response_status,
                        response_time_ms: response_time_ms.max(0) as u64,
                        error_message,
                        request_payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                        attempted_at: Utc::now(),
                        retry_reason: None,
                    }
                },
            )
            .collect())
    }
}

/// Wraps the trace store so logging can never fail the delivery path.
#[derive(Clone)]
pub struct ExecutionLogger {
    store: Arc<dyn TraceStore>,
}

impl ExecutionLogger {
    /// Create a logger over a trace store.
    #[must_use]
    pub fn new(store: Arc<dyn TraceStore>) -> Self {
        Self { store }
    }

    /// Persist the trace, swallowing store errors.
    pub async fn save(&self, trace: &ExecutionTrace) {
        if let Err(e) = self.store.save(trace).await {
            warn!(trace_id = %trace.trace_id, error = %e, "trace save failed");
        }
    }

    /// Append a step to the trace and persist best-effort.
    pub async fn step(
        &self,
        trace: &mut ExecutionTrace,
        name: &str,
        started: Instant,
        status: StepStatus,
        metadata: serde_json::Value,
        action_index: Option<u32>,
    ) {
        trace.push_step(TraceStep {
            name: name.to_string(),
            ts: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            status,
            metadata,
            action_index,
        });
        self.save(trace).await;
    }

    /// Finish the trace and persist best-effort.
    pub async fn finish(
        &self,
        trace: &mut ExecutionTrace,
        status: TraceStatus,
        error: Option<String>,
    ) {
        trace.finish(status, error);
        self.save(trace).await;
    }

    /// Read back a trace.
    pub async fn get(&self, trace_id: Uuid) -> Option<ExecutionTrace> {
        match self.store.get(trace_id).await {
            Ok(trace) => trace,
            Err(e) => {
                warn!(trace_id = %trace_id, error = %e, "trace read failed");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::integration::Direction;
    use sluice_core::trace::TriggerType;

    fn trace() -> ExecutionTrace {
        ExecutionTrace::start(
            Direction::Outbound,
            TriggerType::Event,
            Uuid::new_v4(),
            "erp-sync".to_string(),
            100,
            None,
        )
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryTraceStore::new();
        let t = trace();
        store.save(&t).await.unwrap();
        let loaded = store.get(t.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.integration_name, "erp-sync");
        assert_eq!(loaded.status, TraceStatus::Pending);
    }

    #[tokio::test]
    async fn test_recent_for_integration_orders_newest_first() {
        let store = MemoryTraceStore::new();
        let integration_id = Uuid::new_v4();
        for _ in 0..3 {
            let mut t = trace();
            t.integration_id = integration_id;
            store.save(&t).await.unwrap();
        }
        let recent = store.recent_for_integration(integration_id, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].started_at >= recent[1].started_at);
    }

    #[tokio::test]
    async fn test_logger_steps_accumulate_and_persist() {
        let store = Arc::new(MemoryTraceStore::new());
        let logger = ExecutionLogger::new(store.clone());

        let mut t = trace();
        logger.save(&t).await;
        logger
            .step(
                &mut t,
                sluice_core::trace::step::TRANSFORMATION,
                Instant::now(),
                StepStatus::Success,
                serde_json::Value::Null,
                Some(0),
            )
            .await;
        logger.finish(&mut t, TraceStatus::Success, None).await;

        let loaded = store.get(t.trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.status, TraceStatus::Success);
        assert!(loaded.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_attempt_store_preserves_order() {
        let store = MemoryAttemptStore::new();
        let trace_id = Uuid::new_v4();
        for n in 1..=3u32 {
            store
                .record(&DeliveryAttempt {
                    delivery_log_id:  trace_id,
                    attempt_number:   n,
                    status:           StepStatus::Failed,
                    response_status:  Some(503),
                    response_time_ms: 10,
                    error_message:    Some("boom".to_string()),
                    request_payload:  serde_json::json!({}),
                    attempted_at:     Utc::now(),
                    retry_reason:     None,
                })
                .await
                .unwrap();
        }
        let attempts = store.for_trace(trace_id).await.unwrap();
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
