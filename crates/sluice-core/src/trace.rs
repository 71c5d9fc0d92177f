//! Execution trace records: the step-by-step account of processing one
//! (event, integration) pair, plus per-try delivery attempts.

use crate::integration::Direction;
use crate::redact::{redact_headers, redact_value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known step names
pub mod step {
    /// Config and URL validation
    pub const VALIDATION: &str = "validation";
    /// Payload transformation
    pub const TRANSFORMATION: &str = "transformation";
    /// Auth header / token resolution
    pub const AUTH_RESOLVE: &str = "auth_resolve";
    /// Outbound HTTP request issued
    pub const HTTP_REQUEST: &str = "http_request";
    /// Response received and classified
    pub const HTTP_RESPONSE: &str = "http_response";
    /// Circuit breaker consultation
    pub const CIRCUIT_CHECK: &str = "circuit_check";
    /// Retry scheduled (DLQ requeue)
    pub const RETRY_SCHEDULE: &str = "retry_schedule";
    /// Per-action condition evaluation
    pub const CONDITION: &str = "condition";
}

/// Terminal/overall status of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Still executing
    Pending,
    /// All non-skipped actions delivered
    Success,
    /// At least one action failed terminally
    Failed,
    /// Nothing was attempted (condition false, circuit open)
    Skipped,
}

impl TraceStatus {
    /// Whether this status is terminal; terminal traces never transition.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Status of one trace step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step completed
    Success,
    /// Step failed
    Failed,
    /// Step was skipped
    Skipped,
}

/// What kicked off the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Ingested event
    Event,
    /// Scheduler dispatch
    Scheduled,
    /// Manual or DLQ replay
    Replay,
}

/// One step in an execution trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// Step name (see [`step`])
    pub name:        String,
    /// When the step finished
    pub ts:          DateTime<Utc>,
    /// Step duration
    pub duration_ms: u64,
    /// Step outcome
    pub status:      StepStatus,
    /// Free-form metadata (already redacted by the producer)
    #[serde(default)]
    pub metadata:    serde_json::Value,
    /// Index of the action this step belongs to, for multi-action traces
    #[serde(default)]
    pub action_index: Option<u32>,
}

/// Redacted snapshot of the outbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSnapshot {
    /// Target URL after template substitution
    pub url:     String,
    /// HTTP method
    pub method:  String,
    /// Headers, secrets redacted
    pub headers: Vec<(String, String)>,
    /// Body, secrets redacted
    pub body:    serde_json::Value,
}

impl RequestSnapshot {
    /// Build a snapshot, redacting headers and body.
    #[must_use]
    pub fn redacted(
        url: &str,
        method: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Self {
        Self {
            url:     url.to_string(),
            method:  method.to_string(),
            headers: redact_headers(headers),
            body:    redact_value(body),
        }
    }
}

/// Snapshot of the endpoint's response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    /// HTTP status
    pub status:  u16,
    /// Response headers (truncated set)
    pub headers: Vec<(String, String)>,
    /// Body, capped by the engine's size limit
    pub body:    String,
}

/// End-to-end record of processing one (event, integration) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    /// Correlation id for this execution
    pub trace_id:         Uuid,
    /// Original trace when this execution is a replay
    pub parent_trace_id:  Option<Uuid>,
    /// Integration direction
    pub direction:        Direction,
    /// What triggered the execution
    pub trigger:          TriggerType,
    /// Integration id
    pub integration_id:   Uuid,
    /// Integration display name
    pub integration_name: String,
    /// Tenant
    pub org_id:           i64,
    /// Triggering event, when any
    pub event_id:         Option<Uuid>,
    /// Message id (scheduled entry / DLQ entry), when any
    pub message_id:       Option<Uuid>,
    /// Snapshot of the last composed request
    pub request:          Option<RequestSnapshot>,
    /// Ordered step log
    pub steps:            Vec<TraceStep>,
    /// Snapshot of the last response
    pub response:         Option<ResponseSnapshot>,
    /// Terminal error rendering, when failed
    pub error:            Option<String>,
    /// Overall status
    pub status:           TraceStatus,
    /// Start time
    pub started_at:       DateTime<Utc>,
    /// Finish time, set when the trace becomes terminal
    pub finished_at:      Option<DateTime<Utc>>,
    /// Total duration, set when the trace becomes terminal
    pub duration_ms:      Option<u64>,
}

impl ExecutionTrace {
    /// Create a pending trace for an execution that starts now.
    #[must_use]
    pub fn start(
        direction: Direction,
        trigger: TriggerType,
        integration_id: Uuid,
        integration_name: String,
        org_id: i64,
        event_id: Option<Uuid>,
    ) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            parent_trace_id: None,
            direction,
            trigger,
            integration_id,
            integration_name,
            org_id,
            event_id,
            message_id: None,
            request: None,
            steps: Vec::new(),
            response: None,
            error: None,
            status: TraceStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Link this trace to the execution it replays.
    #[must_use]
    pub const fn with_parent(mut self, parent_trace_id: Uuid) -> Self {
        self.parent_trace_id = Some(parent_trace_id);
        self
    }

    /// Append a step. Steps on terminal traces are still recorded (they
    /// describe cleanup work) but the status no longer changes.
    pub fn push_step(&mut self, step: TraceStep) {
        self.steps.push(step);
    }

    /// Transition to a terminal status. Once terminal, a trace never
    /// transitions again; later calls are ignored.
    pub fn finish(&mut self, status: TraceStatus, error: Option<String>) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.duration_ms = Some(
            (now - self.started_at).num_milliseconds().max(0) as u64,
        );
    }
}

/// One physical HTTP try within a delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Trace this attempt belongs to
    pub delivery_log_id: Uuid,
    /// 1-based attempt number, strictly increasing per trace
    pub attempt_number:  u32,
    /// Outcome
    pub status:          StepStatus,
    /// HTTP status, when a response arrived
    pub response_status: Option<u16>,
    /// Round-trip time
    pub response_time_ms: u64,
    /// Error message for failed attempts
    pub error_message:   Option<String>,
    /// Redacted request payload
    pub request_payload: serde_json::Value,
    /// When the attempt was made
    pub attempted_at:    DateTime<Utc>,
    /// Why this attempt happened (first try, backoff retry, DLQ replay)
    pub retry_reason:    Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> ExecutionTrace {
        ExecutionTrace::start(
            Direction::Outbound,
            TriggerType::Event,
            Uuid::new_v4(),
            "erp-sync".to_string(),
            100,
            Some(Uuid::new_v4()),
        )
    }

    #[test]
    fn test_terminal_status_never_transitions() {
        let mut t = trace();
        t.finish(TraceStatus::Success, None);
        let finished_at = t.finished_at;

        t.finish(TraceStatus::Failed, Some("late".to_string()));
        assert_eq!(t.status, TraceStatus::Success);
        assert!(t.error.is_none());
        assert_eq!(t.finished_at, finished_at);
    }

    #[test]
    fn test_finish_sets_duration() {
        let mut t = trace();
        t.finish(TraceStatus::Failed, Some("boom".to_string()));
        assert!(t.duration_ms.is_some());
        assert!(t.finished_at.is_some());
        assert_eq!(t.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_request_snapshot_redacts() {
        let snapshot = RequestSnapshot::redacted(
            "https://api.example.com",
            "POST",
            &[("Authorization".to_string(), "Bearer x".to_string())],
            &serde_json::json!({"password": "p", "oid": 7}),
        );
        assert_eq!(snapshot.headers[0].1, crate::redact::REDACTED);
        assert_eq!(snapshot.body["password"], crate::redact::REDACTED);
        assert_eq!(snapshot.body["oid"], 7);
    }

    #[test]
    fn test_steps_accumulate_with_action_index() {
        let mut t = trace();
        t.push_step(TraceStep {
            name:         step::TRANSFORMATION.to_string(),
            ts:           Utc::now(),
            duration_ms:  3,
            status:       StepStatus::Success,
            metadata:     serde_json::Value::Null,
            action_index: Some(0),
        });
        t.push_step(TraceStep {
            name:         step::CONDITION.to_string(),
            ts:           Utc::now(),
            duration_ms:  0,
            status:       StepStatus::Skipped,
            metadata:     serde_json::json!({"reason": "condition_false"}),
            action_index: Some(1),
        });
        assert_eq!(t.steps.len(), 2);
        assert_eq!(t.steps[1].action_index, Some(1));
    }
}
