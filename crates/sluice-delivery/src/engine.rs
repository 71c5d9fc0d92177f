//! The delivery engine: condition gates, transformation, auth, signing,
//! HTTP execution, classification and bookkeeping for one (event,
//! integration) pair.
//!
//! Actions execute sequentially in declared order. A failing action does
//! not stop later actions unless it declares `on_error = STOP`; every
//! action gets its own steps, attempts and DLQ lifecycle under the shared
//! trace. The circuit breaker is consulted once per delivery and fed only
//! endpoint-health failures (transient errors), so a misconfigured
//! request cannot open the circuit.

use crate::alert::{AlertDispatcher, FailureRecord, CATEGORY_AUTO_DISABLED};
use crate::auth::AuthResolver;
use crate::breaker::{BreakerDecision, CircuitBreakerRegistry};
use crate::classify::{classify_status, error_for_status, Disposition};
use crate::dlq::{entry_for_failure, DlqStore};
use crate::logger::{AttemptStore, ExecutionLogger};
use crate::retry::RetryPolicy;
use crate::url_policy::UrlPolicy;
use chrono::Utc;
use sluice_core::condition::{ConditionEvaluator, Gate};
use sluice_core::event::{DeliveryContext, GatewayEvent};
use sluice_core::integration::{
    ActionSpec, HttpMethod, IntegrationConfig, OnError, SigningConfig,
};
use sluice_core::redact::redact_value;
use sluice_core::registry::IntegrationRegistry;
use sluice_core::template;
use sluice_core::trace::{
    step, DeliveryAttempt, ExecutionTrace, RequestSnapshot, ResponseSnapshot, StepStatus,
    TraceStatus, TriggerType,
};
use sluice_core::transform::Transformer;
use sluice_core::Sandbox;
use sluice_error::{DeliveryError, ErrorKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Response bodies captured on traces are capped at this size
pub const RESPONSE_BODY_CAP: usize = 100 * 1024;
/// Transformed payloads past this size log a warning
pub const PAYLOAD_WARN_BYTES: usize = 1024 * 1024;

/// Engine-wide policy knobs
#[derive(Debug, Clone, Copy)]
pub struct EnginePolicy {
    /// Outbound URL policy
    pub url_policy:        UrlPolicy,
    /// Response body capture cap (bytes)
    pub response_body_cap: usize,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            url_policy:        UrlPolicy::strict(),
            response_body_cap: RESPONSE_BODY_CAP,
        }
    }
}

/// Outcome of one action within a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Delivered successfully
    Delivered,
    /// Condition evaluated to false
    SkippedCondition,
    /// Failed with the given kind
    Failed(ErrorKind),
}

/// Outcome of a whole delivery
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// Trace id for the execution
    pub trace_id: Uuid,
    /// Terminal trace status
    pub status:   TraceStatus,
    /// Per-action outcomes, in declared order
    pub actions:  Vec<ActionOutcome>,
}

/// The delivery engine
pub struct DeliveryEngine {
    http:        reqwest::Client,
    auth:        AuthResolver,
    transformer: Transformer,
    conditions:  ConditionEvaluator,
    breakers:    CircuitBreakerRegistry,
    registry:    Arc<IntegrationRegistry>,
    logger:      ExecutionLogger,
    attempts:    Arc<dyn AttemptStore>,
    dlq:         Arc<dyn DlqStore>,
    alerts:      Option<Arc<AlertDispatcher>>,
    policy:      EnginePolicy,
}

impl DeliveryEngine {
    /// Assemble an engine.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        registry: Arc<IntegrationRegistry>,
        logger: ExecutionLogger,
        attempts: Arc<dyn AttemptStore>,
        dlq: Arc<dyn DlqStore>,
        breakers: CircuitBreakerRegistry,
        policy: EnginePolicy,
    ) -> Self {
        let sandbox = Sandbox::default();
        Self {
            auth: AuthResolver::new(http.clone()),
            http,
            transformer: Transformer::new(sandbox.clone()),
            conditions: ConditionEvaluator::new(sandbox),
            breakers,
            registry,
            logger,
            attempts,
            dlq,
            alerts: None,
            policy,
        }
    }

    /// Attach the alert dispatcher.
    #[must_use]
    pub fn with_alerts(mut self, alerts: Arc<AlertDispatcher>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Breaker registry, for operational listings.
    #[must_use]
    pub const fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Deliver one event through one matched integration.
    pub async fn deliver_event(
        &self,
        event: &GatewayEvent,
        integration: &IntegrationConfig,
    ) -> DeliveryOutcome {
        let mut trace = ExecutionTrace::start(
            integration.direction,
            TriggerType::Event,
            integration.id,
            integration.name.clone(),
            integration.org_id,
            Some(event.event_id),
        );
        self.logger.save(&trace).await;

        let ctx = DeliveryContext {
            org_id:           event.org_id,
            org_unit_id:      event.org_unit_id,
            event_type:       event.event_type.clone(),
            integration_id:   integration.id,
            integration_name: integration.name.clone(),
            now:              Utc::now(),
        };

        // Circuit check happens once per delivery, before any work
        let circuit_started = Instant::now();
        match self.breakers.check(integration.id, Utc::now()) {
            BreakerDecision::ShortCircuit { next_probe_at } => {
                self.logger
                    .step(
                        &mut trace,
                        step::CIRCUIT_CHECK,
                        circuit_started,
                        StepStatus::Skipped,
                        serde_json::json!({"reason": "circuit_open", "next_probe_at": next_probe_at}),
                        None,
                    )
                    .await;
                // Park for retry once the cooldown has passed
                let parked = entry_for_failure(
                    trace.trace_id,
                    Some(event.event_id),
                    integration.id,
                    integration.org_id,
                    integration.direction,
                    0,
                    event.payload.clone(),
                    &DeliveryError::CircuitOpen {
                        integration_id: integration.id.to_string(),
                    },
                    integration.retry_count.max(1),
                    Some(next_probe_at),
                );
                if let Err(e) = self.dlq.enqueue(&parked).await {
                    warn!(error = %e, "failed to park circuit-open delivery");
                }
                self.logger
                    .finish(
                        &mut trace,
                        TraceStatus::Skipped,
                        Some(ErrorKind::CircuitOpen.as_str().to_string()),
                    )
                    .await;
                return DeliveryOutcome {
                    trace_id: trace.trace_id,
                    status:   TraceStatus::Skipped,
                    actions:  vec![ActionOutcome::Failed(ErrorKind::CircuitOpen)],
                };
            },
            decision @ (BreakerDecision::Allow | BreakerDecision::Probe) => {
                self.logger
                    .step(
                        &mut trace,
                        step::CIRCUIT_CHECK,
                        circuit_started,
                        StepStatus::Success,
                        serde_json::json!({"probe": decision == BreakerDecision::Probe}),
                        None,
                    )
                    .await;
            },
        }

        let actions = integration.effective_actions();
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut attempt_counter = 0u32;

        for (index, action) in actions.iter().enumerate() {
            let action_index = index as u32;
            let outcome = self
                .run_action(
                    &mut trace,
                    integration,
                    action,
                    action_index,
                    event,
                    &ctx,
                    &mut attempt_counter,
                )
                .await;

            let stop = matches!(outcome, ActionOutcome::Failed(_))
                && action.on_error == OnError::Stop;
            outcomes.push(outcome);
            if stop {
                debug!(action = %action.name, "action failed with on_error=STOP, skipping rest");
                break;
            }
        }

        let status = overall_status(&outcomes);
        let error = outcomes.iter().find_map(|o| match o {
            ActionOutcome::Failed(kind) => Some(kind.as_str().to_string()),
            _ => None,
        });
        self.logger.finish(&mut trace, status, error).await;

        DeliveryOutcome {
            trace_id: trace.trace_id,
            status,
            actions: outcomes,
        }
    }

    /// Run one action: condition gate, transform, then execute.
    #[allow(clippy::too_many_arguments)]
    async fn run_action(
        &self,
        trace: &mut ExecutionTrace,
        integration: &IntegrationConfig,
        action: &ActionSpec,
        action_index: u32,
        event: &GatewayEvent,
        ctx: &DeliveryContext,
        attempt_counter: &mut u32,
    ) -> ActionOutcome {
        // Per-action condition gate
        if action.condition.is_some() {
            let started = Instant::now();
            match self.conditions.evaluate(action.condition.as_deref(), event, ctx) {
                Ok(Gate::Pass) => {
                    self.logger
                        .step(
                            trace,
                            step::CONDITION,
                            started,
                            StepStatus::Success,
                            serde_json::Value::Null,
                            Some(action_index),
                        )
                        .await;
                },
                Ok(Gate::ConditionFalse) => {
                    self.logger
                        .step(
                            trace,
                            step::CONDITION,
                            started,
                            StepStatus::Skipped,
                            serde_json::json!({"reason": "condition_false"}),
                            Some(action_index),
                        )
                        .await;
                    return ActionOutcome::SkippedCondition;
                },
                Err(e) => {
                    self.logger
                        .step(
                            trace,
                            step::CONDITION,
                            started,
                            StepStatus::Failed,
                            serde_json::json!({"error": e.to_string(), "errorKind": e.kind()}),
                            Some(action_index),
                        )
                        .await;
                    return self
                        .handle_action_failure(
                            trace,
                            integration,
                            action_index,
                            event.payload.clone(),
                            Some(event.event_id),
                            &DeliveryError::Transformation {
                                reason: format!("condition evaluation failed: {e}"),
                            },
                        )
                        .await;
                },
            }
        }

        // Transformation
        let transformation = action
            .transformation
            .as_ref()
            .unwrap_or(&integration.transformation);
        let started = Instant::now();
        let body = match self.transformer.apply(transformation, &event.payload, ctx) {
            Ok(body) => {
                self.logger
                    .step(
                        trace,
                        step::TRANSFORMATION,
                        started,
                        StepStatus::Success,
                        serde_json::Value::Null,
                        Some(action_index),
                    )
                    .await;
                template::render_value(&body, ctx)
            },
            Err(e) => {
                self.logger
                    .step(
                        trace,
                        step::TRANSFORMATION,
                        started,
                        StepStatus::Failed,
                        serde_json::json!({"error": e.to_string(), "errorKind": e.kind().as_str()}),
                        Some(action_index),
                    )
                    .await;
                return self
                    .handle_action_failure(
                        trace,
                        integration,
                        action_index,
                        event.payload.clone(),
                        Some(event.event_id),
                        &e,
                    )
                    .await;
            },
        };

        match self
            .execute_action(
                trace,
                integration,
                action,
                action_index,
                &body,
                ctx,
                attempt_counter,
            )
            .await
        {
            Ok(()) => {
                self.breakers.record_success(integration.id);
                ActionOutcome::Delivered
            },
            Err(e) => {
                if e.is_transient() {
                    self.record_breaker_failure(integration).await;
                }
                self.handle_action_failure(
                    trace,
                    integration,
                    action_index,
                    body,
                    Some(event.event_id),
                    &e,
                )
                .await
            },
        }
    }

    /// Execute one action with an already-transformed body: URL policy,
    /// auth, headers, signing, then the HTTP attempt loop.
    #[allow(clippy::too_many_arguments)]
    async fn execute_action(
        &self,
        trace: &mut ExecutionTrace,
        integration: &IntegrationConfig,
        action: &ActionSpec,
        action_index: u32,
        body: &serde_json::Value,
        ctx: &DeliveryContext,
        attempt_counter: &mut u32,
    ) -> Result<(), DeliveryError> {
        let url = template::render_str(&action.target_url, ctx);

        // URL policy runs before auth so credentials never leak toward a
        // disallowed destination
        let started = Instant::now();
        if let Err(e) = self.policy.url_policy.validate(&url) {
            self.logger
                .step(
                    trace,
                    step::VALIDATION,
                    started,
                    StepStatus::Failed,
                    serde_json::json!({"error": e.to_string()}),
                    Some(action_index),
                )
                .await;
            return Err(e);
        }
        self.logger
            .step(
                trace,
                step::VALIDATION,
                started,
                StepStatus::Success,
                serde_json::Value::Null,
                Some(action_index),
            )
            .await;

        // Auth resolution
        let started = Instant::now();
        let resolved = match self
            .auth
            .resolve(
                integration.id,
                &integration.auth,
                ctx,
                action.http_method.as_str(),
                &url,
            )
            .await
        {
            Ok(resolved) => {
                self.logger
                    .step(
                        trace,
                        step::AUTH_RESOLVE,
                        started,
                        StepStatus::Success,
                        serde_json::json!({"type": integration.auth.auth_type()}),
                        Some(action_index),
                    )
                    .await;
                resolved
            },
            Err(e) => {
                self.logger
                    .step(
                        trace,
                        step::AUTH_RESOLVE,
                        started,
                        StepStatus::Failed,
                        serde_json::json!({"error": e.to_string(), "errorKind": e.kind().as_str()}),
                        Some(action_index),
                    )
                    .await;
                return Err(e);
            },
        };

        // Compose headers
        let body_bytes = serde_json::to_vec(body).map_err(|e| DeliveryError::Transformation {
            reason: format!("body serialization failed: {e}"),
        })?;
        if body_bytes.len() > PAYLOAD_WARN_BYTES {
            warn!(
                integration = %integration.id,
                bytes = body_bytes.len(),
                "transformed payload is unusually large"
            );
        }

        let mut headers: Vec<(String, String)> =
            vec![("Content-Type".to_string(), "application/json".to_string())];
        for pair in &action.headers {
            headers.push((pair.key.clone(), template::render_str(&pair.value, ctx)));
        }
        headers.extend(resolved.headers.clone());
        if let Some(signing) = action.signing.as_ref().or(integration.signing.as_ref()) {
            headers.push(signature_header_pair(signing, &body_bytes));
        }

        trace.request = Some(RequestSnapshot::redacted(
            &url,
            action.http_method.as_str(),
            &headers,
            body,
        ));

        // Attempt loop
        let policy = RetryPolicy::with_max_retries(integration.retry_count);
        let timeout = Duration::from_millis(integration.timeout_ms);
        let mut failures = 0u32;

        loop {
            *attempt_counter += 1;
            let attempt_number = *attempt_counter;
            let started = Instant::now();

            self.logger
                .step(
                    trace,
                    step::HTTP_REQUEST,
                    started,
                    StepStatus::Success,
                    serde_json::json!({"attempt": attempt_number, "url": url}),
                    Some(action_index),
                )
                .await;

            let result = self
                .send_once(&url, action.http_method, &headers, &body_bytes, timeout)
                .await;

            match result {
                Ok(response) => {
                    let status = response.status;
                    self.record_attempt(
                        trace.trace_id,
                        attempt_number,
                        StepStatus::Success,
                        Some(status),
                        started,
                        body,
                        None,
                        failures,
                    )
                    .await;

                    match classify_status(status, response.retry_after.as_deref()) {
                        Disposition::Success => {
                            self.logger
                                .step(
                                    trace,
                                    step::HTTP_RESPONSE,
                                    started,
                                    StepStatus::Success,
                                    serde_json::json!({"status": status}),
                                    Some(action_index),
                                )
                                .await;
                            trace.response = Some(ResponseSnapshot {
                                status,
                                headers: response.headers,
                                body: response.body,
                            });
                            return Ok(());
                        },
                        Disposition::Transient { retry_after } => {
                            failures += 1;
                            let error =
                                error_for_status(status, &response.body, response.retry_after.as_deref());
                            self.logger
                                .step(
                                    trace,
                                    step::HTTP_RESPONSE,
                                    started,
                                    StepStatus::Failed,
                                    serde_json::json!({"status": status, "transient": true}),
                                    Some(action_index),
                                )
                                .await;
                            if !policy.should_retry(failures) {
                                return Err(error);
                            }
                            let delay = policy.delay(failures, retry_after);
                            self.schedule_step(trace, action_index, delay).await;
                            tokio::time::sleep(delay).await;
                        },
                        Disposition::Terminal => {
                            self.logger
                                .step(
                                    trace,
                                    step::HTTP_RESPONSE,
                                    started,
                                    StepStatus::Failed,
                                    serde_json::json!({"status": status, "transient": false}),
                                    Some(action_index),
                                )
                                .await;
                            trace.response = Some(ResponseSnapshot {
                                status,
                                headers: response.headers,
                                body: response.body.clone(),
                            });
                            return Err(error_for_status(status, &response.body, None));
                        },
                    }
                },
                Err(error) => {
                    failures += 1;
                    self.record_attempt(
                        trace.trace_id,
                        attempt_number,
                        StepStatus::Failed,
                        None,
                        started,
                        body,
                        Some(error.to_string()),
                        failures,
                    )
                    .await;
                    self.logger
                        .step(
                            trace,
                            step::HTTP_RESPONSE,
                            started,
                            StepStatus::Failed,
                            serde_json::json!({"error": error.to_string(), "errorKind": error.kind().as_str()}),
                            Some(action_index),
                        )
                        .await;
                    if !error.is_transient() || !policy.should_retry(failures) {
                        return Err(error);
                    }
                    let delay = policy.delay(failures, None);
                    self.schedule_step(trace, action_index, delay).await;
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    async fn schedule_step(&self, trace: &mut ExecutionTrace, action_index: u32, delay: Duration) {
        self.logger
            .step(
                trace,
                step::RETRY_SCHEDULE,
                Instant::now(),
                StepStatus::Success,
                serde_json::json!({"delay_ms": delay.as_millis() as u64}),
                Some(action_index),
            )
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        trace_id: Uuid,
        attempt_number: u32,
        status: StepStatus,
        response_status: Option<u16>,
        started: Instant,
        body: &serde_json::Value,
        error_message: Option<String>,
        prior_failures: u32,
    ) {
        let attempt = DeliveryAttempt {
            delivery_log_id: trace_id,
            attempt_number,
            status: match response_status {
                Some(s) if (200..300).contains(&s) => StepStatus::Success,
                Some(_) => StepStatus::Failed,
                None => status,
            },
            response_status,
            response_time_ms: started.elapsed().as_millis() as u64,
            error_message,
            request_payload: redact_value(body),
            attempted_at: Utc::now(),
            retry_reason: (prior_failures > 0).then(|| "backoff retry".to_string()),
        };
        if let Err(e) = self.attempts.record(&attempt).await {
            warn!(error = %e, "attempt record failed");
        }
    }

    async fn send_once(
        &self,
        url: &str,
        method: HttpMethod,
        headers: &[(String, String)],
        body: &[u8],
        timeout: Duration,
    ) -> Result<RawResponse, DeliveryError> {
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let has_body = method != reqwest::Method::GET && method != reqwest::Method::DELETE;
        let mut request = self.http.request(method, url).timeout(timeout);
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if has_body {
            request = request.body(body.to_vec());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                }
            } else {
                DeliveryError::Network {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .take(16)
            .map(|(k, v)| {
                (
                    k.to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let body_text = response.text().await.unwrap_or_default();
        let body = if body_text.len() > self.policy.response_body_cap {
            body_text
                .chars()
                .take(self.policy.response_body_cap)
                .collect()
        } else {
            body_text
        };

        Ok(RawResponse {
            status,
            headers,
            body,
            retry_after,
        })
    }

    async fn record_breaker_failure(&self, integration: &IntegrationConfig) {
        let outcome = self.breakers.record_failure(integration.id, Utc::now());
        if outcome.auto_disable {
            warn!(
                integration = %integration.id,
                failures = outcome.consecutive_failures,
                "auto-disabling integration after repeated failures"
            );
            self.registry.set_active(integration.id, false);
            if let Some(alerts) = &self.alerts {
                alerts.record_failure(FailureRecord {
                    org_id:           integration.org_id,
                    integration_id:   integration.id,
                    integration_name: integration.name.clone(),
                    category:         CATEGORY_AUTO_DISABLED.to_string(),
                    sample:           format!(
                        "integration disabled after {} consecutive failures",
                        outcome.consecutive_failures
                    ),
                    trace_id:         Uuid::nil(),
                    at:               Utc::now(),
                });
            }
        }
    }

    async fn handle_action_failure(
        &self,
        trace: &mut ExecutionTrace,
        integration: &IntegrationConfig,
        action_index: u32,
        payload: serde_json::Value,
        event_id: Option<Uuid>,
        error: &DeliveryError,
    ) -> ActionOutcome {
        let next_attempt_at = error.is_transient().then(|| {
            Utc::now()
                + chrono::Duration::from_std(RetryPolicy::default().backoff_ceiling(1))
                    .unwrap_or_else(|_| chrono::Duration::seconds(60))
        });
        let entry = entry_for_failure(
            trace.trace_id,
            event_id,
            integration.id,
            integration.org_id,
            integration.direction,
            action_index,
            payload,
            error,
            integration.retry_count.max(1),
            next_attempt_at,
        );
        if let Err(e) = self.dlq.enqueue(&entry).await {
            warn!(error = %e, "DLQ enqueue failed");
        }

        if let Some(alerts) = &self.alerts {
            alerts.record_failure(FailureRecord {
                org_id:           integration.org_id,
                integration_id:   integration.id,
                integration_name: integration.name.clone(),
                category:         error.kind().as_str().to_string(),
                sample:           error.to_string().chars().take(256).collect(),
                trace_id:         trace.trace_id,
                at:               Utc::now(),
            });
        }

        ActionOutcome::Failed(error.kind())
    }

    /// Replay a DLQ entry: re-run its action with the stored payload
    /// under a fresh trace linked to the original.
    pub async fn redeliver(
        &self,
        entry: &crate::dlq::DlqEntry,
        integration: &IntegrationConfig,
    ) -> Result<(), DeliveryError> {
        let actions = integration.effective_actions();
        let action = actions
            .get(entry.action_index as usize)
            .or_else(|| actions.first())
            .ok_or_else(|| DeliveryError::Config {
                reason: "integration has no actions".to_string(),
            })?;

        let mut trace = ExecutionTrace::start(
            integration.direction,
            TriggerType::Replay,
            integration.id,
            integration.name.clone(),
            integration.org_id,
            entry.event_id,
        )
        .with_parent(entry.trace_id);
        trace.message_id = Some(entry.id);
        self.logger.save(&trace).await;

        let ctx = DeliveryContext {
            org_id:           integration.org_id,
            org_unit_id:      integration.org_unit_id,
            event_type:       integration.event_type.clone(),
            integration_id:   integration.id,
            integration_name: integration.name.clone(),
            now:              Utc::now(),
        };

        let mut attempt_counter = 0u32;
        let result = self
            .execute_action(
                &mut trace,
                integration,
                action,
                entry.action_index,
                &entry.payload,
                &ctx,
                &mut attempt_counter,
            )
            .await;

        match &result {
            Ok(()) => {
                self.breakers.record_success(integration.id);
                self.logger.finish(&mut trace, TraceStatus::Success, None).await;
            },
            Err(e) => {
                if e.is_transient() {
                    self.record_breaker_failure(integration).await;
                }
                self.logger
                    .finish(&mut trace, TraceStatus::Failed, Some(e.to_string()))
                    .await;
            },
        }
        result
    }

    /// Deliver a pre-transformed payload to an explicit endpoint, used by
    /// the scheduler's dispatch path. Returns the trace id.
    #[allow(clippy::too_many_arguments)]
    pub async fn deliver_direct(
        &self,
        integration: &IntegrationConfig,
        url: &str,
        method: HttpMethod,
        payload: &serde_json::Value,
        message_id: Option<Uuid>,
        event_id: Option<Uuid>,
    ) -> Result<Uuid, DeliveryError> {
        // Scheduled dispatches respect the breaker like any delivery
        if let BreakerDecision::ShortCircuit { .. } =
            self.breakers.check(integration.id, Utc::now())
        {
            return Err(DeliveryError::CircuitOpen {
                integration_id: integration.id.to_string(),
            });
        }

        let action = ActionSpec {
            name:           integration.name.clone(),
            target_url:     url.to_string(),
            http_method:    method,
            headers:        integration.headers.clone(),
            condition:      None,
            transformation: None,
            on_error:       OnError::Continue,
            signing:        integration.signing.clone(),
        };

        let mut trace = ExecutionTrace::start(
            integration.direction,
            TriggerType::Scheduled,
            integration.id,
            integration.name.clone(),
            integration.org_id,
            event_id,
        );
        trace.message_id = message_id;
        self.logger.save(&trace).await;

        let ctx = DeliveryContext {
            org_id:           integration.org_id,
            org_unit_id:      integration.org_unit_id,
            event_type:       integration.event_type.clone(),
            integration_id:   integration.id,
            integration_name: integration.name.clone(),
            now:              Utc::now(),
        };

        let mut attempt_counter = 0u32;
        let result = self
            .execute_action(&mut trace, integration, &action, 0, payload, &ctx, &mut attempt_counter)
            .await;

        match &result {
            Ok(()) => {
                self.breakers.record_success(integration.id);
                self.logger.finish(&mut trace, TraceStatus::Success, None).await;
            },
            Err(e) => {
                if e.is_transient() {
                    self.record_breaker_failure(integration).await;
                }
                self.logger
                    .finish(&mut trace, TraceStatus::Failed, Some(e.to_string()))
                    .await;
            },
        }
        result.map(|()| trace.trace_id)
    }
}

struct RawResponse {
    status:      u16,
    headers:     Vec<(String, String)>,
    body:        String,
    retry_after: Option<String>,
}

fn signature_header_pair(signing: &SigningConfig, body: &[u8]) -> (String, String) {
    (
        signing.header_name.clone(),
        crate::signing::signature_header(&signing.secrets, body),
    )
}

fn overall_status(outcomes: &[ActionOutcome]) -> TraceStatus {
    let any_failed = outcomes.iter().any(|o| matches!(o, ActionOutcome::Failed(_)));
    let any_delivered = outcomes.iter().any(|o| matches!(o, ActionOutcome::Delivered));
    if any_failed {
        TraceStatus::Failed
    } else if any_delivered {
        TraceStatus::Success
    } else {
        TraceStatus::Skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        use ActionOutcome::{Delivered, Failed, SkippedCondition};
        assert_eq!(overall_status(&[Delivered]), TraceStatus::Success);
        assert_eq!(
            overall_status(&[Delivered, SkippedCondition]),
            TraceStatus::Success
        );
        assert_eq!(
            overall_status(&[Delivered, Failed(ErrorKind::Timeout)]),
            TraceStatus::Failed
        );
        assert_eq!(overall_status(&[SkippedCondition]), TraceStatus::Skipped);
        assert_eq!(overall_status(&[]), TraceStatus::Skipped);
    }

    #[test]
    fn test_signature_header_pair_uses_config_name() {
        let signing = SigningConfig {
            header_name: "X-Signature".to_string(),
            secrets:     vec!["s1".to_string(), "s0".to_string()],
        };
        let (name, value) = signature_header_pair(&signing, b"{}");
        assert_eq!(name, "X-Signature");
        assert!(value.starts_with("v1="));
        assert!(value.contains(",v2="));
    }
}
