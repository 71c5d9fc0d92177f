//! Scheduling-script evaluation.
//!
//! A scheduling script is a sandboxed pure function of `{event, context}`
//! returning either a unix-millisecond timestamp (DELAYED) or a recurring
//! configuration object `{firstOccurrence, intervalMs, maxOccurrences? |
//! endDate?}`. Evaluation is deterministic: the wall clock is pinned per
//! evaluation, so the same inputs always produce the same decision.

use crate::entry::{RecurringConfig, ScheduleDecision};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sluice_core::event::{DeliveryContext, GatewayEvent};
use sluice_core::script::{Sandbox, ScriptLimits};
use sluice_error::{ScheduleError, ScriptError};

/// Evaluates scheduling scripts
#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    limits: ScriptLimits,
}

impl Default for ScheduleEvaluator {
    fn default() -> Self {
        Self {
            limits: ScriptLimits::scheduling(),
        }
    }
}

impl ScheduleEvaluator {
    /// Create an evaluator with custom limits.
    #[must_use]
    pub const fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    /// Evaluate a script against an event, with the clock pinned to
    /// `now`, and validate the resulting decision.
    pub fn evaluate(
        &self,
        script: &str,
        event: &GatewayEvent,
        ctx: &DeliveryContext,
        now: DateTime<Utc>,
    ) -> Result<ScheduleDecision, ScheduleError> {
        let sandbox = Sandbox::new(self.limits).with_now(now);
        let event_json = serde_json::to_value(event).map_err(|e| ScheduleError::Invalid {
            reason: format!("event serialization failed: {e}"),
        })?;
        let value = sandbox.schedule(script, &event_json, &ctx.to_json())?;
        let decision = decision_from_value(&value)?;
        decision.validate(now)?;
        Ok(decision)
    }
}

/// Interpret a script result as a scheduling decision.
fn decision_from_value(value: &Value) -> Result<ScheduleDecision, ScheduleError> {
    match value {
        Value::Number(n) => {
            let ms = n.as_f64().map(|f| f as i64).ok_or_else(|| ScheduleError::Invalid {
                reason: "timestamp is not a finite number".to_string(),
            })?;
            let at = Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| ScheduleError::Invalid {
                    reason: format!("invalid epoch millis {ms}"),
                })?;
            Ok(ScheduleDecision::Delayed(at))
        },
        Value::Object(map) => {
            let first = map
                .get("firstOccurrence")
                .ok_or_else(|| ScheduleError::Invalid {
                    reason: "recurring config requires firstOccurrence".to_string(),
                })?;
            let first_ms = first
                .as_f64()
                .map(|f| f as i64)
                .ok_or_else(|| ScheduleError::Invalid {
                    reason: "firstOccurrence must be epoch millis".to_string(),
                })?;
            let first_occurrence = Utc
                .timestamp_millis_opt(first_ms)
                .single()
                .ok_or_else(|| ScheduleError::Invalid {
                    reason: format!("invalid firstOccurrence {first_ms}"),
                })?;

            let interval_ms = map
                .get("intervalMs")
                .and_then(Value::as_f64)
                .map(|f| f as i64)
                .ok_or_else(|| ScheduleError::Invalid {
                    reason: "recurring config requires intervalMs".to_string(),
                })?;

            let max_occurrences = map
                .get("maxOccurrences")
                .and_then(Value::as_f64)
                .map(|f| f as u32);

            let end_date = map
                .get("endDate")
                .and_then(Value::as_f64)
                .map(|f| {
                    Utc.timestamp_millis_opt(f as i64)
                        .single()
                        .ok_or_else(|| ScheduleError::Invalid {
                            reason: format!("invalid endDate {f}"),
                        })
                })
                .transpose()?;

            Ok(ScheduleDecision::Recurring(RecurringConfig {
                first_occurrence,
                interval_ms,
                max_occurrences,
                end_date,
                occurrence: 1,
            }))
        },
        Value::Null => Err(ScheduleError::Script(ScriptError::InvalidResult {
            message: "scheduling script returned null".to_string(),
        })),
        other => Err(ScheduleError::Script(ScriptError::InvalidResult {
            message: format!("scheduling script returned {other}"),
        })),
    }
}
