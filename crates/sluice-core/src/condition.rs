//! Condition evaluation for gating integrations and per-action execution.
//!
//! A condition is a boolean sandbox expression over `{event, context}`.
//! `null`, missing values and empty strings evaluate to false. An absent
//! condition always passes.

use crate::event::{DeliveryContext, GatewayEvent};
use crate::script::Sandbox;
use sluice_error::ScriptError;

/// Outcome of evaluating a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Condition passed (or none was configured)
    Pass,
    /// Condition evaluated to false
    ConditionFalse,
}

/// Evaluates conditions in the sandbox
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator {
    sandbox: Sandbox,
}

impl ConditionEvaluator {
    /// Create an evaluator backed by the given sandbox.
    #[must_use]
    pub const fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    /// Evaluate an optional condition against an event.
    pub fn evaluate(
        &self,
        condition: Option<&str>,
        event: &GatewayEvent,
        ctx: &DeliveryContext,
    ) -> Result<Gate, ScriptError> {
        let Some(condition) = condition else {
            return Ok(Gate::Pass);
        };
        if condition.trim().is_empty() {
            return Ok(Gate::Pass);
        }

        let event_json = event_view(event);
        let passed = self
            .sandbox
            .eval_condition(condition, &event_json, &ctx.to_json())?;
        Ok(if passed { Gate::Pass } else { Gate::ConditionFalse })
    }
}

/// The event shape scripts see: payload fields are reachable both at the
/// top level (`event.amount`) and under `event.payload`.
fn event_view(event: &GatewayEvent) -> serde_json::Value {
    let mut view = match &event.payload {
        serde_json::Value::Object(map) => serde_json::Value::Object(map.clone()),
        other => serde_json::json!({ "value": other }),
    };
    if let Some(map) = view.as_object_mut() {
        map.insert("payload".to_string(), event.payload.clone());
        map.insert(
            "eventType".to_string(),
            serde_json::Value::String(event.event_type.clone()),
        );
        map.insert("orgId".to_string(), serde_json::json!(event.org_id));
        map.insert("orgUnitId".to_string(), serde_json::json!(event.org_unit_id));
    }
    view
}
