//! Secure script sandbox.
//!
//! Executes untrusted transformation, condition and scheduling scripts as
//! a deterministic, synchronous evaluation of a JavaScript-like subset.
//! There is no host access: the evaluator exposes only whitelisted helper
//! functions, so network, filesystem, process and dynamic code generation
//! are unreachable by construction — a script naming `fetch`, `require` or
//! `eval` fails with a reference error at call time. Execution is bounded
//! by both an operation budget and a wall-clock deadline.
//!
//! Script shapes:
//! - a bare expression: `payload.total * 1.2`
//! - a `transform` (or `schedule`) function:
//!   `function transform(payload, context) { return { oid: payload.id }; }`

mod ast;
mod helpers;
mod interp;
mod lexer;
mod parser;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sluice_error::ScriptError;
use std::collections::HashMap;
use std::time::Duration;

pub use ast::Program;
pub use interp::truthy;
pub use parser::parse;

/// Default operation budget per evaluation
pub const DEFAULT_MAX_OPS: u64 = 500_000;
/// Default deadline for transformation scripts
pub const TRANSFORM_DEADLINE: Duration = Duration::from_secs(60);
/// Default deadline for scheduling scripts
pub const SCHEDULE_DEADLINE: Duration = Duration::from_secs(5);

/// Resource limits for one evaluation
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    /// Maximum interpreter operations
    pub max_ops:  u64,
    /// Wall-clock deadline
    pub deadline: Duration,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_ops:  DEFAULT_MAX_OPS,
            deadline: TRANSFORM_DEADLINE,
        }
    }
}

impl ScriptLimits {
    /// Limits for scheduling-script evaluation.
    #[must_use]
    pub const fn scheduling() -> Self {
        Self {
            max_ops:  DEFAULT_MAX_OPS,
            deadline: SCHEDULE_DEADLINE,
        }
    }
}

/// Sandboxed script evaluator
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: ScriptLimits,
    /// Injected clock; `now()` and date helpers resolve against this
    now:    Option<DateTime<Utc>>,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(ScriptLimits::default())
    }
}

impl Sandbox {
    /// Create a sandbox with the given limits.
    #[must_use]
    pub const fn new(limits: ScriptLimits) -> Self {
        Self { limits, now: None }
    }

    /// Pin the clock scripts observe. Used by the scheduler for
    /// deterministic evaluation and by tests.
    #[must_use]
    pub const fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    fn clock(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    /// Evaluate a script with the given global bindings and return its
    /// result value.
    ///
    /// When the program defines `entry_point`, that function is called
    /// with the values of `entry_args` (looked up among the globals);
    /// otherwise the top-level statements run and the value of the last
    /// expression (or explicit `return`) is the result.
    pub fn eval(
        &self,
        source: &str,
        globals: &HashMap<String, Value>,
        entry_point: &str,
        entry_args: &[&str],
    ) -> Result<Value, ScriptError> {
        let program = parser::parse(source)?;
        let mut interp = interp::Interpreter::new(
            &program,
            globals.clone(),
            self.clock(),
            self.limits.max_ops,
            self.limits.deadline,
        );

        if program.functions.contains_key(entry_point) {
            let args: Vec<Value> = entry_args
                .iter()
                .map(|name| globals.get(*name).cloned().unwrap_or(Value::Null))
                .collect();
            interp.call_function(entry_point, args)
        } else {
            interp.run()
        }
    }

    /// Run a transformation script: `transform(payload, context)`.
    pub fn transform(
        &self,
        source: &str,
        payload: &Value,
        context: &Value,
    ) -> Result<Value, ScriptError> {
        let globals = HashMap::from([
            ("payload".to_string(), payload.clone()),
            ("context".to_string(), context.clone()),
            // Event shape for scripts written against the event object
            ("event".to_string(), payload.clone()),
        ]);
        self.eval(source, &globals, "transform", &["payload", "context"])
    }

    /// Run a scheduling script: `schedule(event, context)`.
    pub fn schedule(
        &self,
        source: &str,
        event: &Value,
        context: &Value,
    ) -> Result<Value, ScriptError> {
        let globals = HashMap::from([
            ("event".to_string(), event.clone()),
            ("context".to_string(), context.clone()),
            ("payload".to_string(), event.clone()),
        ]);
        self.eval(source, &globals, "schedule", &["event", "context"])
    }

    /// Evaluate a boolean condition over `{event, context}`.
    ///
    /// `null`, missing values and empty strings are false.
    pub fn eval_condition(
        &self,
        source: &str,
        event: &Value,
        context: &Value,
    ) -> Result<bool, ScriptError> {
        if source.trim().is_empty() {
            return Ok(false);
        }
        let globals = HashMap::from([
            ("event".to_string(), event.clone()),
            ("context".to_string(), context.clone()),
            ("payload".to_string(), event.clone()),
        ]);
        let value = self.eval(source, &globals, "condition", &["event", "context"])?;
        Ok(truthy(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn sandbox() -> Sandbox {
        Sandbox::default().with_now(Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap())
    }

    #[test]
    fn test_bare_expression_transform() {
        let result = sandbox()
            .transform("{ oid: payload.orderId }", &json!({"orderId": 7}), &json!({}))
            .unwrap();
        assert_eq!(result, json!({"oid": 7}));
    }

    #[test]
    fn test_function_transform() {
        let script = r"
            function transform(payload, context) {
                let total = payload.amount * 1.1;
                return {
                    oid: payload.orderId,
                    total: Math.round(total),
                    org: context.orgId,
                };
            }
        ";
        let result = sandbox()
            .transform(
                script,
                &json!({"orderId": 7, "amount": 100}),
                &json!({"orgId": 42}),
            )
            .unwrap();
        assert_eq!(result, json!({"oid": 7, "total": 110.0, "org": 42}));
    }

    #[test]
    fn test_helper_functions_in_scripts() {
        let script = r"
            function transform(payload, context) {
                return {
                    at: formatDate(now(), '%Y-%m-%d'),
                    auth: base64Encode(payload.user + ':' + payload.pass),
                };
            }
        ";
        let result = sandbox()
            .transform(script, &json!({"user": "u", "pass": "p"}), &json!({}))
            .unwrap();
        assert_eq!(result["at"], "2026-03-14");
        assert_eq!(result["auth"], "dTpw");
    }

    #[test]
    fn test_condition_truthiness() {
        let sb = sandbox();
        let event = json!({"amount": 500, "note": ""});
        assert!(sb.eval_condition("event.amount > 100", &event, &json!({})).unwrap());
        assert!(!sb.eval_condition("event.amount > 1000", &event, &json!({})).unwrap());
        // Empty string and null are false
        assert!(!sb.eval_condition("event.note", &event, &json!({})).unwrap());
        assert!(!sb.eval_condition("event.missing", &event, &json!({})).unwrap());
        // Empty condition is false, not an error
        assert!(!sb.eval_condition("   ", &event, &json!({})).unwrap());
    }

    #[test]
    fn test_missing_property_chains_to_null() {
        let result = sandbox()
            .transform("payload.a.b.c", &json!({"x": 1}), &json!({}))
            .unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_unknown_identifier_is_reference_error() {
        let err = sandbox()
            .transform("fetch('https://example.com')", &json!({}), &json!({}))
            .unwrap_err();
        assert!(matches!(err, ScriptError::Reference { .. }));

        let err = sandbox().transform("require + 1", &json!({}), &json!({})).unwrap_err();
        assert!(matches!(err, ScriptError::Reference { .. }));
    }

    #[test]
    fn test_syntax_error_kind() {
        let err = sandbox().transform("{ a: }", &json!({}), &json!({})).unwrap_err();
        assert!(matches!(err, ScriptError::Syntax { .. }));
    }

    #[test]
    fn test_operation_budget_stops_loops() {
        // Mutual recursion runs until the op budget trips the breaker.
        let sb = Sandbox::new(ScriptLimits {
            max_ops:  10_000,
            deadline: Duration::from_secs(5),
        });
        let script = r"
            function transform(payload, context) {
                return spin(0);
            }
            function spin(n) {
                return spin(n);
            }
        ";
        let err = sb.transform(script, &json!({}), &json!({})).unwrap_err();
        assert!(
            matches!(
                err,
                ScriptError::BudgetExhausted { .. } | ScriptError::Type { .. }
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn test_scheduling_script_returns_timestamp() {
        let script = "addHours(now(), 2)";
        let result = sandbox().schedule(script, &json!({}), &json!({})).unwrap();
        let now_ms = sandbox().clock().timestamp_millis();
        assert_eq!(result.as_f64().unwrap() as i64, now_ms + 2 * 3600 * 1000);
    }

    #[test]
    fn test_scheduling_script_returns_recurring_config() {
        let script = r"
            function schedule(event, context) {
                return {
                    firstOccurrence: addDays(startOfDay(now()), 1),
                    intervalMs: 86400000,
                    maxOccurrences: 7,
                };
            }
        ";
        let result = sandbox().schedule(script, &json!({}), &json!({})).unwrap();
        assert!(result["firstOccurrence"].is_number());
        assert_eq!(result["intervalMs"], 86_400_000);
        assert_eq!(result["maxOccurrences"], 7);
    }

    #[test]
    fn test_determinism_with_pinned_clock() {
        let script = "addMinutes(now(), 30)";
        let a = sandbox().schedule(script, &json!({}), &json!({})).unwrap();
        let b = sandbox().schedule(script, &json!({}), &json!({})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_string_and_array_operations() {
        let script = r"
            function transform(payload, context) {
                let parts = payload.name.split(' ');
                return {
                    first: parts[0].toUpperCase(),
                    count: parts.length,
                    tagged: payload.tags.includes('vip'),
                };
            }
        ";
        let result = sandbox()
            .transform(
                script,
                &json!({"name": "ada lovelace", "tags": ["vip", "eu"]}),
                &json!({}),
            )
            .unwrap();
        assert_eq!(result, json!({"first": "ADA", "count": 2, "tagged": true}));
    }

    #[test]
    fn test_or_default_idiom() {
        let result = sandbox()
            .transform("payload.nickname || 'anonymous'", &json!({}), &json!({}))
            .unwrap();
        assert_eq!(result, json!("anonymous"));
    }

    #[test]
    fn test_top_level_statements_with_return() {
        let script = "let x = payload.n + 1; return x * 2;";
        let result = sandbox().transform(script, &json!({"n": 4}), &json!({})).unwrap();
        assert_eq!(result, json!(10.0));
    }
}
