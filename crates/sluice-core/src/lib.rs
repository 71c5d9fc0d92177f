#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Sluice core domain model.
//!
//! This crate holds the pure parts of the gateway: normalized events and
//! dedup keys, integration configurations with their tagged variants, the
//! event-to-integration matcher, the template engine, the SIMPLE/SCRIPT
//! transformer, the condition evaluator, the secure script sandbox, and
//! the execution-trace record types. Nothing here performs I/O; the
//! ingest, delivery and scheduling crates drive these types.

pub mod condition;
pub mod event;
pub mod integration;
pub mod matcher;
pub mod redact;
pub mod registry;
pub mod script;
pub mod template;
pub mod trace;
pub mod transform;

pub use condition::{ConditionEvaluator, Gate};
pub use event::{DedupKey, DeliveryContext, EventStatus, GatewayEvent, TimelineEntry};
pub use integration::{
    ActionSpec, AuthConfig, DeliveryMode, Direction, HeaderPair, IntegrationConfig, OnError,
    SigningConfig, TenantScope, TransformationConfig,
};
pub use matcher::IntegrationMatcher;
pub use registry::IntegrationRegistry;
pub use script::{Sandbox, ScriptLimits};
pub use trace::{
    DeliveryAttempt, ExecutionTrace, RequestSnapshot, ResponseSnapshot, StepStatus, TraceStatus,
    TraceStep, TriggerType,
};
pub use transform::Transformer;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_event_through_matcher_and_transform() {
        let mut config = integration::tests::minimal("ORDER_CREATED");
        config.transformation = TransformationConfig::Script {
            source: "{ oid: payload.orderId }".to_string(),
        };
        let registry = IntegrationRegistry::new();
        registry.load(vec![config]);

        let event = GatewayEvent::new(
            "orders-queue".to_string(),
            Some(42),
            100,
            Some(7),
            "ORDER_CREATED".to_string(),
            json!({"orderId": 7}),
            Utc::now(),
        );

        let matcher = registry.build_matcher();
        let matches = matcher.find_matches(&event);
        assert_eq!(matches.len(), 1);

        let ctx = DeliveryContext {
            org_id:           event.org_id,
            org_unit_id:      event.org_unit_id,
            event_type:       event.event_type.clone(),
            integration_id:   matches[0].id,
            integration_name: matches[0].name.clone(),
            now:              Utc::now(),
        };
        let body = Transformer::default()
            .apply(&matches[0].transformation, &event.payload, &ctx)
            .unwrap();
        assert_eq!(body, json!({"oid": 7}));
    }
}
