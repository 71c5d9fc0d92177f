//! Template token substitution for URLs, headers and body strings.
//!
//! Supported tokens: `{{config.orgId}}`, `{{config.integrationId}}`,
//! `{{config.integrationName}}`, `{{date.today()}}`, `{{date.yesterday()}}`,
//! `{{date.todayStart()}}`, `{{date.todayEnd()}}`, `{{date.now()}}`,
//! `{{date.timestamp()}}`, and `{{env.NAME}}`. Unknown tokens pass through
//! verbatim. Substitution is recursive over object and array bodies; only
//! string values are rewritten.

use crate::event::DeliveryContext;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_]+(?:\(\))?)\s*\}\}")
            .expect("template token regex is valid")
    })
}

/// Substitute all supported tokens in a string. Unknown tokens are left
/// verbatim.
#[must_use]
pub fn render_str(input: &str, ctx: &DeliveryContext) -> String {
    token_re()
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let namespace = &caps[1];
            let name = &caps[2];
            resolve(namespace, name, ctx).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Recursively substitute tokens in every string field of a JSON value.
#[must_use]
pub fn render_value(value: &Value, ctx: &DeliveryContext) -> Value {
    match value {
        Value::String(s) => Value::String(render_str(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve(namespace: &str, name: &str, ctx: &DeliveryContext) -> Option<String> {
    match namespace {
        "config" => resolve_config(name, ctx),
        "date" => resolve_date(name, ctx.now),
        "env" => std::env::var(name).ok(),
        _ => None,
    }
}

fn resolve_config(name: &str, ctx: &DeliveryContext) -> Option<String> {
    match name {
        "orgId" => Some(ctx.org_id.to_string()),
        "integrationId" => Some(ctx.integration_id.to_string()),
        "integrationName" => Some(ctx.integration_name.clone()),
        _ => None,
    }
}

fn resolve_date(name: &str, now: DateTime<Utc>) -> Option<String> {
    let today = now.date_naive();
    match name {
        "today()" => Some(today.format("%Y-%m-%d").to_string()),
        "yesterday()" => Some((today - Duration::days(1)).format("%Y-%m-%d").to_string()),
        "todayStart()" => Some(format!("{}T00:00:00Z", today.format("%Y-%m-%d"))),
        "todayEnd()" => Some(format!("{}T23:59:59Z", today.format("%Y-%m-%d"))),
        "now()" => Some(now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        "timestamp()" => Some(now.timestamp_millis().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            org_id:           100,
            org_unit_id:      Some(7),
            event_type:       "ORDER_CREATED".to_string(),
            integration_id:   Uuid::nil(),
            integration_name: "erp-sync".to_string(),
            now:              Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
        }
    }

    #[test]
    fn test_config_tokens() {
        let out = render_str("org={{config.orgId}} name={{config.integrationName}}", &ctx());
        assert_eq!(out, "org=100 name=erp-sync");
    }

    #[test]
    fn test_date_tokens() {
        let ctx = ctx();
        assert_eq!(render_str("{{date.today()}}", &ctx), "2026-03-14");
        assert_eq!(render_str("{{date.yesterday()}}", &ctx), "2026-03-13");
        assert_eq!(render_str("{{date.todayStart()}}", &ctx), "2026-03-14T00:00:00Z");
        assert_eq!(render_str("{{date.todayEnd()}}", &ctx), "2026-03-14T23:59:59Z");
        assert_eq!(render_str("{{date.now()}}", &ctx), "2026-03-14T09:26:53Z");
        assert!(!render_str("{{date.timestamp()}}", &ctx).contains('{'));
    }

    #[test]
    fn test_env_tokens() {
        temp_env::with_var("SLUICE_TEST_TOKEN", Some("abc"), || {
            assert_eq!(render_str("k={{env.SLUICE_TEST_TOKEN}}", &ctx()), "k=abc");
        });
    }

    #[test]
    fn test_unknown_tokens_pass_through() {
        let ctx = ctx();
        assert_eq!(render_str("{{config.unknown}}", &ctx), "{{config.unknown}}");
        assert_eq!(render_str("{{weird.thing()}}", &ctx), "{{weird.thing()}}");
        // Missing env vars are unknown tokens too
        assert_eq!(
            render_str("{{env.SLUICE_DEFINITELY_UNSET_VAR}}", &ctx),
            "{{env.SLUICE_DEFINITELY_UNSET_VAR}}"
        );
    }

    #[test]
    fn test_recursive_value_substitution() {
        let body = serde_json::json!({
            "org": "{{config.orgId}}",
            "nested": {"day": "{{date.today()}}"},
            "list": ["{{config.integrationName}}", 42],
            "count": 3,
        });
        let out = render_value(&body, &ctx());
        assert_eq!(out["org"], "100");
        assert_eq!(out["nested"]["day"], "2026-03-14");
        assert_eq!(out["list"][0], "erp-sync");
        assert_eq!(out["list"][1], 42);
        assert_eq!(out["count"], 3);
    }

    #[test]
    fn test_substitution_is_closed_over_known_tokens() {
        let input = "{{config.orgId}}/{{date.today()}}/{{config.integrationId}}";
        let out = render_str(input, &ctx());
        assert!(!out.contains("{{"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const KNOWN_TOKENS: &[&str] = &[
            "{{config.orgId}}",
            "{{config.integrationId}}",
            "{{config.integrationName}}",
            "{{date.today()}}",
            "{{date.yesterday()}}",
            "{{date.todayStart()}}",
            "{{date.todayEnd()}}",
            "{{date.now()}}",
            "{{date.timestamp()}}",
        ];

        fn fragment() -> impl Strategy<Value = String> {
            prop_oneof![
                "[a-zA-Z0-9 /:_.-]{0,12}".prop_map(|s| s),
                (0..KNOWN_TOKENS.len()).prop_map(|i| KNOWN_TOKENS[i].to_string()),
            ]
        }

        proptest! {
            // For any string built from plain text and supported tokens,
            // the output contains no residual supported token.
            #[test]
            fn prop_known_tokens_always_resolve(parts in proptest::collection::vec(fragment(), 0..8)) {
                let input = parts.concat();
                let out = render_str(&input, &ctx());
                for token in KNOWN_TOKENS {
                    prop_assert!(!out.contains(token));
                }
            }
        }
    }
}
