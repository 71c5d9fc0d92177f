//! Payload transformation: SIMPLE field mappings and SCRIPT mode.

use crate::event::DeliveryContext;
use crate::integration::{FieldMapping, FieldTransform, StaticField, TransformationConfig};
use crate::script::Sandbox;
use crate::template;
use serde_json::Value;
use sluice_error::DeliveryError;

/// Applies integration transformations to event payloads
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    sandbox: Sandbox,
}

impl Transformer {
    /// Create a transformer backed by the given sandbox.
    #[must_use]
    pub const fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    /// Produce the outbound request body for a payload.
    ///
    /// Transformation failures are terminal: the caller records a failed
    /// `transformation` step and never issues the HTTP request.
    pub fn apply(
        &self,
        config: &TransformationConfig,
        payload: &Value,
        ctx: &DeliveryContext,
    ) -> Result<Value, DeliveryError> {
        match config {
            TransformationConfig::Simple {
                mappings,
                static_fields,
            } => Ok(apply_simple(mappings, static_fields, payload, ctx)),
            TransformationConfig::Script { source } => self
                .sandbox
                .transform(source, payload, &ctx.to_json())
                .map_err(|e| DeliveryError::Transformation {
                    reason: e.to_string(),
                }),
        }
    }
}

fn apply_simple(
    mappings: &[FieldMapping],
    static_fields: &[StaticField],
    payload: &Value,
    ctx: &DeliveryContext,
) -> Value {
    let mut out = Value::Object(serde_json::Map::new());

    for mapping in mappings {
        let source = get_path(payload, &mapping.source_field);
        match source {
            Some(value) => {
                let transformed = transform_value(value, mapping.transform);
                set_path(&mut out, &mapping.target_field, transformed);
            },
            None => {
                if mapping.transform == FieldTransform::Default {
                    if let Some(default) = &mapping.default_value {
                        set_path(&mut out, &mapping.target_field, default.clone());
                    }
                }
                // Missing source without a default: key omitted
            },
        }
    }

    for field in static_fields {
        let rendered = template::render_value(&field.value, ctx);
        set_path(&mut out, &field.key, rendered);
    }

    out
}

fn transform_value(value: &Value, transform: FieldTransform) -> Value {
    match transform {
        FieldTransform::None | FieldTransform::Default => value.clone(),
        FieldTransform::Trim => map_str(value, |s| s.trim().to_string()),
        FieldTransform::Upper => map_str(value, str::to_uppercase),
        FieldTransform::Lower => map_str(value, str::to_lowercase),
        FieldTransform::Date => normalize_date(value),
    }
}

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

/// Normalize common date renderings to RFC 3339. Unparseable values pass
/// through unchanged.
fn normalize_date(value: &Value) -> Value {
    match value {
        Value::String(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                return Value::String(
                    dt.with_timezone(&chrono::Utc)
                        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                );
            }
            for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                    return Value::String(
                        dt.and_utc().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    );
                }
            }
            if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                    return Value::String(
                        dt.and_utc().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    );
                }
            }
            value.clone()
        },
        Value::Number(n) => n
            .as_i64()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map_or_else(
                || value.clone(),
                |dt| Value::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            ),
        other => other.clone(),
    }
}

/// Read a dotted path out of a JSON value.
#[must_use]
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a dotted path into a JSON object, creating intermediate objects.
pub fn set_path(target: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = target;

    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current
            .as_object_mut()
            .expect("just ensured current is an object");
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> DeliveryContext {
        DeliveryContext {
            org_id:           100,
            org_unit_id:      Some(7),
            event_type:       "ORDER_CREATED".to_string(),
            integration_id:   Uuid::nil(),
            integration_name: "erp-sync".to_string(),
            now:              Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap(),
        }
    }

    fn mapping(source: &str, target: &str, transform: FieldTransform) -> FieldMapping {
        FieldMapping {
            source_field:  source.to_string(),
            target_field:  target.to_string(),
            transform,
            default_value: None,
        }
    }

    #[test]
    fn test_simple_mapping_basics() {
        let config = TransformationConfig::Simple {
            mappings:      vec![
                mapping("customer.name", "buyer", FieldTransform::Upper),
                mapping("note", "note", FieldTransform::Trim),
                mapping("orderId", "order.id", FieldTransform::None),
            ],
            static_fields: vec![StaticField {
                key:   "source".to_string(),
                value: json!("sluice"),
            }],
        };
        let payload = json!({
            "customer": {"name": "ada"},
            "note": "  rush  ",
            "orderId": 7,
        });
        let transformer = Transformer::default();
        let out = transformer.apply(&config, &payload, &ctx()).unwrap();
        assert_eq!(
            out,
            json!({
                "buyer": "ADA",
                "note": "rush",
                "order": {"id": 7},
                "source": "sluice",
            })
        );
    }

    #[test]
    fn test_missing_source_with_default() {
        let config = TransformationConfig::Simple {
            mappings:      vec![FieldMapping {
                source_field:  "status".to_string(),
                target_field:  "state".to_string(),
                transform:     FieldTransform::Default,
                default_value: Some(json!("NEW")),
            }],
            static_fields: Vec::new(),
        };
        let transformer = Transformer::default();
        let out = transformer.apply(&config, &json!({}), &ctx()).unwrap();
        assert_eq!(out, json!({"state": "NEW"}));
    }

    #[test]
    fn test_missing_source_without_default_omits_key() {
        let config = TransformationConfig::Simple {
            mappings:      vec![mapping("status", "state", FieldTransform::None)],
            static_fields: Vec::new(),
        };
        let transformer = Transformer::default();
        let out = transformer.apply(&config, &json!({}), &ctx()).unwrap();
        assert_eq!(out, json!({}));
    }

    #[test]
    fn test_date_normalization() {
        let config = TransformationConfig::Simple {
            mappings:      vec![mapping("when", "at", FieldTransform::Date)],
            static_fields: Vec::new(),
        };
        let transformer = Transformer::default();
        let out = transformer
            .apply(&config, &json!({"when": "2026-03-14"}), &ctx())
            .unwrap();
        assert_eq!(out, json!({"at": "2026-03-14T00:00:00Z"}));
    }

    #[test]
    fn test_static_fields_are_templated() {
        let config = TransformationConfig::Simple {
            mappings:      Vec::new(),
            static_fields: vec![StaticField {
                key:   "meta.org".to_string(),
                value: json!("{{config.orgId}}"),
            }],
        };
        let transformer = Transformer::default();
        let out = transformer.apply(&config, &json!({}), &ctx()).unwrap();
        assert_eq!(out, json!({"meta": {"org": "100"}}));
    }

    #[test]
    fn test_script_mode() {
        let config = TransformationConfig::Script {
            source: "{ oid: payload.orderId }".to_string(),
        };
        let transformer = Transformer::default();
        let out = transformer.apply(&config, &json!({"orderId": 7}), &ctx()).unwrap();
        assert_eq!(out, json!({"oid": 7}));
    }

    #[test]
    fn test_script_failure_is_transformation_error() {
        let config = TransformationConfig::Script {
            source: "nonexistentHelper()".to_string(),
        };
        let transformer = Transformer::default();
        let err = transformer.apply(&config, &json!({}), &ctx()).unwrap_err();
        assert!(matches!(err, DeliveryError::Transformation { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_path_helpers() {
        let value = json!({"a": {"b": [{"c": 1}]}});
        assert_eq!(get_path(&value, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(get_path(&value, "a.missing"), None);

        let mut target = json!({});
        set_path(&mut target, "x.y.z", json!(true));
        assert_eq!(target, json!({"x": {"y": {"z": true}}}));
    }
}
