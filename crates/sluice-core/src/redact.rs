//! Secret redaction for logged request/response snapshots.
//!
//! A case-insensitive key filter replaces values of sensitive keys before
//! anything reaches the structured logger or persisted trace records.

use serde_json::Value;

/// Replacement text for redacted values
pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "secret",
    "token",
    "key",
    "authorization",
    "credential",
];

/// Whether a key is sensitive under the case-insensitive filter.
#[must_use]
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|needle| lower.contains(needle))
}

/// Recursively redact sensitive keys in a JSON value.
#[must_use]
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_sensitive_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact_value(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

/// Redact sensitive header values, preserving order.
#[must_use]
pub fn redact_headers(headers: &[(String, String)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| {
            if is_sensitive_key(k) {
                (k.clone(), REDACTED.to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_filter_is_case_insensitive() {
        assert!(is_sensitive_key("Authorization"));
        assert!(is_sensitive_key("X-API-KEY"));
        assert!(is_sensitive_key("client_secret"));
        assert!(is_sensitive_key("accessToken"));
        assert!(!is_sensitive_key("orderId"));
    }

    #[test]
    fn test_nested_redaction() {
        let input = json!({
            "orderId": 7,
            "password": "hunter2",
            "auth": {"token": "t", "scope": "read"},
            "items": [{"apiKey": "k", "sku": "A"}],
        });
        let out = redact_value(&input);
        assert_eq!(out["orderId"], 7);
        assert_eq!(out["password"], REDACTED);
        assert_eq!(out["auth"]["token"], REDACTED);
        assert_eq!(out["auth"]["scope"], "read");
        assert_eq!(out["items"][0]["apiKey"], REDACTED);
        assert_eq!(out["items"][0]["sku"], "A");
    }

    #[test]
    fn test_header_redaction() {
        let headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Authorization".to_string(), "Bearer abc".to_string()),
        ];
        let out = redact_headers(&headers);
        assert_eq!(out[0].1, "application/json");
        assert_eq!(out[1].1, REDACTED);
    }
}
