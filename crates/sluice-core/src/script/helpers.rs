//! Host helpers exposed to sandboxed scripts.
//!
//! Bare functions cover dates, encoding and id generation; the `JSON`,
//! `Math` and `Object` namespaces and string/array/number methods are
//! dispatched from the interpreter. Every helper is pure given the
//! injected clock; none perform I/O.

use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sluice_error::ScriptError;

fn type_err(message: impl Into<String>) -> ScriptError {
    ScriptError::Type {
        message: message.into(),
    }
}

fn number(n: f64) -> Result<Value, ScriptError> {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| type_err("arithmetic produced a non-finite number"))
}

fn as_str<'a>(v: &'a Value, what: &str) -> Result<&'a str, ScriptError> {
    v.as_str().ok_or_else(|| type_err(format!("{what} expects a string")))
}

fn as_f64(v: &Value, what: &str) -> Result<f64, ScriptError> {
    v.as_f64().ok_or_else(|| type_err(format!("{what} expects a number")))
}

fn arg<'a>(args: &'a [Value], idx: usize, what: &str) -> Result<&'a Value, ScriptError> {
    args.get(idx).ok_or_else(|| type_err(format!("{what}: missing argument {idx}")))
}

/// Parse a date value (millis number, RFC 3339 string, or common
/// date formats) into a UTC instant.
fn parse_instant(v: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>, ScriptError> {
    match v {
        Value::Null => Ok(now),
        Value::Number(_) => {
            let ms = as_f64(v, "date")? as i64;
            Utc.timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| type_err(format!("invalid epoch millis {ms}")))
        },
        Value::String(s) => parse_date_string(s, None),
        other => Err(type_err(format!("cannot interpret {other} as a date"))),
    }
}

fn parse_date_string(s: &str, format: Option<&str>) -> Result<DateTime<Utc>, ScriptError> {
    if let Some(fmt) = format {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
        if let Ok(d) = chrono::NaiveDate::parse_from_str(s, fmt) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt.and_utc());
            }
        }
        return Err(type_err(format!("'{s}' does not match format '{fmt}'")));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc());
        }
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(type_err(format!("unparseable date '{s}'")))
}

fn millis(dt: DateTime<Utc>) -> Result<Value, ScriptError> {
    number(dt.timestamp_millis() as f64)
}

/// Call a bare helper function. Returns `None` when the name is not a
/// helper, so the interpreter can fall back to user-defined functions.
pub fn call(
    name: &str,
    args: &[Value],
    now: DateTime<Utc>,
) -> Option<Result<Value, ScriptError>> {
    let result = match name {
        "now" => millis(now),
        "parseDate" | "toTimestamp" => (|| {
            let value = arg(args, 0, name)?;
            let fmt = args.get(1).and_then(Value::as_str);
            match value {
                Value::String(s) => millis(parse_date_string(s, fmt)?),
                _ => millis(parse_instant(value, now)?),
            }
        })(),
        "formatDate" => (|| {
            let instant = parse_instant(arg(args, 0, "formatDate")?, now)?;
            let fmt = args
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("%Y-%m-%dT%H:%M:%SZ");
            Ok(Value::String(instant.format(fmt).to_string()))
        })(),
        "addDays" | "addHours" | "addMinutes" => (|| {
            let instant = parse_instant(arg(args, 0, name)?, now)?;
            let amount = as_f64(arg(args, 1, name)?, name)? as i64;
            let delta = match name {
                "addDays" => chrono::Duration::days(amount),
                "addHours" => chrono::Duration::hours(amount),
                _ => chrono::Duration::minutes(amount),
            };
            millis(instant + delta)
        })(),
        "startOfDay" => (|| {
            let instant = parse_instant(args.first().unwrap_or(&Value::Null), now)?;
            let start = instant
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| type_err("invalid date"))?;
            millis(start.and_utc())
        })(),
        "endOfDay" => (|| {
            let instant = parse_instant(args.first().unwrap_or(&Value::Null), now)?;
            let end = instant
                .date_naive()
                .and_hms_milli_opt(23, 59, 59, 999)
                .ok_or_else(|| type_err("invalid date"))?;
            millis(end.and_utc())
        })(),
        "base64Encode" => (|| {
            let s = as_str(arg(args, 0, "base64Encode")?, "base64Encode")?;
            Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(s.as_bytes()),
            ))
        })(),
        "base64Decode" => (|| {
            let s = as_str(arg(args, 0, "base64Decode")?, "base64Decode")?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(s)
                .map_err(|e| type_err(format!("invalid base64: {e}")))?;
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| type_err("base64 payload is not valid UTF-8"))
        })(),
        "generateUUID" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "parseInt" => (|| {
            let v = arg(args, 0, "parseInt")?;
            match v {
                Value::Number(_) => number(as_f64(v, "parseInt")?.trunc()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| type_err(format!("parseInt: '{s}' is not a number")))
                    .and_then(|n| number(n.trunc())),
                _ => Err(type_err("parseInt expects a number or string")),
            }
        })(),
        "parseFloat" => (|| {
            let v = arg(args, 0, "parseFloat")?;
            match v {
                Value::Number(_) => Ok(v.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| type_err(format!("parseFloat: '{s}' is not a number")))
                    .and_then(number),
                _ => Err(type_err("parseFloat expects a number or string")),
            }
        })(),
        "String" => Ok(Value::String(stringify(args.first().unwrap_or(&Value::Null)))),
        _ => return None,
    };
    Some(result)
}

/// Call a method on a namespace object (`JSON`, `Math`, `Object`).
/// Returns `None` when the namespace is unknown.
pub fn namespace_call(
    namespace: &str,
    method: &str,
    args: &[Value],
) -> Option<Result<Value, ScriptError>> {
    let result = match (namespace, method) {
        ("JSON", "parse") => (|| {
            let s = as_str(arg(args, 0, "JSON.parse")?, "JSON.parse")?;
            serde_json::from_str(s).map_err(|e| type_err(format!("JSON.parse: {e}")))
        })(),
        ("JSON", "stringify") => {
            Ok(Value::String(arg(args, 0, "JSON.stringify").map(Value::to_string).unwrap_or_else(|_| "null".to_string())))
        },
        ("Math", "floor" | "ceil" | "round" | "abs" | "trunc") => (|| {
            let n = as_f64(arg(args, 0, "Math")?, "Math")?;
            let out = match method {
                "floor" => n.floor(),
                "ceil" => n.ceil(),
                "round" => n.round(),
                "abs" => n.abs(),
                _ => n.trunc(),
            };
            number(out)
        })(),
        ("Math", "min" | "max") => (|| {
            let mut acc = if method == "min" { f64::INFINITY } else { f64::NEG_INFINITY };
            if args.is_empty() {
                return Err(type_err("Math.min/max expects at least one argument"));
            }
            for v in args {
                let n = as_f64(v, "Math")?;
                acc = if method == "min" { acc.min(n) } else { acc.max(n) };
            }
            number(acc)
        })(),
        ("Math", "pow") => (|| {
            let base = as_f64(arg(args, 0, "Math.pow")?, "Math.pow")?;
            let exp = as_f64(arg(args, 1, "Math.pow")?, "Math.pow")?;
            number(base.powf(exp))
        })(),
        ("Object", "keys") => (|| {
            let obj = arg(args, 0, "Object.keys")?;
            let map = obj
                .as_object()
                .ok_or_else(|| type_err("Object.keys expects an object"))?;
            Ok(Value::Array(map.keys().map(|k| Value::String(k.clone())).collect()))
        })(),
        ("Object", "values") => (|| {
            let obj = arg(args, 0, "Object.values")?;
            let map = obj
                .as_object()
                .ok_or_else(|| type_err("Object.values expects an object"))?;
            Ok(Value::Array(map.values().cloned().collect()))
        })(),
        _ => return None,
    };
    Some(result)
}

/// Call a method on a concrete value (strings, arrays, numbers).
pub fn method_call(
    target: &Value,
    method: &str,
    args: &[Value],
) -> Result<Value, ScriptError> {
    match target {
        Value::String(s) => string_method(s, method, args),
        Value::Array(items) => array_method(items, method, args),
        Value::Number(_) => number_method(target, method, args),
        other => Err(type_err(format!(
            "no method '{method}' on value {other}"
        ))),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match method {
        "trim" => Ok(Value::String(s.trim().to_string())),
        "toUpperCase" => Ok(Value::String(s.to_uppercase())),
        "toLowerCase" => Ok(Value::String(s.to_lowercase())),
        "includes" => Ok(Value::Bool(s.contains(as_str(arg(args, 0, method)?, method)?))),
        "startsWith" => Ok(Value::Bool(s.starts_with(as_str(arg(args, 0, method)?, method)?))),
        "endsWith" => Ok(Value::Bool(s.ends_with(as_str(arg(args, 0, method)?, method)?))),
        "indexOf" => {
            let needle = as_str(arg(args, 0, method)?, method)?;
            let idx = s.find(needle).map_or(-1.0, |i| i as f64);
            number(idx)
        },
        "split" => {
            let sep = as_str(arg(args, 0, method)?, method)?;
            Ok(Value::Array(
                s.split(sep).map(|part| Value::String(part.to_string())).collect(),
            ))
        },
        "replace" => {
            let from = as_str(arg(args, 0, method)?, method)?;
            let to = as_str(arg(args, 1, method)?, method)?;
            Ok(Value::String(s.replacen(from, to, 1)))
        },
        "replaceAll" => {
            let from = as_str(arg(args, 0, method)?, method)?;
            let to = as_str(arg(args, 1, method)?, method)?;
            Ok(Value::String(s.replace(from, to)))
        },
        "substring" => {
            let chars: Vec<char> = s.chars().collect();
            let start = (as_f64(arg(args, 0, method)?, method)? as usize).min(chars.len());
            let end = args
                .get(1)
                .map(|v| as_f64(v, method))
                .transpose()?
                .map_or(chars.len(), |n| (n as usize).min(chars.len()));
            let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
            Ok(Value::String(chars[lo..hi].iter().collect()))
        },
        "padStart" => {
            let width = as_f64(arg(args, 0, method)?, method)? as usize;
            let pad = args.get(1).and_then(Value::as_str).unwrap_or(" ");
            let mut out = s.to_string();
            if pad.is_empty() {
                return Ok(Value::String(out));
            }
            while out.chars().count() < width {
                out.insert_str(0, pad);
            }
            Ok(Value::String(out))
        },
        "toString" => Ok(Value::String(s.to_string())),
        _ => Err(type_err(format!("unknown string method '{method}'"))),
    }
}

fn array_method(items: &[Value], method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    match method {
        "includes" => {
            let needle = arg(args, 0, method)?;
            Ok(Value::Bool(items.contains(needle)))
        },
        "indexOf" => {
            let needle = arg(args, 0, method)?;
            let idx = items.iter().position(|v| v == needle).map_or(-1.0, |i| i as f64);
            number(idx)
        },
        "join" => {
            let sep = args.first().and_then(Value::as_str).unwrap_or(",");
            Ok(Value::String(
                items.iter().map(stringify).collect::<Vec<_>>().join(sep),
            ))
        },
        "concat" => {
            let mut out = items.to_vec();
            for v in args {
                match v {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        },
        "slice" => {
            let start = args
                .first()
                .map(|v| as_f64(v, method))
                .transpose()?
                .map_or(0, |n| n.max(0.0) as usize)
                .min(items.len());
            let end = args
                .get(1)
                .map(|v| as_f64(v, method))
                .transpose()?
                .map_or(items.len(), |n| (n.max(0.0) as usize).min(items.len()));
            Ok(Value::Array(items[start..end.max(start)].to_vec()))
        },
        _ => Err(type_err(format!("unknown array method '{method}'"))),
    }
}

fn number_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let n = as_f64(target, "number")?;
    match method {
        "toFixed" => {
            let digits = args
                .first()
                .map(|v| as_f64(v, method))
                .transpose()?
                .unwrap_or(0.0) as usize;
            Ok(Value::String(format!("{n:.digits$}")))
        },
        "toString" => Ok(Value::String(stringify(target))),
        _ => Err(type_err(format!("unknown number method '{method}'"))),
    }
}

/// JS-style string rendering for concatenation and `join`.
#[must_use]
pub fn stringify(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            let f = n.as_f64().unwrap_or(0.0);
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", f as i64)
            } else {
                format!("{f}")
            }
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
    }

    fn call_ok(name: &str, args: &[Value]) -> Value {
        call(name, args, fixed_now()).unwrap().unwrap()
    }

    #[test]
    fn test_now_returns_injected_clock() {
        let ms = call_ok("now", &[]);
        assert_eq!(ms.as_f64().unwrap() as i64, fixed_now().timestamp_millis());
    }

    #[test]
    fn test_parse_and_format_date() {
        let ms = call_ok("parseDate", &[json!("2026-03-14T09:30:00Z")]);
        assert_eq!(ms.as_f64().unwrap() as i64, fixed_now().timestamp_millis());

        let formatted = call_ok("formatDate", &[ms, json!("%Y-%m-%d")]);
        assert_eq!(formatted, json!("2026-03-14"));
    }

    #[test]
    fn test_parse_date_with_explicit_format() {
        let ms = call_ok("parseDate", &[json!("14/03/2026"), json!("%d/%m/%Y")]);
        let back = call_ok("formatDate", &[ms, json!("%Y-%m-%d")]);
        assert_eq!(back, json!("2026-03-14"));
    }

    #[test]
    fn test_add_helpers() {
        let base = fixed_now().timestamp_millis() as f64;
        let plus_two_hours = call_ok("addHours", &[json!(base), json!(2)]);
        assert_eq!(
            plus_two_hours.as_f64().unwrap() as i64 - base as i64,
            2 * 3600 * 1000
        );
        let plus_day = call_ok("addDays", &[json!(base), json!(1)]);
        assert_eq!(plus_day.as_f64().unwrap() as i64 - base as i64, 86_400_000);
    }

    #[test]
    fn test_day_bounds() {
        let start = call_ok("startOfDay", &[]);
        let end = call_ok("endOfDay", &[]);
        let start_dt = Utc.timestamp_millis_opt(start.as_f64().unwrap() as i64).unwrap();
        assert_eq!(start_dt.format("%H:%M:%S").to_string(), "00:00:00");
        assert!(end.as_f64().unwrap() > start.as_f64().unwrap());
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = call_ok("base64Encode", &[json!("user:pass")]);
        let decoded = call_ok("base64Decode", &[encoded]);
        assert_eq!(decoded, json!("user:pass"));
    }

    #[test]
    fn test_generate_uuid_shape() {
        let id = call_ok("generateUUID", &[]);
        assert_eq!(id.as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_unknown_helper_is_none() {
        assert!(call("fetch", &[], fixed_now()).is_none());
        assert!(call("require", &[], fixed_now()).is_none());
    }

    #[test]
    fn test_json_namespace() {
        let parsed = namespace_call("JSON", "parse", &[json!("{\"a\":1}")]).unwrap().unwrap();
        assert_eq!(parsed["a"], 1);
        let text = namespace_call("JSON", "stringify", &[json!({"a": 1})]).unwrap().unwrap();
        assert_eq!(text, json!("{\"a\":1}"));
    }

    #[test]
    fn test_math_namespace() {
        assert_eq!(
            namespace_call("Math", "floor", &[json!(2.9)]).unwrap().unwrap(),
            json!(2.0)
        );
        assert_eq!(
            namespace_call("Math", "max", &[json!(1), json!(5), json!(3)]).unwrap().unwrap(),
            json!(5.0)
        );
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(method_call(&json!("  hi  "), "trim", &[]).unwrap(), json!("hi"));
        assert_eq!(method_call(&json!("abc"), "toUpperCase", &[]).unwrap(), json!("ABC"));
        assert_eq!(
            method_call(&json!("a,b,c"), "split", &[json!(",")]).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(
            method_call(&json!("hello"), "substring", &[json!(1), json!(3)]).unwrap(),
            json!("el")
        );
    }

    #[test]
    fn test_array_methods() {
        let arr = json!([1, 2, 3]);
        let items = arr.as_array().unwrap();
        assert_eq!(array_method(items, "includes", &[json!(2)]).unwrap(), json!(true));
        assert_eq!(array_method(items, "join", &[json!("-")]).unwrap(), json!("1-2-3"));
    }

    #[test]
    fn test_stringify_trims_integral_floats() {
        assert_eq!(stringify(&json!(7.0)), "7");
        assert_eq!(stringify(&json!(7.5)), "7.5");
        assert_eq!(stringify(&json!(null)), "null");
    }
}
