//! Lossy coercion helpers for untrusted JSON payloads.
//!
//! Ingest never fails on malformed input: every field coerces to a typed
//! value or a documented default. Numeric coercion goes through f64 so that
//! `"3.9"` becomes 3 rather than an error.

use serde_json::Value;

/// Try to read a JSON value as a float. Accepts numbers and numeric strings.
pub fn try_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce to f64, falling back to `default` on anything non-numeric.
pub fn coerce_f64(value: &Value, default: f64) -> f64 {
    try_f64(value).unwrap_or(default)
}

/// Coerce to i64 by truncating the float reading, falling back to `default`.
pub fn coerce_i64(value: &Value, default: i64) -> i64 {
    try_f64(value).map(|f| f as i64).unwrap_or(default)
}

/// Read a trimmed string out of a JSON value. Numbers render decimally so a
/// client sending `"site": 7` still tags something stable; everything else
/// (null, bool, arrays, objects) reads as empty.
pub fn string_like(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Read a trimmed string field from a JSON object, empty when absent.
pub fn str_field(map: &serde_json::Map<String, Value>, key: &str) -> String {
    map.get(key).map(string_like).unwrap_or_default()
}

/// Format a float with at most `precision` decimal places, stripping
/// trailing zeros and a trailing point. An all-zero rendering collapses to
/// `"0"` so a field value never ends up empty.
pub fn format_float(value: f64, precision: usize) -> String {
    let text = format!("{value:.precision$}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
