//! Coercion of `If` condition values to booleans.

use serde_json::Value;

/// Whether a rendered condition value selects the `then` branch.
///
/// Booleans pass through, numeric zero (including `-0`) is falsy, the strings
/// `"true"` and `"false"` are matched case-sensitively, and the strings a
/// rendered zero or empty value produces (`"0"`, `"-0"`, `""`) are falsy.
/// `null` is falsy. Anything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !matches!(s.as_str(), "false" | "0" | "-0" | ""),
        Value::Array(_) | Value::Object(_) => true,
    }
}
