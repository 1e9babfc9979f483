//! SQL literal rendering shared by the filter transforms.

use serde_json::Value;

/// Render a JSON value as a SQL literal.
///
/// Numbers (and strings that parse as finite numbers) are inlined bare;
/// everything else becomes a single-quoted literal. Embedded single quotes
/// are NOT escaped: this matches the output of the system this replaces
/// and is a known limitation, not an oversight (see DESIGN.md).
pub fn literal(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) if s.parse::<f64>().map(f64::is_finite).unwrap_or(false) => s.clone(),
        Value::String(s) => format!("'{s}'"),
        Value::Bool(b) => b.to_string(),
        Value::Null => "NULL".to_string(),
        other => format!("'{other}'"),
    }
}
