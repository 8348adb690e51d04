use serde_json::{Map, Number, Value};
use tracing::debug;

/// Flatten a whitespace-separated `key=value` payload into a JSON object.
///
/// Tokens without a `=` are skipped with a log line. The split happens at
/// the first `=`, so values may themselves contain `=`. When a key repeats,
/// the last occurrence wins.
pub fn flatten_key_values(payload: &str) -> Value {
    let mut object = Map::new();
    for token in payload.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                object.insert(key.to_string(), infer_value(value));
            }
            None => debug!("skipping token without '=': {:?}", token),
        }
    }
    Value::Object(object)
}

/// Best-effort value typing: bool, then integer, then float, then string.
fn infer_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(Number::from(n));
    }
    if let Ok(f) = raw.parse::<f64>() {
        // NaN and infinity have no JSON representation; those fall through
        // to plain strings
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(raw.to_string())
}
