//! Journal export lines (`journalctl --output=json`).

use serde_json::Value;
use warden_protocol::protocol::LogLine;

/// Parse one line of tail output.
///
/// Journal JSON yields message, priority and timestamp. Anything else is
/// passed through verbatim as the message.
pub fn parse_line(raw: &str) -> LogLine {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(raw) else {
        return LogLine::plain(raw);
    };

    let message = match fields.get("MESSAGE") {
        Some(Value::String(s)) => s.clone(),
        // Non-UTF-8 messages are exported as byte arrays
        Some(Value::Array(bytes)) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => String::new(),
    };

    LogLine {
        message,
        priority: numeric_field(fields.get("PRIORITY")).and_then(|p| u8::try_from(p).ok()),
        timestamp: numeric_field(fields.get("__REALTIME_TIMESTAMP")),
    }
}

/// Journal fields are strings even when numeric.
fn numeric_field(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}
