// =============================================================================
// Payload scrubbing for the order-event audit stream
// =============================================================================
//
// Raw exchange payloads are persisted verbatim on every order event for
// auditability. Before a payload reaches the database it is recursively
// scrubbed: credential-bearing keys are dropped entirely, and any string
// longer than MAX_STRING_CHARS is truncated with an ellipsis marker.
// =============================================================================

use serde_json::Value;

/// Keys removed from payloads wherever they appear (case-insensitive).
const SENSITIVE_KEYS: &[&str] = &[
    "token",
    "secret",
    "signature",
    "api_key",
    "password",
    "authorization",
];

/// Maximum length of any persisted string value, marker included.
const MAX_STRING_CHARS: usize = 2048;

/// Marker appended to truncated strings.
const ELLIPSIS: &str = "...";

/// Recursively scrub a JSON payload for persistence.
pub fn scrub_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    continue;
                }
                out.insert(k.clone(), scrub_payload(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(scrub_payload).collect()),
        Value::String(s) => Value::String(truncate(s)),
        other => other.clone(),
    }
}

/// Scrub and serialize a payload in one step.
pub fn scrubbed_json(value: &Value) -> String {
    scrub_payload(value).to_string()
}

fn is_sensitive_key(key: &str) -> bool {
    SENSITIVE_KEYS.iter().any(|s| key.eq_ignore_ascii_case(s))
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_STRING_CHARS {
        return s.to_string();
    }
    let keep = MAX_STRING_CHARS - ELLIPSIS.chars().count();
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(ELLIPSIS);
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn drops_sensitive_keys_at_any_depth() {
        let payload = json!({
            "symbol": "BTCUSDT",
            "api_key": "abc",
            "nested": {
                "Signature": "deadbeef",
                "qty": 1.5,
                "deeper": [{"PASSWORD": "x", "ok": true}]
            }
        });
        let scrubbed = scrub_payload(&payload);
        assert_eq!(scrubbed["symbol"], "BTCUSDT");
        assert!(scrubbed.get("api_key").is_none());
        assert!(scrubbed["nested"].get("Signature").is_none());
        assert_eq!(scrubbed["nested"]["qty"], 1.5);
        assert!(scrubbed["nested"]["deeper"][0].get("PASSWORD").is_none());
        assert_eq!(scrubbed["nested"]["deeper"][0]["ok"], true);
    }

    #[test]
    fn truncates_long_strings_with_marker() {
        let long = "x".repeat(5000);
        let payload = json!({ "raw": long });
        let scrubbed = scrub_payload(&payload);
        let out = scrubbed["raw"].as_str().unwrap();
        assert_eq!(out.chars().count(), 2048);
        assert!(out.ends_with("..."));
    }

    #[test]
    fn short_strings_untouched() {
        let payload = json!({ "note": "ok", "n": 7, "b": false, "z": null });
        assert_eq!(scrub_payload(&payload), payload);
    }

    #[test]
    fn strings_inside_arrays_are_truncated() {
        let payload = json!([ "a".repeat(3000), "b" ]);
        let scrubbed = scrub_payload(&payload);
        assert_eq!(scrubbed[0].as_str().unwrap().chars().count(), 2048);
        assert_eq!(scrubbed[1], "b");
    }

    #[test]
    fn boundary_length_is_not_truncated() {
        let exact = "y".repeat(2048);
        let payload = json!({ "v": exact.clone() });
        assert_eq!(scrub_payload(&payload)["v"].as_str().unwrap(), exact);
    }
}
