//! Deterministic payload hashing for idempotency keys.
//!
//! Two payloads that are structurally equal must hash identically regardless
//! of object key order, so the payload is first rendered to a canonical form
//! (object keys sorted recursively) and then folded through a 32-bit rolling
//! hash rendered in base36.

use serde_json::Value;

/// Render a JSON value with all object keys sorted, recursively.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        stable_stringify(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// 32-bit rolling hash of the canonical payload, rendered base36.
pub fn payload_hash(payload: &Value) -> String {
    let canonical = stable_stringify(payload);
    let mut hash: u32 = 0;
    for byte in canonical.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    to_base36(hash)
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let a = json!({"name": "a", "age": 30});
        let b = json!({"age": 30, "name": "a"});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn nested_key_order_does_not_change_hash() {
        let a = json!({"outer": {"x": 1, "y": 2}});
        let b = json!({"outer": {"y": 2, "x": 1}});
        assert_eq!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn different_values_change_hash() {
        let a = json!({"name": "a"});
        let b = json!({"name": "b"});
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn array_order_matters() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(payload_hash(&a), payload_hash(&b));
    }

    #[test]
    fn base36_renders_zero() {
        assert_eq!(to_base36(0), "0");
    }

    #[test]
    fn base36_renders_known_value() {
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(35), "z");
    }
}
