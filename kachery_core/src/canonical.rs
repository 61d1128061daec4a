//! The canonical JSON form.
//!
//! Every signature in the protocol is computed over this serialization, and
//! manifest files are stored in it, so two values are interchangeable
//! exactly when their canonical forms are byte-equal. Object keys are
//! sorted lexicographically at every depth; array order is preserved;
//! scalars use `serde_json`'s compact rendering. The serializer walks the
//! value itself rather than relying on map-ordering behavior of the
//! underlying `Map` type.

use serde::Serialize;
use serde_json::Value;

/// Serialize a JSON value to its canonical compact string.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical bytes of any serializable value, via its JSON representation.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    Ok(to_canonical_json(&v).into_bytes())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json::to_string on a str cannot fail
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                write_value(out, &map[*key]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).unwrap());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let v = json!({
            "zeta": {"b": 2, "a": 1},
            "alpha": [{"y": true, "x": false}],
        });
        assert_eq!(
            to_canonical_json(&v),
            r#"{"alpha":[{"x":false,"y":true}],"zeta":{"a":1,"b":2}}"#
        );
    }

    #[test]
    fn test_array_order_preserved() {
        let v = json!([3, 1, 2]);
        assert_eq!(to_canonical_json(&v), "[3,1,2]");
    }

    #[test]
    fn test_scalars() {
        assert_eq!(to_canonical_json(&json!(null)), "null");
        assert_eq!(to_canonical_json(&json!("a\"b")), r#""a\"b""#);
        assert_eq!(to_canonical_json(&json!(42)), "42");
    }

    #[test]
    fn test_equal_values_equal_bytes() {
        let a = json!({"k1": 1, "k2": {"n": [1, 2]}});
        let b = json!({"k2": {"n": [1, 2]}, "k1": 1});
        assert_eq!(to_canonical_json(&a), to_canonical_json(&b));
    }
}
