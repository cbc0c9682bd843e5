//! Storage key derivation.
//!
//! A key is `"{rule}:{hash}"`, where the hash is a 32-bit djb2 variant over the
//! identity's canonical JSON. The hash keeps keys short; it is not
//! collision-resistant. Two distinct identities under one rule that happen to
//! collide share a limit, which is an accepted tradeoff at 32 bits for
//! per-rule identity counts well below the tens of thousands. Keys for
//! different rules never collide because the rule name is kept verbatim.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// Seed of the djb2 hash.
const HASH_SEED: u32 = 5381;

/// Derive the storage key for an identity under a rule.
pub fn derive_key<I>(rule_name: &str, identity: &I) -> Result<String>
where
    I: Serialize + ?Sized,
{
    let canonical = canonical_json(identity)?;
    Ok(format!("{}:{}", rule_name, hash(&canonical)))
}

/// Serialize an identity to JSON with object keys sorted at every depth.
pub fn canonical_json<I>(identity: &I) -> Result<String>
where
    I: Serialize + ?Sized,
{
    let value = sort_keys(serde_json::to_value(identity)?);
    Ok(serde_json::to_string(&value)?)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, sort_keys(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// djb2 variant: `hash = hash * 33 ^ unit` over the UTF-16 code units of the
/// input, last to first, wrapping at 32 bits.
///
/// The iteration order and code unit width match keys written by other
/// clients of the same stores.
pub fn hash(input: &str) -> u32 {
    // `EncodeUtf16` only iterates forwards
    let units: Vec<u16> = input.encode_utf16().collect();
    units
        .into_iter()
        .rev()
        .fold(HASH_SEED, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Client {
        port: u16,
        ip: &'static str,
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(hash("hello world"), 2616892229);
        assert_eq!(hash("world hello"), 2266517189);
        assert_eq!(hash(""), HASH_SEED);
        assert_eq!(hash("{}"), 5861539);
    }

    #[test]
    fn test_hash_uses_utf16_units() {
        // U+1F600 is a surrogate pair: two code units, low surrogate hashed first
        let expected = HASH_SEED.wrapping_mul(33) ^ 0xDE00;
        let expected = expected.wrapping_mul(33) ^ 0xD83D;
        assert_eq!(hash("\u{1F600}"), expected);
    }

    #[test]
    fn test_empty_object_key() {
        assert_eq!(derive_key("login", &json!({})).unwrap(), "login:5861539");
    }

    #[test]
    fn test_key_is_stable() {
        let identity = json!({"ip": "1.2.3.4"});
        let first = derive_key("login", &identity).unwrap();
        let second = derive_key("login", &identity).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, "login:3490493226");
    }

    #[test]
    fn test_rule_names_separate_keys() {
        for identity in [json!({"ip": "1.2.3.4"}), json!("alice"), json!(42)] {
            let login = derive_key("login", &identity).unwrap();
            let other = derive_key("other", &identity).unwrap();
            assert_ne!(login, other);
        }
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let from_struct = derive_key(
            "login",
            &Client {
                port: 80,
                ip: "1.2.3.4",
            },
        )
        .unwrap();
        let from_json = derive_key("login", &json!({"ip": "1.2.3.4", "port": 80})).unwrap();

        assert_eq!(from_struct, from_json);
        assert_eq!(
            canonical_json(&Client {
                port: 80,
                ip: "1.2.3.4"
            })
            .unwrap(),
            r#"{"ip":"1.2.3.4","port":80}"#
        );
    }

    #[test]
    fn test_nested_objects_are_sorted() {
        let identity = json!({"b": [{"z": 1, "a": 2}], "a": {"y": true, "x": null}});
        assert_eq!(
            canonical_json(&identity).unwrap(),
            r#"{"a":{"x":null,"y":true},"b":[{"a":2,"z":1}]}"#
        );
    }

    #[test]
    fn test_scalar_identities() {
        assert_eq!(canonical_json("alice").unwrap(), r#""alice""#);
        assert_eq!(canonical_json(&42u32).unwrap(), "42");
        assert_ne!(
            derive_key("login", "alice").unwrap(),
            derive_key("login", "bob").unwrap()
        );
    }

    #[test]
    fn test_unserializable_identity() {
        use std::collections::HashMap;

        let mut identity = HashMap::new();
        identity.insert((1, 2), "tuple keys are not valid JSON object keys");
        assert!(derive_key("login", &identity).is_err());
    }
}
