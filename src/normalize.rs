use std::collections::BTreeSet;

use serde_json::Value;

/// Canonicalizes a JSON payload into a fingerprint string.
///
/// The payload is parsed, keys named in `ignored_keys` are dropped (top
/// level only, or at every depth including inside arrays when `deep`), and
/// the result is re-serialized with object keys sorted. Two payloads that
/// differ only in key order, whitespace, or ignored-key values produce the
/// same fingerprint, and normalizing a fingerprint is a no-op.
pub fn normalized_json_string(
    payload: &[u8],
    ignored_keys: &BTreeSet<String>,
    deep: bool,
) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;
    serde_json::to_string(&strip_ignored(value, ignored_keys, deep))
}

fn strip_ignored(value: Value, ignored_keys: &BTreeSet<String>, deep: bool) -> Value {
    match value {
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .filter(|(key, _)| !ignored_keys.contains(key))
                .map(|(key, entry)| {
                    let entry = if deep {
                        strip_ignored(entry, ignored_keys, deep)
                    } else {
                        entry
                    };
                    (key, entry)
                })
                .collect(),
        ),
        Value::Array(items) if deep => Value::Array(
            items
                .into_iter()
                .map(|item| strip_ignored(item, ignored_keys, deep))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn key_order_and_whitespace_are_canonicalized() {
        let first = normalized_json_string(br#"{"b":1, "a":2}"#, &keys(&[]), false).unwrap();
        let second = normalized_json_string(br#"{ "a": 2, "b": 1 }"#, &keys(&[]), false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn ignored_keys_do_not_affect_the_fingerprint() {
        let first =
            normalized_json_string(br#"{"id":"a","ts":1}"#, &keys(&["ts"]), false).unwrap();
        let second =
            normalized_json_string(br#"{"id":"a","ts":999}"#, &keys(&["ts"]), false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shallow_mode_keeps_nested_occurrences() {
        let fingerprint =
            normalized_json_string(br#"{"ts":1,"inner":{"ts":2}}"#, &keys(&["ts"]), false)
                .unwrap();
        assert_eq!(fingerprint, r#"{"inner":{"ts":2}}"#);
    }

    #[test]
    fn deep_mode_strips_through_objects_and_arrays() {
        let fingerprint = normalized_json_string(
            br#"{"ts":1,"items":[{"ts":2,"id":"a"}]}"#,
            &keys(&["ts"]),
            true,
        )
        .unwrap();
        assert_eq!(fingerprint, r#"{"items":[{"id":"a"}]}"#);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once =
            normalized_json_string(br#"{"z":[3,2],"a":{"y":1,"x":0}}"#, &keys(&[]), true).unwrap();
        let twice = normalized_json_string(once.as_bytes(), &keys(&[]), true).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unparsable_payload_is_an_error() {
        assert!(normalized_json_string(b"not json", &keys(&[]), false).is_err());
    }
}
