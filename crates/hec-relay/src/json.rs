// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::de::IgnoredAny;

/// True iff `bytes` is exactly one JSON value, optionally surrounded by whitespace.
///
/// Deserialising into `IgnoredAny` walks the document without building it, so valid input
/// only allocates for escaped strings. Skipped strings are not UTF-8 checked by the slice
/// reader, hence the up-front `from_utf8`.
#[must_use]
pub fn is_valid_json(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(text) => serde_json::from_str::<IgnoredAny>(text).is_ok(),
        Err(_) => false,
    }
}

/// First `max` bytes of `bytes` as text, with `...` appended when something was cut.
///
/// Only used for log previews of rejected payloads: invalid UTF-8 is replaced and a cut never
/// lands inside a multi-byte character.
#[must_use]
pub fn truncate(bytes: &[u8], max: usize) -> String {
    if bytes.len() <= max {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut cut = max;
    // back off continuation bytes (10xxxxxx) so the preview ends on a char boundary
    while cut > 0 && cut < bytes.len() && (bytes[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }
    let mut preview = String::from_utf8_lossy(&bytes[..cut]).into_owned();
    preview.push_str("...");
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    #[test]
    fn test_valid_documents() {
        for doc in [
            "{}",
            "[]",
            r#"{"a":1}"#,
            r#"  {"nested":{"list":[1,2.5,-3e10,true,false,null]}}  "#,
            r#""just a string""#,
            "42",
            "-0.5",
            "true",
            "null",
            "{\"esc\":\"quote \\\" and \\u00e9\"}\r",
        ] {
            assert!(is_valid_json(doc.as_bytes()), "expected valid: {doc}");
        }
    }

    #[test]
    fn test_invalid_documents() {
        for doc in ["", " ", "{", "{]", "1 2", "null,", "not json", "{'a':1}", "[1,]"] {
            assert!(!is_valid_json(doc.as_bytes()), "expected invalid: {doc:?}");
        }
    }

    #[test]
    fn test_invalid_utf8_is_invalid_json() {
        assert!(!is_valid_json(b"\"\xff\xfe\""));
        assert!(!is_valid_json(b"{\"\xff\":1}"));
        assert!(!is_valid_json(b"[\"ok\",\"\xc3\"]"));
        assert!(is_valid_json("{\"caf\u{e9}\":\"\u{2603}\"}".as_bytes()));
    }

    #[test]
    fn test_truncate_short_input_untouched() {
        assert_eq!(truncate(b"hello", 10), "hello");
        assert_eq!(truncate(b"hello", 5), "hello");
        assert_eq!(truncate(b"", 0), "");
    }

    #[test]
    fn test_truncate_long_input() {
        assert_eq!(truncate(b"hello world", 5), "hello...");
        assert_eq!(truncate(b"abc", 0), "...");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // "é" is two bytes; cutting after the first byte must not split it
        let input = "aé-tail".as_bytes();
        assert_eq!(truncate(input, 2), "a...");
        assert_eq!(truncate(input, 3), "aé...");
    }

    #[test]
    fn test_truncate_replaces_invalid_utf8() {
        assert_eq!(truncate(b"\xffabc", 2), "\u{fffd}a...");
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            (-1.0e12f64..1.0e12).prop_map(|f| json!(f)),
            ".*".prop_map(Value::String),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn encoder_output_is_always_valid(value in arb_json()) {
            let encoded = serde_json::to_vec(&value).unwrap();
            prop_assert!(is_valid_json(&encoded));
            let pretty = serde_json::to_vec_pretty(&value).unwrap();
            prop_assert!(is_valid_json(&pretty));
        }

        #[test]
        fn truncate_never_exceeds_budget(input in ".*", max in 0usize..64) {
            let preview = truncate(input.as_bytes(), max);
            if input.len() <= max {
                prop_assert_eq!(preview, input);
            } else {
                prop_assert!(preview.ends_with("..."));
                prop_assert!(preview.len() <= max + 3);
            }
        }
    }
}
