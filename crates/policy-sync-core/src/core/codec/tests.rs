// crates/policy-sync-core/src/core/codec/tests.rs
// ============================================================================
// Module: Rule Codec Unit Tests
// Description: Key layout and corrupt-entry detection.
// Purpose: Lock the on-store key format.
// Dependencies: policy-sync-core
// ============================================================================

//! ## Overview
//! Unit tests for the exact key layout and for rejection of foreign entries.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::use_debug,
    reason = "Test-only assertions favor direct unwrap/expect for clarity."
)]

use super::*;
use crate::core::rule::MAX_KEY_BYTES;

fn rule(section: &str, fields: &[&str]) -> PolicyRule {
    PolicyRule::new(section, fields.iter().copied()).unwrap()
}

#[test]
fn key_layout_is_stable() {
    let key = encode_key(&rule("p", &["alice", "data1", "read"]));
    assert_eq!(key.as_str(), "p.vYWxpY2U.vZGF0YTE.vcmVhZA");
}

#[test]
fn empty_field_encodes_to_bare_marker() {
    let key = encode_key(&rule("p", &["", "data1", "write"]));
    assert_eq!(key.as_str(), "p.v.vZGF0YTE.vd3JpdGU");
    assert_eq!(decode_key(key.as_str()).unwrap(), rule("p", &["", "data1", "write"]));
}

#[test]
fn delimiter_inside_field_does_not_split_key() {
    let dotted = rule("p", &["a.b", "c"]);
    let split = rule("p", &["a", "b", "c"]);
    assert_ne!(encode_key(&dotted), encode_key(&split));
    assert_eq!(decode_key(encode_key(&dotted).as_str()).unwrap(), dotted);
}

#[test]
fn value_is_canonical_json() {
    let value = encode_value(&rule("g", &["alice", "admin"])).unwrap();
    assert_eq!(value, br#"{"section":"g","fields":["alice","admin"]}"#);
}

#[test]
fn decode_rejects_foreign_keys() {
    for key in ["", "p", "p.alice", "p.v@@", ".vYQ", "p..vYQ", "1p.vYQ"] {
        assert!(
            matches!(decode_key(key), Err(CodecError::MalformedKey(_))),
            "key {key:?} should be rejected"
        );
    }
}

#[test]
fn decode_entry_rejects_mismatched_value() {
    let (key, _) = encode_entry(&rule("p", &["alice", "data1", "read"])).unwrap();
    let other = encode_value(&rule("p", &["alice", "data1", "write"])).unwrap();
    assert!(matches!(decode_entry(key.as_str(), &other), Err(CodecError::Mismatch(_))));
}

#[test]
fn decode_entry_rejects_garbage_value() {
    let key = encode_key(&rule("p", &["alice"]));
    assert!(matches!(
        decode_entry(key.as_str(), b"not json"),
        Err(CodecError::MalformedValue(_))
    ));
    assert!(matches!(
        decode_entry(key.as_str(), br#"{"section":"p","fields":["alice"],"extra":1}"#),
        Err(CodecError::MalformedValue(_))
    ));
}

#[test]
fn key_length_limit_is_enforced_at_the_boundary() {
    // "pq" + ".v" + 3068 base64 bytes of a 2301-byte field.
    let longest = "x".repeat(2301);
    let accepted = PolicyRule::new("pq", [longest]).unwrap();
    let key = encode_key(&accepted);
    assert_eq!(key.as_str().len(), MAX_KEY_BYTES);
    assert_eq!(encoded_key_len(accepted.section(), accepted.fields()), MAX_KEY_BYTES);

    let result = PolicyRule::new("pq", ["x".repeat(2302)]);
    assert!(matches!(
        result,
        Err(CodecError::KeyTooLong {
            actual_bytes: 3074,
            max_bytes: MAX_KEY_BYTES,
        })
    ));
}

#[test]
fn fields_within_size_limit_can_still_overflow_the_key() {
    let fields = vec!["x".repeat(MAX_FIELD_BYTES); 3];
    assert!(matches!(PolicyRule::new("p", fields), Err(CodecError::KeyTooLong { .. })));
}

#[test]
fn decode_rejects_keys_over_the_length_limit() {
    let token = URL_SAFE_NO_PAD.encode("x".repeat(2400));
    let key = format!("p.v{token}");
    assert!(key.len() > MAX_KEY_BYTES);
    assert!(matches!(decode_key(&key), Err(CodecError::MalformedKey(_))));
}
