// crates/policy-sync-core/src/core/codec.rs
// ============================================================================
// Module: Rule Codec
// Description: Deterministic mapping between policy rules and store entries.
// Purpose: Keep rule tuples and bucket keys in exact one-to-one correspondence.
// Dependencies: base64, serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! Keys have the shape `<section>.<token>.<token>...` with one token per
//! field. A token is `v` followed by the unpadded URL-safe base64 of the
//! field bytes; the base64 alphabet never contains `.`, and the `v` marker
//! keeps empty fields from producing empty tokens. Every key is therefore a
//! legal key-value subject and decodes back to exactly one rule.
//!
//! The stored value is the canonical JSON payload of the rule. Decoding an
//! entry checks that key and value describe the same rule; anything else is
//! a corrupt entry.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::core::rule::MAX_FIELD_BYTES;
use crate::core::rule::MAX_RULE_FIELDS;
use crate::core::rule::PolicyRule;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Delimiter between key segments.
pub const KEY_DELIMITER: char = '.';
/// Marker prefixed to every encoded field token.
const FIELD_TOKEN_MARKER: char = 'v';
/// Maximum accepted stored value size in bytes.
pub const MAX_VALUE_BYTES: usize = 256 * 1024;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Rule encoding and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Rule has no fields.
    #[error("policy rule must contain at least one field")]
    EmptyRule,
    /// Section tag is not a valid identifier.
    #[error("invalid policy section: '{0}'")]
    InvalidSection(String),
    /// Rule exceeds the field count limit.
    #[error("policy rule has {actual} fields (max {max})")]
    TooManyFields {
        /// Actual field count.
        actual: usize,
        /// Maximum allowed field count.
        max: usize,
    },
    /// Field value exceeds the size limit.
    #[error("policy field {index} is {actual_bytes} bytes (max {max_bytes})")]
    FieldTooLarge {
        /// Field position.
        index: usize,
        /// Actual field size in bytes.
        actual_bytes: usize,
        /// Maximum allowed field size in bytes.
        max_bytes: usize,
    },
    /// Encoded store key exceeds the size limit.
    #[error("policy key would be {actual_bytes} bytes (max {max_bytes})")]
    KeyTooLong {
        /// Encoded key size in bytes.
        actual_bytes: usize,
        /// Maximum allowed key size in bytes.
        max_bytes: usize,
    },
    /// Store key was not produced by this codec.
    #[error("malformed policy key: {0}")]
    MalformedKey(String),
    /// Store value is not a valid rule payload.
    #[error("malformed policy value: {0}")]
    MalformedValue(String),
    /// Key and value describe different rules.
    #[error("policy key/value mismatch: {0}")]
    Mismatch(String),
}

// ============================================================================
// SECTION: Store Types
// ============================================================================

/// Store key derived from a policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey(String);

impl StoreKey {
    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key into its string form.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StoreKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Entry read from a policy bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    /// Raw store key.
    pub key: String,
    /// Raw stored value.
    pub value: Vec<u8>,
    /// Store revision when the backend tracks one.
    pub revision: Option<u64>,
}

/// Canonical stored value payload.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct StoredRule {
    /// Section tag.
    section: String,
    /// Ordered field values.
    fields: Vec<String>,
}

// ============================================================================
// SECTION: Encoding
// ============================================================================

/// Encodes the store key for a rule.
#[must_use]
pub fn encode_key(rule: &PolicyRule) -> StoreKey {
    let mut key = String::from(rule.section());
    for field in rule.fields() {
        key.push(KEY_DELIMITER);
        key.push(FIELD_TOKEN_MARKER);
        URL_SAFE_NO_PAD.encode_string(field.as_bytes(), &mut key);
    }
    StoreKey(key)
}

/// Returns the length [`encode_key`] produces for a section and fields.
pub(crate) fn encoded_key_len(section: &str, fields: &[String]) -> usize {
    fields.iter().fold(section.len(), |total, field| {
        let token = base64::encoded_len(field.len(), false).unwrap_or(usize::MAX);
        total.saturating_add(2).saturating_add(token)
    })
}

/// Encodes the canonical value payload for a rule.
///
/// # Errors
///
/// Returns [`CodecError::MalformedValue`] if serialization fails.
pub fn encode_value(rule: &PolicyRule) -> Result<Vec<u8>, CodecError> {
    let payload = StoredRule {
        section: rule.section().to_string(),
        fields: rule.fields().to_vec(),
    };
    serde_json::to_vec(&payload).map_err(|err| CodecError::MalformedValue(err.to_string()))
}

/// Encodes a rule into its store key and value.
///
/// # Errors
///
/// Returns [`CodecError`] if the value payload cannot be serialized.
pub fn encode_entry(rule: &PolicyRule) -> Result<(StoreKey, Vec<u8>), CodecError> {
    Ok((encode_key(rule), encode_value(rule)?))
}

// ============================================================================
// SECTION: Decoding
// ============================================================================

/// Decodes a rule from its store key alone.
///
/// # Errors
///
/// Returns [`CodecError::MalformedKey`] for keys this codec never produces.
pub fn decode_key(key: &str) -> Result<PolicyRule, CodecError> {
    let mut segments = key.split(KEY_DELIMITER);
    let section = segments.next().unwrap_or_default();
    let mut fields = Vec::new();
    for token in segments {
        if fields.len() == MAX_RULE_FIELDS {
            return Err(CodecError::MalformedKey(format!("too many fields in {key}")));
        }
        let Some(encoded) = token.strip_prefix(FIELD_TOKEN_MARKER) else {
            return Err(CodecError::MalformedKey(format!("unmarked field token in {key}")));
        };
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|err| CodecError::MalformedKey(format!("{key}: {err}")))?;
        if bytes.len() > MAX_FIELD_BYTES {
            return Err(CodecError::MalformedKey(format!("oversized field in {key}")));
        }
        let field = String::from_utf8(bytes)
            .map_err(|_| CodecError::MalformedKey(format!("non utf-8 field in {key}")))?;
        fields.push(field);
    }
    PolicyRule::new(section, fields).map_err(|err| CodecError::MalformedKey(format!("{key}: {err}")))
}

/// Decodes a stored entry, requiring key and value to agree.
///
/// # Errors
///
/// Returns [`CodecError`] when the key or value is malformed or when they
/// describe different rules.
pub fn decode_entry(key: &str, value: &[u8]) -> Result<PolicyRule, CodecError> {
    let rule = decode_key(key)?;
    if value.len() > MAX_VALUE_BYTES {
        return Err(CodecError::MalformedValue(format!(
            "value for {key} is {} bytes (max {MAX_VALUE_BYTES})",
            value.len()
        )));
    }
    let stored: StoredRule = serde_json::from_slice(value)
        .map_err(|err| CodecError::MalformedValue(format!("{key}: {err}")))?;
    if stored.section != rule.section() || stored.fields.as_slice() != rule.fields() {
        return Err(CodecError::Mismatch(key.to_string()));
    }
    Ok(rule)
}

#[cfg(test)]
mod tests;
