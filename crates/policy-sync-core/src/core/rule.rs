// crates/policy-sync-core/src/core/rule.rs
// ============================================================================
// Module: Policy Rules
// Description: Validated policy rule tuples and positional rule filters.
// Purpose: Give the codec and engine a fixed-shape rule with explicit arity.
// Dependencies: serde, crate::core::codec
// ============================================================================

//! ## Overview
//! A [`PolicyRule`] is one authorization fact: a section tag (`p`, `g`,
//! `g2`, ...) plus an ordered list of string fields. Rules are validated at
//! construction so every rule that exists can be encoded. A [`PolicyFilter`]
//! selects rules by positional field equality.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::codec::CodecError;
use crate::core::codec::encoded_key_len;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Maximum section tag length in bytes.
pub const MAX_SECTION_BYTES: usize = 32;
/// Maximum number of fields in a single rule.
pub const MAX_RULE_FIELDS: usize = 32;
/// Maximum length of a single field value in bytes.
pub const MAX_FIELD_BYTES: usize = 4096;
/// Maximum encoded store key length in bytes.
///
/// The store addresses entries by subject, and the server caps a protocol
/// line at 4 KiB including the bucket prefix and payload header.
pub const MAX_KEY_BYTES: usize = 3072;

// ============================================================================
// SECTION: Policy Rule
// ============================================================================

/// Policy rule tuple under a named section.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Section tag (policy type).
    section: String,
    /// Ordered field values.
    fields: Vec<String>,
}

impl PolicyRule {
    /// Builds a validated policy rule.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the section tag is invalid, the rule has
    /// no fields, the arity or a field exceeds the limits, or the encoded
    /// key would exceed [`MAX_KEY_BYTES`].
    pub fn new(
        section: impl Into<String>,
        fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, CodecError> {
        let section = section.into();
        validate_section(&section)?;
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        validate_fields(&fields)?;
        let key_bytes = encoded_key_len(&section, &fields);
        if key_bytes > MAX_KEY_BYTES {
            return Err(CodecError::KeyTooLong {
                actual_bytes: key_bytes,
                max_bytes: MAX_KEY_BYTES,
            });
        }
        Ok(Self {
            section,
            fields,
        })
    }

    /// Returns the section tag.
    #[must_use]
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Returns the ordered field values.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Returns the rule arity.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Consumes the rule into its section and fields.
    #[must_use]
    pub fn into_parts(self) -> (String, Vec<String>) {
        (self.section, self.fields)
    }
}

/// Validates a section tag.
///
/// # Errors
///
/// Returns [`CodecError::InvalidSection`] when the tag is empty, too long, or
/// contains characters outside `[A-Za-z0-9_]` (leading letter required).
pub fn validate_section(section: &str) -> Result<(), CodecError> {
    if section.is_empty() || section.len() > MAX_SECTION_BYTES {
        return Err(CodecError::InvalidSection(section.to_string()));
    }
    let mut chars = section.chars();
    let leading_ok = chars.next().is_some_and(|ch| ch.is_ascii_alphabetic());
    if !leading_ok || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        return Err(CodecError::InvalidSection(section.to_string()));
    }
    Ok(())
}

/// Validates rule arity and field sizes.
fn validate_fields(fields: &[String]) -> Result<(), CodecError> {
    if fields.is_empty() {
        return Err(CodecError::EmptyRule);
    }
    if fields.len() > MAX_RULE_FIELDS {
        return Err(CodecError::TooManyFields {
            actual: fields.len(),
            max: MAX_RULE_FIELDS,
        });
    }
    if let Some((index, field)) =
        fields.iter().enumerate().find(|(_, field)| field.len() > MAX_FIELD_BYTES)
    {
        return Err(CodecError::FieldTooLarge {
            index,
            actual_bytes: field.len(),
            max_bytes: MAX_FIELD_BYTES,
        });
    }
    Ok(())
}

// ============================================================================
// SECTION: Policy Filter
// ============================================================================

/// Positional rule filter.
///
/// A rule matches when its section equals the filter section and, for each
/// filter value `i`, either the value is empty (wildcard) or it equals the
/// rule field at `field_index + i`. Rules too short to cover a non-wildcard
/// position never match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFilter {
    /// Section tag to match.
    pub section: String,
    /// Index of the first field the values apply to.
    pub field_index: usize,
    /// Field values; empty strings are wildcards.
    pub values: Vec<String>,
}

impl PolicyFilter {
    /// Builds a filter for the given section and positional values.
    #[must_use]
    pub fn new(
        section: impl Into<String>,
        field_index: usize,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            section: section.into(),
            field_index,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true when the rule satisfies the filter.
    #[must_use]
    pub fn matches(&self, rule: &PolicyRule) -> bool {
        if rule.section() != self.section {
            return false;
        }
        self.values.iter().enumerate().all(|(offset, expected)| {
            if expected.is_empty() {
                return true;
            }
            self.field_index
                .checked_add(offset)
                .and_then(|position| rule.fields().get(position))
                .is_some_and(|actual| actual == expected)
        })
    }
}
