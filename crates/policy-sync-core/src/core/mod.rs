// crates/policy-sync-core/src/core/mod.rs
// ============================================================================
// Module: Policy Sync Core Types
// Description: Rule tuples, filters, and the rule codec.
// Purpose: Group the pure, stateless data layer.
// Dependencies: crate::core::{rule, codec}
// ============================================================================

//! ## Overview
//! Pure data types shared by the engine and every bucket backend.

pub mod codec;
pub mod rule;

pub use codec::CodecError;
pub use codec::StoreEntry;
pub use codec::StoreKey;
pub use codec::decode_entry;
pub use codec::decode_key;
pub use codec::encode_entry;
pub use codec::encode_key;
pub use codec::encode_value;
pub use rule::PolicyFilter;
pub use rule::PolicyRule;
