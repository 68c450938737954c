// crates/policy-sync-core/src/interfaces/mod.rs
// ============================================================================
// Module: Policy Sync Interfaces
// Description: Store and caller boundaries for the synchronization engine.
// Purpose: Keep the engine backend-agnostic and model-agnostic.
// Dependencies: crate::core, thiserror
// ============================================================================

//! ## Overview
//! [`PolicyBucket`] is the key-value store boundary: one named bucket with
//! get-all, put, conditional update, delete, and delete-all. Each call is
//! acknowledged independently and must be safe to issue from several worker
//! threads at once. [`PolicyModel`] is the caller boundary: the in-memory
//! rule set the authorization engine evaluates against.

// ============================================================================
// SECTION: Imports
// ============================================================================

use thiserror::Error;

use crate::core::PolicyRule;
use crate::core::StoreEntry;
use crate::core::StoreKey;

// ============================================================================
// SECTION: Store Boundary
// ============================================================================

/// Policy bucket errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store could not be reached or the session failed.
    #[error("policy store connection error: {0}")]
    Connection(String),
    /// Store rejected or failed the operation.
    #[error("policy store backend error: {0}")]
    Backend(String),
    /// Conditional update lost against a concurrent writer.
    #[error("policy store revision conflict: {0}")]
    Conflict(String),
    /// Invalid key or value for the store.
    #[error("policy store invalid input: {0}")]
    Invalid(String),
    /// Store handle has been closed.
    #[error("policy store closed")]
    Closed,
}

/// Key-value bucket holding encoded policy rules.
pub trait PolicyBucket: Send + Sync {
    /// Reads every live entry in the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the bucket cannot be read.
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError>;

    /// Creates or overwrites an entry and returns its new revision.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the write fails.
    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError>;

    /// Replaces an entry only if its current revision matches.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the revision is stale, or another
    /// [`StoreError`] when the write fails.
    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError>;

    /// Deletes an entry by raw key. Deleting an absent key succeeds.
    ///
    /// Takes the raw key so entries this codec cannot decode can still be
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the delete fails.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes every entry in the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when any delete fails.
    fn delete_all(&self) -> Result<(), StoreError>;

    /// Releases the underlying connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when shutdown fails.
    fn close(&self) -> Result<(), StoreError>;
}

// ============================================================================
// SECTION: Caller Boundary
// ============================================================================

/// In-memory policy model owned by the authorization engine.
pub trait PolicyModel {
    /// Returns every rule currently held by the model.
    fn policy_rules(&self) -> Vec<PolicyRule>;

    /// Adds a rule to the model; returns false when it was already present.
    fn add_policy_rule(&mut self, rule: PolicyRule) -> bool;
}
