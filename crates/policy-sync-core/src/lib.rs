// crates/policy-sync-core/src/lib.rs
// ============================================================================
// Module: Policy Sync Core
// Description: Backend-agnostic policy synchronization engine.
// Purpose: Persist authorization policy rules into a key-value bucket.
// Dependencies: base64, serde, serde_json, thiserror, tokio-util
// ============================================================================

//! ## Overview
//! Policy Sync Core maps authorization policy rules onto entries of a
//! key-value bucket and keeps an in-memory policy model synchronized with
//! that bucket. The rule codec is a pure bijection between rules and store
//! keys; the [`PolicySyncAdapter`] drives load, save, and incremental
//! mutation through any [`PolicyBucket`] implementation.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod audit;
pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use audit::FileAuditSink;
pub use audit::NoopAuditSink;
pub use audit::StderrAuditSink;
pub use audit::SyncAuditSink;
pub use crate::core::CodecError;
pub use crate::core::PolicyFilter;
pub use crate::core::PolicyRule;
pub use crate::core::StoreEntry;
pub use crate::core::StoreKey;
pub use interfaces::PolicyBucket;
pub use interfaces::PolicyModel;
pub use interfaces::StoreError;
pub use runtime::BatchControl;
pub use runtime::BatchError;
pub use runtime::BoundedExecutor;
pub use runtime::LoadReport;
pub use runtime::MemoryBucket;
pub use runtime::MemoryPolicyModel;
pub use runtime::PolicySyncAdapter;
pub use runtime::SaveMode;
pub use runtime::SaveReport;
pub use runtime::SyncError;
pub use runtime::SyncOptions;
