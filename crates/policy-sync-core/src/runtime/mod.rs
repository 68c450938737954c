// crates/policy-sync-core/src/runtime/mod.rs
// ============================================================================
// Module: Policy Sync Runtime
// Description: Synchronization engine, bounded executor, and memory backends.
// Purpose: Group the stateful runtime over the pure core types.
// Dependencies: crate::{audit, core, interfaces}
// ============================================================================

//! ## Overview
//! Runtime pieces that drive a [`crate::interfaces::PolicyBucket`]: the
//! [`PolicySyncAdapter`], the [`BoundedExecutor`] it uses for bulk work, and
//! deterministic in-memory backends.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod adapter;
pub mod executor;
pub mod memory;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use adapter::DEFAULT_BATCH_TIMEOUT_MS;
pub use adapter::DEFAULT_MAX_CONCURRENCY;
pub use adapter::LoadReport;
pub use adapter::PolicySyncAdapter;
pub use adapter::SaveMode;
pub use adapter::SaveReport;
pub use adapter::SyncError;
pub use adapter::SyncOptions;
pub use executor::BatchControl;
pub use executor::BatchError;
pub use executor::BatchReport;
pub use executor::BoundedExecutor;
pub use executor::OperationFailure;
pub use executor::OperationRecord;
pub use executor::StoreOp;
pub use executor::StoreOpKind;
pub use memory::MemoryBucket;
pub use memory::MemoryPolicyModel;
