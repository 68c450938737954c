// crates/policy-sync-jetstream/src/lib.rs
// ============================================================================
// Module: Policy Sync JetStream
// Description: NATS JetStream backend for policy synchronization.
// Purpose: Bind the synchronization engine to a JetStream key-value bucket.
// Dependencies: policy-sync-core, async-nats, rustls, tokio
// ============================================================================

//! ## Overview
//! Provides [`JetStreamBucket`], a [`policy_sync_core::PolicyBucket`] over a
//! JetStream key-value bucket, and [`CredentialRotator`], which keeps the
//! connection's mutual-TLS material fresh without reconnecting.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod bucket;
pub mod credentials;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use bucket::JetStreamBucket;
pub use bucket::JetStreamError;
pub use bucket::JetStreamStoreConfig;
pub use bucket::open_adapter;
pub use bucket::validate_bucket_name;
pub use credentials::CredentialError;
pub use credentials::CredentialRotator;
pub use credentials::CredentialSnapshot;
pub use credentials::RotationState;
pub use credentials::TlsCredentialConfig;
