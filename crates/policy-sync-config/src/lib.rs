// crates/policy-sync-config/src/lib.rs
// ============================================================================
// Module: Policy Sync Config Library
// Description: Adapter configuration model and validation.
// Purpose: Single source of truth for policy-sync.toml semantics.
// Dependencies: policy-sync-core, policy-sync-jetstream, serde, toml, url
// ============================================================================

//! ## Overview
//! `policy-sync-config` loads the adapter configuration from TOML with strict
//! size and path limits, validates it, and builds a ready adapter from it.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
