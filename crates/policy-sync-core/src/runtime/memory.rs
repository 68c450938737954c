// crates/policy-sync-core/src/runtime/memory.rs
// ============================================================================
// Module: Policy Sync In-Memory Backends
// Description: In-memory policy bucket and policy model.
// Purpose: Provide deterministic implementations without external deps.
// Dependencies: crate::core, crate::interfaces
// ============================================================================

//! ## Overview
//! [`MemoryBucket`] is a revisioned, thread-safe [`PolicyBucket`] used by
//! tests and embedded deployments. [`MemoryPolicyModel`] is a minimal
//! insertion-ordered [`PolicyModel`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crate::core::PolicyRule;
use crate::core::StoreEntry;
use crate::core::StoreKey;
use crate::interfaces::PolicyBucket;
use crate::interfaces::PolicyModel;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Memory Bucket
// ============================================================================

/// Bucket contents guarded by the store mutex.
#[derive(Debug, Default)]
struct BucketState {
    /// Entries keyed by raw key: (value, revision).
    entries: BTreeMap<String, (Vec<u8>, u64)>,
    /// Last assigned revision.
    last_revision: u64,
}

impl BucketState {
    /// Writes an entry under the next revision.
    fn write(&mut self, key: &str, value: &[u8]) -> u64 {
        self.last_revision += 1;
        self.entries.insert(key.to_string(), (value.to_vec(), self.last_revision));
        self.last_revision
    }
}

/// In-memory policy bucket for tests and examples.
#[derive(Debug, Default, Clone)]
pub struct MemoryBucket {
    /// Bucket state protected by a mutex.
    state: Arc<Mutex<BucketState>>,
    /// Set once the bucket is closed.
    closed: Arc<AtomicBool>,
}

impl MemoryBucket {
    /// Creates an empty in-memory bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a raw entry without codec checks.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the bucket is closed.
    pub fn insert_raw(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        Ok(self.lock()?.write(key, value))
    }

    /// Returns every raw key in sorted order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the bucket is closed.
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.entries.keys().cloned().collect())
    }

    /// Locks the bucket state, failing once closed.
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BucketState>, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("memory bucket mutex poisoned".to_string()))
    }
}

impl PolicyBucket for MemoryBucket {
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        let guard = self.lock()?;
        Ok(guard
            .entries
            .iter()
            .map(|(key, (value, revision))| StoreEntry {
                key: key.clone(),
                value: value.clone(),
                revision: Some(*revision),
            })
            .collect())
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
        Ok(self.lock()?.write(key.as_str(), value))
    }

    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError> {
        let mut guard = self.lock()?;
        match guard.entries.get(key.as_str()) {
            Some((_, current)) if *current == revision => {}
            Some((_, current)) => {
                return Err(StoreError::Conflict(format!(
                    "{key}: expected revision {revision}, found {current}"
                )));
            }
            None => {
                return Err(StoreError::Conflict(format!(
                    "{key}: expected revision {revision}, entry missing"
                )));
            }
        }
        Ok(guard.write(key.as_str(), value))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()?.entries.remove(key);
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.lock()?.entries.clear();
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// SECTION: Memory Model
// ============================================================================

/// Insertion-ordered, duplicate-free policy model.
#[derive(Debug, Default, Clone)]
pub struct MemoryPolicyModel {
    /// Rules in insertion order.
    rules: Vec<PolicyRule>,
    /// Membership index.
    index: HashSet<PolicyRule>,
}

impl MemoryPolicyModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a model from rules, dropping duplicates.
    #[must_use]
    pub fn from_rules(rules: impl IntoIterator<Item = PolicyRule>) -> Self {
        let mut model = Self::new();
        for rule in rules {
            model.add_policy_rule(rule);
        }
        model
    }

    /// Returns the rules in insertion order.
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Returns the rules of one section in insertion order.
    #[must_use]
    pub fn rules_in(&self, section: &str) -> Vec<&PolicyRule> {
        self.rules.iter().filter(|rule| rule.section() == section).collect()
    }

    /// Returns true when the model holds the rule.
    #[must_use]
    pub fn contains(&self, rule: &PolicyRule) -> bool {
        self.index.contains(rule)
    }

    /// Removes a rule; returns false when it was absent.
    pub fn remove_rule(&mut self, rule: &PolicyRule) -> bool {
        if !self.index.remove(rule) {
            return false;
        }
        self.rules.retain(|existing| existing != rule);
        true
    }

    /// Removes every rule.
    pub fn clear(&mut self) {
        self.rules.clear();
        self.index.clear();
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true when the model holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl PolicyModel for MemoryPolicyModel {
    fn policy_rules(&self) -> Vec<PolicyRule> {
        self.rules.clone()
    }

    fn add_policy_rule(&mut self, rule: PolicyRule) -> bool {
        if !self.index.insert(rule.clone()) {
            return false;
        }
        self.rules.push(rule);
        true
    }
}
