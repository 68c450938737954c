// crates/policy-sync-core/src/runtime/adapter.rs
// ============================================================================
// Module: Synchronization Engine
// Description: Policy persistence operations over a policy bucket.
// Purpose: Keep the policy model and the bucket in exact correspondence.
// Dependencies: crate::{audit, core, interfaces, runtime::executor}, serde, thiserror
// ============================================================================

//! ## Overview
//! [`PolicySyncAdapter`] is the persistence surface the authorization engine
//! calls: load, save, add, remove, filtered remove, close. Bulk paths encode
//! rules with the codec and push mutations through the [`BoundedExecutor`].
//!
//! Invariants:
//! - After a successful save, the bucket key set is exactly the encoded
//!   image of the saved model.
//! - After a successful load, every decodable entry in the bucket has been
//!   added to the model; undecodable entries are skipped and audited.
//! - Recreate-mode saves wipe the bucket first, so an interrupted save can
//!   leave it empty or partially populated. Incremental saves never pass
//!   through an empty bucket.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::audit::BatchAuditEvent;
use crate::audit::DecodeSkipAuditEvent;
use crate::audit::SyncAuditSink;
use crate::core::CodecError;
use crate::core::PolicyFilter;
use crate::core::PolicyRule;
use crate::core::StoreKey;
use crate::core::decode_entry;
use crate::core::decode_key;
use crate::core::encode_entry;
use crate::core::encode_key;
use crate::interfaces::PolicyBucket;
use crate::interfaces::PolicyModel;
use crate::interfaces::StoreError;
use crate::runtime::executor::BatchControl;
use crate::runtime::executor::BatchError;
use crate::runtime::executor::BatchReport;
use crate::runtime::executor::BoundedExecutor;
use crate::runtime::executor::StoreOp;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default maximum in-flight store operations.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
/// Default bulk operation timeout in milliseconds.
pub const DEFAULT_BATCH_TIMEOUT_MS: u64 = 30_000;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Synchronization engine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncOptions {
    /// Maximum concurrent store operations in a bulk batch.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Wipe and rewrite the bucket on save instead of diffing.
    #[serde(default)]
    pub recreate_on_save: bool,
    /// Bulk operation deadline in milliseconds (0 disables the deadline).
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            recreate_on_save: false,
            batch_timeout_ms: DEFAULT_BATCH_TIMEOUT_MS,
        }
    }
}

impl SyncOptions {
    /// Returns the batch control implied by the configured timeout.
    #[must_use]
    pub fn batch_control(&self) -> BatchControl {
        if self.batch_timeout_ms == 0 {
            BatchControl::unbounded()
        } else {
            BatchControl::with_timeout(Duration::from_millis(self.batch_timeout_ms))
        }
    }
}

/// Returns the default concurrency ceiling.
const fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// Returns the default batch timeout.
const fn default_batch_timeout_ms() -> u64 {
    DEFAULT_BATCH_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Synchronization engine errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Caller supplied a rule the codec rejects.
    #[error("invalid policy rule: {0}")]
    Codec(#[from] CodecError),
    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Bulk batch was only partially applied.
    #[error(transparent)]
    Batch(#[from] BatchError),
    /// Save refused because the last load was filtered.
    #[error("cannot save a filtered policy; load the full policy first")]
    FilteredSave,
    /// Adapter has been closed.
    #[error("policy adapter closed")]
    Closed,
}

// ============================================================================
// SECTION: Reports
// ============================================================================

/// Result of a bulk load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Rules decoded and offered to the model.
    pub loaded: usize,
    /// Corrupt entries skipped.
    pub skipped: usize,
}

/// Save strategy used for a bulk save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    /// Wipe then rewrite.
    Recreate,
    /// Diff against current contents.
    Incremental,
}

/// Result of a bulk save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    /// Strategy used.
    pub mode: SaveMode,
    /// Puts issued (creates and overwrites).
    pub puts: usize,
    /// Conditional updates issued.
    pub updates: usize,
    /// Deletes issued.
    pub deletes: usize,
}

impl SaveReport {
    /// Total store mutations issued.
    #[must_use]
    pub const fn operations(&self) -> usize {
        self.puts + self.updates + self.deletes
    }
}

// ============================================================================
// SECTION: Adapter
// ============================================================================

/// Policy persistence adapter over a policy bucket.
pub struct PolicySyncAdapter {
    /// Bucket holding encoded rules.
    bucket: Arc<dyn PolicyBucket>,
    /// Engine options.
    options: SyncOptions,
    /// Bulk operation executor.
    executor: BoundedExecutor,
    /// Audit sink for non-fatal diagnostics.
    audit: Arc<dyn SyncAuditSink>,
    /// Set when the last load was filtered.
    filtered: AtomicBool,
    /// Set once the adapter is closed.
    closed: AtomicBool,
}

impl PolicySyncAdapter {
    /// Creates an adapter over the bucket.
    #[must_use]
    pub fn new(
        bucket: Arc<dyn PolicyBucket>,
        options: SyncOptions,
        audit: Arc<dyn SyncAuditSink>,
    ) -> Self {
        Self {
            bucket,
            executor: BoundedExecutor::new(options.max_concurrency),
            options,
            audit,
            filtered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the engine options.
    #[must_use]
    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Returns true when the last load was filtered.
    #[must_use]
    pub fn is_filtered(&self) -> bool {
        self.filtered.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------------

    /// Loads every rule in the bucket into the model.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket cannot be read. Corrupt entries
    /// are skipped, not returned as errors.
    pub fn load_policy(&self, model: &mut dyn PolicyModel) -> Result<LoadReport, SyncError> {
        let report = self.load_matching(model, None)?;
        self.filtered.store(false, Ordering::Release);
        Ok(report)
    }

    /// Loads only the rules matching the filter and marks the adapter filtered.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket cannot be read.
    pub fn load_filtered_policy(
        &self,
        model: &mut dyn PolicyModel,
        filter: &PolicyFilter,
    ) -> Result<LoadReport, SyncError> {
        let report = self.load_matching(model, Some(filter))?;
        self.filtered.store(true, Ordering::Release);
        Ok(report)
    }

    /// Reads, decodes, then commits rules to the model.
    fn load_matching(
        &self,
        model: &mut dyn PolicyModel,
        filter: Option<&PolicyFilter>,
    ) -> Result<LoadReport, SyncError> {
        let (rules, skipped) = self.read_rules()?;
        let mut report = LoadReport {
            loaded: 0,
            skipped,
        };
        for (_, rule) in rules {
            if filter.is_some_and(|filter| !filter.matches(&rule)) {
                continue;
            }
            model.add_policy_rule(rule);
            report.loaded += 1;
        }
        Ok(report)
    }

    /// Reads the bucket and decodes every entry, auditing corrupt ones.
    fn read_rules(&self) -> Result<(Vec<(String, PolicyRule)>, usize), SyncError> {
        self.ensure_open()?;
        let entries = self.bucket.entries()?;
        let mut rules = Vec::with_capacity(entries.len());
        let mut skipped = 0;
        for entry in entries {
            match decode_entry(&entry.key, &entry.value) {
                Ok(rule) => rules.push((entry.key, rule)),
                Err(err) => {
                    skipped += 1;
                    self.audit.record_decode_skip(&DecodeSkipAuditEvent::new(
                        entry.key,
                        err.to_string(),
                    ));
                }
            }
        }
        Ok((rules, skipped))
    }

    // ------------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------------

    /// Saves the model, bounded by the configured batch timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when encoding, the bucket read, or any batch
    /// operation fails. The bucket keeps whatever the batch applied.
    pub fn save_policy(&self, model: &dyn PolicyModel) -> Result<SaveReport, SyncError> {
        self.save_policy_with(model, &self.options.batch_control())
    }

    /// Saves the model under an explicit batch control.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when encoding, the bucket read, or any batch
    /// operation fails.
    pub fn save_policy_with(
        &self,
        model: &dyn PolicyModel,
        control: &BatchControl,
    ) -> Result<SaveReport, SyncError> {
        self.ensure_open()?;
        if self.is_filtered() {
            return Err(SyncError::FilteredSave);
        }
        let mut target = BTreeMap::new();
        for rule in model.policy_rules() {
            let (key, value) = encode_entry(&rule)?;
            target.insert(key, value);
        }
        if self.options.recreate_on_save {
            self.save_recreate(target, control)
        } else {
            self.save_incremental(target, control)
        }
    }

    /// Wipes the bucket and writes every target entry.
    fn save_recreate(
        &self,
        target: BTreeMap<StoreKey, Vec<u8>>,
        control: &BatchControl,
    ) -> Result<SaveReport, SyncError> {
        self.bucket.delete_all()?;
        let ops: Vec<StoreOp> = target
            .into_iter()
            .map(|(key, value)| StoreOp::Put {
                key,
                value,
            })
            .collect();
        let report = SaveReport {
            mode: SaveMode::Recreate,
            puts: ops.len(),
            updates: 0,
            deletes: 0,
        };
        self.run_batch("save_recreate", ops, control)?;
        Ok(report)
    }

    /// Diffs the bucket against the target and applies only the difference.
    fn save_incremental(
        &self,
        mut target: BTreeMap<StoreKey, Vec<u8>>,
        control: &BatchControl,
    ) -> Result<SaveReport, SyncError> {
        let mut ops = Vec::new();
        let mut report = SaveReport {
            mode: SaveMode::Incremental,
            puts: 0,
            updates: 0,
            deletes: 0,
        };
        for entry in self.bucket.entries()? {
            let wanted = decode_key(&entry.key)
                .ok()
                .map(|rule| encode_key(&rule))
                .filter(|key| key.as_str() == entry.key)
                .and_then(|key| target.remove_entry(&key));
            match wanted {
                None => {
                    report.deletes += 1;
                    ops.push(StoreOp::Delete {
                        key: entry.key,
                    });
                }
                Some((_, value)) if value == entry.value => {}
                Some((key, value)) => {
                    if let Some(revision) = entry.revision {
                        report.updates += 1;
                        ops.push(StoreOp::Update {
                            key,
                            value,
                            revision,
                        });
                    } else {
                        report.puts += 1;
                        ops.push(StoreOp::Put {
                            key,
                            value,
                        });
                    }
                }
            }
        }
        for (key, value) in target {
            report.puts += 1;
            ops.push(StoreOp::Put {
                key,
                value,
            });
        }
        self.run_batch("save_incremental", ops, control)?;
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Single-rule mutation
    // ------------------------------------------------------------------------

    /// Adds one rule to the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the rule is invalid or the write fails.
    pub fn add_policy(&self, section: &str, fields: &[String]) -> Result<(), SyncError> {
        self.ensure_open()?;
        let rule = PolicyRule::new(section, fields.iter().cloned())?;
        let (key, value) = encode_entry(&rule)?;
        self.bucket.put(&key, &value)?;
        Ok(())
    }

    /// Removes one rule from the bucket; removing an absent rule succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the rule is invalid or the delete fails.
    pub fn remove_policy(&self, section: &str, fields: &[String]) -> Result<(), SyncError> {
        self.ensure_open()?;
        let rule = PolicyRule::new(section, fields.iter().cloned())?;
        self.bucket.delete(encode_key(&rule).as_str())?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Batch mutation
    // ------------------------------------------------------------------------

    /// Adds several rules of one section through the executor.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when any rule is invalid (nothing is written) or
    /// when the batch is only partially applied.
    pub fn add_policies(&self, section: &str, rules: &[Vec<String>]) -> Result<usize, SyncError> {
        self.ensure_open()?;
        let mut ops = Vec::with_capacity(rules.len());
        for fields in rules {
            let rule = PolicyRule::new(section, fields.iter().cloned())?;
            let (key, value) = encode_entry(&rule)?;
            ops.push(StoreOp::Put {
                key,
                value,
            });
        }
        self.run_batch("add_policies", ops, &self.options.batch_control())
    }

    /// Removes several rules of one section through the executor.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when any rule is invalid (nothing is deleted) or
    /// when the batch is only partially applied.
    pub fn remove_policies(
        &self,
        section: &str,
        rules: &[Vec<String>],
    ) -> Result<usize, SyncError> {
        self.ensure_open()?;
        let mut ops = Vec::with_capacity(rules.len());
        for fields in rules {
            let rule = PolicyRule::new(section, fields.iter().cloned())?;
            ops.push(StoreOp::Delete {
                key: encode_key(&rule).into_string(),
            });
        }
        self.run_batch("remove_policies", ops, &self.options.batch_control())
    }

    /// Removes every rule matching the positional filter.
    ///
    /// Empty filter values are wildcards. Returns the number of removed rules.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket read fails or the delete batch is
    /// only partially applied.
    pub fn remove_filtered_policy(
        &self,
        section: &str,
        field_index: usize,
        values: &[String],
    ) -> Result<usize, SyncError> {
        self.remove_filtered_policy_with(
            &PolicyFilter::new(section, field_index, values.iter().cloned()),
            &self.options.batch_control(),
        )
    }

    /// Removes every rule matching the filter under an explicit batch control.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket read fails or the delete batch is
    /// only partially applied.
    pub fn remove_filtered_policy_with(
        &self,
        filter: &PolicyFilter,
        control: &BatchControl,
    ) -> Result<usize, SyncError> {
        let (rules, _) = self.read_rules()?;
        let ops: Vec<StoreOp> = rules
            .into_iter()
            .filter(|(_, rule)| filter.matches(rule))
            .map(|(key, _)| StoreOp::Delete {
                key,
            })
            .collect();
        self.run_batch("remove_filtered_policy", ops, control)
    }

    /// Removes every entry from the bucket.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket cannot be cleared.
    pub fn clear_policy(&self) -> Result<(), SyncError> {
        self.ensure_open()?;
        self.bucket.delete_all()?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Closes the bucket. Calls after a successful close are no-ops.
    ///
    /// The adapter stays open when the bucket fails to shut down, so the
    /// close can be retried.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the bucket fails to shut down.
    pub fn close(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.bucket.close()?;
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Fails once the adapter is closed.
    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    /// Runs a batch, audits its summary, and converts it into a result.
    fn run_batch(
        &self,
        operation: &'static str,
        ops: Vec<StoreOp>,
        control: &BatchControl,
    ) -> Result<usize, SyncError> {
        if ops.is_empty() {
            return Ok(0);
        }
        let report: BatchReport = self.executor.execute(self.bucket.as_ref(), ops, control);
        self.audit.record_batch(&BatchAuditEvent::new(
            operation,
            report.submitted(),
            report.succeeded.len(),
            report.failed.len(),
            report.not_dispatched.len(),
        ));
        Ok(report.into_result()?)
    }
}
