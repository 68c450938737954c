// crates/policy-sync-core/tests/adapter_sync.rs
// ============================================================================
// Module: Synchronization Engine Tests
// Description: Load, save, and mutation behavior over the memory bucket.
// Purpose: Validate model and bucket stay in exact correspondence.
// ============================================================================

//! Synchronization engine tests against in-memory and instrumented buckets.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use policy_sync_core::CodecError;
use policy_sync_core::MemoryBucket;
use policy_sync_core::MemoryPolicyModel;
use policy_sync_core::NoopAuditSink;
use policy_sync_core::PolicyBucket;
use policy_sync_core::PolicyFilter;
use policy_sync_core::PolicyModel;
use policy_sync_core::PolicyRule;
use policy_sync_core::PolicySyncAdapter;
use policy_sync_core::SaveMode;
use policy_sync_core::StoreEntry;
use policy_sync_core::StoreError;
use policy_sync_core::StoreKey;
use policy_sync_core::SyncAuditSink;
use policy_sync_core::SyncError;
use policy_sync_core::SyncOptions;
use policy_sync_core::audit::BatchAuditEvent;
use policy_sync_core::audit::DecodeSkipAuditEvent;
use policy_sync_core::core::encode_entry;
use policy_sync_core::core::encode_key;
use policy_sync_core::runtime::StoreOpKind;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Audit sink that keeps every event for assertions.
#[derive(Default)]
struct RecordingSink {
    skips: Mutex<Vec<DecodeSkipAuditEvent>>,
    batches: Mutex<Vec<BatchAuditEvent>>,
}

impl SyncAuditSink for RecordingSink {
    fn record_decode_skip(&self, event: &DecodeSkipAuditEvent) {
        self.skips.lock().unwrap().push(event.clone());
    }

    fn record_batch(&self, event: &BatchAuditEvent) {
        self.batches.lock().unwrap().push(event.clone());
    }
}

/// Bucket wrapper counting mutations and failing puts on marked keys.
#[derive(Default)]
struct CountingBucket {
    inner: MemoryBucket,
    mutations: AtomicUsize,
    refuse: BTreeSet<String>,
}

impl CountingBucket {
    fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }
}

impl PolicyBucket for CountingBucket {
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        self.inner.entries()
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
        self.count();
        if self.refuse.contains(key.as_str()) {
            return Err(StoreError::Backend("refused".to_string()));
        }
        self.inner.put(key, value)
    }

    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError> {
        self.count();
        self.inner.update(key, value, revision)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.count();
        self.inner.delete(key)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.count();
        self.inner.delete_all()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

/// Bucket where another writer touches one key right after the first read.
struct RacingBucket {
    inner: MemoryBucket,
    contested: String,
    raced: AtomicBool,
}

impl RacingBucket {
    fn new(inner: MemoryBucket, contested: &StoreKey) -> Self {
        Self {
            inner,
            contested: contested.as_str().to_string(),
            raced: AtomicBool::new(false),
        }
    }
}

impl PolicyBucket for RacingBucket {
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        let entries = self.inner.entries()?;
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.inner.insert_raw(&self.contested, b"written by another adapter")?;
        }
        Ok(entries)
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
        self.inner.put(key, value)
    }

    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError> {
        self.inner.update(key, value, revision)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.inner.delete_all()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.inner.close()
    }
}

/// Bucket whose first `close` calls fail, as a drain against a dead server would.
struct FlakyCloseBucket {
    inner: MemoryBucket,
    failures_left: AtomicUsize,
}

impl PolicyBucket for FlakyCloseBucket {
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        self.inner.entries()
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
        self.inner.put(key, value)
    }

    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError> {
        self.inner.update(key, value, revision)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.inner.delete_all()
    }

    fn close(&self) -> Result<(), StoreError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Connection("drain failed".to_string()));
        }
        self.inner.close()
    }
}

fn rule(section: &str, fields: &[&str]) -> PolicyRule {
    PolicyRule::new(section, fields.iter().copied()).unwrap()
}

fn strings(fields: &[&str]) -> Vec<String> {
    fields.iter().map(ToString::to_string).collect()
}

fn sample_rules() -> Vec<PolicyRule> {
    vec![
        rule("p", &["alice", "data1", "read"]),
        rule("p", &["bob", "data2", "write"]),
        rule("p", &["data2_admin", "data2", "read"]),
        rule("p", &["data2_admin", "data2", "write"]),
        rule("g", &["alice", "data2_admin"]),
    ]
}

fn sample_model() -> MemoryPolicyModel {
    MemoryPolicyModel::from_rules(sample_rules())
}

fn adapter_over(bucket: Arc<dyn PolicyBucket>, options: SyncOptions) -> PolicySyncAdapter {
    PolicySyncAdapter::new(bucket, options, Arc::new(NoopAuditSink))
}

fn memory_adapter(options: SyncOptions) -> (MemoryBucket, PolicySyncAdapter) {
    let bucket = MemoryBucket::new();
    let adapter = adapter_over(Arc::new(bucket.clone()), options);
    (bucket, adapter)
}

fn recreate_options() -> SyncOptions {
    SyncOptions {
        recreate_on_save: true,
        ..SyncOptions::default()
    }
}

fn loaded(adapter: &PolicySyncAdapter) -> BTreeSet<PolicyRule> {
    let mut model = MemoryPolicyModel::new();
    adapter.load_policy(&mut model).unwrap();
    model.rules().iter().cloned().collect()
}

fn expected_keys(rules: &[PolicyRule]) -> Vec<String> {
    let keys: BTreeSet<String> = rules.iter().map(|rule| encode_key(rule).into_string()).collect();
    keys.into_iter().collect()
}

// ============================================================================
// SECTION: Load and Save
// ============================================================================

#[test]
fn save_then_load_round_trips_in_both_modes() {
    for options in [SyncOptions::default(), recreate_options()] {
        let (bucket, adapter) = memory_adapter(options);
        adapter.save_policy(&sample_model()).unwrap();
        assert_eq!(bucket.keys().unwrap(), expected_keys(&sample_rules()));
        assert_eq!(loaded(&adapter), sample_rules().into_iter().collect::<BTreeSet<_>>());
    }
}

#[test]
fn load_from_empty_bucket_yields_empty_model() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    let mut model = MemoryPolicyModel::new();
    let report = adapter.load_policy(&mut model).unwrap();
    assert_eq!(report.loaded, 0);
    assert_eq!(report.skipped, 0);
    assert!(model.is_empty());
}

#[test]
fn incremental_save_of_unchanged_model_issues_no_mutations() {
    let bucket = Arc::new(CountingBucket::default());
    let adapter = adapter_over(bucket.clone(), SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();
    let after_first = bucket.mutations();
    assert_eq!(after_first, sample_rules().len());

    let report = adapter.save_policy(&sample_model()).unwrap();
    assert_eq!(report.mode, SaveMode::Incremental);
    assert_eq!(report.operations(), 0);
    assert_eq!(bucket.mutations(), after_first);
}

#[test]
fn incremental_save_applies_only_the_difference() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();

    let mut next = sample_rules();
    next.retain(|rule| rule.fields()[0] != "bob");
    next.push(rule("p", &["carol", "data3", "read"]));
    let report = adapter.save_policy(&MemoryPolicyModel::from_rules(next.clone())).unwrap();
    assert_eq!(report.puts, 1);
    assert_eq!(report.deletes, 1);
    assert_eq!(report.updates, 0);
    assert_eq!(bucket.keys().unwrap(), expected_keys(&next));
}

#[test]
fn incremental_save_rewrites_non_canonical_and_removes_foreign_entries() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    let alice = rule("p", &["alice", "data1", "read"]);
    let key = encode_key(&alice);
    bucket
        .insert_raw(key.as_str(), br#"{ "section": "p", "fields": ["alice", "data1", "read"] }"#)
        .unwrap();
    bucket.insert_raw("legacy_entry", b"junk").unwrap();

    let report = adapter.save_policy(&MemoryPolicyModel::from_rules([alice.clone()])).unwrap();
    assert_eq!(report.updates, 1);
    assert_eq!(report.deletes, 1);
    assert_eq!(bucket.keys().unwrap(), vec![key.into_string()]);
    let (_, canonical) = encode_entry(&alice).unwrap();
    let stored = bucket.entries().unwrap();
    assert_eq!(stored[0].value, canonical);
}

#[test]
fn incremental_update_reports_conflict_when_entry_changed_underneath() {
    let inner = MemoryBucket::new();
    let alice = rule("p", &["alice", "data1", "read"]);
    let key = encode_key(&alice);
    inner
        .insert_raw(key.as_str(), br#"{ "section": "p", "fields": ["alice", "data1", "read"] }"#)
        .unwrap();
    let adapter =
        adapter_over(Arc::new(RacingBucket::new(inner.clone(), &key)), SyncOptions::default());

    let result = adapter.save_policy(&MemoryPolicyModel::from_rules([alice]));
    let Err(SyncError::Batch(error)) = result else {
        panic!("expected batch error");
    };
    assert_eq!(error.succeeded, 0);
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.failures[0].operation.kind, StoreOpKind::Update);
    assert_eq!(error.failures[0].operation.key, key.as_str());
    assert!(matches!(error.failures[0].error, StoreError::Conflict(_)));

    let stored = inner.entries().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].value, b"written by another adapter");
}

#[test]
fn recreate_save_leaves_no_stale_keys() {
    let (bucket, adapter) = memory_adapter(recreate_options());
    bucket.insert_raw("stale_entry", b"{}").unwrap();
    adapter.save_policy(&sample_model()).unwrap();

    let only_alice = [rule("p", &["alice", "data1", "read"])];
    let report = adapter.save_policy(&MemoryPolicyModel::from_rules(only_alice.clone())).unwrap();
    assert_eq!(report.mode, SaveMode::Recreate);
    assert_eq!(report.puts, 1);
    assert_eq!(bucket.keys().unwrap(), expected_keys(&only_alice));
}

#[test]
fn save_of_empty_model_clears_bucket() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();
    adapter.save_policy(&MemoryPolicyModel::new()).unwrap();
    assert!(bucket.keys().unwrap().is_empty());
}

#[test]
fn load_skips_and_audits_corrupt_entries() {
    let bucket = MemoryBucket::new();
    let sink = Arc::new(RecordingSink::default());
    let adapter = PolicySyncAdapter::new(Arc::new(bucket.clone()), SyncOptions::default(), sink.clone());
    adapter.save_policy(&sample_model()).unwrap();
    bucket.insert_raw("p.vYWxpY2U", b"not json").unwrap();
    bucket.insert_raw("unrelated", b"{}").unwrap();

    let mut model = MemoryPolicyModel::new();
    let report = adapter.load_policy(&mut model).unwrap();
    assert_eq!(report.loaded, sample_rules().len());
    assert_eq!(report.skipped, 2);
    let skipped: BTreeSet<String> =
        sink.skips.lock().unwrap().iter().map(|event| event.key.clone()).collect();
    let expected: BTreeSet<String> =
        ["p.vYWxpY2U", "unrelated"].into_iter().map(String::from).collect();
    assert_eq!(skipped, expected);
}

#[test]
fn load_is_additive_and_deduplicated() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();
    let mut model = MemoryPolicyModel::from_rules([rule("p", &["alice", "data1", "read"])]);
    adapter.load_policy(&mut model).unwrap();
    assert_eq!(model.len(), sample_rules().len());
}

#[test]
fn batch_operations_emit_summary_events() {
    let sink = Arc::new(RecordingSink::default());
    let adapter =
        PolicySyncAdapter::new(Arc::new(MemoryBucket::new()), SyncOptions::default(), sink.clone());
    adapter.save_policy(&sample_model()).unwrap();
    let batches = sink.batches.lock().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].operation, "save_incremental");
    assert_eq!(batches[0].submitted, sample_rules().len());
    assert_eq!(batches[0].succeeded, sample_rules().len());
}

#[test]
fn partial_save_failure_lists_every_failed_key() {
    let refused = encode_key(&rule("p", &["bob", "data2", "write"])).into_string();
    let bucket = Arc::new(CountingBucket {
        refuse: [refused.clone()].into_iter().collect(),
        ..CountingBucket::default()
    });
    let adapter = adapter_over(bucket.clone(), SyncOptions::default());
    let Err(SyncError::Batch(error)) = adapter.save_policy(&sample_model()) else {
        panic!("expected batch error");
    };
    assert_eq!(error.failures.len(), 1);
    assert_eq!(error.failures[0].operation.key, refused);
    assert_eq!(error.succeeded, sample_rules().len() - 1);
    assert_eq!(bucket.inner.keys().unwrap().len(), sample_rules().len() - 1);
}

// ============================================================================
// SECTION: Filtered Load
// ============================================================================

#[test]
fn filtered_load_marks_adapter_and_refuses_save() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();

    let mut model = MemoryPolicyModel::new();
    let filter = PolicyFilter::new("p", 0, ["data2_admin".to_string()]);
    let report = adapter.load_filtered_policy(&mut model, &filter).unwrap();
    assert_eq!(report.loaded, 2);
    assert!(adapter.is_filtered());
    assert!(matches!(adapter.save_policy(&model), Err(SyncError::FilteredSave)));

    let mut full = MemoryPolicyModel::new();
    adapter.load_policy(&mut full).unwrap();
    assert!(!adapter.is_filtered());
    adapter.save_policy(&full).unwrap();
}

// ============================================================================
// SECTION: Incremental Mutation
// ============================================================================

#[test]
fn add_remove_and_readd_single_rule() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    let fields = strings(&["eve", "data3", "read"]);
    adapter.add_policy("p", &fields).unwrap();
    assert!(loaded(&adapter).contains(&rule("p", &["eve", "data3", "read"])));

    adapter.remove_policy("p", &fields).unwrap();
    assert!(loaded(&adapter).is_empty());
    adapter.remove_policy("p", &fields).unwrap();

    adapter.add_policy("p", &fields).unwrap();
    assert_eq!(loaded(&adapter).len(), 1);
}

#[test]
fn add_policy_rejects_invalid_rules() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    assert!(matches!(adapter.add_policy("p", &[]), Err(SyncError::Codec(_))));
    assert!(matches!(adapter.add_policy("bad section", &strings(&["x"])), Err(SyncError::Codec(_))));
    assert!(bucket.keys().unwrap().is_empty());
}

#[test]
fn oversized_keys_are_rejected_before_reaching_the_bucket() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    let fields = vec!["x".repeat(4096); 3];
    assert!(matches!(
        adapter.add_policy("p", &fields),
        Err(SyncError::Codec(CodecError::KeyTooLong { .. }))
    ));
    let rules = vec![strings(&["alice", "data1", "read"]), fields];
    assert!(matches!(
        adapter.add_policies("p", &rules),
        Err(SyncError::Codec(CodecError::KeyTooLong { .. }))
    ));
    assert!(bucket.keys().unwrap().is_empty());
}

#[test]
fn batch_add_and_remove_policies() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    let rules = vec![strings(&["alice", "data1", "read"]), strings(&["bob", "data2", "write"])];
    assert_eq!(adapter.add_policies("p", &rules).unwrap(), 2);
    assert_eq!(bucket.keys().unwrap().len(), 2);
    assert_eq!(adapter.remove_policies("p", &rules).unwrap(), 2);
    assert!(bucket.keys().unwrap().is_empty());
    assert_eq!(adapter.remove_policies("p", &rules).unwrap(), 2);
}

#[test]
fn batch_add_with_one_invalid_rule_writes_nothing() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    let rules = vec![strings(&["alice", "data1", "read"]), Vec::new()];
    assert!(matches!(adapter.add_policies("p", &rules), Err(SyncError::Codec(_))));
    assert!(bucket.keys().unwrap().is_empty());
}

#[test]
fn remove_filtered_policy_matches_positionally() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();

    let removed = adapter.remove_filtered_policy("p", 0, &strings(&["data2_admin"])).unwrap();
    assert_eq!(removed, 2);
    let remaining = loaded(&adapter);
    assert_eq!(remaining.len(), 3);
    assert!(remaining.contains(&rule("g", &["alice", "data2_admin"])));
    assert_eq!(adapter.remove_filtered_policy("p", 0, &strings(&["data2_admin"])).unwrap(), 0);
}

#[test]
fn remove_filtered_policy_treats_empty_values_as_wildcards() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();
    let removed = adapter.remove_filtered_policy("p", 1, &strings(&["", "write"])).unwrap();
    assert_eq!(removed, 2);
    let remaining = loaded(&adapter);
    assert!(!remaining.contains(&rule("p", &["bob", "data2", "write"])));
    assert!(remaining.contains(&rule("p", &["data2_admin", "data2", "read"])));
}

#[test]
fn clear_policy_empties_bucket() {
    let (bucket, adapter) = memory_adapter(SyncOptions::default());
    adapter.save_policy(&sample_model()).unwrap();
    adapter.clear_policy().unwrap();
    assert!(bucket.keys().unwrap().is_empty());
}

// ============================================================================
// SECTION: Lifecycle
// ============================================================================

#[test]
fn operations_after_close_fail() {
    let (_, adapter) = memory_adapter(SyncOptions::default());
    adapter.close().unwrap();
    adapter.close().unwrap();
    let mut model = MemoryPolicyModel::new();
    assert!(matches!(adapter.load_policy(&mut model), Err(SyncError::Closed)));
    assert!(matches!(adapter.save_policy(&model), Err(SyncError::Closed)));
    assert!(matches!(adapter.add_policy("p", &strings(&["x"])), Err(SyncError::Closed)));
    assert!(matches!(adapter.remove_policy("p", &strings(&["x"])), Err(SyncError::Closed)));
    assert!(matches!(
        adapter.remove_filtered_policy("p", 0, &strings(&["x"])),
        Err(SyncError::Closed)
    ));
    assert!(model.policy_rules().is_empty());
}

#[test]
fn failed_close_can_be_retried() {
    let bucket = Arc::new(FlakyCloseBucket {
        inner: MemoryBucket::new(),
        failures_left: AtomicUsize::new(1),
    });
    let adapter = adapter_over(bucket, SyncOptions::default());
    assert!(matches!(adapter.close(), Err(SyncError::Store(StoreError::Connection(_)))));

    let mut model = MemoryPolicyModel::new();
    adapter.load_policy(&mut model).unwrap();

    adapter.close().unwrap();
    assert!(matches!(adapter.load_policy(&mut model), Err(SyncError::Closed)));
    adapter.close().unwrap();
}
