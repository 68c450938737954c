// crates/policy-sync-core/src/runtime/executor.rs
// ============================================================================
// Module: Bounded Executor
// Description: Bounded-concurrency execution of independent bucket operations.
// Purpose: Run bulk puts/deletes with a parallelism ceiling and full reporting.
// Dependencies: crate::core, crate::interfaces, tokio-util, thiserror
// ============================================================================

//! ## Overview
//! A batch is a list of [`StoreOp`]s that each touch a distinct key, so they
//! commute and carry no ordering. The executor runs at most `N` of them at
//! once on scoped worker threads and never short-circuits: a failed
//! operation is recorded and the rest keep running. A [`BatchControl`]
//! deadline or cancellation stops new dispatches; operations already in
//! flight finish and are reported.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::StoreKey;
use crate::interfaces::PolicyBucket;
use crate::interfaces::StoreError;

// ============================================================================
// SECTION: Operations
// ============================================================================

/// Operation kind label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOpKind {
    /// Create or overwrite.
    Put,
    /// Conditional replace.
    Update,
    /// Delete.
    Delete,
}

impl fmt::Display for StoreOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Put => "put",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// Single bucket operation in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Create or overwrite an entry.
    Put {
        /// Target key.
        key: StoreKey,
        /// Encoded value.
        value: Vec<u8>,
    },
    /// Replace an entry at a known revision.
    Update {
        /// Target key.
        key: StoreKey,
        /// Encoded value.
        value: Vec<u8>,
        /// Expected current revision.
        revision: u64,
    },
    /// Delete an entry by raw key.
    Delete {
        /// Raw target key.
        key: String,
    },
}

impl StoreOp {
    /// Returns the operation kind.
    #[must_use]
    pub const fn kind(&self) -> StoreOpKind {
        match self {
            Self::Put {
                ..
            } => StoreOpKind::Put,
            Self::Update {
                ..
            } => StoreOpKind::Update,
            Self::Delete {
                ..
            } => StoreOpKind::Delete,
        }
    }

    /// Returns the raw key the operation targets.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put {
                key,
                ..
            }
            | Self::Update {
                key,
                ..
            } => key.as_str(),
            Self::Delete {
                key,
            } => key,
        }
    }

    /// Applies the operation to the bucket.
    fn apply(&self, bucket: &dyn PolicyBucket) -> Result<(), StoreError> {
        match self {
            Self::Put {
                key,
                value,
            } => bucket.put(key, value).map(|_| ()),
            Self::Update {
                key,
                value,
                revision,
            } => bucket.update(key, value, *revision).map(|_| ()),
            Self::Delete {
                key,
            } => bucket.delete(key),
        }
    }

    /// Returns the identity record for reporting.
    fn record(&self) -> OperationRecord {
        OperationRecord {
            kind: self.kind(),
            key: self.key().to_string(),
        }
    }
}

// ============================================================================
// SECTION: Control
// ============================================================================

/// Deadline and cancellation signal for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchControl {
    /// Instant after which no new operation is dispatched.
    pub deadline: Option<Instant>,
    /// External cancellation token.
    pub cancel: Option<CancellationToken>,
}

impl BatchControl {
    /// Control with no deadline and no cancellation.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Control with a deadline `timeout` from now.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now().checked_add(timeout),
            cancel: None,
        }
    }

    /// Adds an external cancellation token.
    #[must_use]
    pub fn cancelled_by(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Returns true once the deadline passed or the token fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

// ============================================================================
// SECTION: Reporting
// ============================================================================

/// Identity of one batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRecord {
    /// Operation kind.
    pub kind: StoreOpKind,
    /// Raw target key.
    pub key: String,
}

/// Failed batch operation and its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    /// Operation identity.
    pub operation: OperationRecord,
    /// Underlying store error.
    pub error: StoreError,
}

/// Per-operation outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Operations that completed successfully.
    pub succeeded: Vec<OperationRecord>,
    /// Operations that failed.
    pub failed: Vec<OperationFailure>,
    /// Operations never dispatched because the batch was cancelled.
    pub not_dispatched: Vec<OperationRecord>,
}

impl BatchReport {
    /// Total operations submitted.
    #[must_use]
    pub fn submitted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.not_dispatched.len()
    }

    /// Returns true when every submitted operation succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.not_dispatched.is_empty()
    }

    /// Converts the report into the success count or an aggregate error.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError`] when any operation failed or was not dispatched.
    pub fn into_result(self) -> Result<usize, BatchError> {
        if self.is_complete() {
            return Ok(self.succeeded.len());
        }
        Err(BatchError {
            succeeded: self.succeeded.len(),
            failures: self.failed,
            not_dispatched: self.not_dispatched,
        })
    }
}

/// Aggregate error for a partially applied batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "batch incomplete: {} failed, {} not dispatched, {succeeded} applied{}",
    .failures.len(),
    .not_dispatched.len(),
    describe_failures(.failures)
)]
pub struct BatchError {
    /// Number of operations that were applied.
    pub succeeded: usize,
    /// Every failed operation with its cause.
    pub failures: Vec<OperationFailure>,
    /// Operations skipped after cancellation.
    pub not_dispatched: Vec<OperationRecord>,
}

/// Formats the failure list for the aggregate error message.
fn describe_failures(failures: &[OperationFailure]) -> String {
    failures.iter().fold(String::new(), |mut out, failure| {
        out.push_str(if out.is_empty() { ": " } else { "; " });
        out.push_str(&format!(
            "{} {}: {}",
            failure.operation.kind, failure.operation.key, failure.error
        ));
        out
    })
}

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Slot table shared by parallel workers.
#[derive(Debug)]
struct SlotTable {
    /// One slot per submitted operation.
    slots: Vec<Slot>,
    /// Index of the next operation to dispatch.
    next: usize,
}

/// Dispatch state of one operation slot.
#[derive(Debug)]
enum Slot {
    /// Not yet handed to a worker.
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Finished with a result.
    Done(Result<(), StoreError>),
}

/// Worker pool with a fixed ceiling on in-flight operations.
#[derive(Debug, Clone, Copy)]
pub struct BoundedExecutor {
    /// Maximum concurrent operations.
    max_in_flight: NonZeroUsize,
}

impl BoundedExecutor {
    /// Creates an executor; a ceiling of zero is treated as one.
    #[must_use]
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            max_in_flight: NonZeroUsize::new(max_in_flight).unwrap_or(NonZeroUsize::MIN),
        }
    }

    /// Returns the in-flight ceiling.
    #[must_use]
    pub const fn max_in_flight(&self) -> usize {
        self.max_in_flight.get()
    }

    /// Executes the batch and reports every operation's outcome.
    #[must_use]
    pub fn execute(
        &self,
        bucket: &dyn PolicyBucket,
        ops: Vec<StoreOp>,
        control: &BatchControl,
    ) -> BatchReport {
        let workers = self.max_in_flight.get().min(ops.len());
        let slots = if workers <= 1 {
            run_sequential(bucket, &ops, control)
        } else {
            run_parallel(bucket, &ops, control, workers)
        };
        collect_report(&ops, slots)
    }
}

/// Runs the batch on the calling thread.
fn run_sequential(
    bucket: &dyn PolicyBucket,
    ops: &[StoreOp],
    control: &BatchControl,
) -> Vec<Slot> {
    let mut slots: Vec<Slot> = ops.iter().map(|_| Slot::Pending).collect();
    for (op, slot) in ops.iter().zip(slots.iter_mut()) {
        if control.is_triggered() {
            break;
        }
        *slot = Slot::Done(op.apply(bucket));
    }
    slots
}

/// Runs the batch on `workers` scoped threads sharing one slot table.
fn run_parallel(
    bucket: &dyn PolicyBucket,
    ops: &[StoreOp],
    control: &BatchControl,
    workers: usize,
) -> Vec<Slot> {
    let table = Mutex::new(SlotTable {
        slots: ops.iter().map(|_| Slot::Pending).collect(),
        next: 0,
    });
    thread::scope(|scope| {
        for _ in 0 .. workers {
            scope.spawn(|| {
                while let Some(index) = claim_next(&table, control) {
                    let result = ops[index].apply(bucket);
                    let mut guard = table.lock().unwrap_or_else(PoisonError::into_inner);
                    guard.slots[index] = Slot::Done(result);
                }
            });
        }
    });
    table.into_inner().unwrap_or_else(PoisonError::into_inner).slots
}

/// Claims the next pending slot unless the batch was cancelled.
fn claim_next(table: &Mutex<SlotTable>, control: &BatchControl) -> Option<usize> {
    if control.is_triggered() {
        return None;
    }
    let mut guard = table.lock().unwrap_or_else(PoisonError::into_inner);
    let index = guard.next;
    if index >= guard.slots.len() {
        return None;
    }
    guard.next += 1;
    guard.slots[index] = Slot::InFlight;
    Some(index)
}

/// Folds slot states into a report.
fn collect_report(ops: &[StoreOp], slots: Vec<Slot>) -> BatchReport {
    let mut report = BatchReport::default();
    for (op, slot) in ops.iter().zip(slots) {
        match slot {
            Slot::Done(Ok(())) => report.succeeded.push(op.record()),
            Slot::Done(Err(error)) => report.failed.push(OperationFailure {
                operation: op.record(),
                error,
            }),
            Slot::InFlight => report.failed.push(OperationFailure {
                operation: op.record(),
                error: StoreError::Backend("worker terminated before completion".to_string()),
            }),
            Slot::Pending => report.not_dispatched.push(op.record()),
        }
    }
    report
}
