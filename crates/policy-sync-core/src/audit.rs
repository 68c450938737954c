// crates/policy-sync-core/src/audit.rs
// ============================================================================
// Module: Policy Sync Audit Logging
// Description: Structured audit events for non-fatal synchronization diagnostics.
// Purpose: Emit JSON-lines events without hard logging dependencies.
// Dependencies: serde, serde_json
// ============================================================================

//! ## Overview
//! The engine and the transport never fail an operation for a diagnostic
//! they can recover from (skipped corrupt entries, failed credential
//! reloads). Those conditions are reported as audit events through a
//! [`SyncAuditSink`] so deployments can route them to their own pipeline.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Serialize;

// ============================================================================
// SECTION: Types
// ============================================================================

/// Entry skipped during a bulk read because it failed to decode.
#[derive(Debug, Clone, Serialize)]
pub struct DecodeSkipAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Raw store key of the skipped entry.
    pub key: String,
    /// Decode failure description.
    pub reason: String,
}

/// Outcome of a credential reload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialOutcome {
    /// New credential snapshot is live.
    Rotated,
    /// Reload failed; previous snapshot retained.
    Failed,
}

/// Credential rotation audit event.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Reload outcome.
    pub outcome: CredentialOutcome,
    /// Generation of the snapshot in effect after the attempt.
    pub generation: u64,
    /// Failure description when the reload failed.
    pub message: Option<String>,
}

/// Bulk operation summary audit event.
#[derive(Debug, Clone, Serialize)]
pub struct BatchAuditEvent {
    /// Event identifier.
    pub event: &'static str,
    /// Event timestamp (milliseconds since epoch).
    pub timestamp_ms: u128,
    /// Engine operation label (e.g. `save_incremental`).
    pub operation: &'static str,
    /// Operations submitted to the executor.
    pub submitted: usize,
    /// Operations that succeeded.
    pub succeeded: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations never dispatched because the batch was cancelled.
    pub not_dispatched: usize,
}

/// Returns the current time in milliseconds since the epoch.
fn now_ms() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

impl DecodeSkipAuditEvent {
    /// Creates a decode-skip event with a consistent timestamp.
    #[must_use]
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            event: "decode_skip",
            timestamp_ms: now_ms(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

impl CredentialAuditEvent {
    /// Creates a credential rotation event with a consistent timestamp.
    #[must_use]
    pub fn new(outcome: CredentialOutcome, generation: u64, message: Option<String>) -> Self {
        Self {
            event: "credential_rotation",
            timestamp_ms: now_ms(),
            outcome,
            generation,
            message,
        }
    }
}

impl BatchAuditEvent {
    /// Creates a batch summary event with a consistent timestamp.
    #[must_use]
    pub fn new(
        operation: &'static str,
        submitted: usize,
        succeeded: usize,
        failed: usize,
        not_dispatched: usize,
    ) -> Self {
        Self {
            event: "batch_complete",
            timestamp_ms: now_ms(),
            operation,
            submitted,
            succeeded,
            failed,
            not_dispatched,
        }
    }
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Audit sink for synchronization diagnostics.
pub trait SyncAuditSink: Send + Sync {
    /// Record a skipped corrupt entry.
    fn record_decode_skip(&self, event: &DecodeSkipAuditEvent);

    /// Record a credential rotation attempt.
    fn record_credential(&self, _event: &CredentialAuditEvent) {}

    /// Record a bulk operation summary.
    fn record_batch(&self, _event: &BatchAuditEvent) {}
}

/// Serializes an event as one JSON line into the writer.
fn write_json_line<W: Write, E: Serialize>(writer: &mut W, event: &E) {
    if let Ok(payload) = serde_json::to_string(event) {
        let _ = writeln!(writer, "{payload}");
        let _ = writer.flush();
    }
}

/// Audit sink that logs JSON lines to stderr.
pub struct StderrAuditSink;

impl SyncAuditSink for StderrAuditSink {
    fn record_decode_skip(&self, event: &DecodeSkipAuditEvent) {
        write_json_line(&mut io::stderr(), event);
    }

    fn record_credential(&self, event: &CredentialAuditEvent) {
        write_json_line(&mut io::stderr(), event);
    }

    fn record_batch(&self, event: &BatchAuditEvent) {
        write_json_line(&mut io::stderr(), event);
    }
}

/// Audit sink that logs JSON lines to a file.
pub struct FileAuditSink {
    /// File handle used for append-only logging.
    file: Mutex<std::fs::File>,
}

impl FileAuditSink {
    /// Opens the audit log file in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Appends one event while holding the file lock.
    fn append<E: Serialize>(&self, event: &E) {
        if let Ok(mut file) = self.file.lock() {
            write_json_line(&mut *file, event);
        }
    }
}

impl SyncAuditSink for FileAuditSink {
    fn record_decode_skip(&self, event: &DecodeSkipAuditEvent) {
        self.append(event);
    }

    fn record_credential(&self, event: &CredentialAuditEvent) {
        self.append(event);
    }

    fn record_batch(&self, event: &BatchAuditEvent) {
        self.append(event);
    }
}

/// No-op audit sink.
pub struct NoopAuditSink;

impl SyncAuditSink for NoopAuditSink {
    fn record_decode_skip(&self, _event: &DecodeSkipAuditEvent) {}
}
