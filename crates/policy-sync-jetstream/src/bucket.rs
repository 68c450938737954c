// crates/policy-sync-jetstream/src/bucket.rs
// ============================================================================
// Module: JetStream Policy Bucket
// Description: NATS JetStream key-value backend for the policy bucket.
// Purpose: Persist encoded policy rules in a JetStream KV bucket.
// Dependencies: policy-sync-core, async-nats, bytes, tokio, tokio-stream
// ============================================================================

//! ## Overview
//! [`JetStreamBucket`] implements [`PolicyBucket`] over one JetStream
//! key-value bucket. The async client runs on a runtime owned by the bucket,
//! and every call blocks until the server acknowledges it. The bucket is
//! created with history 1 when it does not exist. When TLS is enabled a
//! [`CredentialRotator`] supplies client certificates and trust roots.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::error::Error as _;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_nats::Client;
use async_nats::ConnectOptions;
use async_nats::jetstream;
use async_nats::jetstream::context::GetStreamError;
use async_nats::jetstream::context::GetStreamErrorKind;
use async_nats::jetstream::context::KeyValueError;
use async_nats::jetstream::context::KeyValueErrorKind;
use async_nats::jetstream::Error as ServerError;
use async_nats::jetstream::ErrorCode;
use async_nats::jetstream::kv;
use async_nats::jetstream::kv::Operation;
use async_nats::jetstream::kv::UpdateErrorKind;
use bytes::Bytes;
use policy_sync_core::PolicyBucket;
use policy_sync_core::PolicySyncAdapter;
use policy_sync_core::StoreEntry;
use policy_sync_core::StoreError;
use policy_sync_core::StoreKey;
use policy_sync_core::SyncAuditSink;
use policy_sync_core::SyncOptions;
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::runtime::Runtime;
use tokio::runtime::RuntimeFlavor;
use tokio_stream::StreamExt;

use crate::credentials::CredentialError;
use crate::credentials::CredentialRotator;
use crate::credentials::RotationState;
use crate::credentials::TlsCredentialConfig;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default server URL.
pub const DEFAULT_SERVER_URL: &str = "nats://127.0.0.1:4222";
/// Default bucket name.
pub const DEFAULT_BUCKET: &str = "policy_rules";
/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Maximum bucket name length.
const MAX_BUCKET_NAME_LENGTH: usize = 255;
/// Worker threads for the owned client runtime.
const RUNTIME_WORKER_THREADS: usize = 2;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// JetStream store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JetStreamStoreConfig {
    /// Server URL.
    #[serde(default = "default_url")]
    pub url: String,
    /// Key-value bucket name.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Mutual-TLS credentials.
    #[serde(default)]
    pub tls: TlsCredentialConfig,
}

impl Default for JetStreamStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            bucket: default_bucket(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            tls: TlsCredentialConfig::default(),
        }
    }
}

impl JetStreamStoreConfig {
    /// Validates the store configuration.
    ///
    /// # Errors
    ///
    /// Returns [`JetStreamError::Invalid`] when a field is out of range.
    pub fn validate(&self) -> Result<(), JetStreamError> {
        if self.url.trim().is_empty() {
            return Err(JetStreamError::Invalid("url must be non-empty".to_string()));
        }
        validate_bucket_name(&self.bucket)?;
        if self.connect_timeout_ms == 0 {
            return Err(JetStreamError::Invalid(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        self.tls.validate()?;
        Ok(())
    }
}

/// Validates a bucket name against the JetStream bucket alphabet.
///
/// # Errors
///
/// Returns [`JetStreamError::Invalid`] for empty, oversized, or illegal names.
pub fn validate_bucket_name(bucket: &str) -> Result<(), JetStreamError> {
    if bucket.is_empty() || bucket.len() > MAX_BUCKET_NAME_LENGTH {
        return Err(JetStreamError::Invalid(format!(
            "bucket name must be 1..={MAX_BUCKET_NAME_LENGTH} bytes"
        )));
    }
    if !bucket.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-') {
        return Err(JetStreamError::Invalid(format!(
            "bucket name {bucket} must match [A-Za-z0-9_-]+"
        )));
    }
    Ok(())
}

/// Returns the default server URL.
fn default_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

/// Returns the default bucket name.
fn default_bucket() -> String {
    DEFAULT_BUCKET.to_string()
}

/// Returns the default connect timeout.
const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// JetStream backend errors.
#[derive(Debug, Error)]
pub enum JetStreamError {
    /// Invalid configuration.
    #[error("jetstream config invalid: {0}")]
    Invalid(String),
    /// Connection or bucket binding failed.
    #[error("jetstream connection error: {0}")]
    Connection(String),
    /// Server rejected or failed an operation.
    #[error("jetstream backend error: {0}")]
    Backend(String),
    /// Conditional update lost against a concurrent writer.
    #[error("jetstream revision conflict: {0}")]
    Conflict(String),
    /// Credential loading failed.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// Owned runtime failure.
    #[error("jetstream runtime error: {0}")]
    Runtime(String),
    /// Bucket handle closed.
    #[error("jetstream bucket closed")]
    Closed,
}

impl From<JetStreamError> for StoreError {
    fn from(err: JetStreamError) -> Self {
        match err {
            JetStreamError::Invalid(message) => Self::Invalid(message),
            JetStreamError::Connection(message) => Self::Connection(message),
            JetStreamError::Conflict(message) => Self::Conflict(message),
            JetStreamError::Closed => Self::Closed,
            JetStreamError::Backend(message) | JetStreamError::Runtime(message) => {
                Self::Backend(message)
            }
            JetStreamError::Credentials(err) => Self::Connection(err.to_string()),
        }
    }
}

// ============================================================================
// SECTION: Runtime Helpers
// ============================================================================

/// Runs a client future to completion on the owned runtime.
///
/// Inside a caller's runtime the future is spawned onto the owned runtime
/// and the caller's thread waits for its result.
fn block_on_with_runtime<F, T>(runtime: &Runtime, future: F) -> Result<T, JetStreamError>
where
    F: Future<Output = Result<T, JetStreamError>> + Send + 'static,
    T: Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        runtime.spawn(async move {
            let _ = tx.send(future.await);
        });
        let wait = move || {
            rx.recv().unwrap_or_else(|_| {
                Err(JetStreamError::Runtime("jetstream task dropped".to_string()))
            })
        };
        if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return tokio::task::block_in_place(wait);
        }
        return wait();
    }

    runtime.block_on(future)
}

// ============================================================================
// SECTION: Bucket
// ============================================================================

/// JetStream key-value policy bucket.
pub struct JetStreamBucket {
    /// Connected client.
    client: Client,
    /// Bound key-value store.
    store: kv::Store,
    /// Bucket name.
    bucket: String,
    /// Credential rotator when TLS is enabled.
    rotator: Option<CredentialRotator>,
    /// Set once the bucket is closed.
    closed: AtomicBool,
    /// Tokio runtime for blocking client operations.
    runtime: Option<Arc<Runtime>>,
}

impl Drop for JetStreamBucket {
    fn drop(&mut self) {
        if let Some(rotator) = self.rotator.take() {
            rotator.stop();
        }
        if let Some(runtime) = self.runtime.take() {
            let _ = std::thread::spawn(move || drop(runtime));
        }
    }
}

impl JetStreamBucket {
    /// Connects to the server and binds the bucket, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns [`JetStreamError`] when the configuration is invalid, the
    /// credentials fail to load, or the server cannot be reached.
    pub fn connect(
        config: &JetStreamStoreConfig,
        audit: Arc<dyn SyncAuditSink>,
    ) -> Result<Self, JetStreamError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKER_THREADS)
            .thread_name("policy-sync-jetstream")
            .enable_all()
            .build()
            .map_err(|err| JetStreamError::Runtime(err.to_string()))?;

        let mut options =
            ConnectOptions::new().connection_timeout(Duration::from_millis(config.connect_timeout_ms));
        let rotator = if config.tls.enabled {
            let rotator = CredentialRotator::start(&config.tls, audit, runtime.handle())?;
            options = options.require_tls(true).tls_client_config(rotator.client_config()?);
            Some(rotator)
        } else {
            None
        };

        let url = config.url.clone();
        let bucket = config.bucket.clone();
        let (client, store) = block_on_with_runtime(&runtime, async move {
            let client = options
                .connect(url.as_str())
                .await
                .map_err(|err| JetStreamError::Connection(err.to_string()))?;
            let context = jetstream::new(client.clone());
            let store = match context.get_key_value(bucket.as_str()).await {
                Ok(store) => store,
                Err(err) if is_bucket_missing(&err) => context
                    .create_key_value(kv::Config {
                        bucket: bucket.clone(),
                        history: 1,
                        ..Default::default()
                    })
                    .await
                    .map_err(|err| JetStreamError::Connection(err.to_string()))?,
                Err(err) => return Err(JetStreamError::Connection(err.to_string())),
            };
            Ok((client, store))
        })?;

        Ok(Self {
            client,
            store,
            bucket: config.bucket.clone(),
            rotator,
            closed: AtomicBool::new(false),
            runtime: Some(Arc::new(runtime)),
        })
    }

    /// Returns the bound bucket name.
    #[must_use]
    pub fn bucket_name(&self) -> &str {
        &self.bucket
    }

    /// Returns the credential rotator state.
    #[must_use]
    pub fn rotation_state(&self) -> RotationState {
        self.rotator.as_ref().map_or(RotationState::Disabled, CredentialRotator::state)
    }

    /// Returns the credential rotator when TLS is enabled.
    #[must_use]
    pub const fn credentials(&self) -> Option<&CredentialRotator> {
        self.rotator.as_ref()
    }

    /// Returns the runtime or an error once closed.
    fn runtime(&self) -> Result<&Runtime, JetStreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JetStreamError::Closed);
        }
        self.runtime
            .as_ref()
            .map(AsRef::as_ref)
            .ok_or(JetStreamError::Closed)
    }

    /// Runs a future against a clone of the store handle.
    fn with_store<F, Fut, T>(&self, op: F) -> Result<T, JetStreamError>
    where
        F: FnOnce(kv::Store) -> Fut,
        Fut: Future<Output = Result<T, JetStreamError>> + Send + 'static,
        T: Send + 'static,
    {
        block_on_with_runtime(self.runtime()?, op(self.store.clone()))
    }
}

/// Returns true when a bucket lookup failed only because the bucket is absent.
fn is_bucket_missing(err: &KeyValueError) -> bool {
    matches!(err.kind(), KeyValueErrorKind::GetBucket)
        && err
            .source()
            .and_then(|source| source.downcast_ref::<GetStreamError>())
            .is_some_and(|source| match source.kind() {
                GetStreamErrorKind::JetStream(server) => is_stream_not_found(&server),
                _ => false,
            })
}

/// Returns true for the server's stream-not-found error code.
fn is_stream_not_found(err: &ServerError) -> bool {
    err.error_code() == ErrorCode::STREAM_NOT_FOUND
}

/// Lists every live key in the store.
async fn list_keys(store: &kv::Store) -> Result<Vec<String>, JetStreamError> {
    let keys = store.keys().await.map_err(|err| JetStreamError::Backend(err.to_string()))?;
    let mut keys = pin!(keys);
    let mut out = Vec::new();
    while let Some(key) = keys.next().await {
        out.push(key.map_err(|err| JetStreamError::Backend(err.to_string()))?);
    }
    Ok(out)
}

impl PolicyBucket for JetStreamBucket {
    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self.with_store(|store| async move {
            let mut entries = Vec::new();
            for key in list_keys(&store).await? {
                let entry = store
                    .entry(key.as_str())
                    .await
                    .map_err(|err| JetStreamError::Backend(err.to_string()))?;
                if let Some(entry) = entry.filter(|entry| matches!(entry.operation, Operation::Put))
                {
                    entries.push(StoreEntry {
                        key,
                        value: entry.value.to_vec(),
                        revision: Some(entry.revision),
                    });
                }
            }
            Ok(entries)
        })?)
    }

    fn put(&self, key: &StoreKey, value: &[u8]) -> Result<u64, StoreError> {
        let key = key.as_str().to_string();
        let value = Bytes::copy_from_slice(value);
        Ok(self.with_store(|store| async move {
            store.put(key, value).await.map_err(|err| JetStreamError::Backend(err.to_string()))
        })?)
    }

    fn update(&self, key: &StoreKey, value: &[u8], revision: u64) -> Result<u64, StoreError> {
        let key = key.as_str().to_string();
        let value = Bytes::copy_from_slice(value);
        Ok(self.with_store(|store| async move {
            store.update(key.as_str(), value, revision).await.map_err(|err| {
                if matches!(err.kind(), UpdateErrorKind::WrongLastRevision) {
                    JetStreamError::Conflict(format!("{key}: {err}"))
                } else {
                    JetStreamError::Backend(err.to_string())
                }
            })
        })?)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        Ok(self.with_store(|store| async move {
            store.purge(key).await.map_err(|err| JetStreamError::Backend(err.to_string()))
        })?)
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        Ok(self.with_store(|store| async move {
            for key in list_keys(&store).await? {
                store.purge(key).await.map_err(|err| JetStreamError::Backend(err.to_string()))?;
            }
            Ok(())
        })?)
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let runtime = self.runtime.as_deref().ok_or(JetStreamError::Closed)?;
        if let Some(rotator) = &self.rotator {
            rotator.stop();
        }
        let client = self.client.clone();
        let drained = block_on_with_runtime(runtime, async move {
            client.drain().await.map_err(|err| JetStreamError::Connection(err.to_string()))
        });
        if drained.is_err() {
            self.closed.store(false, Ordering::Release);
        }
        Ok(drained?)
    }
}

// ============================================================================
// SECTION: Adapter Construction
// ============================================================================

/// Connects a JetStream bucket and wraps it in a synchronization adapter.
///
/// # Errors
///
/// Returns [`JetStreamError`] when the bucket cannot be connected.
pub fn open_adapter(
    config: &JetStreamStoreConfig,
    options: SyncOptions,
    audit: Arc<dyn SyncAuditSink>,
) -> Result<PolicySyncAdapter, JetStreamError> {
    let bucket = JetStreamBucket::connect(config, Arc::clone(&audit))?;
    Ok(PolicySyncAdapter::new(Arc::new(bucket), options, audit))
}
