// crates/policy-sync-jetstream/src/credentials.rs
// ============================================================================
// Module: Credential Rotator
// Description: Hot-reloaded mutual-TLS material for the JetStream connection.
// Purpose: Replace client certificates and trust roots without reconnecting.
// Dependencies: policy-sync-core, rustls, rustls-pki-types, serde, tokio, tokio-util
// ============================================================================

//! ## Overview
//! The rotator loads a client certificate chain, its private key, and a
//! trust-root bundle from PEM files, and publishes them as an immutable
//! [`CredentialSnapshot`]. The TLS client config handed to the transport
//! holds a certificate resolver and a server verifier that read the current
//! snapshot on every handshake, so a reload takes effect on the next
//! handshake while established sessions keep running.
//!
//! Invariants:
//! - The first load must succeed; later failed reloads keep the last good
//!   snapshot, mark the rotator [`RotationState::Failed`], and emit an audit
//!   event.
//! - A snapshot is swapped in only after every file parsed and the key
//!   matched the certificate.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::Duration;

use policy_sync_core::SyncAuditSink;
use policy_sync_core::audit::CredentialAuditEvent;
use policy_sync_core::audit::CredentialOutcome;
use rustls::ClientConfig;
use rustls::DigitallySignedStruct;
use rustls::RootCertStore;
use rustls::SignatureScheme;
use rustls::client::ResolvesClientCert;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::client::danger::ServerCertVerified;
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::ServerName;
use rustls_pki_types::UnixTime;
use rustls_pki_types::pem::PemObject;
use serde::Deserialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default credential refresh interval in milliseconds.
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 60_000;
/// Minimum accepted refresh interval in milliseconds.
pub const MIN_REFRESH_INTERVAL_MS: u64 = 100;

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Mutual-TLS credential file configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsCredentialConfig {
    /// Enable TLS with client certificates.
    #[serde(default)]
    pub enabled: bool,
    /// PEM client certificate chain.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,
    /// PEM private key for the client certificate.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// PEM bundle of trusted root certificates.
    #[serde(default)]
    pub root_ca_path: Option<PathBuf>,
    /// Reload interval in milliseconds.
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
}

impl Default for TlsCredentialConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            root_ca_path: None,
            refresh_interval_ms: DEFAULT_REFRESH_INTERVAL_MS,
        }
    }
}

impl TlsCredentialConfig {
    /// Validates the credential configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] when TLS is enabled without all
    /// three paths or when the refresh interval is too short.
    pub fn validate(&self) -> Result<(), CredentialError> {
        if !self.enabled {
            return Ok(());
        }
        self.paths()?;
        if self.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(CredentialError::Config(format!(
                "refresh_interval_ms must be at least {MIN_REFRESH_INTERVAL_MS}"
            )));
        }
        Ok(())
    }

    /// Returns the refresh interval.
    #[must_use]
    pub const fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    /// Resolves the three credential paths.
    fn paths(&self) -> Result<CredentialPaths, CredentialError> {
        let require = |path: &Option<PathBuf>, name: &str| {
            path.clone()
                .ok_or_else(|| CredentialError::Config(format!("tls.{name} is required")))
        };
        Ok(CredentialPaths {
            cert: require(&self.cert_path, "cert_path")?,
            key: require(&self.key_path, "key_path")?,
            roots: require(&self.root_ca_path, "root_ca_path")?,
        })
    }
}

/// Returns the default refresh interval.
const fn default_refresh_interval_ms() -> u64 {
    DEFAULT_REFRESH_INTERVAL_MS
}

/// Resolved credential file locations.
#[derive(Debug, Clone)]
struct CredentialPaths {
    /// Client certificate chain.
    cert: PathBuf,
    /// Client private key.
    key: PathBuf,
    /// Trust-root bundle.
    roots: PathBuf,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Credential loading errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// Invalid credential configuration.
    #[error("tls credential config invalid: {0}")]
    Config(String),
    /// Credential file could not be read.
    #[error("tls credential file {path}: {message}")]
    Io {
        /// File path.
        path: String,
        /// I/O failure description.
        message: String,
    },
    /// Credential file held no usable PEM material.
    #[error("tls credential parse error in {path}: {message}")]
    Parse {
        /// File path.
        path: String,
        /// Parse failure description.
        message: String,
    },
    /// TLS stack rejected the material.
    #[error("tls credential rejected: {0}")]
    Tls(String),
}

// ============================================================================
// SECTION: Snapshot
// ============================================================================

/// Rotator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    /// TLS is not configured.
    Disabled,
    /// The first load succeeded and no reload has run yet.
    Initialized,
    /// The last periodic or manual reload succeeded.
    Rotating,
    /// The last reload failed; the previous snapshot is still live.
    Failed,
}

/// Immutable set of credentials used for handshakes.
pub struct CredentialSnapshot {
    /// Monotonic snapshot generation, starting at 1.
    generation: u64,
    /// Client certificate chain with its signing key.
    certified_key: Arc<CertifiedKey>,
    /// Server certificate verifier over the trust roots.
    verifier: Arc<WebPkiServerVerifier>,
}

impl CredentialSnapshot {
    /// Returns the snapshot generation.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the client certificate chain.
    #[must_use]
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }
}

impl fmt::Debug for CredentialSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSnapshot")
            .field("generation", &self.generation)
            .field("chain_len", &self.certified_key.cert.len())
            .finish_non_exhaustive()
    }
}

/// Loads and validates a snapshot from disk.
fn load_snapshot(
    paths: &CredentialPaths,
    provider: &Arc<CryptoProvider>,
    generation: u64,
) -> Result<CredentialSnapshot, CredentialError> {
    let chain = read_certificates(&paths.cert)?;
    let key_pem = read_file(&paths.key)?;
    let key = PrivateKeyDer::from_pem_slice(&key_pem)
        .map_err(|err| parse_error(&paths.key, &err.to_string()))?;
    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|err| CredentialError::Tls(err.to_string()))?;
    let certified_key = CertifiedKey::new(chain, signing_key);
    certified_key.keys_match().map_err(|err| CredentialError::Tls(err.to_string()))?;

    let mut roots = RootCertStore::empty();
    for cert in read_certificates(&paths.roots)? {
        roots.add(cert).map_err(|err| CredentialError::Tls(err.to_string()))?;
    }
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
        .build()
        .map_err(|err| CredentialError::Tls(err.to_string()))?;

    Ok(CredentialSnapshot {
        generation,
        certified_key: Arc::new(certified_key),
        verifier,
    })
}

/// Reads every PEM certificate in a file; an empty file is an error.
fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let pem = read_file(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| parse_error(path, &err.to_string()))?;
    if certs.is_empty() {
        return Err(parse_error(path, "no certificates found"));
    }
    Ok(certs)
}

/// Reads a credential file.
fn read_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|err| CredentialError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// Builds a parse error for a path.
fn parse_error(path: &Path, message: &str) -> CredentialError {
    CredentialError::Parse {
        path: path.display().to_string(),
        message: message.to_string(),
    }
}

// ============================================================================
// SECTION: Live Handshake Hooks
// ============================================================================

/// Shared rotator state read by handshakes and written by reloads.
struct RotatorShared {
    /// Credential file locations.
    paths: CredentialPaths,
    /// Crypto provider for keys and verification.
    provider: Arc<CryptoProvider>,
    /// Current snapshot.
    current: RwLock<Arc<CredentialSnapshot>>,
    /// Lifecycle state.
    state: Mutex<RotationState>,
    /// Serializes reloads.
    reload: Mutex<()>,
    /// Audit sink for rotation outcomes.
    audit: Arc<dyn SyncAuditSink>,
}

impl RotatorShared {
    /// Returns the current snapshot.
    fn current(&self) -> Arc<CredentialSnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Sets the lifecycle state.
    fn set_state(&self, state: RotationState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Reloads the files and swaps the snapshot on success.
    fn rotate(&self) -> Result<u64, CredentialError> {
        let _reload = self.reload.lock().unwrap_or_else(PoisonError::into_inner);
        let next_generation = self.current().generation + 1;
        match load_snapshot(&self.paths, &self.provider, next_generation) {
            Ok(snapshot) => {
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
                self.set_state(RotationState::Rotating);
                self.audit.record_credential(&CredentialAuditEvent::new(
                    CredentialOutcome::Rotated,
                    next_generation,
                    None,
                ));
                Ok(next_generation)
            }
            Err(err) => {
                self.set_state(RotationState::Failed);
                self.audit.record_credential(&CredentialAuditEvent::new(
                    CredentialOutcome::Failed,
                    next_generation - 1,
                    Some(err.to_string()),
                ));
                Err(err)
            }
        }
    }
}

/// Client certificate resolver backed by the live snapshot.
struct LiveClientCert {
    /// Rotator state.
    shared: Arc<RotatorShared>,
}

impl fmt::Debug for LiveClientCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveClientCert").finish_non_exhaustive()
    }
}

impl ResolvesClientCert for LiveClientCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.shared.current().certified_key))
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Server certificate verifier backed by the live snapshot.
struct LiveServerVerifier {
    /// Rotator state.
    shared: Arc<RotatorShared>,
}

impl fmt::Debug for LiveServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveServerVerifier").finish_non_exhaustive()
    }
}

impl ServerCertVerifier for LiveServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.shared.current().verifier.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.shared.current().verifier.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.shared.current().verifier.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.shared.current().verifier.supported_verify_schemes()
    }
}

// ============================================================================
// SECTION: Rotator
// ============================================================================

/// Periodically reloads mutual-TLS credentials from disk.
pub struct CredentialRotator {
    /// State shared with handshake hooks and the reload task.
    shared: Arc<RotatorShared>,
    /// Stops the reload task.
    cancel: CancellationToken,
    /// Background reload task.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CredentialRotator {
    /// Loads the initial credentials and starts the reload loop on `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the configuration is invalid or the
    /// initial load fails.
    pub fn start(
        config: &TlsCredentialConfig,
        audit: Arc<dyn SyncAuditSink>,
        handle: &Handle,
    ) -> Result<Self, CredentialError> {
        if !config.enabled {
            return Err(CredentialError::Config("tls is disabled".to_string()));
        }
        config.validate()?;
        let paths = config.paths()?;
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let initial = load_snapshot(&paths, &provider, 1)?;
        let shared = Arc::new(RotatorShared {
            paths,
            provider,
            current: RwLock::new(Arc::new(initial)),
            state: Mutex::new(RotationState::Initialized),
            reload: Mutex::new(()),
            audit,
        });
        let cancel = CancellationToken::new();
        let task = spawn_reload_loop(handle, Arc::clone(&shared), cancel.clone(), config.refresh_interval());
        Ok(Self {
            shared,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Reloads the credential files immediately.
    ///
    /// Returns the new snapshot generation.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError`] when the reload fails; the previous
    /// snapshot stays live.
    pub fn rotate_now(&self) -> Result<u64, CredentialError> {
        self.shared.rotate()
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CredentialSnapshot> {
        self.shared.current()
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> RotationState {
        *self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds a TLS client config whose handshakes use the live snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Tls`] when the provider rejects the
    /// default protocol versions.
    pub fn client_config(&self) -> Result<ClientConfig, CredentialError> {
        let verifier = Arc::new(LiveServerVerifier {
            shared: Arc::clone(&self.shared),
        });
        let resolver = Arc::new(LiveClientCert {
            shared: Arc::clone(&self.shared),
        });
        Ok(ClientConfig::builder_with_provider(Arc::clone(&self.shared.provider))
            .with_safe_default_protocol_versions()
            .map_err(|err| CredentialError::Tls(err.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver))
    }

    /// Stops the reload loop. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for CredentialRotator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the periodic reload loop.
fn spawn_reload_loop(
    handle: &Handle,
    shared: Arc<RotatorShared>,
    cancel: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    handle.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let shared = Arc::clone(&shared);
                    // Failures are audited inside rotate.
                    let _ = tokio::task::spawn_blocking(move || shared.rotate()).await;
                }
            }
        }
    })
}
