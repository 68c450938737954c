// crates/policy-sync-config/src/config.rs
// ============================================================================
// Module: Policy Sync Configuration
// Description: Configuration loading and validation for the policy adapter.
// Purpose: Provide strict, fail-closed config parsing with hard limits.
// Dependencies: policy-sync-core, policy-sync-jetstream, serde, toml, url
// ============================================================================

//! ## Overview
//! Configuration is loaded from a TOML file with strict size and path limits.
//! The path comes from the caller, then `POLICY_SYNC_CONFIG`, then
//! `policy-sync.toml` in the working directory. Every section has defaults,
//! so an empty file describes a plaintext connection to a local server.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use policy_sync_core::FileAuditSink;
use policy_sync_core::NoopAuditSink;
use policy_sync_core::PolicySyncAdapter;
use policy_sync_core::StderrAuditSink;
use policy_sync_core::SyncAuditSink;
use policy_sync_core::SyncOptions;
use policy_sync_jetstream::JetStreamError;
use policy_sync_jetstream::JetStreamStoreConfig;
use policy_sync_jetstream::open_adapter;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default configuration filename when no path is specified.
const DEFAULT_CONFIG_NAME: &str = "policy-sync.toml";
/// Environment variable used to override the config path.
pub const CONFIG_ENV_VAR: &str = "POLICY_SYNC_CONFIG";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_SIZE: usize = 1024 * 1024;
/// Maximum length of a single path component.
pub const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum total path length.
pub const MAX_TOTAL_PATH_LENGTH: usize = 4096;
/// Maximum configurable store concurrency.
pub const MAX_SYNC_CONCURRENCY: usize = 1024;
/// Server URL schemes the client is built to dial.
const ALLOWED_URL_SCHEMES: [&str; 2] = ["nats", "tls"];

// ============================================================================
// SECTION: Config Model
// ============================================================================

/// Policy adapter configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// JetStream store configuration.
    #[serde(default)]
    pub store: JetStreamStoreConfig,
    /// Synchronization engine options.
    #[serde(default)]
    pub sync: SyncOptions,
    /// Audit sink configuration.
    #[serde(default)]
    pub audit: AuditConfig,
}

impl AdapterConfig {
    /// Loads configuration from disk using the default resolution rules.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when loading or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_path(path);
        check_path_limits("config path", &resolved)?;
        let bytes = fs::read(&resolved).map_err(|err| ConfigError::Io(err.to_string()))?;
        if bytes.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
        }
        let content = std::str::from_utf8(&bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml(content)
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when parsing or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_store(&self.store)?;
        validate_sync(&self.sync)?;
        self.audit.validate()?;
        Ok(())
    }

    /// Builds the audit sink and connects an adapter for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the audit log cannot be opened or the
    /// store cannot be connected.
    pub fn open_adapter(&self) -> Result<PolicySyncAdapter, ConfigError> {
        let audit = self.audit.build_sink().map_err(|err| ConfigError::Io(err.to_string()))?;
        Ok(open_adapter(&self.store, self.sync, audit)?)
    }
}

/// Audit sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Enable audit events.
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Append events to this file instead of stderr.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: None,
        }
    }
}

impl AuditConfig {
    /// Validates the audit configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            validate_path_string("audit.path", path)?;
        }
        Ok(())
    }

    /// Builds the configured audit sink.
    ///
    /// # Errors
    ///
    /// Returns an error when the audit file cannot be opened.
    pub fn build_sink(&self) -> io::Result<Arc<dyn SyncAuditSink>> {
        if !self.enabled {
            return Ok(Arc::new(NoopAuditSink));
        }
        match &self.path {
            Some(path) => Ok(Arc::new(FileAuditSink::new(Path::new(path.trim()))?)),
            None => Ok(Arc::new(StderrAuditSink)),
        }
    }
}

/// Returns the default audit toggle.
const fn default_audit_enabled() -> bool {
    true
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O failure while reading configuration.
    #[error("config io error: {0}")]
    Io(String),
    /// TOML parsing error.
    #[error("config parse error: {0}")]
    Parse(String),
    /// Invalid configuration data.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Store connection failed.
    #[error(transparent)]
    Store(#[from] JetStreamError),
}

// ============================================================================
// SECTION: Validation
// ============================================================================

/// Validates the store section.
fn validate_store(store: &JetStreamStoreConfig) -> Result<(), ConfigError> {
    let url = Url::parse(store.url.trim())
        .map_err(|err| ConfigError::Invalid(format!("store.url is invalid: {err}")))?;
    if !ALLOWED_URL_SCHEMES.contains(&url.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "store.url scheme must be one of {}",
            ALLOWED_URL_SCHEMES.join(", ")
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::Invalid("store.url must include a host".to_string()));
    }
    store.validate().map_err(|err| ConfigError::Invalid(err.to_string()))?;
    let tls = &store.tls;
    for (field, path) in [
        ("store.tls.cert_path", &tls.cert_path),
        ("store.tls.key_path", &tls.key_path),
        ("store.tls.root_ca_path", &tls.root_ca_path),
    ] {
        if let Some(path) = path {
            validate_path_string(field, &path.to_string_lossy())?;
        }
    }
    Ok(())
}

/// Validates the sync section.
fn validate_sync(sync: &SyncOptions) -> Result<(), ConfigError> {
    if sync.max_concurrency == 0 || sync.max_concurrency > MAX_SYNC_CONCURRENCY {
        return Err(ConfigError::Invalid(format!(
            "sync.max_concurrency must be between 1 and {MAX_SYNC_CONCURRENCY}"
        )));
    }
    Ok(())
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Resolves the config path: caller, then environment, then default name.
fn resolve_path(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_NAME))
}

/// Validates a non-empty path string taken from a config field.
fn validate_path_string(field: &str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{field} must be non-empty")));
    }
    check_path_limits(field, Path::new(trimmed))
}

/// Rejects paths over the total or per-component length limits.
fn check_path_limits(label: &str, path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().len() > MAX_TOTAL_PATH_LENGTH {
        return Err(ConfigError::Invalid(format!("{label} exceeds max length")));
    }
    if path.components().any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH) {
        return Err(ConfigError::Invalid(format!("{label} component too long")));
    }
    Ok(())
}
