//! Error types shared across the daemon.
//!
//! Subsystem-specific errors live next to their subsystems ([`ConfigError`]
//! with the config loader, [`BackendError`] with the backend trait); this
//! module holds the state-layer errors and the top-level composition error.
//!
//! [`ConfigError`]: crate::config::ConfigError
//! [`BackendError`]: crate::backends::BackendError

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the repo state store and the cost ledger.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt state record at {path} (quarantined as {quarantined}): {detail}")]
    Corrupt {
        path: PathBuf,
        quarantined: PathBuf,
        detail: String,
    },
    #[error("unknown repo '{repo_id}'")]
    UnknownRepo { repo_id: String },
    #[error("repo '{repo_id}' is already registered at {path}")]
    AlreadyRegistered { repo_id: String, path: PathBuf },
    #[error("repo path {path} does not exist or is not a directory")]
    InvalidRepoPath { path: PathBuf },
    #[error("failed to encode state record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level error for daemon startup and command execution.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Telemetry(#[from] crate::telemetry::TelemetryInitError),
    #[error(transparent)]
    Registry(#[from] crate::backends::RegistryError),
    #[error("no enabled backend tiers configured; enrichment cannot run")]
    NoEnabledTiers,
}
