//! Per-repository freshness record.
//!
//! One [`RepoState`] exists per registered repository. It tracks pipeline
//! watermarks, pending work counts, idle cycling, and the worker lease. The
//! record is serialized losslessly to a single JSON file by the store; all
//! mutation goes through [`RepoStateStore::update`] and the lease helpers.
//!
//! [`RepoStateStore::update`]: crate::state::store::RepoStateStore::update

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Freshness state for one registered repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoState {
    /// Stable identifier derived from the repository path.
    pub repo_id: String,
    pub path: PathBuf,
    pub display_name: String,
    pub registered_at: DateTime<Utc>,
    /// Completion time of the last successful sync job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Completion time of the last successful enrichment job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_enriched_at: Option<DateTime<Utc>>,
    /// Completion time of the last successful embedding job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_embedded_at: Option<DateTime<Utc>>,
    /// Worker currently holding this repo, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Consecutive finished jobs that processed zero items.
    #[serde(default)]
    pub idle_cycles: u32,
    #[serde(default)]
    pub pending_enrichment_count: u64,
    #[serde(default)]
    pub pending_embedding_count: u64,
    /// Consecutive jobs that reported an error for this repo.
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl RepoState {
    /// Create a fresh record for a repository rooted at `path`.
    pub fn new(path: &Path, now: DateTime<Utc>) -> Self {
        Self {
            repo_id: derive_repo_id(path),
            path: path.to_path_buf(),
            display_name: display_name_for(path),
            registered_at: now,
            last_synced_at: None,
            last_enriched_at: None,
            last_embedded_at: None,
            lease_owner: None,
            lease_expires_at: None,
            idle_cycles: 0,
            pending_enrichment_count: 0,
            pending_embedding_count: 0,
            consecutive_failures: 0,
        }
    }

    /// Whether a lease exists and has not yet expired.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        match (self.lease_owner, self.lease_expires_at) {
            (Some(_), Some(expires_at)) => expires_at > now,
            _ => false,
        }
    }

    /// Grant a lease to `owner` lasting `ttl` from `now`.
    pub fn grant_lease(&mut self, owner: Uuid, ttl: Duration, now: DateTime<Utc>) {
        self.lease_owner = Some(owner);
        self.lease_expires_at = Some(now + ttl);
    }

    /// Drop the lease regardless of owner.
    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }

    /// Total pending work across both downstream stages.
    pub fn pending_total(&self) -> u64 {
        self.pending_enrichment_count + self.pending_embedding_count
    }
}

/// Derive the stable repo ID for a path: slugified directory name plus the
/// first eight hex characters of the path's SHA-256 digest.
///
/// The digest suffix keeps IDs distinct when two repos share a directory
/// name; the slug prefix keeps them readable in logs and CLI output.
pub fn derive_repo_id(path: &Path) -> String {
    format!("{}-{}", slugify(&display_name_for(path)), path_digest(path))
}

fn display_name_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string())
}

fn path_digest(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "repo".to_string()
    } else {
        trimmed.to_string()
    }
}
