//! File-backed repo state store.
//!
//! Each repo owns one JSON record under `<state_dir>/repos/`. Writes go
//! through a per-record async lock and land via temp-file rename, so a crash
//! mid-write never leaves a torn record. Records that fail to parse are
//! quarantined (renamed aside) and the repo is treated as unknown; the store
//! keeps serving every other record.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::StateError;
use crate::state::repo::RepoState;

/// Store for per-repo freshness records.
pub struct RepoStateStore {
    repos_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RepoStateStore {
    /// Open (creating if needed) the store rooted at `state_dir`.
    pub async fn open(state_dir: &Path) -> Result<Self, StateError> {
        let repos_dir = state_dir.join("repos");
        fs::create_dir_all(&repos_dir)
            .await
            .map_err(|source| StateError::CreateDir {
                path: repos_dir.clone(),
                source,
            })?;
        Ok(Self {
            repos_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Register the repository rooted at `path`, creating its record.
    pub async fn register(&self, path: &Path, now: DateTime<Utc>) -> Result<RepoState, StateError> {
        let canonical = fs::canonicalize(path)
            .await
            .map_err(|_| StateError::InvalidRepoPath {
                path: path.to_path_buf(),
            })?;
        let metadata = fs::metadata(&canonical)
            .await
            .map_err(|_| StateError::InvalidRepoPath {
                path: canonical.clone(),
            })?;
        if !metadata.is_dir() {
            return Err(StateError::InvalidRepoPath { path: canonical });
        }

        let state = RepoState::new(&canonical, now);
        let lock = self.record_lock(&state.repo_id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.load_record(&self.record_path(&state.repo_id)).await? {
            return Err(StateError::AlreadyRegistered {
                repo_id: existing.repo_id,
                path: existing.path,
            });
        }

        self.write_atomic(&state).await?;
        info!(repo_id = %state.repo_id, path = %state.path.display(), "Registered repository");
        Ok(state)
    }

    /// Fetch a repo's record. Corrupt records are quarantined and reported
    /// as absent.
    pub async fn get(&self, repo_id: &str) -> Result<Option<RepoState>, StateError> {
        match self.load_record(&self.record_path(repo_id)).await {
            Ok(state) => Ok(state),
            Err(err @ StateError::Corrupt { .. }) => {
                error!(repo_id, error = %err, "Quarantined corrupt state record");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Write a record unconditionally.
    pub async fn upsert(&self, state: &RepoState) -> Result<(), StateError> {
        let lock = self.record_lock(&state.repo_id).await;
        let _guard = lock.lock().await;
        self.write_atomic(state).await
    }

    /// Load, mutate, and persist a record under its lock. This is the only
    /// read-modify-write path, so concurrent updates serialize here.
    pub async fn update<F>(&self, repo_id: &str, mutate: F) -> Result<RepoState, StateError>
    where
        F: FnOnce(&mut RepoState),
    {
        let lock = self.record_lock(repo_id).await;
        let _guard = lock.lock().await;

        let mut state = self
            .load_record(&self.record_path(repo_id))
            .await?
            .ok_or_else(|| StateError::UnknownRepo {
                repo_id: repo_id.to_string(),
            })?;
        mutate(&mut state);
        self.write_atomic(&state).await?;
        Ok(state)
    }

    /// Grant `owner` the repo's lease unless a live lease already exists.
    pub async fn try_acquire_lease(
        &self,
        repo_id: &str,
        owner: Uuid,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StateError> {
        let lock = self.record_lock(repo_id).await;
        let _guard = lock.lock().await;

        let mut state = self
            .load_record(&self.record_path(repo_id))
            .await?
            .ok_or_else(|| StateError::UnknownRepo {
                repo_id: repo_id.to_string(),
            })?;

        if state.has_live_lease(now) {
            return Ok(false);
        }

        state.grant_lease(owner, ttl, now);
        self.write_atomic(&state).await?;
        Ok(true)
    }

    /// Release the lease if `owner` still holds it. A mismatched owner means
    /// the lease expired and was reclaimed; that is logged, not an error.
    pub async fn release_lease(&self, repo_id: &str, owner: Uuid) -> Result<(), StateError> {
        let lock = self.record_lock(repo_id).await;
        let _guard = lock.lock().await;

        let Some(mut state) = self.load_record(&self.record_path(repo_id)).await? else {
            warn!(repo_id, "Lease release for unknown repo");
            return Ok(());
        };

        if state.lease_owner != Some(owner) {
            warn!(
                repo_id,
                lease_owner = ?state.lease_owner,
                "Lease no longer held by releasing worker; leaving record untouched"
            );
            return Ok(());
        }

        state.clear_lease();
        self.write_atomic(&state).await
    }

    /// Load every readable record, sorted by repo ID. Corrupt records are
    /// quarantined and skipped.
    pub async fn load_all(&self) -> Result<Vec<RepoState>, StateError> {
        let mut entries =
            fs::read_dir(&self.repos_dir)
                .await
                .map_err(|source| StateError::Read {
                    path: self.repos_dir.clone(),
                    source,
                })?;

        let mut states = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StateError::Read {
                path: self.repos_dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.load_record(&path).await {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(err @ StateError::Corrupt { .. }) => {
                    error!(path = %path.display(), error = %err, "Quarantined corrupt state record");
                }
                Err(err) => return Err(err),
            }
        }

        states.sort_by(|a, b| a.repo_id.cmp(&b.repo_id));
        Ok(states)
    }

    /// Delete a repo's record. Returns whether a record existed.
    pub async fn remove(&self, repo_id: &str) -> Result<bool, StateError> {
        let lock = self.record_lock(repo_id).await;
        let _guard = lock.lock().await;

        let path = self.record_path(repo_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StateError::Write { path, source }),
        }
    }

    /// Clear leases whose expiry has passed. Run at startup so leases left
    /// behind by an unclean shutdown never block scheduling.
    pub async fn expire_stale_leases(&self, now: DateTime<Utc>) -> Result<u32, StateError> {
        let mut cleared = 0;
        for state in self.load_all().await? {
            if state.lease_owner.is_some() && !state.has_live_lease(now) {
                self.update(&state.repo_id, |record| record.clear_lease())
                    .await?;
                info!(repo_id = %state.repo_id, "Cleared stale lease");
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    fn record_path(&self, repo_id: &str) -> PathBuf {
        self.repos_dir.join(format!("{repo_id}.json"))
    }

    async fn record_lock(&self, repo_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(repo_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_record(&self, path: &Path) -> Result<Option<RepoState>, StateError> {
        let raw = match fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                let quarantined = self.quarantine(path).await?;
                Err(StateError::Corrupt {
                    path: path.to_path_buf(),
                    quarantined,
                    detail: err.to_string(),
                })
            }
        }
    }

    async fn quarantine(&self, path: &Path) -> Result<PathBuf, StateError> {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_string());
        let quarantined =
            path.with_file_name(format!("{}.corrupt-{}", file_name, Utc::now().timestamp()));
        fs::rename(path, &quarantined)
            .await
            .map_err(|source| StateError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(quarantined)
    }

    async fn write_atomic(&self, state: &RepoState) -> Result<(), StateError> {
        let path = self.record_path(&state.repo_id);
        let tmp = path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(state)?;

        fs::write(&tmp, encoded)
            .await
            .map_err(|source| StateError::Write {
                path: tmp.clone(),
                source,
            })?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|source| StateError::Write { path, source })
    }
}
