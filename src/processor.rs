//! Interfaces to the indexing pipeline.
//!
//! The daemon never parses files, computes embeddings, or touches the index
//! engine itself. Workers drive those stages through [`RepoProcessor`], and
//! the scheduler reads backlog sizes through [`IndexStats`]. Embedders wire
//! their own implementations; [`NoopProcessor`] is the bundled stand-in the
//! CLI uses when no indexer is attached.

use async_trait::async_trait;

use crate::state::RepoState;

/// What one processor invocation accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkDone {
    /// Items actually processed. Zero marks the repo as idle for this cycle.
    pub items_processed: u64,
    /// Whether some items failed while others succeeded.
    pub had_error: bool,
}

/// Drives the indexing pipeline stages for one repository.
///
/// Implementations must be idempotent per stage: a job abandoned mid-run is
/// re-attempted after its lease expires, so partially completed work must be
/// safe to redo.
#[async_trait]
pub trait RepoProcessor: Send + Sync {
    /// Re-scan the repository and reconcile the index with the working tree.
    async fn sync(
        &self,
        repo: &RepoState,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>>;

    /// Enrich up to `batch_size` pending items (summaries, doc generation).
    async fn enrich(
        &self,
        repo: &RepoState,
        batch_size: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>>;

    /// Embed up to `limit` pending items into the vector index.
    async fn embed(
        &self,
        repo: &RepoState,
        limit: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>>;
}

/// Read-only view of per-repo index backlogs.
#[async_trait]
pub trait IndexStats: Send + Sync {
    async fn pending_enrichment_count(
        &self,
        repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;

    async fn pending_embedding_count(
        &self,
        repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>>;
}

/// Processor that performs no work. Keeps the daemon runnable (and every
/// scheduling path exercisable) without an attached indexer.
pub struct NoopProcessor;

#[async_trait]
impl RepoProcessor for NoopProcessor {
    async fn sync(
        &self,
        _repo: &RepoState,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        Ok(WorkDone::default())
    }

    async fn enrich(
        &self,
        _repo: &RepoState,
        _batch_size: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        Ok(WorkDone::default())
    }

    async fn embed(
        &self,
        _repo: &RepoState,
        _limit: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        Ok(WorkDone::default())
    }
}

#[async_trait]
impl IndexStats for NoopProcessor {
    async fn pending_enrichment_count(
        &self,
        _repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(0)
    }

    async fn pending_embedding_count(
        &self,
        _repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(0)
    }
}
