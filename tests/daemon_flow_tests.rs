use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use freshd::daemon::Daemon;
use freshd::processor::{IndexStats, RepoProcessor, WorkDone};
use freshd::state::RepoState;
use tempfile::TempDir;
use tokio::time::sleep;

mod test_utils;
use test_utils::{ollama_tier, register_repo, test_config, write_tier_file};

/// Processor that counts stage invocations and can be told to fail or
/// dawdle. Backlog counts are fixed at construction.
struct RecordingProcessor {
    items: u64,
    fail_sync: bool,
    delay: Duration,
    pending_enrichment: u64,
    syncs: AtomicU32,
    enriches: AtomicU32,
    embeds: AtomicU32,
}

impl RecordingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: 3,
            fail_sync: false,
            delay: Duration::ZERO,
            pending_enrichment: 0,
            syncs: AtomicU32::new(0),
            enriches: AtomicU32::new(0),
            embeds: AtomicU32::new(0),
        })
    }

    fn failing_sync() -> Arc<Self> {
        Arc::new(Self {
            fail_sync: true,
            ..Self::unwrapped()
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::unwrapped()
        })
    }

    fn with_enrichment_backlog(pending: u64) -> Arc<Self> {
        Arc::new(Self {
            pending_enrichment: pending,
            ..Self::unwrapped()
        })
    }

    fn unwrapped() -> Self {
        Self {
            items: 3,
            fail_sync: false,
            delay: Duration::ZERO,
            pending_enrichment: 0,
            syncs: AtomicU32::new(0),
            enriches: AtomicU32::new(0),
            embeds: AtomicU32::new(0),
        }
    }

    fn syncs(&self) -> u32 {
        self.syncs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoProcessor for RecordingProcessor {
    async fn sync(
        &self,
        _repo: &RepoState,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail_sync {
            return Err("working tree walk failed".into());
        }
        Ok(WorkDone {
            items_processed: self.items,
            had_error: false,
        })
    }

    async fn enrich(
        &self,
        _repo: &RepoState,
        batch_size: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        self.enriches.fetch_add(1, Ordering::SeqCst);
        Ok(WorkDone {
            items_processed: self.pending_enrichment.min(batch_size as u64),
            had_error: false,
        })
    }

    async fn embed(
        &self,
        _repo: &RepoState,
        _limit: usize,
    ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        self.embeds.fetch_add(1, Ordering::SeqCst);
        Ok(WorkDone::default())
    }
}

#[async_trait]
impl IndexStats for RecordingProcessor {
    async fn pending_enrichment_count(
        &self,
        _repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.pending_enrichment)
    }

    async fn pending_embedding_count(
        &self,
        _repo_id: &str,
    ) -> Result<u64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(0)
    }
}

async fn daemon_with(processor: Arc<RecordingProcessor>, dir: &TempDir) -> Daemon {
    let config = test_config(dir);
    write_tier_file(
        &config.backends_file,
        &[ollama_tier("local", "http://127.0.0.1:1", 0)],
    )
    .await;
    Daemon::build(config, processor.clone(), processor)
        .await
        .unwrap()
}

#[tokio::test]
async fn a_change_event_becomes_a_sync_job_after_the_debounce() {
    let dir = TempDir::new().unwrap();
    let processor = RecordingProcessor::new();
    let mut daemon = daemon_with(processor.clone(), &dir).await;
    let repo = register_repo(&daemon.store(), &dir, "repo-a").await;

    // First pass bootstraps the never-synced repo.
    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.jobs_scheduled, 1);
    assert_eq!(processor.syncs(), 1);

    // A change inside its quiet window schedules nothing.
    daemon.change_queue().add(&repo.repo_id).await;
    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.jobs_scheduled, 0);

    // Once the window elapses the change turns into a sync job.
    sleep(Duration::from_millis(1_100)).await;
    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.jobs_scheduled, 1);
    assert_eq!(processor.syncs(), 2);

    let state = daemon.store().get(&repo.repo_id).await.unwrap().unwrap();
    assert!(state.last_synced_at.is_some());
    assert_eq!(state.lease_owner, None);
    assert_eq!(state.consecutive_failures, 0);
}

#[tokio::test]
async fn run_once_waits_for_job_writebacks() {
    let dir = TempDir::new().unwrap();
    let processor = RecordingProcessor::slow(Duration::from_millis(300));
    let mut daemon = daemon_with(processor.clone(), &dir).await;
    let repo = register_repo(&daemon.store(), &dir, "repo-a").await;

    daemon.run_once().await.unwrap();

    // The pass returns only after the spawned job finished its write-back.
    let state = daemon.store().get(&repo.repo_id).await.unwrap().unwrap();
    assert!(state.last_synced_at.is_some());
    assert_eq!(state.lease_owner, None);
}

#[tokio::test]
async fn sync_failures_mark_the_repo_and_release_the_lease() {
    let dir = TempDir::new().unwrap();
    let processor = RecordingProcessor::failing_sync();
    let mut daemon = daemon_with(processor.clone(), &dir).await;
    let repo = register_repo(&daemon.store(), &dir, "repo-a").await;

    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.jobs_scheduled, 1);

    let state = daemon.store().get(&repo.repo_id).await.unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.last_synced_at.is_none());
    assert_eq!(state.lease_owner, None);
}

#[tokio::test]
async fn a_synced_quiet_fleet_schedules_nothing() {
    let dir = TempDir::new().unwrap();
    let processor = RecordingProcessor::new();
    let mut daemon = daemon_with(processor.clone(), &dir).await;
    register_repo(&daemon.store(), &dir, "repo-a").await;

    daemon.run_once().await.unwrap();

    // Synced, unchanged, and inside the idle window: nothing to do.
    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.jobs_scheduled, 0);
    assert_eq!(stats.repos_considered, 1);
    assert_eq!(processor.syncs(), 1);
}

#[tokio::test]
async fn backlog_counts_refresh_from_the_stats_source() {
    let dir = TempDir::new().unwrap();
    let processor = RecordingProcessor::with_enrichment_backlog(7);
    let mut daemon = daemon_with(processor.clone(), &dir).await;
    let repo = register_repo(&daemon.store(), &dir, "repo-a").await;

    let stats = daemon.run_once().await.unwrap();
    assert_eq!(stats.backlog_repos, 1);

    let state = daemon.store().get(&repo.repo_id).await.unwrap().unwrap();
    assert_eq!(state.pending_enrichment_count, 7);
}
