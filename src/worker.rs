//! Bounded-concurrency execution of index jobs.
//!
//! The scheduler hands batches of [`Job`]s to the [`WorkerPool`]; each job
//! runs on its own task under a shared semaphore. Per-repo exclusivity is
//! enforced twice: an in-process running set catches same-tick duplicates,
//! and the persisted lease in [`RepoStateStore`] serializes repos across
//! restarts and unclean shutdowns. A job failure is recorded on the repo
//! record and never propagates out of the pool.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{SchedulerConfig, WorkerPoolConfig};
use crate::processor::{RepoProcessor, WorkDone};
use crate::state::RepoStateStore;
use crate::telemetry::{with_job_context, JobContext};

/// Pipeline stage a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Sync,
    Enrich,
    Embed,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Sync => "sync",
            JobKind::Enrich => "enrich",
            JobKind::Embed => "embed",
        }
    }
}

/// One unit of scheduled work. Jobs are ephemeral: they exist only
/// in-process, and a lost job is simply rebuilt on a later tick.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: Uuid,
    pub repo_id: String,
    pub kind: JobKind,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(repo_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            repo_id: repo_id.into(),
            kind,
            attempt: 1,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    store: Arc<RepoStateStore>,
    processor: Arc<dyn RepoProcessor>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<String>>>,
    tracker: TaskTracker,
    job_timeout: Duration,
    lease_ttl: chrono::Duration,
    enrich_batch_size: usize,
    embed_limit: usize,
}

impl WorkerPool {
    pub fn new(
        store: Arc<RepoStateStore>,
        processor: Arc<dyn RepoProcessor>,
        pool_config: &WorkerPoolConfig,
        scheduler_config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            permits: Arc::new(Semaphore::new(pool_config.max_workers)),
            running: Arc::new(Mutex::new(HashSet::new())),
            tracker: TaskTracker::new(),
            job_timeout: Duration::from_secs(pool_config.job_timeout_seconds),
            lease_ttl: chrono::Duration::seconds(pool_config.lease_ttl_seconds as i64),
            enrich_batch_size: scheduler_config.enrich_batch_size,
            embed_limit: scheduler_config.embed_limit,
        }
    }

    /// Submit a batch of jobs, blocking while the pool is saturated.
    pub async fn submit_jobs(&self, jobs: Vec<Job>) {
        for job in jobs {
            self.submit(job).await;
        }
    }

    /// Repos with a job currently in flight in this process.
    pub fn running_repo_ids(&self) -> HashSet<String> {
        self.running_set().clone()
    }

    /// Wait up to `grace` for in-flight jobs to finish. Jobs still running
    /// afterwards are abandoned; their leases expire by TTL and the work is
    /// rebuilt on a later tick.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                still_running = self.running_set().len(),
                grace_secs = grace.as_secs(),
                "Drain grace expired; abandoning in-flight jobs"
            );
        }
    }

    async fn submit(&self, job: Job) {
        // Mark the repo running before spawning so the next scheduler tick
        // already sees it.
        if !self.running_set().insert(job.repo_id.clone()) {
            debug!(
                repo_id = %job.repo_id,
                kind = job.kind.as_str(),
                "Repo already has a job in flight; skipping"
            );
            return;
        }

        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.running_set().remove(&job.repo_id);
                return;
            }
        };

        let worker = self.clone();
        let context = JobContext {
            job_id: job.job_id.to_string(),
            repo_id: job.repo_id.clone(),
        };
        self.tracker.spawn(async move {
            let _permit = permit;
            with_job_context(context, worker.run_job(job)).await;
        });
    }

    async fn run_job(&self, job: Job) {
        let started = std::time::Instant::now();
        let repo_id = job.repo_id.clone();

        // Clear the running marker on every exit path.
        let running = Arc::clone(&self.running);
        let _running_guard = scopeguard::guard(repo_id.clone(), move |id| {
            running
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&id);
        });

        let owner = job.job_id;
        match self
            .store
            .try_acquire_lease(&repo_id, owner, self.lease_ttl, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                counter!("freshd_lease_conflicts_total").increment(1);
                debug!(
                    repo_id,
                    kind = job.kind.as_str(),
                    "Lease held elsewhere; skipping job"
                );
                return;
            }
            Err(err) => {
                error!(repo_id, error = %err, "Failed to acquire lease; skipping job");
                return;
            }
        }

        let metric_labels = vec![("kind", job.kind.as_str().to_string())];
        counter!("freshd_jobs_started_total", &metric_labels).increment(1);
        info!(
            kind = job.kind.as_str(),
            attempt = job.attempt,
            "Starting index job"
        );

        let outcome = self.execute(&job).await;
        histogram!("freshd_job_duration_ms", &metric_labels)
            .record(started.elapsed().as_millis() as f64);

        match outcome {
            Ok(done) => {
                counter!("freshd_jobs_completed_total", &metric_labels).increment(1);
                info!(
                    kind = job.kind.as_str(),
                    items_processed = done.items_processed,
                    had_error = done.had_error,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Index job completed"
                );
                if let Err(err) = self.record_success(&job, done).await {
                    error!(repo_id, error = %err, "Failed to write back job result");
                }
            }
            Err(err) => {
                counter!("freshd_jobs_failed_total", &metric_labels).increment(1);
                warn!(
                    kind = job.kind.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "Index job failed"
                );
                if let Err(err) = self.record_failure(&job).await {
                    error!(repo_id, error = %err, "Failed to record job failure");
                }
            }
        }

        if let Err(err) = self.store.release_lease(&repo_id, owner).await {
            error!(repo_id, error = %err, "Failed to release lease");
        }
    }

    /// Dispatch to the processor on a task of its own, so a panicking
    /// processor is contained and the lease still gets released.
    async fn execute(&self, job: &Job) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
        let Some(repo) = self.store.get(&job.repo_id).await? else {
            return Err(format!("repo {} is not registered", job.repo_id).into());
        };

        let processor = Arc::clone(&self.processor);
        let kind = job.kind;
        let enrich_batch_size = self.enrich_batch_size;
        let embed_limit = self.embed_limit;
        let handle = tokio::spawn(async move {
            match kind {
                JobKind::Sync => processor.sync(&repo).await,
                JobKind::Enrich => processor.enrich(&repo, enrich_batch_size).await,
                JobKind::Embed => processor.embed(&repo, embed_limit).await,
            }
        });

        let aborter = handle.abort_handle();
        match tokio::time::timeout(self.job_timeout, handle).await {
            Err(_elapsed) => {
                aborter.abort();
                counter!("freshd_jobs_timed_out_total").increment(1);
                Err(format!("job timed out after {}s", self.job_timeout.as_secs()).into())
            }
            Ok(Err(join_error)) => Err(format!("job crashed: {join_error}").into()),
            Ok(Ok(result)) => result,
        }
    }

    async fn record_success(
        &self,
        job: &Job,
        done: WorkDone,
    ) -> Result<(), crate::error::StateError> {
        let now = Utc::now();
        let kind = job.kind;
        self.store
            .update(&job.repo_id, |repo| {
                match kind {
                    JobKind::Sync => repo.last_synced_at = Some(now),
                    JobKind::Enrich => {
                        repo.last_enriched_at = Some(now);
                        repo.pending_enrichment_count = repo
                            .pending_enrichment_count
                            .saturating_sub(done.items_processed);
                    }
                    JobKind::Embed => {
                        repo.last_embedded_at = Some(now);
                        repo.pending_embedding_count = repo
                            .pending_embedding_count
                            .saturating_sub(done.items_processed);
                    }
                }
                if done.items_processed > 0 {
                    repo.idle_cycles = 0;
                } else {
                    repo.idle_cycles = repo.idle_cycles.saturating_add(1);
                }
                if done.had_error {
                    repo.consecutive_failures = repo.consecutive_failures.saturating_add(1);
                } else {
                    repo.consecutive_failures = 0;
                }
            })
            .await
            .map(|_| ())
    }

    async fn record_failure(&self, job: &Job) -> Result<(), crate::error::StateError> {
        self.store
            .update(&job.repo_id, |repo| {
                repo.consecutive_failures = repo.consecutive_failures.saturating_add(1);
                repo.idle_cycles = repo.idle_cycles.saturating_add(1);
            })
            .await
            .map(|_| ())
    }

    fn running_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("available_permits", &self.permits.available_permits())
            .field("running", &self.running_set().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RepoState;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockProcessor {
        items: u64,
        had_error: bool,
        fail: bool,
        panic: bool,
        delay: Option<Duration>,
        calls: AtomicU32,
    }

    impl MockProcessor {
        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn respond(
            &self,
        ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.panic {
                panic!("processor exploded");
            }
            if self.fail {
                return Err("index backend unavailable".into());
            }
            Ok(WorkDone {
                items_processed: self.items,
                had_error: self.had_error,
            })
        }
    }

    #[async_trait]
    impl RepoProcessor for MockProcessor {
        async fn sync(
            &self,
            _repo: &RepoState,
        ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
            self.respond().await
        }

        async fn enrich(
            &self,
            _repo: &RepoState,
            _batch_size: usize,
        ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
            self.respond().await
        }

        async fn embed(
            &self,
            _repo: &RepoState,
            _limit: usize,
        ) -> Result<WorkDone, Box<dyn std::error::Error + Send + Sync>> {
            self.respond().await
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<RepoStateStore>,
        processor: Arc<MockProcessor>,
        pool: WorkerPool,
    }

    async fn harness(processor: MockProcessor) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RepoStateStore::open(dir.path()).await.unwrap());
        let processor = Arc::new(processor);
        let pool_config = WorkerPoolConfig {
            max_workers: 4,
            job_timeout_seconds: 1,
            lease_ttl_seconds: 30,
            drain_grace_seconds: 5,
        };
        let pool = WorkerPool::new(
            store.clone(),
            processor.clone(),
            &pool_config,
            &SchedulerConfig::default(),
        );
        Harness {
            _dir: dir,
            store,
            processor,
            pool,
        }
    }

    async fn register_repo(store: &RepoStateStore, dir: &TempDir, name: &str) -> String {
        let repo_path = dir.path().join(name);
        tokio::fs::create_dir_all(&repo_path).await.unwrap();
        store
            .register(&repo_path, Utc::now())
            .await
            .unwrap()
            .repo_id
    }

    #[tokio::test]
    async fn success_updates_watermarks_and_releases_lease() {
        let h = harness(MockProcessor {
            items: 4,
            ..Default::default()
        })
        .await;
        let repo_id = register_repo(&h.store, &h._dir, "alpha").await;
        h.store
            .update(&repo_id, |repo| {
                repo.pending_enrichment_count = 10;
                repo.idle_cycles = 3;
            })
            .await
            .unwrap();

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Enrich)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert!(repo.last_enriched_at.is_some());
        assert_eq!(repo.pending_enrichment_count, 6);
        assert_eq!(repo.idle_cycles, 0);
        assert_eq!(repo.consecutive_failures, 0);
        assert_eq!(repo.lease_owner, None);
        assert_eq!(h.processor.calls(), 1);
    }

    #[tokio::test]
    async fn live_lease_skips_the_job() {
        let h = harness(MockProcessor::default()).await;
        let repo_id = register_repo(&h.store, &h._dir, "beta").await;

        let other_owner = Uuid::new_v4();
        assert!(h
            .store
            .try_acquire_lease(&repo_id, other_owner, chrono::Duration::seconds(60), Utc::now())
            .await
            .unwrap());

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Sync)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        assert_eq!(h.processor.calls(), 0);
        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert_eq!(repo.lease_owner, Some(other_owner));
    }

    #[tokio::test]
    async fn failure_is_recorded_and_contained() {
        let h = harness(MockProcessor {
            fail: true,
            ..Default::default()
        })
        .await;
        let repo_id = register_repo(&h.store, &h._dir, "gamma").await;

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Sync)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert_eq!(repo.consecutive_failures, 1);
        assert_eq!(repo.lease_owner, None);
        assert_eq!(repo.last_synced_at, None);
    }

    #[tokio::test]
    async fn panicking_processor_still_releases_the_lease() {
        let h = harness(MockProcessor {
            panic: true,
            ..Default::default()
        })
        .await;
        let repo_id = register_repo(&h.store, &h._dir, "delta").await;

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Embed)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert_eq!(repo.lease_owner, None);
        assert_eq!(repo.consecutive_failures, 1);
        assert!(h.pool.running_repo_ids().is_empty());
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let h = harness(MockProcessor {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        })
        .await;
        let repo_id = register_repo(&h.store, &h._dir, "epsilon").await;

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Sync)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert_eq!(repo.consecutive_failures, 1);
        assert_eq!(repo.lease_owner, None);
        assert_eq!(repo.last_synced_at, None);
    }

    #[tokio::test]
    async fn same_repo_jobs_in_one_batch_run_once() {
        let h = harness(MockProcessor {
            items: 1,
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .await;
        let repo_id = register_repo(&h.store, &h._dir, "zeta").await;

        h.pool
            .submit_jobs(vec![
                Job::new(repo_id.clone(), JobKind::Sync),
                Job::new(repo_id.clone(), JobKind::Sync),
            ])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        assert_eq!(h.processor.calls(), 1);
    }

    #[tokio::test]
    async fn zero_item_job_increments_idle_cycles() {
        let h = harness(MockProcessor::default()).await;
        let repo_id = register_repo(&h.store, &h._dir, "eta").await;

        h.pool
            .submit_jobs(vec![Job::new(repo_id.clone(), JobKind::Sync)])
            .await;
        h.pool.drain(Duration::from_secs(5)).await;

        let repo = h.store.get(&repo_id).await.unwrap().unwrap();
        assert_eq!(repo.idle_cycles, 1);
        assert!(repo.last_synced_at.is_some());
    }
}
