//! # Index Scheduler
//!
//! Background task that turns debounced change events and periodic idle
//! sweeps into index jobs, while keeping at-most-one job per repository.
//! Each tick merges three eligibility sources: repos whose change events
//! have settled past the debounce window, repos that have never been
//! synced, and repos with pending downstream work whose idle backoff has
//! elapsed. The quieter the fleet, the longer the scheduler sleeps.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::change_queue::ChangeQueue;
use crate::config::{AppConfig, SchedulerConfig};
use crate::error::StateError;
use crate::processor::IndexStats;
use crate::state::{RepoState, RepoStateStore};
use crate::worker::{Job, JobKind, WorkerPool};

/// Scheduler lifecycle, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Background scheduler service.
pub struct Scheduler {
    config: Arc<AppConfig>,
    store: Arc<RepoStateStore>,
    queue: Arc<ChangeQueue>,
    pool: WorkerPool,
    stats_source: Arc<dyn IndexStats>,
    /// Consecutive ticks that scheduled nothing; drives the idle sleep.
    idle_ticks: u32,
    lifecycle: Lifecycle,
}

/// Counters for one scheduler tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TickStats {
    pub repos_considered: u64,
    pub jobs_scheduled: u64,
    pub skipped_running: u64,
    pub skipped_leased: u64,
    pub skipped_not_due: u64,
    pub stat_refresh_errors: u64,
    pub backlog_repos: u64,
}

impl Scheduler {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<RepoStateStore>,
        queue: Arc<ChangeQueue>,
        pool: WorkerPool,
        stats_source: Arc<dyn IndexStats>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            pool,
            stats_source,
            idle_ticks: 0,
            lifecycle: Lifecycle::Starting,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Run the scheduler loop until the shutdown token fires, then drain
    /// the worker pool within the configured grace period.
    #[instrument(skip_all)]
    pub async fn run_forever(&mut self, shutdown: CancellationToken) {
        info!(
            base_interval_seconds = self.config.scheduler.base_interval_seconds,
            max_workers = self.config.pool.max_workers,
            "Starting index scheduler"
        );
        self.lifecycle = Lifecycle::Running;

        loop {
            let sleep_for = compute_idle_sleep(&self.config.scheduler, self.idle_ticks);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Index scheduler shutdown requested");
                    break;
                }
                _ = self.queue.wait(sleep_for) => {
                    let tick_started = Instant::now();
                    match self.tick().await {
                        Ok(stats) => self.settle_idle(&stats),
                        Err(err) => error!(error = %err, "Scheduler tick failed"),
                    }
                    histogram!("freshd_scheduler_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        self.lifecycle = Lifecycle::Draining;
        let grace = StdDuration::from_secs(self.config.pool.drain_grace_seconds);
        self.pool.drain(grace).await;
        self.lifecycle = Lifecycle::Stopped;
        info!("Index scheduler stopped");
    }

    /// Run exactly one tick. Used by the `tick` subcommand and tests.
    pub async fn run_once(&mut self) -> Result<TickStats, StateError> {
        let stats = self.tick().await?;
        self.settle_idle(&stats);
        Ok(stats)
    }

    /// Wait for in-flight jobs to finish; one-shot mode calls this before
    /// exiting.
    pub async fn drain(&self, grace: StdDuration) {
        self.pool.drain(grace).await;
    }

    fn settle_idle(&mut self, stats: &TickStats) {
        if stats.jobs_scheduled > 0 {
            self.idle_ticks = 0;
        } else {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
        }
        gauge!("freshd_scheduler_idle_ticks_gauge").set(self.idle_ticks as f64);
    }

    async fn tick(&mut self) -> Result<TickStats, StateError> {
        let now = Utc::now();
        let mut stats = TickStats::default();

        let changed: HashSet<String> = self.queue.get_ready().await.into_iter().collect();
        let running = self.pool.running_repo_ids();
        let repos = self.store.load_all().await?;

        let mut jobs = Vec::new();
        for repo in repos {
            stats.repos_considered += 1;

            if running.contains(&repo.repo_id) {
                stats.skipped_running += 1;
                debug!(repo_id = %repo.repo_id, "Job already in flight; skipping");
                continue;
            }
            if repo.has_live_lease(now) {
                stats.skipped_leased += 1;
                debug!(repo_id = %repo.repo_id, "Lease held elsewhere; skipping");
                continue;
            }

            let repo = self.refresh_pending_counts(repo, &mut stats).await;
            if repo.pending_total() > 0 {
                stats.backlog_repos += 1;
            }

            match next_job_kind(&repo, changed.contains(&repo.repo_id), &self.config.scheduler, now)
            {
                Some(kind) => {
                    let metric_labels = vec![("kind", kind.as_str().to_string())];
                    counter!("freshd_jobs_scheduled_total", &metric_labels).increment(1);
                    jobs.push(Job::new(repo.repo_id.clone(), kind));
                    stats.jobs_scheduled += 1;
                }
                None => {
                    stats.skipped_not_due += 1;
                }
            }
        }

        gauge!("freshd_scheduler_backlog_gauge").set(stats.backlog_repos as f64);

        if !jobs.is_empty() {
            self.pool.submit_jobs(jobs).await;
        }

        debug!(
            considered = stats.repos_considered,
            scheduled = stats.jobs_scheduled,
            skipped_running = stats.skipped_running,
            skipped_leased = stats.skipped_leased,
            skipped_not_due = stats.skipped_not_due,
            backlog = stats.backlog_repos,
            stat_errors = stats.stat_refresh_errors,
            "Scheduler tick completed"
        );

        Ok(stats)
    }

    /// Pull fresh backlog counts from the index; fall back to the stored
    /// values when the source is unavailable.
    async fn refresh_pending_counts(&self, repo: RepoState, stats: &mut TickStats) -> RepoState {
        let enrich = self
            .stats_source
            .pending_enrichment_count(&repo.repo_id)
            .await;
        let embed = self
            .stats_source
            .pending_embedding_count(&repo.repo_id)
            .await;

        let (enrich, embed) = match (enrich, embed) {
            (Ok(enrich), Ok(embed)) => (enrich, embed),
            (enrich, embed) => {
                stats.stat_refresh_errors += 1;
                warn!(
                    repo_id = %repo.repo_id,
                    enrich_err = enrich.as_ref().err().map(|e| e.to_string()),
                    embed_err = embed.as_ref().err().map(|e| e.to_string()),
                    "Failed to refresh pending counts; using stored values"
                );
                return repo;
            }
        };

        if enrich == repo.pending_enrichment_count && embed == repo.pending_embedding_count {
            return repo;
        }

        match self
            .store
            .update(&repo.repo_id, |state| {
                state.pending_enrichment_count = enrich;
                state.pending_embedding_count = embed;
            })
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                warn!(repo_id = %repo.repo_id, error = %err, "Failed to persist pending counts");
                repo
            }
        }
    }
}

/// Pick the job a repo needs most, if any. Pipeline order decides when
/// several stages are due at once: a changed or never-synced repo syncs
/// first, then enrichment, then embedding.
fn next_job_kind(
    repo: &RepoState,
    changed: bool,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Option<JobKind> {
    if changed || repo.last_synced_at.is_none() {
        return Some(JobKind::Sync);
    }
    if !idle_due(repo, config, now) {
        return None;
    }
    if repo.pending_enrichment_count > 0 {
        return Some(JobKind::Enrich);
    }
    if repo.pending_embedding_count > 0 {
        return Some(JobKind::Embed);
    }
    None
}

/// Whether a repo's per-repo idle backoff has elapsed since its last
/// completed work.
fn idle_due(repo: &RepoState, config: &SchedulerConfig, now: DateTime<Utc>) -> bool {
    let last_activity = [
        repo.last_synced_at,
        repo.last_enriched_at,
        repo.last_embedded_at,
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(repo.registered_at);

    let multiplier = config
        .idle_backoff_base
        .powi(repo.idle_cycles as i32)
        .min(config.idle_backoff_max_multiplier);
    let interval_ms = (config.base_interval_seconds as f64 * multiplier * 1_000.0) as i64;
    now >= last_activity + Duration::milliseconds(interval_ms)
}

/// Sleep between ticks: the base interval stretched by consecutive idle
/// ticks, capped at `idle_backoff_max_multiplier` times the base.
fn compute_idle_sleep(config: &SchedulerConfig, idle_ticks: u32) -> StdDuration {
    let multiplier = config
        .idle_backoff_base
        .powi(idle_ticks as i32)
        .min(config.idle_backoff_max_multiplier);
    StdDuration::from_secs_f64(config.base_interval_seconds as f64 * multiplier)
}
