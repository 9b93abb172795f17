//! Daemon assembly and lifecycle.
//!
//! Wires configuration, state store, change queue, backend tiers, budget,
//! worker pool, and scheduler into one runnable unit. Construction is
//! fail-fast: invalid config, an unusable state directory, or an empty
//! tier registry abort startup before any background task spawns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backends::TierRegistry;
use crate::cascade::{BudgetGovernor, EnrichmentCascade};
use crate::change_queue::ChangeQueue;
use crate::config::{load_backend_tiers, AppConfig};
use crate::error::DaemonError;
use crate::processor::{IndexStats, RepoProcessor};
use crate::scheduler::{Scheduler, TickStats};
use crate::state::{CostLedger, RepoStateStore};
use crate::worker::WorkerPool;

pub struct Daemon {
    config: Arc<AppConfig>,
    store: Arc<RepoStateStore>,
    queue: Arc<ChangeQueue>,
    budget: Arc<BudgetGovernor>,
    cascade: Arc<EnrichmentCascade>,
    scheduler: Scheduler,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon").finish_non_exhaustive()
    }
}

impl Daemon {
    /// Build the full daemon from configuration. `processor` and `stats`
    /// supply the indexing pipeline; [`NoopProcessor`] covers both when no
    /// indexer is attached.
    ///
    /// [`NoopProcessor`]: crate::processor::NoopProcessor
    pub async fn build(
        config: AppConfig,
        processor: Arc<dyn RepoProcessor>,
        stats: Arc<dyn IndexStats>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;
        let config = Arc::new(config);

        let store = Arc::new(RepoStateStore::open(&config.state_dir).await?);
        let expired = store.expire_stale_leases(Utc::now()).await?;
        if expired > 0 {
            info!(expired, "Cleared stale leases from a previous run");
        }

        let tiers = load_backend_tiers(&config.backends_file)?;
        let registry = TierRegistry::from_tiers(&tiers, reqwest::Client::new())?;
        if registry.is_empty() {
            return Err(DaemonError::NoEnabledTiers);
        }

        let budget = Arc::new(BudgetGovernor::open(&config.state_dir, &config.budget).await?);
        let cascade = Arc::new(EnrichmentCascade::new(
            registry,
            budget.clone(),
            config.cascade.clone(),
        ));

        let queue = Arc::new(ChangeQueue::new(Duration::from_secs(
            config.scheduler.debounce_seconds,
        )));
        let pool = WorkerPool::new(store.clone(), processor, &config.pool, &config.scheduler);
        let scheduler = Scheduler::new(
            config.clone(),
            store.clone(),
            queue.clone(),
            pool,
            stats,
        );

        Ok(Self {
            config,
            store,
            queue,
            budget,
            cascade,
            scheduler,
        })
    }

    /// Run until SIGINT/SIGTERM, then drain and stop.
    pub async fn run(mut self) {
        info!(
            profile = %self.config.profile,
            state_dir = %self.config.state_dir.display(),
            tiers = self.cascade.tier_count(),
            "freshd starting"
        );

        let shutdown = CancellationToken::new();
        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        self.scheduler.run_forever(shutdown).await;
        info!("freshd stopped");
    }

    /// One scheduling pass, then wait for the spawned jobs to finish.
    pub async fn run_once(&mut self) -> Result<TickStats, DaemonError> {
        let stats = self.scheduler.run_once().await?;
        let grace = Duration::from_secs(self.config.pool.drain_grace_seconds);
        self.scheduler.drain(grace).await;
        Ok(stats)
    }

    /// Feed of external change notifications (filesystem watcher, hooks).
    pub fn change_queue(&self) -> Arc<ChangeQueue> {
        self.queue.clone()
    }

    pub fn store(&self) -> Arc<RepoStateStore> {
        self.store.clone()
    }

    /// Enrichment dispatch entry point for embedded processors.
    pub fn cascade(&self) -> Arc<EnrichmentCascade> {
        self.cascade.clone()
    }

    pub async fn budget_snapshot(&self) -> CostLedger {
        self.budget.snapshot().await
    }
}

/// Resolves when the process receives SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
