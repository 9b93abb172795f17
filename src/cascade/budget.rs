//! Spend tracking shared by every cascade call.
//!
//! Wraps the persisted [`CostLedger`] behind a mutex so concurrent jobs
//! see a consistent running total. Every check and commit applies lazy
//! period rollover first, so the daily and monthly windows reset without
//! a background timer.

use std::path::{Path, PathBuf};

use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BudgetConfig;
use crate::error::StateError;
use crate::state::{load_ledger, save_ledger, CostLedger};

pub const LEDGER_FILE: &str = "cost_ledger.json";

pub struct BudgetGovernor {
    ledger_path: PathBuf,
    ledger: Mutex<CostLedger>,
}

impl BudgetGovernor {
    /// Load (or freshly create) the ledger under `state_dir`.
    pub async fn open(state_dir: &Path, budget: &BudgetConfig) -> Result<Self, StateError> {
        let ledger_path = state_dir.join(LEDGER_FILE);
        let ledger = load_ledger(&ledger_path, budget, Utc::now()).await?;
        Ok(Self {
            ledger_path,
            ledger: Mutex::new(ledger),
        })
    }

    /// Would spending `estimated_cost_usd` more push either period over
    /// its cap? Landing exactly on a cap is allowed.
    pub async fn would_exceed(&self, estimated_cost_usd: f64) -> bool {
        let mut ledger = self.ledger.lock().await;
        if ledger.rollover(Utc::now()) {
            self.persist(&ledger).await;
        }
        let blocked = ledger.would_exceed(estimated_cost_usd);
        if blocked {
            counter!("freshd_budget_blocked_total").increment(1);
            debug!(
                estimated_cost_usd,
                daily_remaining_usd = ledger.daily_remaining_usd(),
                monthly_remaining_usd = ledger.monthly_remaining_usd(),
                "Estimated cost exceeds budget headroom"
            );
        }
        blocked
    }

    /// Record spend that actually happened, then persist.
    pub async fn commit(&self, cost_usd: f64) {
        if cost_usd <= 0.0 {
            return;
        }
        let mut ledger = self.ledger.lock().await;
        ledger.rollover(Utc::now());
        ledger.commit(cost_usd);
        gauge!("freshd_budget_daily_spend_usd_gauge").set(ledger.daily_spend_usd);
        gauge!("freshd_budget_monthly_spend_usd_gauge").set(ledger.monthly_spend_usd);
        self.persist(&ledger).await;
    }

    pub async fn snapshot(&self) -> CostLedger {
        let mut ledger = self.ledger.lock().await;
        if ledger.rollover(Utc::now()) {
            self.persist(&ledger).await;
        }
        ledger.clone()
    }

    /// A failed persist loses at most one increment and the next commit
    /// rewrites the full ledger, so log and carry on.
    async fn persist(&self, ledger: &CostLedger) {
        if let Err(err) = save_ledger(&self.ledger_path, ledger).await {
            warn!(
                path = %self.ledger_path.display(),
                error = %err,
                "Failed to persist cost ledger"
            );
        }
    }
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGovernor")
            .field("ledger_path", &self.ledger_path)
            .finish()
    }
}
