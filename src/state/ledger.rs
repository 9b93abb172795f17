//! Cost ledger tracking daily and monthly spend against configured caps.
//!
//! The ledger is a single JSON file beside the repo records. Periods roll
//! over lazily on UTC boundaries; spend survives restarts within a period.

use std::io::ErrorKind;
use std::path::Path;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::config::BudgetConfig;
use crate::error::StateError;

/// Accumulated spend and the caps it is measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub daily_spend_usd: f64,
    pub monthly_spend_usd: f64,
    pub daily_cap_usd: f64,
    pub monthly_cap_usd: f64,
    /// UTC date the daily period started.
    pub period_start_daily: NaiveDate,
    /// First day of the UTC month the monthly period started.
    pub period_start_monthly: NaiveDate,
}

impl CostLedger {
    /// Fresh ledger with zero spend, periods anchored at `now`.
    pub fn new(budget: &BudgetConfig, now: DateTime<Utc>) -> Self {
        let today = now.date_naive();
        Self {
            daily_spend_usd: 0.0,
            monthly_spend_usd: 0.0,
            daily_cap_usd: budget.daily_cap_usd,
            monthly_cap_usd: budget.monthly_cap_usd,
            period_start_daily: today,
            period_start_monthly: month_start(today),
        }
    }

    /// Reset any period whose UTC boundary `now` has crossed. Returns
    /// whether anything changed.
    pub fn rollover(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let mut changed = false;

        if today > self.period_start_daily {
            info!(
                previous_spend_usd = self.daily_spend_usd,
                "Daily budget period rolled over"
            );
            self.daily_spend_usd = 0.0;
            self.period_start_daily = today;
            changed = true;
        }

        let current_month = month_start(today);
        if current_month > self.period_start_monthly {
            info!(
                previous_spend_usd = self.monthly_spend_usd,
                "Monthly budget period rolled over"
            );
            self.monthly_spend_usd = 0.0;
            self.period_start_monthly = current_month;
            changed = true;
        }

        changed
    }

    /// Whether adding `cost` would push either period over its cap.
    /// Landing exactly on the cap is allowed.
    pub fn would_exceed(&self, cost: f64) -> bool {
        self.daily_spend_usd + cost > self.daily_cap_usd
            || self.monthly_spend_usd + cost > self.monthly_cap_usd
    }

    /// Record spend that the provider will actually invoice.
    pub fn commit(&mut self, cost: f64) {
        self.daily_spend_usd += cost;
        self.monthly_spend_usd += cost;
    }

    pub fn daily_remaining_usd(&self) -> f64 {
        (self.daily_cap_usd - self.daily_spend_usd).max(0.0)
    }

    pub fn monthly_remaining_usd(&self) -> f64 {
        (self.monthly_cap_usd - self.monthly_spend_usd).max(0.0)
    }

    /// Whether either period has no headroom left at all.
    pub fn exhausted(&self) -> bool {
        self.daily_remaining_usd() <= 0.0 || self.monthly_remaining_usd() <= 0.0
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).expect("first day of month is valid")
}

/// Load the ledger from `path`, starting fresh when the file is absent or
/// unreadable. Caps always come from the current config, not the file.
pub async fn load_ledger(
    path: &Path,
    budget: &BudgetConfig,
    now: DateTime<Utc>,
) -> Result<CostLedger, StateError> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(CostLedger::new(budget, now));
        }
        Err(source) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut ledger: CostLedger = match serde_json::from_str(&raw) {
        Ok(ledger) => ledger,
        Err(err) => {
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "cost_ledger.json".to_string());
            let quarantined =
                path.with_file_name(format!("{}.corrupt-{}", file_name, now.timestamp()));
            warn!(
                path = %path.display(),
                quarantined = %quarantined.display(),
                error = %err,
                "Cost ledger unreadable; quarantining and starting fresh"
            );
            fs::rename(path, &quarantined)
                .await
                .map_err(|source| StateError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
            return Ok(CostLedger::new(budget, now));
        }
    };

    ledger.daily_cap_usd = budget.daily_cap_usd;
    ledger.monthly_cap_usd = budget.monthly_cap_usd;
    ledger.rollover(now);
    Ok(ledger)
}

/// Persist the ledger atomically.
pub async fn save_ledger(path: &Path, ledger: &CostLedger) -> Result<(), StateError> {
    let tmp = path.with_extension("json.tmp");
    let encoded = serde_json::to_vec_pretty(ledger)?;

    fs::write(&tmp, encoded)
        .await
        .map_err(|source| StateError::Write {
            path: tmp.clone(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| StateError::Write {
            path: path.to_path_buf(),
            source,
        })
}
