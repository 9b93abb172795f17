//! Health diagnostics behind the `doctor` subcommand.
//!
//! Each check runs independently so a broken state directory still lets
//! the tier and budget checks report. The report serializes to JSON; the
//! CLI exits non-zero when any check fails.

use chrono::Utc;
use serde::Serialize;

use crate::cascade::budget::LEDGER_FILE;
use crate::config::{load_backend_tiers, AppConfig};
use crate::state::load_ledger;

#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub healthy: bool,
    pub checks: Vec<DoctorCheck>,
}

#[derive(Debug, Serialize)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Run every health check and collect the verdicts.
pub async fn run_doctor(config: &AppConfig) -> DoctorReport {
    let checks = vec![
        check_state_dir(config).await,
        check_backend_tiers(config),
        check_budget(config).await,
    ];
    let healthy = checks.iter().all(|check| check.ok);
    DoctorReport { healthy, checks }
}

/// The state directory must exist (or be creatable) and accept writes.
async fn check_state_dir(config: &AppConfig) -> DoctorCheck {
    let dir = &config.state_dir;
    let probe = dir.join(".doctor-probe");

    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&probe, b"probe").await?;
        tokio::fs::remove_file(&probe).await
    }
    .await;

    match result {
        Ok(()) => DoctorCheck {
            name: "state_dir",
            ok: true,
            detail: format!("{} is writable", dir.display()),
        },
        Err(err) => DoctorCheck {
            name: "state_dir",
            ok: false,
            detail: format!("{}: {}", dir.display(), err),
        },
    }
}

/// At least one enabled backend tier must be configured.
fn check_backend_tiers(config: &AppConfig) -> DoctorCheck {
    match load_backend_tiers(&config.backends_file) {
        Ok(tiers) => {
            let enabled = tiers.iter().filter(|tier| tier.enabled).count();
            DoctorCheck {
                name: "backend_tiers",
                ok: enabled > 0,
                detail: format!(
                    "{} tier(s) configured, {} enabled ({})",
                    tiers.len(),
                    enabled,
                    config.backends_file.display()
                ),
            }
        }
        Err(err) => DoctorCheck {
            name: "backend_tiers",
            ok: false,
            detail: err.to_string(),
        },
    }
}

/// Budget headroom must remain in both the daily and monthly windows.
async fn check_budget(config: &AppConfig) -> DoctorCheck {
    let ledger_path = config.state_dir.join(LEDGER_FILE);
    match load_ledger(&ledger_path, &config.budget, Utc::now()).await {
        Ok(ledger) => DoctorCheck {
            name: "budget",
            ok: !ledger.exhausted(),
            detail: format!(
                "{:.2} USD left today, {:.2} USD left this month",
                ledger.daily_remaining_usd(),
                ledger.monthly_remaining_usd()
            ),
        },
        Err(err) => DoctorCheck {
            name: "budget",
            ok: false,
            detail: err.to_string(),
        },
    }
}
