//! Configuration loading for the freshness daemon.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `FRESHD_`, producing a typed [`AppConfig`], plus the backend tier list
//! from a JSON tier file.

use std::{collections::BTreeMap, env, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `FRESHD_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Directory holding repo state records and the cost ledger.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// JSON file describing the enrichment backend tiers.
    #[serde(default = "default_backends_file")]
    pub backends_file: PathBuf,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pool: WorkerPoolConfig,
    #[serde(default)]
    pub cascade: CascadeConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
}

/// Scheduler cadence and idle backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Base tick interval in seconds when the daemon has work (default: 180).
    ///
    /// Environment variable: `FRESHD_SCHEDULER_BASE_INTERVAL_SECONDS`
    #[serde(default = "default_scheduler_base_interval_seconds")]
    pub base_interval_seconds: u64,

    /// Quiet window a repo must hold before a change event becomes ready
    /// (default: 30).
    ///
    /// Environment variable: `FRESHD_SCHEDULER_DEBOUNCE_SECONDS`
    #[serde(default = "default_scheduler_debounce_seconds")]
    pub debounce_seconds: u64,

    /// Multiplier applied per consecutive idle cycle (default: 2.0).
    ///
    /// Sleep formula: `base_interval * min(backoff_base^idle_cycles,
    /// max_multiplier)`.
    ///
    /// Environment variable: `FRESHD_SCHEDULER_IDLE_BACKOFF_BASE`
    #[serde(default = "default_scheduler_idle_backoff_base")]
    pub idle_backoff_base: f64,

    /// Cap on the idle backoff multiplier (default: 10.0).
    ///
    /// Environment variable: `FRESHD_SCHEDULER_IDLE_BACKOFF_MAX_MULTIPLIER`
    #[serde(default = "default_scheduler_idle_backoff_max_multiplier")]
    pub idle_backoff_max_multiplier: f64,

    /// Items handed to the processor per enrichment job (default: 50).
    ///
    /// Environment variable: `FRESHD_SCHEDULER_ENRICH_BATCH_SIZE`
    #[serde(default = "default_scheduler_enrich_batch_size")]
    pub enrich_batch_size: usize,

    /// Items handed to the processor per embedding job (default: 200).
    ///
    /// Environment variable: `FRESHD_SCHEDULER_EMBED_LIMIT`
    #[serde(default = "default_scheduler_embed_limit")]
    pub embed_limit: usize,
}

/// Worker pool sizing and lease parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrently running jobs (default: 4).
    ///
    /// Environment variable: `FRESHD_POOL_MAX_WORKERS`
    #[serde(default = "default_pool_max_workers")]
    pub max_workers: usize,

    /// Hard wall-clock limit per job in seconds (default: 600).
    ///
    /// Environment variable: `FRESHD_POOL_JOB_TIMEOUT_SECONDS`
    #[serde(default = "default_pool_job_timeout_seconds")]
    pub job_timeout_seconds: u64,

    /// Lease time-to-live in seconds (default: 780). Must exceed the job
    /// timeout so an abandoned lease always outlives the job that held it.
    ///
    /// Environment variable: `FRESHD_POOL_LEASE_TTL_SECONDS`
    #[serde(default = "default_pool_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// Grace period for draining in-flight jobs on shutdown (default: 30).
    ///
    /// Environment variable: `FRESHD_POOL_DRAIN_GRACE_SECONDS`
    #[serde(default = "default_pool_drain_grace_seconds")]
    pub drain_grace_seconds: u64,
}

/// Enrichment cascade retry, timeout, and circuit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CascadeConfig {
    /// Transient-failure retries attempted on one tier before falling
    /// through to the next (default: 3).
    ///
    /// Environment variable: `FRESHD_CASCADE_RETRY_MAX`
    #[serde(default = "default_cascade_retry_max")]
    pub retry_max: u32,

    /// Starting backoff between same-tier retries in seconds (default: 1.0).
    ///
    /// Subsequent retries use exponential backoff: base_seconds * 2^attempt.
    ///
    /// Environment variable: `FRESHD_CASCADE_BACKOFF_BASE_SECONDS`
    #[serde(default = "default_cascade_backoff_base_seconds")]
    pub backoff_base_seconds: f64,

    /// Upper bound for retry backoff in seconds (default: 30.0). Must be
    /// >= backoff_base_seconds.
    ///
    /// Environment variable: `FRESHD_CASCADE_BACKOFF_MAX_SECONDS`
    #[serde(default = "default_cascade_backoff_max_seconds")]
    pub backoff_max_seconds: f64,

    /// Jitter factor applied to retry backoff (default: 0.1, range 0.0-1.0).
    ///
    /// Environment variable: `FRESHD_CASCADE_JITTER_FACTOR`
    #[serde(default = "default_cascade_jitter_factor")]
    pub jitter_factor: f64,

    /// Per-call timeout for backend requests in seconds (default: 120).
    /// Tiers may override with their own `timeout_seconds`.
    ///
    /// Environment variable: `FRESHD_CASCADE_CALL_TIMEOUT_SECONDS`
    #[serde(default = "default_cascade_call_timeout_seconds")]
    pub call_timeout_seconds: u64,

    /// Deadline for acquiring a rate-limit permit in seconds (default: 20).
    /// Expiry is treated as a transient failure for that tier.
    ///
    /// Environment variable: `FRESHD_CASCADE_ACQUIRE_DEADLINE_SECONDS`
    #[serde(default = "default_cascade_acquire_deadline_seconds")]
    pub acquire_deadline_seconds: u64,

    /// Consecutive failures that open a tier's circuit (default: 5).
    ///
    /// Environment variable: `FRESHD_CASCADE_CIRCUIT_FAILURE_THRESHOLD`
    #[serde(default = "default_cascade_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// Cooldown before an open circuit admits a probe in seconds
    /// (default: 60).
    ///
    /// Environment variable: `FRESHD_CASCADE_CIRCUIT_COOLDOWN_SECONDS`
    #[serde(default = "default_cascade_circuit_cooldown_seconds")]
    pub circuit_cooldown_seconds: u64,

    /// Terminal cascade failures before an item is permanently failed
    /// (default: 5).
    ///
    /// Environment variable: `FRESHD_CASCADE_MAX_FAILURES_PER_ITEM`
    #[serde(default = "default_cascade_max_failures_per_item")]
    pub max_failures_per_item: u32,
}

/// Spend caps for remote backend usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BudgetConfig {
    /// Daily spend cap in USD (default: 10.0).
    ///
    /// Environment variable: `FRESHD_BUDGET_DAILY_CAP_USD`
    #[serde(default = "default_budget_daily_cap_usd")]
    pub daily_cap_usd: f64,

    /// Monthly spend cap in USD (default: 200.0).
    ///
    /// Environment variable: `FRESHD_BUDGET_MONTHLY_CAP_USD`
    #[serde(default = "default_budget_monthly_cap_usd")]
    pub monthly_cap_usd: f64,
}

/// Remote service family a tier speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Openai,
    Anthropic,
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Openai => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
        }
    }
}

/// One enrichment backend tier as declared in the tier file.
///
/// Tiers are walked in ascending `routing_tier` order; declaration order
/// breaks ties. The order never changes at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendTier {
    pub name: String,
    pub provider: ProviderKind,
    pub model: String,
    /// Override for the provider's default API base URL (local gateways,
    /// proxies, self-hosted deployments).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Inline API key. Takes precedence over `api_key_env`; redacted in all
    /// config dumps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub routing_tier: u32,
    #[serde(default = "default_tier_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_tier_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_tier_tokens_per_minute")]
    pub tokens_per_minute: u64,
    /// Cost per thousand input tokens in USD.
    #[serde(default)]
    pub input_cost_per_1k: f64,
    /// Cost per thousand output tokens in USD.
    #[serde(default)]
    pub output_cost_per_1k: f64,
    /// Per-call timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_tier_enabled")]
    pub enabled: bool,
}

impl BackendTier {
    /// Copy of the tier safe to print: the inline API key is masked.
    pub fn redacted(&self) -> BackendTier {
        let mut tier = self.clone();
        if tier.api_key.is_some() {
            tier.api_key = Some("[REDACTED]".to_string());
        }
        tier
    }

    /// Resolve the API key: inline value first, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|var| env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            state_dir: default_state_dir(),
            backends_file: default_backends_file(),
            scheduler: SchedulerConfig::default(),
            pool: WorkerPoolConfig::default(),
            cascade: CascadeConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: default_scheduler_base_interval_seconds(),
            debounce_seconds: default_scheduler_debounce_seconds(),
            idle_backoff_base: default_scheduler_idle_backoff_base(),
            idle_backoff_max_multiplier: default_scheduler_idle_backoff_max_multiplier(),
            enrich_batch_size: default_scheduler_enrich_batch_size(),
            embed_limit: default_scheduler_embed_limit(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_pool_max_workers(),
            job_timeout_seconds: default_pool_job_timeout_seconds(),
            lease_ttl_seconds: default_pool_lease_ttl_seconds(),
            drain_grace_seconds: default_pool_drain_grace_seconds(),
        }
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            retry_max: default_cascade_retry_max(),
            backoff_base_seconds: default_cascade_backoff_base_seconds(),
            backoff_max_seconds: default_cascade_backoff_max_seconds(),
            jitter_factor: default_cascade_jitter_factor(),
            call_timeout_seconds: default_cascade_call_timeout_seconds(),
            acquire_deadline_seconds: default_cascade_acquire_deadline_seconds(),
            circuit_failure_threshold: default_cascade_circuit_failure_threshold(),
            circuit_cooldown_seconds: default_cascade_circuit_cooldown_seconds(),
            max_failures_per_item: default_cascade_max_failures_per_item(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cap_usd: default_budget_daily_cap_usd(),
            monthly_cap_usd: default_budget_monthly_cap_usd(),
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_interval_seconds < 10 || self.base_interval_seconds > 3600 {
            return Err(ConfigError::InvalidBaseInterval {
                value: self.base_interval_seconds,
            });
        }

        if self.debounce_seconds == 0 || self.debounce_seconds > 600 {
            return Err(ConfigError::InvalidDebounce {
                value: self.debounce_seconds,
            });
        }

        if self.idle_backoff_base < 1.0 {
            return Err(ConfigError::InvalidIdleBackoffBase {
                value: self.idle_backoff_base,
            });
        }

        if self.idle_backoff_max_multiplier < 1.0 {
            return Err(ConfigError::InvalidIdleBackoffCap {
                value: self.idle_backoff_max_multiplier,
            });
        }

        if self.enrich_batch_size == 0 || self.embed_limit == 0 {
            return Err(ConfigError::InvalidBatchSize {
                enrich: self.enrich_batch_size,
                embed: self.embed_limit,
            });
        }

        Ok(())
    }
}

impl WorkerPoolConfig {
    /// Validate worker pool configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 || self.max_workers > 64 {
            return Err(ConfigError::InvalidWorkerCount {
                value: self.max_workers,
            });
        }

        if self.job_timeout_seconds < 10 {
            return Err(ConfigError::InvalidJobTimeout {
                value: self.job_timeout_seconds,
            });
        }

        if self.lease_ttl_seconds <= self.job_timeout_seconds {
            return Err(ConfigError::InvalidLeaseTtl {
                ttl: self.lease_ttl_seconds,
                job_timeout: self.job_timeout_seconds,
            });
        }

        if self.drain_grace_seconds == 0 {
            return Err(ConfigError::InvalidDrainGrace {
                value: self.drain_grace_seconds,
            });
        }

        Ok(())
    }
}

impl CascadeConfig {
    /// Validate cascade configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max > 10 {
            return Err(ConfigError::InvalidRetryMax {
                value: self.retry_max,
            });
        }

        if self.backoff_base_seconds <= 0.0 || self.backoff_base_seconds > self.backoff_max_seconds
        {
            return Err(ConfigError::InvalidBackoffBounds {
                base: self.backoff_base_seconds,
                max: self.backoff_max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidJitterFactor {
                value: self.jitter_factor,
            });
        }

        if self.call_timeout_seconds == 0 || self.acquire_deadline_seconds == 0 {
            return Err(ConfigError::InvalidCascadeTimeouts {
                call: self.call_timeout_seconds,
                acquire: self.acquire_deadline_seconds,
            });
        }

        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::InvalidCircuitThreshold {
                value: self.circuit_failure_threshold,
            });
        }

        if self.max_failures_per_item == 0 {
            return Err(ConfigError::InvalidMaxFailuresPerItem {
                value: self.max_failures_per_item,
            });
        }

        Ok(())
    }
}

impl BudgetConfig {
    /// Validate budget configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_cap_usd <= 0.0 {
            return Err(ConfigError::InvalidBudgetCap {
                field: "daily".to_string(),
                value: self.daily_cap_usd,
            });
        }

        if self.monthly_cap_usd <= 0.0 {
            return Err(ConfigError::InvalidBudgetCap {
                field: "monthly".to_string(),
                value: self.monthly_cap_usd,
            });
        }

        if self.daily_cap_usd > self.monthly_cap_usd {
            return Err(ConfigError::InvalidBudgetOrdering {
                daily: self.daily_cap_usd,
                monthly: self.monthly_cap_usd,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns a pretty JSON representation of the effective configuration.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        // No secret material lives in AppConfig itself; API keys stay in the
        // tier file (masked by BackendTier::redacted) or in env vars.
        serde_json::to_string_pretty(self)
    }

    /// Validates the configuration, returning the first violated bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        self.pool.validate()?;
        self.cascade.validate()?;
        self.budget.validate()?;
        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".freshd")
}

fn default_backends_file() -> PathBuf {
    PathBuf::from("backends.json")
}

fn default_scheduler_base_interval_seconds() -> u64 {
    180 // 3 minutes
}

fn default_scheduler_debounce_seconds() -> u64 {
    30
}

fn default_scheduler_idle_backoff_base() -> f64 {
    2.0
}

fn default_scheduler_idle_backoff_max_multiplier() -> f64 {
    10.0
}

fn default_scheduler_enrich_batch_size() -> usize {
    50
}

fn default_scheduler_embed_limit() -> usize {
    200
}

fn default_pool_max_workers() -> usize {
    4
}

fn default_pool_job_timeout_seconds() -> u64 {
    600 // 10 minutes
}

fn default_pool_lease_ttl_seconds() -> u64 {
    780 // job timeout plus one base tick
}

fn default_pool_drain_grace_seconds() -> u64 {
    30
}

fn default_cascade_retry_max() -> u32 {
    3
}

fn default_cascade_backoff_base_seconds() -> f64 {
    1.0
}

fn default_cascade_backoff_max_seconds() -> f64 {
    30.0
}

fn default_cascade_jitter_factor() -> f64 {
    0.1 // 10% jitter
}

fn default_cascade_call_timeout_seconds() -> u64 {
    120
}

fn default_cascade_acquire_deadline_seconds() -> u64 {
    20
}

fn default_cascade_circuit_failure_threshold() -> u32 {
    5
}

fn default_cascade_circuit_cooldown_seconds() -> u64 {
    60
}

fn default_cascade_max_failures_per_item() -> u32 {
    5
}

fn default_budget_daily_cap_usd() -> f64 {
    10.0
}

fn default_budget_monthly_cap_usd() -> f64 {
    200.0
}

fn default_tier_concurrency_limit() -> usize {
    2
}

fn default_tier_requests_per_minute() -> u32 {
    60
}

fn default_tier_tokens_per_minute() -> u64 {
    90_000
}

fn default_tier_enabled() -> bool {
    true
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("scheduler base interval must be between 10 and 3600 seconds, got {value}")]
    InvalidBaseInterval { value: u64 },
    #[error("debounce window must be between 1 and 600 seconds, got {value}")]
    InvalidDebounce { value: u64 },
    #[error("idle backoff base must be at least 1.0, got {value}")]
    InvalidIdleBackoffBase { value: f64 },
    #[error("idle backoff max multiplier must be at least 1.0, got {value}")]
    InvalidIdleBackoffCap { value: f64 },
    #[error("enrich batch size and embed limit must be positive, got {enrich} and {embed}")]
    InvalidBatchSize { enrich: usize, embed: usize },
    #[error("worker count must be between 1 and 64, got {value}")]
    InvalidWorkerCount { value: usize },
    #[error("job timeout must be at least 10 seconds, got {value}")]
    InvalidJobTimeout { value: u64 },
    #[error("lease TTL ({ttl}s) must exceed the job timeout ({job_timeout}s)")]
    InvalidLeaseTtl { ttl: u64, job_timeout: u64 },
    #[error("drain grace must be positive, got {value}")]
    InvalidDrainGrace { value: u64 },
    #[error("cascade retry max must not exceed 10, got {value}")]
    InvalidRetryMax { value: u32 },
    #[error("cascade backoff base seconds ({base}) must be positive and not exceed max ({max})")]
    InvalidBackoffBounds { base: f64, max: f64 },
    #[error("cascade jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidJitterFactor { value: f64 },
    #[error("cascade call timeout and acquire deadline must be positive, got {call} and {acquire}")]
    InvalidCascadeTimeouts { call: u64, acquire: u64 },
    #[error("circuit failure threshold must be positive, got {value}")]
    InvalidCircuitThreshold { value: u32 },
    #[error("max failures per item must be positive, got {value}")]
    InvalidMaxFailuresPerItem { value: u32 },
    #[error("{field} budget cap must be positive, got {value}")]
    InvalidBudgetCap { field: String, value: f64 },
    #[error("daily budget cap ({daily}) cannot exceed monthly cap ({monthly})")]
    InvalidBudgetOrdering { daily: f64, monthly: f64 },
    #[error("failed to read backend tier file {path}: {source}")]
    BackendsFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse backend tier file {path}: {source}")]
    BackendsParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("backend tier file {path} declares no tiers")]
    NoTiers { path: PathBuf },
    #[error("duplicate backend tier name '{name}'")]
    DuplicateTierName { name: String },
    #[error("backend tier '{name}' is invalid: {detail}")]
    InvalidTier { name: String, detail: String },
}

/// Loads configuration using layered `.env` files and `FRESHD_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates the full application configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("FRESHD_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let state_dir = layered
            .remove("STATE_DIR")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_state_dir);
        let backends_file = layered
            .remove("BACKENDS_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_backends_file);

        let scheduler = SchedulerConfig {
            base_interval_seconds: layered
                .remove("SCHEDULER_BASE_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_base_interval_seconds),
            debounce_seconds: layered
                .remove("SCHEDULER_DEBOUNCE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_debounce_seconds),
            idle_backoff_base: layered
                .remove("SCHEDULER_IDLE_BACKOFF_BASE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_idle_backoff_base),
            idle_backoff_max_multiplier: layered
                .remove("SCHEDULER_IDLE_BACKOFF_MAX_MULTIPLIER")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_idle_backoff_max_multiplier),
            enrich_batch_size: layered
                .remove("SCHEDULER_ENRICH_BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_enrich_batch_size),
            embed_limit: layered
                .remove("SCHEDULER_EMBED_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_embed_limit),
        };

        let pool = WorkerPoolConfig {
            max_workers: layered
                .remove("POOL_MAX_WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pool_max_workers),
            job_timeout_seconds: layered
                .remove("POOL_JOB_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pool_job_timeout_seconds),
            lease_ttl_seconds: layered
                .remove("POOL_LEASE_TTL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pool_lease_ttl_seconds),
            drain_grace_seconds: layered
                .remove("POOL_DRAIN_GRACE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_pool_drain_grace_seconds),
        };

        let cascade = CascadeConfig {
            retry_max: layered
                .remove("CASCADE_RETRY_MAX")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_retry_max),
            backoff_base_seconds: layered
                .remove("CASCADE_BACKOFF_BASE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_backoff_base_seconds),
            backoff_max_seconds: layered
                .remove("CASCADE_BACKOFF_MAX_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_backoff_max_seconds),
            jitter_factor: layered
                .remove("CASCADE_JITTER_FACTOR")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_jitter_factor),
            call_timeout_seconds: layered
                .remove("CASCADE_CALL_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_call_timeout_seconds),
            acquire_deadline_seconds: layered
                .remove("CASCADE_ACQUIRE_DEADLINE_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_acquire_deadline_seconds),
            circuit_failure_threshold: layered
                .remove("CASCADE_CIRCUIT_FAILURE_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_circuit_failure_threshold),
            circuit_cooldown_seconds: layered
                .remove("CASCADE_CIRCUIT_COOLDOWN_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_circuit_cooldown_seconds),
            max_failures_per_item: layered
                .remove("CASCADE_MAX_FAILURES_PER_ITEM")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_cascade_max_failures_per_item),
        };

        let budget = BudgetConfig {
            daily_cap_usd: layered
                .remove("BUDGET_DAILY_CAP_USD")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_budget_daily_cap_usd),
            monthly_cap_usd: layered
                .remove("BUDGET_MONTHLY_CAP_USD")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_budget_monthly_cap_usd),
        };

        let config = AppConfig {
            profile,
            log_level,
            log_format,
            state_dir,
            backends_file,
            scheduler,
            pool,
            cascade,
            budget,
        };

        config.validate()?;

        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("FRESHD_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("FRESHD_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Loads, validates, and orders the backend tier list from `path`.
///
/// The returned tiers are sorted by ascending `routing_tier`; declaration
/// order within the file breaks ties (stable sort).
pub fn load_backend_tiers(path: &std::path::Path) -> Result<Vec<BackendTier>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::BackendsFile {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tiers: Vec<BackendTier> =
        serde_json::from_str(&raw).map_err(|source| ConfigError::BackendsParse {
            path: path.to_path_buf(),
            source,
        })?;

    if tiers.is_empty() {
        return Err(ConfigError::NoTiers {
            path: path.to_path_buf(),
        });
    }

    let mut seen = std::collections::BTreeSet::new();
    for tier in &tiers {
        if tier.name.trim().is_empty() {
            return Err(ConfigError::InvalidTier {
                name: tier.name.clone(),
                detail: "name must not be empty".to_string(),
            });
        }
        if !seen.insert(tier.name.clone()) {
            return Err(ConfigError::DuplicateTierName {
                name: tier.name.clone(),
            });
        }
        if tier.model.trim().is_empty() {
            return Err(ConfigError::InvalidTier {
                name: tier.name.clone(),
                detail: "model must not be empty".to_string(),
            });
        }
        if tier.concurrency_limit == 0 {
            return Err(ConfigError::InvalidTier {
                name: tier.name.clone(),
                detail: "concurrency_limit must be positive".to_string(),
            });
        }
        if tier.requests_per_minute == 0 || tier.tokens_per_minute == 0 {
            return Err(ConfigError::InvalidTier {
                name: tier.name.clone(),
                detail: "requests_per_minute and tokens_per_minute must be positive".to_string(),
            });
        }
        if tier.input_cost_per_1k < 0.0 || tier.output_cost_per_1k < 0.0 {
            return Err(ConfigError::InvalidTier {
                name: tier.name.clone(),
                detail: "costs must not be negative".to_string(),
            });
        }
    }

    tiers.sort_by_key(|tier| tier.routing_tier);
    Ok(tiers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_passes_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lease_ttl_must_exceed_job_timeout() {
        let pool = WorkerPoolConfig {
            job_timeout_seconds: 600,
            lease_ttl_seconds: 600,
            ..WorkerPoolConfig::default()
        };
        assert!(matches!(
            pool.validate(),
            Err(ConfigError::InvalidLeaseTtl { .. })
        ));
    }

    #[test]
    fn cascade_backoff_bounds_are_checked() {
        let cascade = CascadeConfig {
            backoff_base_seconds: 60.0,
            backoff_max_seconds: 30.0,
            ..CascadeConfig::default()
        };
        assert!(matches!(
            cascade.validate(),
            Err(ConfigError::InvalidBackoffBounds { .. })
        ));

        let cascade = CascadeConfig {
            jitter_factor: 1.5,
            ..CascadeConfig::default()
        };
        assert!(matches!(
            cascade.validate(),
            Err(ConfigError::InvalidJitterFactor { .. })
        ));
    }

    #[test]
    fn budget_caps_must_be_ordered() {
        let budget = BudgetConfig {
            daily_cap_usd: 500.0,
            monthly_cap_usd: 200.0,
        };
        assert!(matches!(
            budget.validate(),
            Err(ConfigError::InvalidBudgetOrdering { .. })
        ));
    }

    #[test]
    fn tier_redaction_masks_inline_key() {
        let tier = BackendTier {
            name: "fast".to_string(),
            provider: ProviderKind::Openai,
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: None,
            api_key: Some("sk-secret".to_string()),
            routing_tier: 0,
            concurrency_limit: 2,
            requests_per_minute: 60,
            tokens_per_minute: 90_000,
            input_cost_per_1k: 0.00015,
            output_cost_per_1k: 0.0006,
            timeout_seconds: None,
            enabled: true,
        };
        assert_eq!(tier.redacted().api_key.as_deref(), Some("[REDACTED]"));
        assert_eq!(tier.resolve_api_key().as_deref(), Some("sk-secret"));
    }
}
