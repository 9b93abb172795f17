//! Shared fixtures for the integration suites.
//!
//! Builds temp-dir-rooted configurations tuned so the slow defaults
//! (three-minute ticks, ten-minute job timeouts) do not apply to tests.

use std::path::Path;

use chrono::Utc;
use freshd::config::AppConfig;
use freshd::state::{RepoState, RepoStateStore};
use tempfile::TempDir;

/// Configuration rooted in `dir` with the shortest intervals that still
/// pass validation.
#[allow(dead_code)]
pub fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.state_dir = dir.path().join("state");
    config.backends_file = dir.path().join("backends.json");
    config.scheduler.base_interval_seconds = 10;
    config.scheduler.debounce_seconds = 1;
    config.pool.job_timeout_seconds = 10;
    config.pool.lease_ttl_seconds = 30;
    config.pool.drain_grace_seconds = 5;
    config
}

/// A tier entry for a local Ollama endpoint. No API key, free of charge.
#[allow(dead_code)]
pub fn ollama_tier(name: &str, base_url: &str, routing_tier: u32) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "provider": "ollama",
        "model": "qwen2.5-coder",
        "base_url": base_url,
        "routing_tier": routing_tier,
        "requests_per_minute": 10_000,
        "tokens_per_minute": 10_000_000
    })
}

/// A tier entry for an OpenAI-compatible endpoint with an inline key and
/// non-zero pricing.
#[allow(dead_code)]
pub fn openai_tier(name: &str, base_url: &str, routing_tier: u32) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "provider": "openai",
        "model": "gpt-4o-mini",
        "base_url": base_url,
        "api_key": "test-api-key",
        "routing_tier": routing_tier,
        "requests_per_minute": 10_000,
        "tokens_per_minute": 10_000_000,
        "input_cost_per_1k": 1.0,
        "output_cost_per_1k": 2.0
    })
}

/// Write `tiers` as the backend tier file referenced by the config.
#[allow(dead_code)]
pub async fn write_tier_file(path: &Path, tiers: &[serde_json::Value]) {
    let body = serde_json::to_string_pretty(&tiers).unwrap();
    tokio::fs::write(path, body).await.unwrap();
}

/// Create a working directory under `dir` and register it with the store.
#[allow(dead_code)]
pub async fn register_repo(store: &RepoStateStore, dir: &TempDir, name: &str) -> RepoState {
    let workdir = dir.path().join(name);
    tokio::fs::create_dir_all(&workdir).await.unwrap();
    store.register(&workdir, Utc::now()).await.unwrap()
}
