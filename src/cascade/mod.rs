//! Tiered dispatch of enrichment calls across backend tiers.
//!
//! Tiers are tried in routing order. Each tier sits behind its own
//! circuit breaker, rate limiter, and concurrency semaphore; a shared
//! budget governor gates every call. Transient failures retry on the
//! same tier with exponential backoff before falling through; fatal
//! failures fall through immediately; budget exhaustion aborts the whole
//! cascade so the work item stays pending for a later cycle.

pub mod budget;
pub mod circuit;
pub mod rate_limit;

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rand::{thread_rng, Rng};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::backends::{BackendError, GenerateRequest, Generation, TierHandle, TierRegistry, Usage};
use crate::config::CascadeConfig;

pub use budget::{BudgetGovernor, LEDGER_FILE};
pub use circuit::{CircuitBreaker, CircuitDecision, CircuitMetrics, CircuitState};
pub use rate_limit::RateLimiter;

/// Final result of one cascade dispatch.
#[derive(Debug)]
pub enum CascadeOutcome {
    /// A tier produced a generation; cost has been committed.
    Success {
        tier_name: String,
        generation: Generation,
    },
    /// Every tier was skipped or failed. The item's failure counter
    /// should be incremented by the caller.
    Exhausted,
    /// Spending the estimated cost would break a budget cap. Nothing was
    /// attempted; the item stays pending without penalty.
    BudgetBlocked,
}

/// How one tier visit ended, driving the walk across tiers.
enum TierVerdict {
    Success(Generation),
    /// Retries exhausted or fatal error; move on to the next tier.
    FallThrough,
    /// Budget gate refused; stop the whole cascade.
    BudgetBlocked,
}

struct TierRuntime {
    handle: TierHandle,
    circuit: CircuitBreaker,
    limiter: RateLimiter,
    permits: Arc<Semaphore>,
}

impl TierRuntime {
    fn new(handle: TierHandle, config: &CascadeConfig) -> Self {
        let tier = &handle.tier;
        let circuit = CircuitBreaker::new(
            tier.name.clone(),
            config.circuit_failure_threshold,
            Duration::from_secs(config.circuit_cooldown_seconds),
        );
        let limiter = RateLimiter::new(
            tier.name.clone(),
            tier.requests_per_minute,
            tier.tokens_per_minute,
        );
        let permits = Arc::new(Semaphore::new(tier.concurrency_limit));
        Self {
            handle,
            circuit,
            limiter,
            permits,
        }
    }

    fn name(&self) -> &str {
        &self.handle.tier.name
    }

    fn call_timeout(&self, config: &CascadeConfig) -> Duration {
        Duration::from_secs(
            self.handle
                .tier
                .timeout_seconds
                .unwrap_or(config.call_timeout_seconds),
        )
    }
}

pub struct EnrichmentCascade {
    tiers: Vec<TierRuntime>,
    budget: Arc<BudgetGovernor>,
    config: CascadeConfig,
}

impl EnrichmentCascade {
    pub fn new(registry: TierRegistry, budget: Arc<BudgetGovernor>, config: CascadeConfig) -> Self {
        let tiers = registry
            .into_handles()
            .into_iter()
            .map(|handle| TierRuntime::new(handle, &config))
            .collect();
        Self {
            tiers,
            budget,
            config,
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    /// Dispatch one request through the tier chain.
    pub async fn generate(&self, request: &GenerateRequest) -> CascadeOutcome {
        for runtime in &self.tiers {
            match self.try_tier(runtime, request).await {
                TierVerdict::Success(generation) => {
                    return CascadeOutcome::Success {
                        tier_name: runtime.name().to_string(),
                        generation,
                    };
                }
                TierVerdict::FallThrough => {
                    let metric_labels = vec![("backend", runtime.name().to_string())];
                    counter!("freshd_cascade_fallthrough_total", &metric_labels).increment(1);
                }
                TierVerdict::BudgetBlocked => {
                    counter!("freshd_cascade_budget_blocked_total").increment(1);
                    return CascadeOutcome::BudgetBlocked;
                }
            }
        }

        counter!("freshd_cascade_exhausted_total").increment(1);
        warn!(
            item_id = %request.item_id,
            repo_id = %request.repo_id,
            tiers = self.tiers.len(),
            "All backend tiers exhausted for enrichment call"
        );
        CascadeOutcome::Exhausted
    }

    async fn try_tier(&self, runtime: &TierRuntime, request: &GenerateRequest) -> TierVerdict {
        let metric_labels = vec![("backend", runtime.name().to_string())];

        let decision = runtime.circuit.check();
        if decision == CircuitDecision::FailFast {
            counter!("freshd_cascade_circuit_skips_total", &metric_labels).increment(1);
            debug!(backend = %runtime.name(), "Circuit open; skipping tier");
            return TierVerdict::FallThrough;
        }
        let is_probe = decision == CircuitDecision::Probe;

        let estimated_cost = estimated_cost_usd(&runtime.handle.tier, request);
        if self.budget.would_exceed(estimated_cost).await {
            if is_probe {
                runtime.circuit.cancel_probe();
            }
            warn!(
                backend = %runtime.name(),
                item_id = %request.item_id,
                estimated_cost_usd = estimated_cost,
                "Budget cap would be exceeded; aborting cascade"
            );
            return TierVerdict::BudgetBlocked;
        }

        // A probe gets one shot; its outcome alone decides whether the
        // circuit closes again.
        let max_attempts = if is_probe {
            1
        } else {
            self.config.retry_max + 1
        };

        for attempt in 0..max_attempts {
            let deadline =
                Instant::now() + Duration::from_secs(self.config.acquire_deadline_seconds);
            if !runtime
                .limiter
                .acquire(request.estimated_tokens(), deadline)
                .await
            {
                counter!("freshd_cascade_rate_refusals_total", &metric_labels).increment(1);
                // No call was made, so the circuit records nothing.
                if is_probe {
                    runtime.circuit.cancel_probe();
                    return TierVerdict::FallThrough;
                }
                if attempt + 1 < max_attempts {
                    self.backoff(runtime.name(), attempt, None).await;
                    continue;
                }
                return TierVerdict::FallThrough;
            }

            let _permit = match runtime.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TierVerdict::FallThrough,
            };

            let started = Instant::now();
            let result = tokio::time::timeout(
                runtime.call_timeout(&self.config),
                runtime.handle.adapter.generate(request),
            )
            .await;
            histogram!("freshd_cascade_request_duration_ms", &metric_labels)
                .record(started.elapsed().as_millis() as f64);

            let error = match result {
                Ok(Ok(generation)) => {
                    runtime.circuit.record_outcome(true);
                    let cost = generation.usage.cost_usd(&runtime.handle.tier);
                    self.budget.commit(cost).await;
                    histogram!("freshd_backend_cost_usd", &metric_labels).record(cost);
                    counter!("freshd_cascade_attempts_total", &metric_labels).increment(1);
                    debug!(
                        backend = %runtime.name(),
                        item_id = %request.item_id,
                        input_tokens = generation.usage.input_tokens,
                        output_tokens = generation.usage.output_tokens,
                        cost_usd = cost,
                        "Enrichment call succeeded"
                    );
                    return TierVerdict::Success(generation);
                }
                Ok(Err(error)) => error,
                Err(_elapsed) => BackendError::transient(format!(
                    "call timed out after {}s",
                    runtime.call_timeout(&self.config).as_secs()
                )),
            };

            runtime.circuit.record_outcome(false);
            counter!("freshd_cascade_attempts_total", &metric_labels).increment(1);

            // Some providers bill partial work even on failure.
            if let Some(usage) = &error.usage {
                let cost = usage.cost_usd(&runtime.handle.tier);
                self.budget.commit(cost).await;
                histogram!("freshd_backend_cost_usd", &metric_labels).record(cost);
            }

            if error.is_transient() && attempt + 1 < max_attempts {
                self.backoff(runtime.name(), attempt, error.retry_after_secs())
                    .await;
                continue;
            }

            info!(
                backend = %runtime.name(),
                item_id = %request.item_id,
                attempt = attempt + 1,
                transient = error.is_transient(),
                error = %error,
                "Tier failed; falling through"
            );
            return TierVerdict::FallThrough;
        }

        TierVerdict::FallThrough
    }

    async fn backoff(&self, tier_name: &str, attempts_completed: u32, retry_after: Option<u64>) {
        let backoff =
            compute_backoff(&self.config, attempts_completed as i32, retry_after);
        debug!(
            backend = %tier_name,
            backoff_ms = backoff.as_millis() as u64,
            "Transient failure; backing off before retry"
        );
        tokio::time::sleep(backoff).await;
    }
}

impl std::fmt::Debug for EnrichmentCascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentCascade")
            .field(
                "tiers",
                &self
                    .tiers
                    .iter()
                    .map(|runtime| runtime.name())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Exponential backoff with jitter for same-tier retries. A server-sent
/// `retry-after` takes precedence when it is larger than the calculated
/// backoff.
fn compute_backoff(
    config: &CascadeConfig,
    attempts_completed: i32,
    retry_after_secs: Option<u64>,
) -> Duration {
    let mut backoff = (config.backoff_base_seconds * 2_f64.powi(attempts_completed))
        .min(config.backoff_max_seconds);

    if let Some(retry_after) = retry_after_secs {
        backoff = backoff.max(retry_after as f64);
    }

    let jitter = if config.jitter_factor > 0.0 {
        thread_rng().gen_range(0.0..(config.jitter_factor * backoff))
    } else {
        0.0
    };
    Duration::from_secs_f64(backoff + jitter)
}

/// Worst-case cost of a call, priced from the prompt-length token
/// heuristic plus the full output allowance.
fn estimated_cost_usd(tier: &crate::config::BackendTier, request: &GenerateRequest) -> f64 {
    Usage {
        input_tokens: (request.prompt.len() / 4) as u64,
        output_tokens: request.max_output_tokens as u64,
    }
    .cost_usd(tier)
}
