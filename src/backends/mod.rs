//! Enrichment backend adapters.
//!
//! Each remote (or local) LLM service speaks through a [`BackendAdapter`].
//! Adapters translate one generation request into provider wire format and
//! map provider failures onto the shared [`BackendError`] taxonomy so the
//! cascade can classify without knowing provider details.

pub mod anthropic;
pub mod ollama;
pub mod openai;
pub mod registry;

use async_trait::async_trait;

use crate::config::BackendTier;

pub use registry::{RegistryError, TierHandle, TierRegistry};

/// One generation request flowing through the cascade.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    /// Identifier of the item being enriched, for logs and correlation.
    pub item_id: String,
    pub repo_id: String,
    pub max_output_tokens: u32,
}

impl GenerateRequest {
    /// Rough token estimate used for rate-limit accounting before the
    /// provider reports real usage: ~4 bytes per prompt token plus the
    /// output allowance.
    pub fn estimated_tokens(&self) -> u64 {
        (self.prompt.len() as u64 / 4) + u64::from(self.max_output_tokens)
    }
}

/// Token usage reported by the provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    /// Invoiced cost of this usage under the tier's pricing.
    pub fn cost_usd(&self, tier: &BackendTier) -> f64 {
        (self.input_tokens as f64 / 1000.0) * tier.input_cost_per_1k
            + (self.output_tokens as f64 / 1000.0) * tier.output_cost_per_1k
    }
}

/// Successful generation and the usage the provider billed for it.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

/// Structured backend failure, classified for cascade control flow.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BackendError {
    #[serde(flatten)]
    pub kind: BackendErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Usage the provider reported before failing. Present only when the
    /// failed call is still billed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendErrorKind {
    /// Provider throttled the call; retry after the hinted delay.
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Retryable failure (timeouts, connection loss, 5xx).
    Transient,
    /// Non-retryable failure (auth, unknown model, malformed request).
    Fatal,
}

impl BackendError {
    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: BackendErrorKind::RateLimited { retry_after_secs },
            message: None,
            usage: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: BackendErrorKind::Transient,
            message: Some(message.into()),
            usage: None,
        }
    }

    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self {
            kind: BackendErrorKind::Fatal,
            message: Some(message.into()),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Whether the same tier may be retried for this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::RateLimited { .. } | BackendErrorKind::Transient
        )
    }

    /// Provider's retry hint, when one was given.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            BackendErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BackendErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            BackendErrorKind::Transient => write!(f, "Transient backend error")?,
            BackendErrorKind::Fatal => write!(f, "Fatal backend error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendError {}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            BackendError::fatal(format!("request construction failed: {}", err))
        } else {
            // Timeouts, connect failures, and mid-body drops are all worth
            // retrying; status-bearing failures are classified from the
            // response before this conversion applies.
            BackendError::transient(err.to_string())
        }
    }
}

/// Map a non-success HTTP status onto the shared taxonomy: 429 is
/// rate-limited, other 4xx are fatal, everything else is transient.
pub(crate) fn classify_status(
    status: u16,
    body: Option<String>,
    retry_after_secs: Option<u64>,
) -> BackendError {
    let detail = body.filter(|b| !b.is_empty()).unwrap_or_default();
    if status == 429 {
        BackendError {
            kind: BackendErrorKind::RateLimited { retry_after_secs },
            message: Some(format!("HTTP 429: {}", detail)),
            usage: None,
        }
    } else if (400..500).contains(&status) {
        BackendError::fatal(format!("HTTP {}: {}", status, detail))
    } else {
        BackendError::transient(format!("HTTP {}: {}", status, detail))
    }
}

/// Parse a `Retry-After` header value in seconds.
pub(crate) fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Adapter for one backend tier's provider API.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Execute one generation call. Implementations never retry internally;
    /// the cascade owns retry and fallthrough policy.
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, BackendError>;

    /// Human-readable host description for logs and doctor output.
    fn describe_host(&self) -> String;
}
