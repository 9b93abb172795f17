//! Tier registry: the ordered set of enabled backends with their adapters.
//!
//! Built once at startup from the tier file and injected into the cascade.
//! There is no global registry; every consumer receives an instance.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::backends::BackendAdapter;
use crate::backends::anthropic::{self, AnthropicAdapter};
use crate::backends::ollama::{self, OllamaAdapter};
use crate::backends::openai::{self, OpenAiAdapter};
use crate::config::{BackendTier, ProviderKind};

/// One enabled tier paired with its adapter.
pub struct TierHandle {
    pub tier: BackendTier,
    pub adapter: Arc<dyn BackendAdapter>,
}

/// Ordered collection of enabled tiers. Iteration order is the cascade's
/// dispatch order and never changes after construction.
pub struct TierRegistry {
    tiers: Vec<TierHandle>,
}

/// Errors raised while building adapters from the tier list.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tier '{name}' has an invalid base URL '{url}': {source}")]
    InvalidBaseUrl {
        name: String,
        url: String,
        source: url::ParseError,
    },
    #[error("tier '{name}' targets a hosted provider but no API key resolved; {hint}")]
    MissingApiKey { name: String, hint: String },
}

impl std::fmt::Debug for TierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierRegistry")
            .field("tiers", &self.tier_names())
            .finish()
    }
}

impl TierRegistry {
    /// Build adapters for every enabled tier.
    pub fn from_tiers(tiers: &[BackendTier], client: reqwest::Client) -> Result<Self, RegistryError> {
        let mut handles = Vec::new();
        for tier in tiers.iter().filter(|tier| tier.enabled) {
            let adapter = build_adapter(tier, client.clone())?;
            info!(
                tier = %tier.name,
                provider = tier.provider.as_str(),
                routing_tier = tier.routing_tier,
                host = %adapter.describe_host(),
                "Registered backend tier"
            );
            handles.push(TierHandle {
                tier: tier.clone(),
                adapter,
            });
        }
        Ok(Self::from_handles(handles))
    }

    /// Assemble a registry from prebuilt handles (adapters injected by
    /// tests or embedders). Handles are ordered by `routing_tier`,
    /// preserving relative order on ties.
    pub fn from_handles(mut handles: Vec<TierHandle>) -> Self {
        handles.sort_by_key(|handle| handle.tier.routing_tier);
        Self { tiers: handles }
    }

    /// Tiers in dispatch order.
    pub fn iter(&self) -> impl Iterator<Item = &TierHandle> {
        self.tiers.iter()
    }

    pub fn into_handles(self) -> Vec<TierHandle> {
        self.tiers
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers
            .iter()
            .map(|handle| handle.tier.name.as_str())
            .collect()
    }
}

fn build_adapter(
    tier: &BackendTier,
    client: reqwest::Client,
) -> Result<Arc<dyn BackendAdapter>, RegistryError> {
    let api_key = tier.resolve_api_key();

    // Hosted providers reject keyless calls outright, so surface that at
    // startup instead of as runtime 401s. Gateway deployments (custom
    // base_url) may legitimately run keyless.
    if api_key.is_none()
        && tier.base_url.is_none()
        && matches!(tier.provider, ProviderKind::Openai | ProviderKind::Anthropic)
    {
        let hint = match &tier.api_key_env {
            Some(var) => format!("set {}", var),
            None => "set api_key_env or api_key in the tier file".to_string(),
        };
        return Err(RegistryError::MissingApiKey {
            name: tier.name.clone(),
            hint,
        });
    }

    let adapter: Arc<dyn BackendAdapter> = match tier.provider {
        ProviderKind::Openai => {
            let base = tier.base_url.as_deref().unwrap_or(openai::DEFAULT_API_BASE);
            Arc::new(
                OpenAiAdapter::new(client, base, api_key, tier.model.clone()).map_err(
                    |source| RegistryError::InvalidBaseUrl {
                        name: tier.name.clone(),
                        url: base.to_string(),
                        source,
                    },
                )?,
            )
        }
        ProviderKind::Anthropic => {
            let base = tier
                .base_url
                .as_deref()
                .unwrap_or(anthropic::DEFAULT_API_BASE);
            Arc::new(
                AnthropicAdapter::new(client, base, api_key, tier.model.clone()).map_err(
                    |source| RegistryError::InvalidBaseUrl {
                        name: tier.name.clone(),
                        url: base.to_string(),
                        source,
                    },
                )?,
            )
        }
        ProviderKind::Ollama => {
            let base = tier.base_url.as_deref().unwrap_or(ollama::DEFAULT_API_BASE);
            Arc::new(
                OllamaAdapter::new(client, base, tier.model.clone()).map_err(|source| {
                    RegistryError::InvalidBaseUrl {
                        name: tier.name.clone(),
                        url: base.to_string(),
                        source,
                    }
                })?,
            )
        }
    };

    Ok(adapter)
}
