//! Ollama local model adapter.
//!
//! Local tiers have no API key and usually zero cost; usage is still
//! reported from the eval counts so token accounting stays uniform.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::backends::{
    BackendAdapter, BackendError, GenerateRequest, Generation, Usage, classify_status,
    parse_retry_after,
};

/// Default local Ollama endpoint.
pub const DEFAULT_API_BASE: &str = "http://localhost:11434";

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

/// Adapter for one local Ollama tier.
pub struct OllamaAdapter {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
}

impl OllamaAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        model: String,
    ) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(base_url)?.join("/api/generate")?;
        Ok(Self {
            client,
            endpoint,
            model,
        })
    }
}

#[async_trait]
impl BackendAdapter for OllamaAdapter {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, BackendError> {
        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: false,
            options: OllamaOptions {
                num_predict: request.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let detail = response.text().await.ok();
            return Err(classify_status(status.as_u16(), detail, retry_after));
        }

        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|err| BackendError::transient(format!("malformed response: {}", err)))?;

        let text = parsed
            .response
            .filter(|text| !text.is_empty())
            .ok_or_else(|| BackendError::transient("response contained no generation"))?;

        let usage = Usage {
            input_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
        };

        debug!(
            item_id = %request.item_id,
            output_tokens = usage.output_tokens,
            "Local generation succeeded"
        );

        Ok(Generation { text, usage })
    }

    fn describe_host(&self) -> String {
        format!(
            "{} ({})",
            self.endpoint.host_str().unwrap_or("localhost"),
            self.model
        )
    }
}
