//! OpenAI-compatible chat completion adapter.
//!
//! Speaks the `/v1/chat/completions` wire format, which also covers Azure
//! OpenAI, vLLM, LiteLLM, and self-hosted gateways through the tier's
//! `base_url` override.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::backends::{
    BackendAdapter, BackendError, GenerateRequest, Generation, Usage, classify_status,
    parse_retry_after,
};

/// Default OpenAI API base.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Adapter for one OpenAI-compatible tier.
pub struct OpenAiAdapter {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
}

impl OpenAiAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        model: String,
    ) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(base_url)?.join("/v1/chat/completions")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl BackendAdapter for OpenAiAdapter {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, BackendError> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_output_tokens,
        };

        let mut http_request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.header("Authorization", format!("Bearer {}", key));
        }

        let response = http_request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let detail = response.text().await.ok();
            return Err(classify_status(status.as_u16(), detail, retry_after));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| BackendError::transient(format!("malformed response: {}", err)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::transient("response contained no completion"))?;

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        debug!(
            item_id = %request.item_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Chat completion succeeded"
        );

        Ok(Generation { text, usage })
    }

    fn describe_host(&self) -> String {
        format!(
            "{} ({})",
            self.endpoint.host_str().unwrap_or("openai"),
            self.model
        )
    }
}
