//! Anthropic messages API adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::backends::{
    BackendAdapter, BackendError, GenerateRequest, Generation, Usage, classify_status,
    parse_retry_after,
};

/// Default Anthropic API base.
pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";

/// API version header value the messages endpoint requires.
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    block_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Adapter for one Anthropic tier.
pub struct AnthropicAdapter {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
}

impl AnthropicAdapter {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        api_key: Option<String>,
        model: String,
    ) -> Result<Self, url::ParseError> {
        let endpoint = Url::parse(base_url)?.join("/v1/messages")?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl BackendAdapter for AnthropicAdapter {
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation, BackendError> {
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_output_tokens,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let mut http_request = self
            .client
            .post(self.endpoint.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.header("x-api-key", key);
        }

        let response = http_request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let detail = response.text().await.ok();
            return Err(classify_status(status.as_u16(), detail, retry_after));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| BackendError::transient(format!("malformed response: {}", err)))?;

        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| BackendError::transient("response contained no text block"))?;

        let usage = parsed
            .usage
            .map(|u| Usage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        debug!(
            item_id = %request.item_id,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "Message generation succeeded"
        );

        Ok(Generation { text, usage })
    }

    fn describe_host(&self) -> String {
        format!(
            "{} ({})",
            self.endpoint.host_str().unwrap_or("anthropic"),
            self.model
        )
    }
}
