use freshd::backends::anthropic::AnthropicAdapter;
use freshd::backends::ollama::OllamaAdapter;
use freshd::backends::openai::OpenAiAdapter;
use freshd::backends::{BackendAdapter, BackendErrorKind, GenerateRequest};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

fn request() -> GenerateRequest {
    GenerateRequest {
        prompt: "Summarize fn main() {}".to_string(),
        item_id: "item-1".to_string(),
        repo_id: "repo-1".to_string(),
        max_output_tokens: 128,
    }
}

#[tokio::test]
async fn openai_adapter_posts_chat_completions() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "max_tokens": 128
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "A no-op entry point."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7, "total_tokens": 19}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        Some("test-key".to_string()),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();

    let generation = adapter.generate(&request()).await.unwrap();
    assert_eq!(generation.text, "A no-op entry point.");
    assert_eq!(generation.usage.input_tokens, 12);
    assert_eq!(generation.usage.output_tokens, 7);
}

#[tokio::test]
async fn openai_adapter_surfaces_retry_after_on_429() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_json(json!({"error": {"message": "rate limit reached"}})),
        )
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        Some("test-key".to_string()),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();

    let err = adapter.generate(&request()).await.unwrap_err();
    assert!(matches!(
        err.kind,
        BackendErrorKind::RateLimited {
            retry_after_secs: Some(7)
        }
    ));
    assert!(err.is_transient());
}

#[tokio::test]
async fn openai_adapter_treats_auth_failures_as_fatal() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"error": {"message": "invalid api key"}})),
        )
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        Some("bad-key".to_string()),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();

    let err = adapter.generate(&request()).await.unwrap_err();
    assert!(matches!(err.kind, BackendErrorKind::Fatal));
    assert!(!err.is_transient());
    assert!(err.message.unwrap().contains("401"));
}

#[tokio::test]
async fn openai_adapter_retries_server_errors_as_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let adapter = OpenAiAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        Some("test-key".to_string()),
        "gpt-4o-mini".to_string(),
    )
    .unwrap();

    let err = adapter.generate(&request()).await.unwrap_err();
    assert!(matches!(err.kind, BackendErrorKind::Transient));
}

#[tokio::test]
async fn anthropic_adapter_sends_version_and_key_headers() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({
            "model": "claude-3-5-haiku-latest",
            "max_tokens": 128
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [
                {"type": "text", "text": "A no-op entry point."}
            ],
            "usage": {"input_tokens": 20, "output_tokens": 9}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = AnthropicAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        Some("test-key".to_string()),
        "claude-3-5-haiku-latest".to_string(),
    )
    .unwrap();

    let generation = adapter.generate(&request()).await.unwrap();
    assert_eq!(generation.text, "A no-op entry point.");
    assert_eq!(generation.usage.input_tokens, 20);
    assert_eq!(generation.usage.output_tokens, 9);
}

#[tokio::test]
async fn ollama_adapter_reads_eval_counts() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .and(body_partial_json(json!({
            "model": "qwen2.5-coder",
            "stream": false,
            "options": {"num_predict": 128}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "A no-op entry point.",
            "prompt_eval_count": 42,
            "eval_count": 17,
            "done": true
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let adapter = OllamaAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        "qwen2.5-coder".to_string(),
    )
    .unwrap();

    let generation = adapter.generate(&request()).await.unwrap();
    assert_eq!(generation.text, "A no-op entry point.");
    assert_eq!(generation.usage.input_tokens, 42);
    assert_eq!(generation.usage.output_tokens, 17);
}

#[tokio::test]
async fn ollama_adapter_rejects_empty_generations() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": "",
            "done": true
        })))
        .mount(&mock_server)
        .await;

    let adapter = OllamaAdapter::new(
        reqwest::Client::new(),
        &mock_server.uri(),
        "qwen2.5-coder".to_string(),
    )
    .unwrap();

    let err = adapter.generate(&request()).await.unwrap_err();
    assert!(matches!(err.kind, BackendErrorKind::Transient));
    assert!(err.message.unwrap().contains("no generation"));
}
