// ABOUTME: Integration tests for the Anthropic-backed config proposer against a mock server
// ABOUTME: Covers request shape, fenced responses, API failures and resolver wiring

use runbox_sandbox::{AnthropicProposer, ConfigProposer, ConfigResolver, ProposalRequest, SandboxError};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completion(text: &str) -> serde_json::Value {
    json!({
        "id": "msg_01",
        "type": "message",
        "role": "assistant",
        "model": "claude-test",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 10, "output_tokens": 20}
    })
}

#[tokio::test]
async fn test_proposer_sends_messages_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "test-key"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"model": "claude-test"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("{}")))
        .expect(1)
        .mount(&server)
        .await;

    let proposer = AnthropicProposer::new("test-key")
        .unwrap()
        .with_model("claude-test")
        .with_base_url(server.uri());

    let text = proposer
        .propose(&ProposalRequest::new("println(1)", "julia"))
        .await
        .unwrap();
    assert_eq!(text, "{}");
}

#[tokio::test]
async fn test_api_error_is_proposer_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;

    let proposer = AnthropicProposer::new("test-key")
        .unwrap()
        .with_base_url(server.uri());

    let err = proposer
        .propose(&ProposalRequest::new("x", "zig"))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Proposer(_)));
    assert!(err.to_string().contains("429"));
}

#[tokio::test]
async fn test_resolver_caches_fenced_proposal() {
    let server = MockServer::start().await;
    let fenced = "```json\n{\"baseImage\": \"julia:1.10\", \"runCommand\": [\"julia\", \"main.jl\"]}\n```";
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(fenced)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let proposer = AnthropicProposer::new("test-key")
        .unwrap()
        .with_base_url(server.uri());
    let resolver = ConfigResolver::new(cache.path()).with_proposer(Arc::new(proposer));

    let first = resolver.resolve("println(1)", "julia", false).await.unwrap();
    assert!(!first.cached);
    assert_eq!(first.config.base_image, "julia:1.10");
    assert_eq!(first.config.workdir, "/app");

    let second = resolver.resolve("println(1)", "julia", false).await.unwrap();
    assert!(second.cached);
}

#[tokio::test]
async fn test_prose_response_is_configuration_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(completion("I cannot determine an image.")),
        )
        .mount(&server)
        .await;

    let cache = TempDir::new().unwrap();
    let proposer = AnthropicProposer::new("test-key")
        .unwrap()
        .with_base_url(server.uri());
    let resolver = ConfigResolver::new(cache.path()).with_proposer(Arc::new(proposer));

    let err = resolver.resolve("x", "cobol", false).await.unwrap_err();
    assert!(matches!(err, SandboxError::Configuration(_)));
    assert_eq!(resolver.cache_stats().await.disk_size, 0);
}
