// ABOUTME: HTTP-level tests for the Anthropic and OpenAI clients
// ABOUTME: Uses wiremock to check request shape, response parsing and error mapping

use rekindle_ai::{AIServiceError, AnthropicClient, LanguageModel, OpenAiClient};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_anthropic_client_returns_first_text_block() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-test"))
        .and(header("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_1",
            "content": [{ "type": "text", "text": "Root cause: unmet expectations." }],
            "usage": { "input_tokens": 10, "output_tokens": 5 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = AnthropicClient::new("sk-ant-test".to_string(), "claude-test".to_string(), 5)
        .unwrap()
        .with_base_url(server.uri());

    let text = client.complete("system", "prompt").await.unwrap();
    assert_eq!(text, "Root cause: unmet expectations.");
}

#[tokio::test]
async fn test_anthropic_client_maps_http_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(529).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let client = AnthropicClient::new("sk-ant-test".to_string(), "claude-test".to_string(), 5)
        .unwrap()
        .with_base_url(server.uri());

    match client.complete("system", "prompt").await {
        Err(AIServiceError::ApiError(msg)) => assert!(msg.contains("overloaded")),
        other => panic!("Expected ApiError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_openai_client_reads_first_choice() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": "You should talk tonight." } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiClient::new("sk-test".to_string(), "gpt-test".to_string(), 5)
        .unwrap()
        .with_base_url(server.uri());

    let text = client.complete("system", "prompt").await.unwrap();
    assert_eq!(text, "You should talk tonight.");
}

#[tokio::test]
async fn test_openai_client_rejects_empty_choices() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let client = OpenAiClient::new("sk-test".to_string(), "gpt-test".to_string(), 5)
        .unwrap()
        .with_base_url(server.uri());

    assert!(matches!(
        client.complete("system", "prompt").await,
        Err(AIServiceError::InvalidResponse)
    ));
}
