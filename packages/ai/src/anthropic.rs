// ABOUTME: Anthropic Claude messages API client
// ABOUTME: Heavier-reasoning backend used for fight-solver analysis

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use rekindle_config::AiSettings;

use crate::provider::{AIServiceError, AIServiceResult, AiProvider, LanguageModel};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    content_type: String,
    #[serde(default)]
    text: String,
}

pub struct AnthropicClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    timeout_secs: u64,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String, timeout_secs: u64) -> AIServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: ANTHROPIC_API_URL.to_string(),
            timeout_secs,
        })
    }

    /// Client from settings, or `None` when no key is configured
    pub fn from_settings(settings: &AiSettings) -> AIServiceResult<Option<Self>> {
        match &settings.anthropic_api_key {
            Some(key) => Ok(Some(Self::new(
                key.clone(),
                settings.anthropic_model.clone(),
                settings.request_timeout_secs,
            )?)),
            None => {
                info!("ANTHROPIC_API_KEY not set - heavy provider unavailable");
                Ok(None)
            }
        }
    }

    /// Point the client at a different host, e.g. a proxy or a mock server
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    fn provider(&self) -> AiProvider {
        AiProvider::Anthropic
    }

    async fn complete(&self, system_prompt: &str, prompt: &str) -> AIServiceResult<String> {
        if self.api_key.is_empty() {
            return Err(AIServiceError::NoApiKey);
        }

        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            system: system_prompt,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        info!("Making Anthropic API request: model={}", self.model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(
                        "Anthropic API request timed out after {} seconds",
                        self.timeout_secs
                    );
                    AIServiceError::ApiError(format!(
                        "Request timed out after {} seconds",
                        self.timeout_secs
                    ))
                } else {
                    error!("Anthropic API request failed: {}", e);
                    AIServiceError::RequestFailed(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Anthropic API error: {} - {}", status, error_text);
            return Err(AIServiceError::ApiError(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        let body: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| AIServiceError::ParseError(e.to_string()))?;

        body.content
            .into_iter()
            .find(|block| block.content_type == "text")
            .map(|block| block.text)
            .ok_or(AIServiceError::InvalidResponse)
    }
}
