// ABOUTME: Language model provider abstraction and shared error type
// ABOUTME: Trait seam for HTTP clients plus a scripted model for embedding and tests

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AIServiceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No API key configured")]
    NoApiKey,

    #[error("No language model provider configured")]
    NoProviderConfigured,

    #[error("Invalid response format")]
    InvalidResponse,
}

pub type AIServiceResult<T> = Result<T, AIServiceError>;

/// Which vendor produced a completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    Anthropic,
    #[serde(rename = "openai")]
    OpenAi,
}

impl AiProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiProvider::Anthropic => "anthropic",
            AiProvider::OpenAi => "openai",
        }
    }
}

impl fmt::Display for AiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiProvider {
    type Err = AIServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anthropic" => Ok(AiProvider::Anthropic),
            "openai" => Ok(AiProvider::OpenAi),
            other => Err(AIServiceError::ParseError(format!(
                "Unknown provider: {}",
                other
            ))),
        }
    }
}

/// A chat-style text completion backend
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> AiProvider;

    async fn complete(&self, system_prompt: &str, prompt: &str) -> AIServiceResult<String>;
}

/// In-process model that replays canned replies and records every prompt.
///
/// Replies are consumed in order; once exhausted the last one repeats.
pub struct ScriptedModel {
    provider: AiProvider,
    replies: Mutex<Vec<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(provider: AiProvider) -> Self {
        Self {
            provider,
            replies: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Model that always answers with `text`
    pub fn replying(provider: AiProvider, text: &str) -> Self {
        Self::new(provider).then_reply(text)
    }

    /// Model whose every call fails with an API error
    pub fn failing(provider: AiProvider, message: &str) -> Self {
        Self::new(provider).then_fail(message)
    }

    pub fn then_reply(self, text: &str) -> Self {
        self.push(Ok(text.to_string()));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.push(Err(message.to_string()));
        self
    }

    fn push(&self, reply: Result<String, String>) {
        match self.replies.lock() {
            Ok(mut replies) => replies.push(reply),
            Err(poisoned) => poisoned.into_inner().push(reply),
        }
    }

    /// User prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        match self.prompts.lock() {
            Ok(prompts) => prompts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> AiProvider {
        self.provider
    }

    async fn complete(&self, _system_prompt: &str, prompt: &str) -> AIServiceResult<String> {
        match self.prompts.lock() {
            Ok(mut prompts) => prompts.push(prompt.to_string()),
            Err(poisoned) => poisoned.into_inner().push(prompt.to_string()),
        }

        let next = {
            let mut replies = match self.replies.lock() {
                Ok(replies) => replies,
                Err(poisoned) => poisoned.into_inner(),
            };
            if replies.len() > 1 {
                Some(replies.remove(0))
            } else {
                replies.first().cloned()
            }
        };

        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(AIServiceError::ApiError(message)),
            None => Err(AIServiceError::InvalidResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trips_through_str() {
        assert_eq!("openai".parse::<AiProvider>().unwrap(), AiProvider::OpenAi);
        assert_eq!(AiProvider::Anthropic.to_string(), "anthropic");
        assert!("gemini".parse::<AiProvider>().is_err());
    }

    #[tokio::test]
    async fn test_scripted_model_replays_in_order_then_repeats() {
        let model = ScriptedModel::new(AiProvider::OpenAi)
            .then_reply("first")
            .then_fail("boom");

        assert_eq!(model.complete("sys", "a").await.unwrap(), "first");
        assert!(matches!(
            model.complete("sys", "b").await,
            Err(AIServiceError::ApiError(_))
        ));
        assert!(model.complete("sys", "c").await.is_err());
        assert_eq!(model.prompts(), vec!["a", "b", "c"]);
    }
}
