// ABOUTME: Dr. Marcie response generator with provider routing and graceful fallback
// ABOUTME: Lenient generation never fails; strict generation surfaces provider errors

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use rekindle_config::AiSettings;

use crate::anthropic::AnthropicClient;
use crate::extract::{extract_action_items, extract_follow_ups};
use crate::openai::OpenAiClient;
use crate::persona::{build_system_prompt, ConversationContext, Mood, PersonaConfig, SessionType, Tone};
use crate::provider::{AIServiceError, AIServiceResult, AiProvider, LanguageModel};

/// Provider class requested for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Stronger reasoning, used for conflict analysis
    Heavy,
    /// Cheaper, used for everyday replies
    Light,
}

impl Backend {
    fn other(self) -> Self {
        match self {
            Backend::Heavy => Backend::Light,
            Backend::Light => Backend::Heavy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarcieResponse {
    pub message: String,
    pub action_items: Vec<String>,
    pub follow_up_questions: Vec<String>,
    pub tone: Tone,
    /// Provider that produced the message; `None` for templates and fallbacks
    pub provider: Option<AiProvider>,
    /// True when the message did not come from a language model
    pub fallback: bool,
}

impl MarcieResponse {
    fn from_text(text: String, tone: Tone, provider: Option<AiProvider>, fallback: bool) -> Self {
        Self {
            action_items: extract_action_items(&text),
            follow_up_questions: extract_follow_ups(&text),
            message: text,
            tone,
            provider,
            fallback,
        }
    }
}

const FALLBACK_MESSAGES: [&str; 3] = [
    "Hmm, seems like I'm having a moment here. But let's keep going, relationships don't pause for technical difficulties!",
    "Well, that's awkward. Even therapists have off days. What were we talking about?",
    "Oops! Looks like my brain took a little vacation. Where were we in fixing your relationship?",
];

fn templates_for(tone: Tone) -> &'static [&'static str] {
    match tone {
        Tone::SweetSavage => &[
            "Oh honey, we need to talk about this. And by 'talk,' I mean I'm going to tell you exactly what's going on here.",
            "Listen sweetie, I've seen this pattern before, and it's not cute. Let's fix this before it gets worse.",
            "Okay, let's be real for a second. This isn't working, and we both know it. Time for some tough love.",
        ],
        Tone::Supportive => &[
            "I can see you're really trying, and that means everything. Let's work through this together.",
            "You're taking the right steps by being here. That shows real commitment to your relationship.",
            "This is challenging, but you have the strength to work through it. I believe in you both.",
        ],
        Tone::Direct => &[
            "Here's what needs to happen: you need to stop making excuses and start making changes.",
            "I'm going to be straight with you because that's what you need right now.",
            "No more dancing around the issue. Let's address this head-on.",
        ],
        Tone::Playful => &[
            "Alright lovebirds, time for some relationship homework! Don't worry, it's the fun kind.",
            "Let's shake things up a bit! I have just the challenge for you two.",
            "Ready to have some fun while fixing your relationship? That's my specialty!",
        ],
        Tone::Concerned => &[
            "I'm really glad you told me. Your safety matters more than any argument, so let's slow down for a moment.",
            "What you shared matters. Before anything else, I want to make sure you have support right now.",
        ],
    }
}

/// Stable index so the same prompt always maps to the same canned reply
fn stable_index(seed: &str, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    seed.bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
        % len
}

pub struct MarcieGenerator {
    heavy: Option<Arc<dyn LanguageModel>>,
    light: Option<Arc<dyn LanguageModel>>,
}

impl MarcieGenerator {
    pub fn new(
        heavy: Option<Arc<dyn LanguageModel>>,
        light: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self { heavy, light }
    }

    /// Generator with no providers; every reply is templated
    pub fn offline() -> Self {
        Self::new(None, None)
    }

    /// Anthropic as the heavy provider, OpenAI as the light one, per configured keys
    pub fn from_settings(settings: &AiSettings) -> AIServiceResult<Self> {
        let heavy = AnthropicClient::from_settings(settings)?
            .map(|client| Arc::new(client) as Arc<dyn LanguageModel>);
        let light = OpenAiClient::from_settings(settings)?
            .map(|client| Arc::new(client) as Arc<dyn LanguageModel>);

        let generator = Self::new(heavy, light);
        info!(
            "Dr. Marcie generator ready with providers: {:?}",
            generator.available_providers()
        );
        Ok(generator)
    }

    pub fn is_available(&self) -> bool {
        self.heavy.is_some() || self.light.is_some()
    }

    pub fn available_providers(&self) -> Vec<AiProvider> {
        self.heavy
            .iter()
            .chain(self.light.iter())
            .map(|model| model.provider())
            .collect()
    }

    /// Heavy for fight-solver sessions and heated moods, light otherwise
    pub fn select_backend(context: &ConversationContext) -> Backend {
        let heated = matches!(context.current_mood, Mood::Angry | Mood::Frustrated);
        if context.session_type == SessionType::FightSolver || heated {
            Backend::Heavy
        } else {
            Backend::Light
        }
    }

    fn slot(&self, backend: Backend) -> Option<&Arc<dyn LanguageModel>> {
        match backend {
            Backend::Heavy => self.heavy.as_ref(),
            Backend::Light => self.light.as_ref(),
        }
    }

    /// Requested backend if configured, otherwise the other one
    fn model_for(&self, backend: Backend) -> Option<&Arc<dyn LanguageModel>> {
        self.slot(backend).or_else(|| self.slot(backend.other()))
    }

    /// Generate a reply, degrading to canned text instead of failing
    pub async fn generate(
        &self,
        prompt: &str,
        context: &ConversationContext,
        persona: &PersonaConfig,
    ) -> MarcieResponse {
        let backend = Self::select_backend(context);

        let Some(model) = self.model_for(backend) else {
            debug!("No provider configured, using templated reply");
            return self.templated(prompt, persona);
        };

        let system_prompt = build_system_prompt(persona, context);
        match model.complete(&system_prompt, prompt).await {
            Ok(text) => MarcieResponse::from_text(text, persona.tone, Some(model.provider()), false),
            Err(e) => {
                warn!(
                    "Dr. Marcie generation via {} failed, using fallback: {}",
                    model.provider(),
                    e
                );
                self.fallback(prompt, persona)
            }
        }
    }

    /// Generate a reply on `backend`, propagating any provider error
    pub async fn generate_strict(
        &self,
        backend: Backend,
        prompt: &str,
        context: &ConversationContext,
        persona: &PersonaConfig,
    ) -> AIServiceResult<MarcieResponse> {
        let model = self
            .model_for(backend)
            .ok_or(AIServiceError::NoProviderConfigured)?;

        let system_prompt = build_system_prompt(persona, context);
        let text = model.complete(&system_prompt, prompt).await?;
        if text.trim().is_empty() {
            return Err(AIServiceError::InvalidResponse);
        }

        Ok(MarcieResponse::from_text(
            text,
            persona.tone,
            Some(model.provider()),
            false,
        ))
    }

    /// Deterministic in-character reply used when no provider exists
    pub fn templated(&self, prompt: &str, persona: &PersonaConfig) -> MarcieResponse {
        let templates = templates_for(persona.tone);
        let text = templates[stable_index(prompt, templates.len())].to_string();
        MarcieResponse::from_text(text, persona.tone, None, true)
    }

    /// Deterministic in-character reply used after a provider error
    pub fn fallback(&self, prompt: &str, persona: &PersonaConfig) -> MarcieResponse {
        let message = FALLBACK_MESSAGES[stable_index(prompt, FALLBACK_MESSAGES.len())].to_string();
        MarcieResponse {
            message,
            action_items: Vec::new(),
            follow_up_questions: vec!["What would you like to talk about?".to_string()],
            tone: persona.tone,
            provider: None,
            fallback: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persona::PersonaContext;
    use crate::provider::ScriptedModel;

    fn fight_context() -> ConversationContext {
        ConversationContext::new("alice", SessionType::FightSolver, Mood::Neutral)
    }

    fn persona() -> PersonaConfig {
        PersonaConfig::new(Tone::Supportive, 2, PersonaContext::FightSolver)
    }

    #[test]
    fn test_backend_selection() {
        assert_eq!(MarcieGenerator::select_backend(&fight_context()), Backend::Heavy);

        let angry = ConversationContext::new("alice", SessionType::CheckIn, Mood::Angry);
        assert_eq!(MarcieGenerator::select_backend(&angry), Backend::Heavy);

        let calm = ConversationContext::new("alice", SessionType::Challenge, Mood::Happy);
        assert_eq!(MarcieGenerator::select_backend(&calm), Backend::Light);
    }

    #[tokio::test]
    async fn test_offline_generation_is_templated_and_deterministic() {
        let generator = MarcieGenerator::offline();

        let first = generator.generate("hello", &fight_context(), &persona()).await;
        let second = generator.generate("hello", &fight_context(), &persona()).await;

        assert!(first.fallback);
        assert_eq!(first.provider, None);
        assert_eq!(first.message, second.message);
        assert!(templates_for(Tone::Supportive).contains(&first.message.as_str()));
    }

    #[tokio::test]
    async fn test_routes_to_other_provider_when_preferred_missing() {
        let light = Arc::new(ScriptedModel::replying(AiProvider::OpenAi, "Try a walk. How was it?"));
        let generator = MarcieGenerator::new(None, Some(light.clone() as Arc<dyn LanguageModel>));

        let response = generator.generate("prompt", &fight_context(), &persona()).await;

        assert_eq!(response.provider, Some(AiProvider::OpenAi));
        assert!(!response.fallback);
        assert_eq!(response.action_items, vec!["Try a walk".to_string()]);
        assert_eq!(response.follow_up_questions, vec!["How was it?".to_string()]);
        assert_eq!(light.call_count(), 1);
    }

    #[tokio::test]
    async fn test_provider_error_degrades_to_fallback() {
        let heavy: Arc<dyn LanguageModel> =
            Arc::new(ScriptedModel::failing(AiProvider::Anthropic, "overloaded"));
        let generator = MarcieGenerator::new(Some(heavy), None);

        let response = generator.generate("prompt", &fight_context(), &persona()).await;

        assert!(response.fallback);
        assert!(FALLBACK_MESSAGES.contains(&response.message.as_str()));
        assert_eq!(response.follow_up_questions.len(), 1);
    }

    #[tokio::test]
    async fn test_strict_generation_propagates_errors() {
        let generator = MarcieGenerator::offline();
        let result = generator
            .generate_strict(Backend::Heavy, "prompt", &fight_context(), &persona())
            .await;
        assert!(matches!(result, Err(AIServiceError::NoProviderConfigured)));

        let down: Arc<dyn LanguageModel> =
            Arc::new(ScriptedModel::failing(AiProvider::Anthropic, "down"));
        let failing = MarcieGenerator::new(Some(down), None);
        let result = failing
            .generate_strict(Backend::Heavy, "prompt", &fight_context(), &persona())
            .await;
        assert!(matches!(result, Err(AIServiceError::ApiError(_))));
    }

    #[tokio::test]
    async fn test_strict_generation_uses_requested_backend() {
        let heavy = Arc::new(ScriptedModel::replying(AiProvider::Anthropic, "heavy reply"));
        let light = Arc::new(ScriptedModel::replying(AiProvider::OpenAi, "light reply"));
        let generator = MarcieGenerator::new(
            Some(heavy.clone() as Arc<dyn LanguageModel>),
            Some(light.clone() as Arc<dyn LanguageModel>),
        );

        let response = generator
            .generate_strict(Backend::Light, "prompt", &fight_context(), &persona())
            .await
            .unwrap();

        assert_eq!(response.message, "light reply");
        assert_eq!(light.call_count(), 1);
        assert_eq!(heavy.call_count(), 0);
    }
}
