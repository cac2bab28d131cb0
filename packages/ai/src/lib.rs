// ABOUTME: Dr. Marcie persona and language model integration
// ABOUTME: Anthropic and OpenAI clients behind one trait, plus the response generator

pub mod anthropic;
pub mod extract;
pub mod generator;
pub mod openai;
pub mod persona;
pub mod provider;

pub use anthropic::AnthropicClient;
pub use extract::truncate_chars;
pub use generator::{Backend, MarcieGenerator, MarcieResponse};
pub use openai::OpenAiClient;
pub use persona::{
    ConversationContext, Mood, PersonaConfig, PersonaContext, SassLevel, SessionType, Tone,
};
pub use provider::{AIServiceError, AIServiceResult, AiProvider, LanguageModel, ScriptedModel};
