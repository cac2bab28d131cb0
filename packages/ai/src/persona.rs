// ABOUTME: Dr. Marcie persona configuration and conversation context
// ABOUTME: Builds the system prompt from tone, sass level and session type

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tone {
    SweetSavage,
    Supportive,
    Direct,
    Playful,
    Concerned,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::SweetSavage => "sweet-savage",
            Tone::Supportive => "supportive",
            Tone::Direct => "direct",
            Tone::Playful => "playful",
            Tone::Concerned => "concerned",
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How blunt the persona is, always within 1..=5
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct SassLevel(u8);

impl SassLevel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn new(level: u8) -> Self {
        Self(level.clamp(Self::MIN, Self::MAX))
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl From<u8> for SassLevel {
    fn from(level: u8) -> Self {
        Self::new(level)
    }
}

impl From<SassLevel> for u8 {
    fn from(level: SassLevel) -> Self {
        level.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersonaContext {
    Challenge,
    FightSolver,
    General,
    Consequence,
}

impl PersonaContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonaContext::Challenge => "challenge",
            PersonaContext::FightSolver => "fight-solver",
            PersonaContext::General => "general",
            PersonaContext::Consequence => "consequence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    Challenge,
    FightSolver,
    CheckIn,
    Consequence,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Challenge => "challenge",
            SessionType::FightSolver => "fight-solver",
            SessionType::CheckIn => "check-in",
            SessionType::Consequence => "consequence",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Neutral,
    Frustrated,
    Sad,
    Angry,
    Hurt,
    Confused,
}

impl Mood {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Happy => "happy",
            Mood::Neutral => "neutral",
            Mood::Frustrated => "frustrated",
            Mood::Sad => "sad",
            Mood::Angry => "angry",
            Mood::Hurt => "hurt",
            Mood::Confused => "confused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub tone: Tone,
    pub sass_level: SassLevel,
    pub context: PersonaContext,
}

impl PersonaConfig {
    pub fn new(tone: Tone, sass_level: u8, context: PersonaContext) -> Self {
        Self {
            tone,
            sass_level: SassLevel::new(sass_level),
            context,
        }
    }
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self::new(Tone::SweetSavage, 3, PersonaContext::General)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub user_id: String,
    pub couple_id: Option<String>,
    pub session_type: SessionType,
    pub current_mood: Mood,
    #[serde(default)]
    pub recent_challenges: Vec<String>,
    #[serde(default)]
    pub recent_history: Vec<String>,
}

impl ConversationContext {
    pub fn new(user_id: &str, session_type: SessionType, current_mood: Mood) -> Self {
        Self {
            user_id: user_id.to_string(),
            couple_id: None,
            session_type,
            current_mood,
            recent_challenges: Vec::new(),
            recent_history: Vec::new(),
        }
    }

    pub fn with_couple(mut self, couple_id: &str) -> Self {
        self.couple_id = Some(couple_id.to_string());
        self
    }

    pub fn with_recent_challenges(mut self, titles: Vec<String>) -> Self {
        self.recent_challenges = titles;
        self
    }
}

const BASE_PERSONALITY: &str = "You are Dr. Marcie Liss, a couples therapist with a unique \"sweet-but-savage\" approach. You're caring and supportive but also direct, witty, and sometimes sarcastic when needed. You don't sugarcoat things: you tell couples what they need to hear, not what they want to hear.

Your personality traits:
- Warm but no-nonsense
- Playfully sarcastic when appropriate
- Encouraging but realistic
- Sometimes blunt about uncomfortable truths
- Always ultimately supportive of the relationship
- Uses humor to defuse tension
- Calls out bad behavior directly
- Celebrates progress genuinely";

fn contextual_guidance(session_type: SessionType) -> &'static str {
    match session_type {
        SessionType::FightSolver => "You're helping resolve a conflict. Be direct about who's at fault, what needs to happen, and don't let anyone off the hook. Use tough love when necessary. Analyze both perspectives and give clear action steps.",
        SessionType::Challenge => "You're guiding a therapy game or challenge. Be encouraging but keep them accountable. Add some playful competition and light teasing. Make it fun but meaningful.",
        SessionType::Consequence => "You're delivering consequences for missed tasks. Be firm but fair. Explain why this matters for their relationship growth. Use your sweet-but-savage tone to motivate them.",
        SessionType::CheckIn => "You're having a general check-in. Be supportive but dig deeper when you sense they're not being fully honest. Ask follow-up questions and provide insights.",
    }
}

/// System prompt for one generation call
pub fn build_system_prompt(persona: &PersonaConfig, context: &ConversationContext) -> String {
    let mut prompt = format!(
        "{}\n\nCurrent tone: {}\nCurrent sass level: {}/5\nCurrent context: {}\nSession type: {}\nUser's current mood: {}",
        BASE_PERSONALITY,
        persona.tone,
        persona.sass_level.get(),
        persona.context.as_str(),
        context.session_type.as_str(),
        context.current_mood.as_str(),
    );

    if !context.recent_challenges.is_empty() {
        prompt.push_str(&format!(
            "\nRecent challenges: {}",
            context.recent_challenges.join(", ")
        ));
    }

    prompt.push_str("\n\n");
    prompt.push_str(contextual_guidance(context.session_type));
    prompt.push_str("\n\nRespond in character as Dr. Marcie Liss. Keep responses conversational, under 150 words, and include specific actionable advice when appropriate. Match your tone to the sass level and context.");
    prompt
}
