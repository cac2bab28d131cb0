// ABOUTME: Conflict analysis building blocks: prompt, provider class, apologies, feedback
// ABOUTME: Pure helpers composed by the manager when both inputs are in

use rekindle_ai::{Backend, PersonaConfig, PersonaContext, Tone};

use crate::parser::{extract_commitment, AnalysisFields, Partner, DEFAULT_COMMITMENT};
use crate::types::{ApologyScripts, SosInput};

pub const CATEGORY_COMMUNICATION: &str = "communication";
pub const CATEGORY_TRUST: &str = "trust";
pub const CATEGORY_CONFLICT_RESOLUTION: &str = "conflict-resolution";

const MAX_HEALING_CATEGORIES: usize = 2;
const HEAVY_SEVERITY: u8 = 4;

/// Heavy provider for intense or long-winded conflicts
pub fn select_backend(partner1: &SosInput, partner2: &SosInput, long_perspective_chars: usize) -> Backend {
    let inputs = [partner1, partner2];
    let severe = inputs.iter().any(|i| i.severity_level >= HEAVY_SEVERITY);
    let intense = inputs.iter().any(|i| i.emotional_state.is_intense());
    let long = inputs
        .iter()
        .any(|i| i.perspective.chars().count() > long_perspective_chars);

    if severe || intense || long {
        Backend::Heavy
    } else {
        Backend::Light
    }
}

/// Persona used for the verdict itself
pub fn analysis_persona() -> PersonaConfig {
    PersonaConfig::new(Tone::Direct, 4, PersonaContext::FightSolver)
}

fn perspective_block(label: &str, input: &SosInput) -> String {
    format!(
        "{} PERSPECTIVE:\n\
         - Emotional State: {}\n\
         - Severity Level: {}/5\n\
         - What Triggered This: {}\n\
         - Their Side of the Story: {}\n\
         - What They Want to Happen: {}",
        label,
        input.emotional_state,
        input.severity_level,
        input.trigger_event,
        input.perspective,
        input.desired_outcome,
    )
}

/// Single prompt carrying both sides of the conflict
pub fn build_analysis_prompt(partner1: &SosInput, partner2: &SosInput) -> String {
    format!(
        "You are Dr. Marcie Liss, analyzing a relationship conflict with your signature \"sweet-but-savage\" approach. Be direct, honest, and solution-focused.

CONFLICT ANALYSIS REQUEST:

{}

{}

PROVIDE A COMPREHENSIVE ANALYSIS INCLUDING:

1. ROOT CAUSE ANALYSIS: What's really going on beneath the surface?

2. FAULT ASSIGNMENT: Be specific about percentages and who bears responsibility for what. Don't be diplomatic - be honest.

3. COMMUNICATION BREAKDOWN: Where did the conversation go wrong?

4. EMOTIONAL VALIDATION: Acknowledge legitimate feelings while calling out unreasonable reactions.

5. IMMEDIATE ACTION PLAN: Who needs to apologize, what needs to be said, and in what order.

6. HEALING ROADMAP: Specific steps to prevent this from happening again.

Use your direct, no-nonsense style. Call out bad behavior, celebrate good intentions, and focus on practical solutions. Be the therapist they need, not the one they want.",
        perspective_block("PARTNER 1", partner1),
        perspective_block("PARTNER 2", partner2),
    )
}

fn apology_script(apologizer: &SosInput, other: &SosInput, commitment: Option<String>) -> String {
    let reason = if apologizer.trigger_event.to_lowercase().contains("said") {
        "what I said"
    } else {
        "my actions"
    };
    format!(
        "I'm sorry for {}. I understand how that made you feel {}. I will {} going forward.",
        reason,
        other.emotional_state,
        commitment.unwrap_or_else(|| DEFAULT_COMMITMENT.to_string()),
    )
}

/// Scripts only for partners the verdict says should apologize
pub fn apology_scripts(
    fields: &AnalysisFields,
    response: &str,
    partner1: &SosInput,
    partner2: &SosInput,
) -> ApologyScripts {
    ApologyScripts {
        partner1: fields.should_apologize(Partner::One).then(|| {
            apology_script(partner1, partner2, extract_commitment(response, Partner::One))
        }),
        partner2: fields.should_apologize(Partner::Two).then(|| {
            apology_script(partner2, partner1, extract_commitment(response, Partner::Two))
        }),
    }
}

/// Harder tone for whoever carries the larger share of fault
pub fn feedback_persona(own_fault: u8, other_fault: u8) -> PersonaConfig {
    if own_fault > other_fault {
        PersonaConfig::new(Tone::Direct, 4, PersonaContext::FightSolver)
    } else {
        PersonaConfig::new(Tone::Supportive, 2, PersonaContext::FightSolver)
    }
}

pub fn build_feedback_prompt(
    role: &str,
    own: &SosInput,
    partner: &SosInput,
    own_fault: u8,
    other_fault: u8,
) -> String {
    let guidance = if own_fault > other_fault {
        "They bear primary responsibility. Be direct about what they did wrong and what they need to do to fix it."
    } else {
        "They are less at fault but still need guidance. Validate their feelings while giving constructive advice."
    };

    format!(
        "Give personalized feedback to {} based on this conflict analysis:\n\n\
         Their input: \"{}\"\n\
         Their emotional state: {}\n\
         Their fault level: {}%\n\
         Partner's perspective: \"{}\"\n\n\
         {}\n\n\
         Be Dr. Marcie: direct, caring, but no-nonsense. Give them specific action steps.",
        role, own.perspective, own.emotional_state, own_fault, partner.perspective, guidance,
    )
}

/// One or two challenge categories for the healing plan
pub fn healing_categories(fields: &AnalysisFields) -> Vec<&'static str> {
    let root_cause = fields.root_cause.to_lowercase();
    let mut categories = Vec::new();

    if root_cause.contains("communication") {
        categories.push(CATEGORY_COMMUNICATION);
    }
    if root_cause.contains("trust") {
        categories.push(CATEGORY_TRUST);
    }
    if fields.partner1_should_apologize || fields.partner2_should_apologize {
        categories.push(CATEGORY_CONFLICT_RESOLUTION);
    }
    if categories.is_empty() {
        categories.push(CATEGORY_COMMUNICATION);
    }

    categories.truncate(MAX_HEALING_CATEGORIES);
    categories
}
