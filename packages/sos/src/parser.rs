// ABOUTME: Best-effort extraction of structured analysis fields from a model reply
// ABOUTME: Every field has a documented default; fields that fell back are recorded

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_ROOT_CAUSE: &str = "Communication breakdown and unmet expectations";
pub const DEFAULT_FAULT_EXPLANATION: &str = "Both partners contributed to this conflict";
pub const DEFAULT_COMMUNICATION: &str = "Communication breakdown occurred";
pub const DEFAULT_VALIDATION: &str = "Both partners have valid emotional responses";
pub const DEFAULT_SUMMARY: &str = "Dr. Marcie reviewed both sides of this conflict";
pub const DEFAULT_COMMITMENT: &str = "work on better communication";

const MAX_ACTIONS: usize = 3;
const MAX_HEALING_CHALLENGES: usize = 3;

lazy_static! {
    static ref PARTNER_MENTION: Regex = Regex::new(r"(?i)partner\s*([12])\b").expect("valid fault regex");
    static ref SHARE: Regex = Regex::new(r"(\d{1,3})\s*%").expect("valid fault regex");
    static ref PAIRED_FAULT: Regex = Regex::new(
        r"(?i)partner\s*1\s+(?:and|&)\s+partner\s*2\b[^.!?\n%]{0,60}?(\d{1,3})\s*%[^.!?\n%\d]{0,12}?(\d{1,3})\s*%"
    )
    .expect("valid fault regex");
    static ref ANY_FAULT: Regex =
        Regex::new(r"(?i)(\d{1,3})\s*%\s*(?:of\s+(?:the\s+)?)?(?:fault|responsibility|blame)")
            .expect("valid fault regex");
    static ref SUMMARY: Regex =
        Regex::new(r"(?i)\b(?:in summary|to summarize|summary)\b\s*[:\-]?\s*([^.!?\n]+[.!?]?)")
            .expect("valid summary regex");
    static ref FIRST_SENTENCE: Regex = Regex::new(r"[^.!?]+[.!?]").expect("valid sentence regex");
    static ref ROOT_CAUSE: Regex = Regex::new(
        r"(?i)\b(?:root cause|underlying issue|real problem)(?:\s+analysis)?(?:\s+(?:is|was))?\s*[:\-]?\s*([^.!?\n]+)"
    )
    .expect("valid root cause regex");
    static ref FAULT_SENTENCE: Regex =
        Regex::new(r"(?i)[^.!?\n]*\b(?:fault|responsib\w*|blame)\b[^.!?\n]*[.!?]?")
            .expect("valid explanation regex");
    static ref COMMUNICATION_SENTENCE: Regex =
        Regex::new(r"(?i)[^.!?\n]*\b(?:communication|conversation)\b[^.!?\n]*[.!?]?")
            .expect("valid communication regex");
    static ref VALIDATION_SENTENCE: Regex =
        Regex::new(r"(?i)[^.!?\n]*\b(?:feel\w*|emotion\w*|valid\w*)\b[^.!?\n]*[.!?]?")
            .expect("valid validation regex");
    static ref PARTNER_ACTIONS: [Regex; 2] = [
        Regex::new(r"(?i)partner\s*1\b[^.!?\n]*?\b(?:needs? to|should|must)\s+([^.!?\n]+)")
            .expect("valid action regex"),
        Regex::new(r"(?i)partner\s*2\b[^.!?\n]*?\b(?:needs? to|should|must)\s+([^.!?\n]+)")
            .expect("valid action regex"),
    ];
    static ref JOINT_ACTIONS: Regex = Regex::new(
        r"(?i)\b(?:both(?:\s+of\s+you|\s+partners)?|together|jointly)\b[^.!?\n]*?\b(?:needs? to|should|must)\s+([^.!?\n]+)"
    )
    .expect("valid action regex");
    // Group 1 is the lead-in before the modal, checked for negation
    static ref APOLOGY: [Regex; 2] = [
        Regex::new(r"(?i)partner\s*1\b([^.!?\n]*?)\b(?:should|needs? to|must)\s+(?:also\s+|first\s+|sincerely\s+|genuinely\s+)?apologi[sz]e")
            .expect("valid apology regex"),
        Regex::new(r"(?i)partner\s*2\b([^.!?\n]*?)\b(?:should|needs? to|must)\s+(?:also\s+|first\s+|sincerely\s+|genuinely\s+)?apologi[sz]e")
            .expect("valid apology regex"),
    ];
    static ref BOTH_APOLOGIZE: Regex = Regex::new(
        r"(?i)\bboth\b([^.!?\n]*?)\b(?:should|needs? to|must)\s+(?:also\s+|first\s+|sincerely\s+|genuinely\s+)?apologi[sz]e"
    )
    .expect("valid apology regex");
    static ref NEGATION: Regex = Regex::new(r"(?i)\b(?:not|never|no)\b|n't\b").expect("valid apology regex");
    static ref COMMITMENT: [Regex; 2] = [
        Regex::new(r"(?i)partner\s*1\b[^.!?\n]*?\b(?:will|commit to|promise to)\s+([^.!?\n]+)")
            .expect("valid commitment regex"),
        Regex::new(r"(?i)partner\s*2\b[^.!?\n]*?\b(?:will|commit to|promise to)\s+([^.!?\n]+)")
            .expect("valid commitment regex"),
    ];
    static ref HEALING_CHALLENGE: Regex =
        Regex::new(r"(?i)\b(?:challenge|exercise|practice|activity)\b\s*[:\-]\s*([^.!?\n]+)")
            .expect("valid challenge regex");
}

/// Which partner a per-partner extraction is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Partner {
    One,
    Two,
}

impl Partner {
    fn index(self) -> usize {
        match self {
            Partner::One => 0,
            Partner::Two => 1,
        }
    }
}

/// Fields pulled out of free-form analysis text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFields {
    pub summary: String,
    pub root_cause: String,
    pub partner1_fault: u8,
    pub partner2_fault: u8,
    pub fault_explanation: String,
    pub partner1_actions: Vec<String>,
    pub partner2_actions: Vec<String>,
    pub joint_actions: Vec<String>,
    pub partner1_should_apologize: bool,
    pub partner2_should_apologize: bool,
    pub healing_challenges: Vec<String>,
    pub communication_breakdown: String,
    pub emotional_validation: String,
    pub degraded_fields: Vec<String>,
}

impl AnalysisFields {
    pub fn should_apologize(&self, partner: Partner) -> bool {
        match partner {
            Partner::One => self.partner1_should_apologize,
            Partner::Two => self.partner2_should_apologize,
        }
    }

    pub fn fault(&self, partner: Partner) -> u8 {
        match partner {
            Partner::One => self.partner1_fault,
            Partner::Two => self.partner2_fault,
        }
    }
}

fn clean(fragment: &str) -> String {
    fragment
        .trim()
        .trim_matches(|c: char| c == '*' || c == '"' || c == '#')
        .trim()
        .to_string()
}

fn first_capture(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|value| !value.is_empty())
}

fn first_match(pattern: &Regex, text: &str) -> Option<String> {
    pattern
        .find_iter(text)
        .map(|m| clean(m.as_str()))
        .find(|value| !value.is_empty())
}

fn all_captures(pattern: &Regex, text: &str, limit: usize) -> Vec<String> {
    pattern
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| clean(m.as_str()))
        .filter(|value| !value.is_empty())
        .take(limit)
        .collect()
}

/// Normalize two shares so they sum to exactly 100
fn normalize_fault(partner1: u32, partner2: u32) -> (u8, u8) {
    let total = partner1 + partner2;
    if total == 0 {
        return (50, 50);
    }
    let scaled = ((partner1 as f64 * 100.0) / total as f64).round() as u32;
    let partner1 = scaled.min(100) as u8;
    (partner1, 100 - partner1)
}

fn parse_percent(value: &str) -> Option<u32> {
    value.parse::<u32>().ok().filter(|p| *p <= 100)
}

/// First share stated for `partner`, looking only between a mention of
/// them and the next mention of either partner in the same sentence
fn partner_share(text: &str, partner: Partner) -> Option<u32> {
    let label = match partner {
        Partner::One => "1",
        Partner::Two => "2",
    };
    let mentions: Vec<(usize, usize, &str)> = PARTNER_MENTION
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), caps.get(1)?.as_str()))
        })
        .collect();

    mentions.iter().enumerate().find_map(|(i, (_, end, which))| {
        if *which != label {
            return None;
        }
        let stop = mentions.get(i + 1).map_or(text.len(), |next| next.0);
        let window = text[*end..stop]
            .split(['.', '!', '?', '\n'])
            .next()
            .unwrap_or_default();
        SHARE
            .captures(window)
            .filter(|caps| caps.get(0).is_some_and(|m| m.start() <= 60))
            .and_then(|caps| caps.get(1))
            .and_then(|m| parse_percent(m.as_str()))
    })
}

/// Any match of `pattern` whose lead-in carries no negation
fn affirmed(pattern: &Regex, text: &str) -> bool {
    pattern.captures_iter(text).any(|caps| {
        caps.get(1)
            .map_or(true, |lead_in| !NEGATION.is_match(lead_in.as_str()))
    })
}

fn extract_fault(text: &str) -> Option<(u8, u8)> {
    if let Some(caps) = PAIRED_FAULT.captures(text) {
        let shares = (
            caps.get(1).and_then(|m| parse_percent(m.as_str())),
            caps.get(2).and_then(|m| parse_percent(m.as_str())),
        );
        if let (Some(p1), Some(p2)) = shares {
            return Some(normalize_fault(p1, p2));
        }
    }

    match (partner_share(text, Partner::One), partner_share(text, Partner::Two)) {
        (Some(p1), Some(p2)) => return Some(normalize_fault(p1, p2)),
        (Some(p1), None) => return Some(normalize_fault(p1, 100 - p1)),
        (None, Some(p2)) => return Some(normalize_fault(100 - p2, p2)),
        (None, None) => {}
    }

    let shares: Vec<u32> = ANY_FAULT
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| parse_percent(m.as_str()))
        .take(2)
        .collect();

    match shares.as_slice() {
        [p1, p2] => Some(normalize_fault(*p1, *p2)),
        [p1] => Some(normalize_fault(*p1, 100 - p1)),
        _ => None,
    }
}

/// What `partner` promises to do, if the reply says so
pub fn extract_commitment(text: &str, partner: Partner) -> Option<String> {
    first_capture(&COMMITMENT[partner.index()], text)
}

/// Extract analysis fields from free-form text. Never fails.
pub fn parse_analysis(text: &str) -> AnalysisFields {
    let mut degraded = Vec::new();
    let mut or_default = |field: &str, value: Option<String>, default: &str| -> String {
        value.unwrap_or_else(|| {
            degraded.push(field.to_string());
            default.to_string()
        })
    };

    let summary = or_default(
        "summary",
        first_capture(&SUMMARY, text),
        &first_match(&FIRST_SENTENCE, text).unwrap_or_else(|| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                DEFAULT_SUMMARY.to_string()
            } else {
                trimmed.to_string()
            }
        }),
    );
    let root_cause = or_default("root_cause", first_capture(&ROOT_CAUSE, text), DEFAULT_ROOT_CAUSE);
    let fault_explanation = or_default(
        "fault_explanation",
        first_match(&FAULT_SENTENCE, text),
        DEFAULT_FAULT_EXPLANATION,
    );
    let communication_breakdown = or_default(
        "communication_breakdown",
        first_match(&COMMUNICATION_SENTENCE, text),
        DEFAULT_COMMUNICATION,
    );
    let emotional_validation = or_default(
        "emotional_validation",
        first_match(&VALIDATION_SENTENCE, text),
        DEFAULT_VALIDATION,
    );

    let (partner1_fault, partner2_fault) = match extract_fault(text) {
        Some(shares) => shares,
        None => {
            degraded.push("fault_assignment".to_string());
            (50, 50)
        }
    };

    let both_apologize = affirmed(&BOTH_APOLOGIZE, text);
    let fields = AnalysisFields {
        summary,
        root_cause,
        partner1_fault,
        partner2_fault,
        fault_explanation,
        partner1_actions: all_captures(&PARTNER_ACTIONS[0], text, MAX_ACTIONS),
        partner2_actions: all_captures(&PARTNER_ACTIONS[1], text, MAX_ACTIONS),
        joint_actions: all_captures(&JOINT_ACTIONS, text, MAX_ACTIONS),
        partner1_should_apologize: both_apologize || affirmed(&APOLOGY[0], text),
        partner2_should_apologize: both_apologize || affirmed(&APOLOGY[1], text),
        healing_challenges: all_captures(&HEALING_CHALLENGE, text, MAX_HEALING_CHALLENGES),
        communication_breakdown,
        emotional_validation,
        degraded_fields: degraded,
    };

    if !fields.degraded_fields.is_empty() {
        warn!(
            "Analysis reply missing fields, using defaults for: {}",
            fields.degraded_fields.join(", ")
        );
    }
    fields
}
