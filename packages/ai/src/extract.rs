// ABOUTME: Best-effort extraction of action items and follow-up questions from replies
// ABOUTME: Pattern-based, never fails; empty lists when nothing matches

use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_ACTION_ITEMS: usize = 3;
pub const MAX_FOLLOW_UPS: usize = 2;

lazy_static! {
    static ref ACTION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)\b(?:try|do|practice|work on|focus on|start|begin)\s+[^.!?]+")
            .expect("valid action regex"),
        Regex::new(r"(?i)\b(?:you should|you need to|i want you to)\s+[^.!?]+")
            .expect("valid action regex"),
    ];
    static ref QUESTION_PATTERN: Regex = Regex::new(r"[^.!?]*\?").expect("valid question regex");
}

/// Up to three imperative phrases in order of appearance
pub fn extract_action_items(text: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = ACTION_PATTERNS
        .iter()
        .flat_map(|pattern| pattern.find_iter(text))
        .map(|m| (m.start(), m.as_str().trim().to_string()))
        .collect();
    found.sort_by_key(|(start, _)| *start);

    let mut items: Vec<String> = Vec::new();
    for (_, item) in found {
        if !item.is_empty() && !items.iter().any(|existing| existing.contains(&item) || item.contains(existing.as_str())) {
            items.push(item);
        }
        if items.len() == MAX_ACTION_ITEMS {
            break;
        }
    }
    items
}

/// Up to two questions in order of appearance
pub fn extract_follow_ups(text: &str) -> Vec<String> {
    QUESTION_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| q.len() > 1)
        .take(MAX_FOLLOW_UPS)
        .collect()
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
