// ABOUTME: Typed settings loaded from the environment with defaults
// ABOUTME: Out-of-range or unparsable values fall back to the default with a warning

use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;

use tracing::warn;

use crate::constants::*;

pub const DEFAULT_DATABASE_URL: &str = "sqlite:rekindle.db";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SOS_DAILY_LIMIT: u32 = 3;
pub const DEFAULT_LONG_PERSPECTIVE_CHARS: usize = 200;
pub const DEFAULT_EMERGENCY_TRIGGERS: [&str; 3] = ["unsafe", "abuse", "hurt me"];
pub const DEFAULT_SPAM_NOTIFICATION_CAP: u32 = 20;
pub const DEFAULT_NOTIFICATION_FREQUENCY_MINUTES: u32 = 5;
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 200;
pub const DEFAULT_DELIVERY_INTERVAL_SECS: u64 = 30;

/// Read a numeric variable, keeping it only when it parses and lies in `range`
fn read_ranged<T, F>(lookup: &F, name: &str, default: T, range: RangeInclusive<T>) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return default;
    };

    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => value,
        Ok(value) => {
            warn!(
                "{}={} outside {}..={}, using default {}",
                name,
                value,
                range.start(),
                range.end(),
                default
            );
            default
        }
        Err(_) => {
            warn!("{}={:?} is not a number, using default {}", name, raw, default);
            default
        }
    }
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Language model provider settings
#[derive(Debug, Clone, PartialEq)]
pub struct AiSettings {
    pub anthropic_api_key: Option<String>,
    pub anthropic_model: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub request_timeout_secs: u64,
}

impl AiSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            anthropic_api_key: non_empty(ANTHROPIC_API_KEY),
            anthropic_model: non_empty(ANTHROPIC_MODEL)
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
            openai_api_key: non_empty(OPENAI_API_KEY),
            openai_model: non_empty(OPENAI_MODEL)
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            request_timeout_secs: read_ranged(
                &lookup,
                REKINDLE_AI_TIMEOUT_SECS,
                DEFAULT_AI_TIMEOUT_SECS,
                5..=600,
            ),
        }
    }
}

impl Default for AiSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// SOS flow policy settings
#[derive(Debug, Clone, PartialEq)]
pub struct SosSettings {
    /// Initiations allowed per user per UTC calendar day
    pub daily_initiation_limit: u32,
    /// Perspective length above which the heavier provider is used
    pub long_perspective_chars: usize,
    /// Lowercase keywords that open the emergency protocol on free-text answers
    pub emergency_triggers: Vec<String>,
}

impl SosSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let emergency_triggers = lookup(REKINDLE_EMERGENCY_TRIGGERS)
            .map(|raw| {
                raw.split(',')
                    .map(|t| t.trim().to_lowercase())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|triggers| !triggers.is_empty())
            .unwrap_or_else(default_triggers);

        Self {
            daily_initiation_limit: read_ranged(
                &lookup,
                REKINDLE_SOS_DAILY_LIMIT,
                DEFAULT_SOS_DAILY_LIMIT,
                1..=20,
            ),
            long_perspective_chars: read_ranged(
                &lookup,
                REKINDLE_SOS_LONG_PERSPECTIVE_CHARS,
                DEFAULT_LONG_PERSPECTIVE_CHARS,
                50..=5000,
            ),
            emergency_triggers,
        }
    }
}

fn default_triggers() -> Vec<String> {
    DEFAULT_EMERGENCY_TRIGGERS
        .iter()
        .map(|t| t.to_string())
        .collect()
}

impl Default for SosSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Consequence engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct ConsequenceSettings {
    /// Hard ceiling on scheduled notifications per spam campaign
    pub spam_notification_cap: u32,
    /// Cadence used when a user's preference is missing or invalid
    pub default_frequency_minutes: u32,
}

impl ConsequenceSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        Self {
            spam_notification_cap: read_ranged(
                &lookup,
                REKINDLE_SPAM_NOTIFICATION_CAP,
                DEFAULT_SPAM_NOTIFICATION_CAP,
                1..=20,
            ),
            default_frequency_minutes: read_ranged(
                &lookup,
                REKINDLE_DEFAULT_NOTIFICATION_FREQUENCY_MINUTES,
                DEFAULT_NOTIFICATION_FREQUENCY_MINUTES,
                1..=120,
            ),
        }
    }
}

impl Default for ConsequenceSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Storage location and background plumbing
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeSettings {
    pub database_url: String,
    pub event_channel_size: usize,
    pub delivery_interval_secs: u64,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        Self {
            database_url: lookup(REKINDLE_DATABASE_URL)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            event_channel_size: read_ranged(
                &lookup,
                REKINDLE_EVENT_CHANNEL_SIZE,
                DEFAULT_EVENT_CHANNEL_SIZE,
                10..=10000,
            ),
            delivery_interval_secs: read_ranged(
                &lookup,
                REKINDLE_DELIVERY_INTERVAL_SECS,
                DEFAULT_DELIVERY_INTERVAL_SECS,
                1..=3600,
            ),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let sos = SosSettings::default();
        assert_eq!(sos.daily_initiation_limit, 3);
        assert_eq!(sos.long_perspective_chars, 200);
        assert_eq!(sos.emergency_triggers, vec!["unsafe", "abuse", "hurt me"]);

        let consequences = ConsequenceSettings::default();
        assert_eq!(consequences.spam_notification_cap, 20);
        assert_eq!(consequences.default_frequency_minutes, 5);

        let ai = AiSettings::default();
        assert!(ai.anthropic_api_key.is_none());
        assert_eq!(ai.openai_model, DEFAULT_OPENAI_MODEL);
    }

    #[test]
    fn test_out_of_range_falls_back() {
        let lookup = lookup_from(&[
            (REKINDLE_SOS_DAILY_LIMIT, "500"),
            (REKINDLE_SPAM_NOTIFICATION_CAP, "50"),
            (REKINDLE_EVENT_CHANNEL_SIZE, "not-a-number"),
        ]);

        assert_eq!(SosSettings::from_lookup(&lookup).daily_initiation_limit, 3);
        assert_eq!(
            ConsequenceSettings::from_lookup(&lookup).spam_notification_cap,
            20
        );
        assert_eq!(RuntimeSettings::from_lookup(&lookup).event_channel_size, 200);
    }

    #[test]
    fn test_custom_values_are_used() {
        let lookup = lookup_from(&[
            (REKINDLE_SOS_DAILY_LIMIT, "5"),
            (REKINDLE_EMERGENCY_TRIGGERS, " Unsafe , scared ,, "),
            (ANTHROPIC_API_KEY, "sk-ant-test"),
            (OPENAI_API_KEY, "   "),
        ]);

        let sos = SosSettings::from_lookup(&lookup);
        assert_eq!(sos.daily_initiation_limit, 5);
        assert_eq!(sos.emergency_triggers, vec!["unsafe", "scared"]);

        let ai = AiSettings::from_lookup(&lookup);
        assert_eq!(ai.anthropic_api_key.as_deref(), Some("sk-ant-test"));
        assert!(ai.openai_api_key.is_none());
    }
}
