// ABOUTME: Fixed activation policy keyed by trigger cause
// ABOUTME: Screensaver art, block and spam durations, makeup categories and rule filtering

use chrono::{DateTime, Utc};
use rekindle_storage::ConsequencePreferences;

use crate::types::{ConsequenceRule, ConsequenceType, ScreensaverCategory, TriggerCause};

pub const MAX_CAPTION_CHARS: usize = 50;
pub const MAX_SPAM_MESSAGE_CHARS: usize = 60;

pub const DEFAULT_BLOCKED_APPS: [&str; 5] = ["instagram", "tiktok", "twitter", "facebook", "snapchat"];

pub const BASE_SPAM_MESSAGES: [&str; 10] = [
    "Your relationship is calling! 📞💕",
    "Don't ignore your partner's needs! 💔",
    "Dr. Marcie reminder: Love requires effort! 💪❤️",
    "Your couple goals are waiting! ⏰👫",
    "Relationship maintenance in progress... 🔧💕",
    "Skipping again? I'm starting to think you're hiding something... 👀",
    "Your partner deserves better than excuses. Step up! 💪",
    "This is your conscience speaking. Well, it's actually me, Dr. Marcie. 😏",
    "Commitment issues are so last season, darling. 💅",
    "Your relationship won't fix itself. Get back in there! 🏃‍♀️💨",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreensaverImage {
    pub id: &'static str,
    pub url: &'static str,
    pub category: ScreensaverCategory,
    pub caption: &'static str,
}

pub const SCREENSAVER_IMAGES: [ScreensaverImage; 4] = [
    ScreensaverImage {
        id: "guilt-1",
        url: "https://images.pexels.com/photos/3184291/pexels-photo-3184291.jpeg",
        category: ScreensaverCategory::GuiltTrip,
        caption: "Your partner is waiting... Still avoiding that challenge?",
    },
    ScreensaverImage {
        id: "motivational-1",
        url: "https://images.pexels.com/photos/1509428/pexels-photo-1509428.jpeg",
        category: ScreensaverCategory::Motivational,
        caption: "Growth happens outside your comfort zone. Get back in there!",
    },
    ScreensaverImage {
        id: "humorous-1",
        url: "https://images.pexels.com/photos/1108099/pexels-photo-1108099.jpeg",
        category: ScreensaverCategory::Humorous,
        caption: "This cat has more commitment than you right now.",
    },
    ScreensaverImage {
        id: "romantic-1",
        url: "https://images.pexels.com/photos/1024993/pexels-photo-1024993.jpeg",
        category: ScreensaverCategory::Romantic,
        caption: "Remember why you're doing this work together.",
    },
];

pub fn screensaver_category(cause: TriggerCause) -> ScreensaverCategory {
    match cause {
        TriggerCause::MissedChallenge => ScreensaverCategory::GuiltTrip,
        TriggerCause::SkippedTask => ScreensaverCategory::Humorous,
        TriggerCause::GameAbandoned => ScreensaverCategory::Romantic,
        TriggerCause::LowScore | TriggerCause::FightUnresolved | TriggerCause::StreakBroken => {
            ScreensaverCategory::Motivational
        }
    }
}

/// First image in the cause's category
pub fn screensaver_image(cause: TriggerCause) -> ScreensaverImage {
    let category = screensaver_category(cause);
    SCREENSAVER_IMAGES
        .iter()
        .find(|image| image.category == category)
        .copied()
        .unwrap_or(SCREENSAVER_IMAGES[0])
}

/// App block length in minutes
pub fn block_duration_minutes(cause: TriggerCause) -> u32 {
    match cause {
        TriggerCause::MissedChallenge => 60,
        TriggerCause::SkippedTask => 45,
        TriggerCause::GameAbandoned => 90,
        _ => 30,
    }
}

/// Length of a notification spam campaign in minutes
pub fn spam_duration_minutes(cause: TriggerCause) -> u32 {
    match cause {
        TriggerCause::MissedChallenge => 120,
        TriggerCause::SkippedTask => 90,
        TriggerCause::GameAbandoned => 180,
        _ => 60,
    }
}

pub fn makeup_category(cause: TriggerCause) -> &'static str {
    match cause {
        TriggerCause::LowScore => "trust",
        TriggerCause::SkippedTask => "fun",
        TriggerCause::GameAbandoned => "conflict-resolution",
        _ => "communication",
    }
}

/// Apps to block: the user's list when set, otherwise the defaults
pub fn apps_to_block(preferences: &ConsequencePreferences) -> Vec<String> {
    if preferences.blocked_app_categories.is_empty() {
        DEFAULT_BLOCKED_APPS.iter().map(|app| app.to_string()).collect()
    } else {
        preferences.blocked_app_categories.clone()
    }
}

/// Number of spam notifications a campaign would send at `frequency_minutes`
pub fn spam_count(duration_minutes: u32, frequency_minutes: u32) -> u32 {
    if frequency_minutes == 0 {
        return 0;
    }
    duration_minutes / frequency_minutes
}

/// Whether the user's preferences permit `rule` at `at`. Device-affecting
/// types are also suppressed inside exemption windows.
pub fn rule_allowed(rule: &ConsequenceRule, preferences: &ConsequencePreferences, at: DateTime<Utc>) -> bool {
    let opted_in = match rule.consequence_type {
        ConsequenceType::Screensaver => preferences.allow_screensaver_changes,
        ConsequenceType::AppBlock => preferences.allow_app_blocking,
        ConsequenceType::NotificationSpam => preferences.allow_notification_spam,
        ConsequenceType::ChallengeAssignment | ConsequenceType::PrivilegeLoss => true,
    };

    opted_in && !(rule.consequence_type.affects_device() && preferences.is_exempt_at(at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use rekindle_storage::ExemptionWindow;

    fn preferences() -> ConsequencePreferences {
        ConsequencePreferences {
            user_id: "alice".to_string(),
            allow_screensaver_changes: true,
            allow_app_blocking: false,
            allow_notification_spam: true,
            max_notification_frequency: 5,
            blocked_app_categories: Vec::new(),
            exemption_hours: Vec::new(),
            emergency_bypass: true,
            updated_at: Utc::now(),
        }
    }

    fn rule(consequence_type: ConsequenceType) -> ConsequenceRule {
        ConsequenceRule {
            id: format!("rule-{}", consequence_type),
            triggered_by: TriggerCause::MissedChallenge,
            severity: Severity::Light,
            consequence_type,
            description: "test".to_string(),
            persona_message: "test".to_string(),
            is_active: true,
            requires_consent: false,
            max_duration_minutes: None,
        }
    }

    #[test]
    fn test_cause_tables() {
        assert_eq!(screensaver_image(TriggerCause::MissedChallenge).id, "guilt-1");
        assert_eq!(screensaver_image(TriggerCause::StreakBroken).id, "motivational-1");
        assert_eq!(block_duration_minutes(TriggerCause::GameAbandoned), 90);
        assert_eq!(block_duration_minutes(TriggerCause::LowScore), 30);
        assert_eq!(spam_duration_minutes(TriggerCause::SkippedTask), 90);
        assert_eq!(spam_duration_minutes(TriggerCause::FightUnresolved), 60);
        assert_eq!(makeup_category(TriggerCause::GameAbandoned), "conflict-resolution");
        assert_eq!(makeup_category(TriggerCause::StreakBroken), "communication");
    }

    #[test]
    fn test_spam_count_floors() {
        assert_eq!(spam_count(120, 5), 24);
        assert_eq!(spam_count(60, 7), 8);
        assert_eq!(spam_count(60, 120), 0);
        assert_eq!(spam_count(60, 0), 0);
    }

    #[test]
    fn test_blocked_apps_fall_back_to_defaults() {
        let mut prefs = preferences();
        assert_eq!(apps_to_block(&prefs).len(), 5);

        prefs.blocked_app_categories = vec!["reddit".to_string()];
        assert_eq!(apps_to_block(&prefs), vec!["reddit".to_string()]);
    }

    #[test]
    fn test_rule_filtering_follows_preferences() {
        let prefs = preferences();
        let now = Utc::now();

        assert!(rule_allowed(&rule(ConsequenceType::Screensaver), &prefs, now));
        assert!(!rule_allowed(&rule(ConsequenceType::AppBlock), &prefs, now));
        assert!(rule_allowed(&rule(ConsequenceType::PrivilegeLoss), &prefs, now));
    }

    #[test]
    fn test_exemption_window_only_blocks_device_types() {
        let mut prefs = preferences();
        prefs.exemption_hours = vec![ExemptionWindow::new("22:00", "07:00").unwrap()];

        let night = Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap();
        let noon = night + Duration::hours(12) + Duration::minutes(30);

        assert!(!rule_allowed(&rule(ConsequenceType::Screensaver), &prefs, night));
        assert!(!rule_allowed(&rule(ConsequenceType::NotificationSpam), &prefs, night));
        assert!(rule_allowed(&rule(ConsequenceType::ChallengeAssignment), &prefs, night));
        assert!(rule_allowed(&rule(ConsequenceType::Screensaver), &prefs, noon));
    }
}
