// ABOUTME: Consequence rule, active consequence and metadata type definitions
// ABOUTME: Cause, type and status enums map directly onto TEXT columns

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What went wrong and prompted a consequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerCause {
    MissedChallenge,
    LowScore,
    SkippedTask,
    FightUnresolved,
    StreakBroken,
    GameAbandoned,
}

impl TriggerCause {
    pub const ALL: [TriggerCause; 6] = [
        TriggerCause::MissedChallenge,
        TriggerCause::LowScore,
        TriggerCause::SkippedTask,
        TriggerCause::FightUnresolved,
        TriggerCause::StreakBroken,
        TriggerCause::GameAbandoned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCause::MissedChallenge => "missed_challenge",
            TriggerCause::LowScore => "low_score",
            TriggerCause::SkippedTask => "skipped_task",
            TriggerCause::FightUnresolved => "fight_unresolved",
            TriggerCause::StreakBroken => "streak_broken",
            TriggerCause::GameAbandoned => "game_abandoned",
        }
    }
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Light,
    Medium,
    Heavy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConsequenceType {
    Screensaver,
    AppBlock,
    NotificationSpam,
    ChallengeAssignment,
    PrivilegeLoss,
}

impl ConsequenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsequenceType::Screensaver => "screensaver",
            ConsequenceType::AppBlock => "app_block",
            ConsequenceType::NotificationSpam => "notification_spam",
            ConsequenceType::ChallengeAssignment => "challenge_assignment",
            ConsequenceType::PrivilegeLoss => "privilege_loss",
        }
    }

    /// Types that change something on the user's device
    pub fn affects_device(&self) -> bool {
        matches!(
            self,
            ConsequenceType::Screensaver
                | ConsequenceType::AppBlock
                | ConsequenceType::NotificationSpam
        )
    }
}

impl fmt::Display for ConsequenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConsequenceStatus {
    PendingConsent,
    Active,
    Completed,
    Cancelled,
}

impl ConsequenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsequenceStatus::PendingConsent => "pending_consent",
            ConsequenceStatus::Active => "active",
            ConsequenceStatus::Completed => "completed",
            ConsequenceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsequenceStatus::Completed | ConsequenceStatus::Cancelled)
    }
}

impl fmt::Display for ConsequenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsequenceRule {
    pub id: String,
    pub triggered_by: TriggerCause,
    pub severity: Severity,
    pub consequence_type: ConsequenceType,
    pub description: String,
    pub persona_message: String,
    pub is_active: bool,
    pub requires_consent: bool,
    pub max_duration_minutes: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScreensaverCategory {
    GuiltTrip,
    Motivational,
    Humorous,
    Romantic,
}

/// What activation did, recorded per consequence type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsequenceMetadata {
    /// Not activated yet, or activation found nothing to do
    #[default]
    Pending,
    Screensaver {
        screensaver_image: String,
        original_screensaver: String,
        caption: String,
        image_category: ScreensaverCategory,
    },
    AppBlock {
        blocked_apps: Vec<String>,
        block_duration_minutes: u32,
        block_start_time: DateTime<Utc>,
        message: String,
    },
    NotificationSpam {
        notification_count: u32,
        scheduled_count: u32,
        frequency_minutes: u32,
        total_duration_minutes: u32,
        messages: Vec<String>,
        start_time: DateTime<Utc>,
    },
    ChallengeAssignment {
        challenge_id: String,
        challenge_title: String,
        assignment_message: String,
    },
    PrivilegeLoss {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveConsequence {
    pub id: String,
    pub rule_id: String,
    pub user_id: String,
    pub couple_id: String,
    pub consequence_type: ConsequenceType,
    pub trigger_cause: TriggerCause,
    pub status: ConsequenceStatus,
    /// Free-text reason supplied by the caller
    pub triggered_by: String,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub user_consent: bool,
    pub metadata: ConsequenceMetadata,
    pub marcie_commentary: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_wire_names_match_columns() {
        assert_eq!(
            serde_json::to_string(&TriggerCause::GameAbandoned).unwrap(),
            "\"game_abandoned\""
        );
        assert_eq!(
            serde_json::to_string(&ConsequenceStatus::PendingConsent).unwrap(),
            "\"pending_consent\""
        );
        for cause in TriggerCause::ALL {
            let json = serde_json::to_string(&cause).unwrap();
            assert_eq!(json, format!("\"{}\"", cause.as_str()));
        }
    }

    #[test]
    fn test_metadata_is_tagged() {
        let metadata = ConsequenceMetadata::PrivilegeLoss {
            message: "No new games".to_string(),
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["kind"], "privilege_loss");

        let pending: ConsequenceMetadata = serde_json::from_str(r#"{"kind":"pending"}"#).unwrap();
        assert_eq!(pending, ConsequenceMetadata::Pending);
    }

    #[test]
    fn test_device_affecting_types() {
        assert!(ConsequenceType::AppBlock.affects_device());
        assert!(!ConsequenceType::ChallengeAssignment.affects_device());
        assert!(!ConsequenceType::PrivilegeLoss.affects_device());
    }
}
