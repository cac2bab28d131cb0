// ABOUTME: SOS session, input and analysis type definitions
// ABOUTME: Status and emotional-state enums map directly onto TEXT columns

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rekindle_ai::{AiProvider, MarcieResponse, Mood};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Active,
    PartnerPending,
    Analyzing,
    Resolved,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::PartnerPending => "partner-pending",
            SessionStatus::Analyzing => "analyzing",
            SessionStatus::Resolved => "resolved",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    /// Counts against the one-open-session-per-couple rule
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionStatus::Active | SessionStatus::PartnerPending | SessionStatus::Analyzing
        )
    }

    /// Partners may still answer questions
    pub fn is_collecting(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::PartnerPending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Resolved | SessionStatus::Abandoned)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EmotionalState {
    Angry,
    Hurt,
    Confused,
    Frustrated,
    Sad,
}

impl EmotionalState {
    pub const ALL: [EmotionalState; 5] = [
        EmotionalState::Angry,
        EmotionalState::Hurt,
        EmotionalState::Confused,
        EmotionalState::Frustrated,
        EmotionalState::Sad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionalState::Angry => "angry",
            EmotionalState::Hurt => "hurt",
            EmotionalState::Confused => "confused",
            EmotionalState::Frustrated => "frustrated",
            EmotionalState::Sad => "sad",
        }
    }

    /// Emotions that call for the heavier analysis provider
    pub fn is_intense(&self) -> bool {
        matches!(self, EmotionalState::Angry | EmotionalState::Hurt)
    }

    pub fn as_mood(&self) -> Mood {
        match self {
            EmotionalState::Angry => Mood::Angry,
            EmotionalState::Hurt => Mood::Hurt,
            EmotionalState::Confused => Mood::Confused,
            EmotionalState::Frustrated => Mood::Frustrated,
            EmotionalState::Sad => Mood::Sad,
        }
    }
}

impl fmt::Display for EmotionalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmotionalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("Unknown emotional state: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosSession {
    pub id: String,
    pub couple_id: String,
    pub initiated_by: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// One partner's completed side of the conflict. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosInput {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub perspective: String,
    pub emotional_state: EmotionalState,
    pub severity_level: u8,
    pub trigger_event: String,
    pub desired_outcome: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAssignment {
    pub partner1_fault: u8,
    pub partner2_fault: u8,
    pub explanation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    pub partner1_actions: Vec<String>,
    pub partner2_actions: Vec<String>,
    pub joint_actions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApologyScripts {
    pub partner1: Option<String>,
    pub partner2: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApologyRequired {
    pub partner1_should_apologize: bool,
    pub partner2_should_apologize: bool,
    pub apology_scripts: ApologyScripts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizedFeedback {
    pub partner1: MarcieResponse,
    pub partner2: MarcieResponse,
}

/// Structured verdict delivered to both partners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictAnalysis {
    pub partner1_user_id: String,
    pub partner2_user_id: String,
    pub summary: String,
    pub root_cause: String,
    pub fault_assignment: FaultAssignment,
    pub recommendations: Recommendations,
    pub apology_required: ApologyRequired,
    pub healing_challenges: Vec<String>,
    pub communication_breakdown: String,
    pub emotional_validation: String,
    pub personalized_feedback: PersonalizedFeedback,
    /// Fields that fell back to defaults because the reply lacked them
    #[serde(default)]
    pub degraded_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SosAnalysis {
    pub id: String,
    pub session_id: String,
    pub ai_provider: AiProvider,
    pub analysis: ConflictAnalysis,
    pub raw_response: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanInitiate {
    pub can_initiate: bool,
    pub reason: Option<String>,
}

impl CanInitiate {
    pub fn allowed() -> Self {
        Self {
            can_initiate: true,
            reason: None,
        }
    }

    pub fn denied(reason: String) -> Self {
        Self {
            can_initiate: false,
            reason: Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_groups() {
        assert!(SessionStatus::Analyzing.is_open());
        assert!(!SessionStatus::Analyzing.is_collecting());
        assert!(SessionStatus::PartnerPending.is_collecting());
        assert!(SessionStatus::Abandoned.is_terminal());
        assert_eq!(
            serde_json::to_string(&SessionStatus::PartnerPending).unwrap(),
            "\"partner-pending\""
        );
    }

    #[test]
    fn test_emotional_state_parsing() {
        assert_eq!("  Hurt ".parse::<EmotionalState>(), Ok(EmotionalState::Hurt));
        assert!("elated".parse::<EmotionalState>().is_err());
        assert!(EmotionalState::Angry.is_intense());
        assert!(!EmotionalState::Sad.is_intense());
    }
}
