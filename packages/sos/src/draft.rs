// ABOUTME: Per-participant input draft: phase, flow cursor and accumulated answers
// ABOUTME: Assembles the immutable SOS input once the last question is answered

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rekindle_core::new_id;
use serde::{Deserialize, Serialize};

use crate::error::{SosError, SosResult};
use crate::machine::SosPhase;
use crate::questions::{
    AnswerValue, FlowCursor, DESIRED_OUTCOME, EMOTIONAL_STATE, SEVERITY_LEVEL, TRIGGER_EVENT,
    YOUR_PERSPECTIVE,
};
use crate::types::{EmotionalState, SosInput};

/// Private working state; only its owner ever reads it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDraft {
    pub session_id: String,
    pub user_id: String,
    pub phase: SosPhase,
    pub cursor: FlowCursor,
    pub answers: BTreeMap<String, AnswerValue>,
    pub updated_at: DateTime<Utc>,
}

impl InputDraft {
    pub fn new(session_id: &str, user_id: &str, phase: SosPhase, cursor: FlowCursor) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            phase,
            cursor,
            answers: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn record(&mut self, question_id: &str, answer: AnswerValue) {
        self.answers.insert(question_id.to_string(), answer);
        self.updated_at = Utc::now();
    }

    fn text(&self, question_id: &str) -> SosResult<String> {
        match self.answers.get(question_id) {
            Some(AnswerValue::Text(text)) if !text.trim().is_empty() => Ok(text.clone()),
            _ => Err(SosError::Validation(format!(
                "Missing answer for '{}'",
                question_id
            ))),
        }
    }

    /// Build the SOS input from the collected answers
    pub fn assemble_input(&self) -> SosResult<SosInput> {
        let emotional_state: EmotionalState = self
            .text(EMOTIONAL_STATE)?
            .parse()
            .map_err(SosError::Validation)?;

        let severity_level = self
            .answers
            .get(SEVERITY_LEVEL)
            .and_then(AnswerValue::as_number)
            .filter(|value| (1..=5).contains(value))
            .ok_or_else(|| {
                SosError::Validation(format!("Missing answer for '{}'", SEVERITY_LEVEL))
            })?;

        Ok(SosInput {
            id: new_id("inp"),
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            perspective: self.text(YOUR_PERSPECTIVE)?,
            emotional_state,
            severity_level: severity_level as u8,
            trigger_event: self.text(TRIGGER_EVENT)?,
            desired_outcome: self.text(DESIRED_OUTCOME)?,
            submitted_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> InputDraft {
        InputDraft::new(
            "sos-1",
            "alice",
            SosPhase::WaitingForPartner,
            FlowCursor::default(),
        )
    }

    #[test]
    fn test_assembles_complete_input() {
        let mut draft = draft();
        draft.record(EMOTIONAL_STATE, AnswerValue::text("hurt"));
        draft.record(SEVERITY_LEVEL, AnswerValue::Number(3));
        draft.record(TRIGGER_EVENT, AnswerValue::text("the party"));
        draft.record(YOUR_PERSPECTIVE, AnswerValue::text("I felt abandoned"));
        draft.record(DESIRED_OUTCOME, AnswerValue::text("stay with me"));

        let input = draft.assemble_input().unwrap();
        assert_eq!(input.emotional_state, EmotionalState::Hurt);
        assert_eq!(input.severity_level, 3);
        assert_eq!(input.perspective, "I felt abandoned");
        assert_eq!(input.user_id, "alice");
    }

    #[test]
    fn test_missing_field_is_validation_error() {
        let mut draft = draft();
        draft.record(EMOTIONAL_STATE, AnswerValue::text("sad"));
        draft.record(SEVERITY_LEVEL, AnswerValue::Number(2));

        match draft.assemble_input() {
            Err(SosError::Validation(msg)) => assert!(msg.contains(YOUR_PERSPECTIVE)),
            other => panic!("Expected Validation, got {:?}", other),
        }
    }
}
