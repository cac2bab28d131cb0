// ABOUTME: Explicit finite-state machine for one participant's SOS journey
// ABOUTME: Pure transition function from (phase, event) to (next phase, effects)

use serde::{Deserialize, Serialize};

use crate::error::{SosError, SosResult};
use crate::questions::AnswerValue;
use crate::types::SessionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SosPhase {
    Initiation,
    InputCollection {
        question_id: String,
    },
    /// Side channel; the cursor does not move while the answer is held
    EmergencyProtocol {
        question_id: String,
        held_answer: AnswerValue,
        escalate: bool,
    },
    WaitingForPartner,
    Analyzing,
    Resolved,
    Abandoned,
}

impl SosPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SosPhase::Initiation => "initiation",
            SosPhase::InputCollection { .. } => "input_collection",
            SosPhase::EmergencyProtocol { .. } => "emergency_protocol",
            SosPhase::WaitingForPartner => "waiting_for_partner",
            SosPhase::Analyzing => "analyzing",
            SosPhase::Resolved => "resolved",
            SosPhase::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SosPhase::Resolved | SosPhase::Abandoned)
    }

    /// Shared session status overrides a participant's own phase once the
    /// session has moved past input collection.
    pub fn overlay(self, status: SessionStatus) -> Self {
        match status {
            SessionStatus::Analyzing => SosPhase::Analyzing,
            SessionStatus::Resolved => SosPhase::Resolved,
            SessionStatus::Abandoned => SosPhase::Abandoned,
            SessionStatus::Active | SessionStatus::PartnerPending => self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SosEvent {
    Initiated {
        first_question: String,
    },
    /// `next_question` is `None` when the answered question was the last one
    AnswerAccepted {
        next_question: Option<String>,
    },
    EmergencyTriggered {
        question_id: String,
        held_answer: AnswerValue,
        escalate: bool,
    },
    EmergencyContinued {
        next_question: Option<String>,
    },
    EmergencyEscalated,
    PartnerCompleted,
    AnalysisSucceeded,
    AnalysisFailed,
    Aborted,
}

impl SosEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SosEvent::Initiated { .. } => "initiated",
            SosEvent::AnswerAccepted { .. } => "answer_accepted",
            SosEvent::EmergencyTriggered { .. } => "emergency_triggered",
            SosEvent::EmergencyContinued { .. } => "emergency_continued",
            SosEvent::EmergencyEscalated => "emergency_escalated",
            SosEvent::PartnerCompleted => "partner_completed",
            SosEvent::AnalysisSucceeded => "analysis_succeeded",
            SosEvent::AnalysisFailed => "analysis_failed",
            SosEvent::Aborted => "aborted",
        }
    }
}

/// Work the manager performs after a transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    AskQuestion(String),
    Acknowledge,
    PersistInput,
    NotifyEmergency,
    PresentCrisisResources,
    RunAnalysis,
    MarkResolved,
    MarkAbandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SosPhase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SosPhase, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    pub fn has(&self, effect: &Effect) -> bool {
        self.effects.contains(effect)
    }
}

fn after_answer(next_question: Option<String>) -> Transition {
    match next_question {
        Some(id) => Transition::to(
            SosPhase::InputCollection {
                question_id: id.clone(),
            },
            vec![Effect::Acknowledge, Effect::AskQuestion(id)],
        ),
        None => Transition::to(
            SosPhase::WaitingForPartner,
            vec![Effect::Acknowledge, Effect::PersistInput],
        ),
    }
}

/// Apply `event` to `phase`. Illegal combinations are `InvalidState`.
pub fn transition(phase: &SosPhase, event: SosEvent) -> SosResult<Transition> {
    use SosEvent as E;
    use SosPhase as P;

    let result = match (phase, event) {
        (P::Initiation, E::Initiated { first_question }) => Transition::to(
            P::InputCollection {
                question_id: first_question.clone(),
            },
            vec![Effect::AskQuestion(first_question)],
        ),

        (P::InputCollection { .. }, E::AnswerAccepted { next_question }) => {
            after_answer(next_question)
        }

        (
            P::InputCollection { question_id },
            E::EmergencyTriggered {
                question_id: triggered,
                held_answer,
                escalate,
            },
        ) if *question_id == triggered => Transition::to(
            P::EmergencyProtocol {
                question_id: triggered,
                held_answer,
                escalate,
            },
            vec![Effect::NotifyEmergency, Effect::PresentCrisisResources],
        ),

        (P::EmergencyProtocol { .. }, E::EmergencyContinued { next_question }) => {
            after_answer(next_question)
        }

        (P::EmergencyProtocol { .. }, E::EmergencyEscalated) => {
            Transition::to(phase.clone(), vec![Effect::PresentCrisisResources])
        }

        (P::WaitingForPartner, E::PartnerCompleted) => {
            Transition::to(P::Analyzing, vec![Effect::RunAnalysis])
        }

        (P::Analyzing, E::AnalysisSucceeded) => {
            Transition::to(P::Resolved, vec![Effect::MarkResolved])
        }

        (P::Analyzing, E::AnalysisFailed) => {
            Transition::to(P::Abandoned, vec![Effect::MarkAbandoned])
        }

        (P::Abandoned, E::Aborted) => Transition::to(P::Abandoned, Vec::new()),

        (P::Resolved, E::Aborted) => {
            return Err(SosError::InvalidState(
                "A resolved session cannot be abandoned".to_string(),
            ))
        }

        (_, E::Aborted) => Transition::to(P::Abandoned, vec![Effect::MarkAbandoned]),

        (phase, event) => {
            return Err(SosError::InvalidState(format!(
                "Cannot apply '{}' while in '{}'",
                event.name(),
                phase.name()
            )))
        }
    };

    Ok(result)
}

/// Shared status changes allowed on the session row
pub fn status_transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus as S;
    matches!(
        (from, to),
        (S::Active, S::PartnerPending)
            | (S::Active, S::Analyzing)
            | (S::PartnerPending, S::Analyzing)
            | (S::Analyzing, S::Resolved)
            | (S::Active, S::Abandoned)
            | (S::PartnerPending, S::Abandoned)
            | (S::Analyzing, S::Abandoned)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collecting(id: &str) -> SosPhase {
        SosPhase::InputCollection {
            question_id: id.to_string(),
        }
    }

    #[test]
    fn test_initiation_asks_first_question() {
        let t = transition(
            &SosPhase::Initiation,
            SosEvent::Initiated {
                first_question: "emotional-state".to_string(),
            },
        )
        .unwrap();

        assert_eq!(t.next, collecting("emotional-state"));
        assert_eq!(t.effects, vec![Effect::AskQuestion("emotional-state".to_string())]);
    }

    #[test]
    fn test_final_answer_persists_input() {
        let t = transition(
            &collecting("desired-outcome"),
            SosEvent::AnswerAccepted { next_question: None },
        )
        .unwrap();

        assert_eq!(t.next, SosPhase::WaitingForPartner);
        assert!(t.has(&Effect::PersistInput));
    }

    #[test]
    fn test_emergency_holds_answer_without_advancing() {
        let held = AnswerValue::text("he said he would hurt me");
        let t = transition(
            &collecting("trigger-event"),
            SosEvent::EmergencyTriggered {
                question_id: "trigger-event".to_string(),
                held_answer: held.clone(),
                escalate: false,
            },
        )
        .unwrap();

        assert_eq!(
            t.next,
            SosPhase::EmergencyProtocol {
                question_id: "trigger-event".to_string(),
                held_answer: held,
                escalate: false,
            }
        );
        assert_eq!(t.effects, vec![Effect::NotifyEmergency, Effect::PresentCrisisResources]);

        let escalated = transition(&t.next, SosEvent::EmergencyEscalated).unwrap();
        assert_eq!(escalated.next, t.next);

        let resumed = transition(
            &t.next,
            SosEvent::EmergencyContinued {
                next_question: Some("your-perspective".to_string()),
            },
        )
        .unwrap();
        assert_eq!(resumed.next, collecting("your-perspective"));
    }

    #[test]
    fn test_emergency_for_other_question_is_rejected() {
        let result = transition(
            &collecting("trigger-event"),
            SosEvent::EmergencyTriggered {
                question_id: "severity-level".to_string(),
                held_answer: AnswerValue::Number(5),
                escalate: false,
            },
        );
        assert!(matches!(result, Err(SosError::InvalidState(_))));
    }

    #[test]
    fn test_analysis_outcomes() {
        let waiting = transition(&SosPhase::WaitingForPartner, SosEvent::PartnerCompleted).unwrap();
        assert_eq!(waiting.next, SosPhase::Analyzing);
        assert_eq!(waiting.effects, vec![Effect::RunAnalysis]);

        let ok = transition(&SosPhase::Analyzing, SosEvent::AnalysisSucceeded).unwrap();
        assert_eq!(ok.next, SosPhase::Resolved);

        let failed = transition(&SosPhase::Analyzing, SosEvent::AnalysisFailed).unwrap();
        assert_eq!(failed.next, SosPhase::Abandoned);
    }

    #[test]
    fn test_abort_rules() {
        let t = transition(&collecting("severity-level"), SosEvent::Aborted).unwrap();
        assert_eq!(t.next, SosPhase::Abandoned);
        assert_eq!(t.effects, vec![Effect::MarkAbandoned]);

        let again = transition(&SosPhase::Abandoned, SosEvent::Aborted).unwrap();
        assert!(again.effects.is_empty());

        assert!(transition(&SosPhase::Resolved, SosEvent::Aborted).is_err());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(transition(&SosPhase::WaitingForPartner, SosEvent::AnswerAccepted { next_question: None }).is_err());
        assert!(transition(&SosPhase::Resolved, SosEvent::PartnerCompleted).is_err());
        assert!(transition(&collecting("x"), SosEvent::EmergencyEscalated).is_err());
    }

    #[test]
    fn test_status_overlay_and_transitions() {
        assert_eq!(collecting("x").overlay(SessionStatus::Resolved), SosPhase::Resolved);
        assert_eq!(
            collecting("x").overlay(SessionStatus::PartnerPending),
            collecting("x")
        );
        assert!(status_transition_allowed(SessionStatus::PartnerPending, SessionStatus::Analyzing));
        assert!(!status_transition_allowed(SessionStatus::Resolved, SessionStatus::Abandoned));
        assert!(!status_transition_allowed(SessionStatus::Abandoned, SessionStatus::Active));
    }
}
