// ABOUTME: Adaptive SOS question flow with branching follow-ups and escalation detours
// ABOUTME: Answer validation per question type and the cursor that picks the next question

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SosError, SosResult};

pub const EMOTIONAL_STATE: &str = "emotional-state";
pub const SEVERITY_LEVEL: &str = "severity-level";
pub const EMERGENCY_CHECK: &str = "emergency-check";
pub const TRIGGER_EVENT: &str = "trigger-event";
pub const YOUR_PERSPECTIVE: &str = "your-perspective";
pub const DESIRED_OUTCOME: &str = "desired-outcome";
pub const SAFETY_CHECK: &str = "safety-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    Text,
    Scale,
    Choice,
    Emotion,
}

/// A submitted answer, either free text/option or a scale value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnswerValue {
    Number(i64),
    Text(String),
}

impl AnswerValue {
    pub fn text(value: &str) -> Self {
        AnswerValue::Text(value.to_string())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AnswerValue::Text(text) => Some(text),
            AnswerValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            AnswerValue::Number(value) => Some(*value),
            AnswerValue::Text(text) => text.trim().parse().ok(),
        }
    }
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Number(value) => write!(f, "{}", value),
            AnswerValue::Text(text) => f.write_str(text),
        }
    }
}

/// Condition over a numeric answer that routes to a branch question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "value")]
pub enum Condition {
    AtLeast(i64),
    AtMost(i64),
    Equals(i64),
}

impl Condition {
    pub fn evaluate(&self, answer: &AnswerValue) -> bool {
        let Some(value) = answer.as_number() else {
            return false;
        };
        match self {
            Condition::AtLeast(threshold) => value >= *threshold,
            Condition::AtMost(threshold) => value <= *threshold,
            Condition::Equals(expected) => value == *expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub condition: Condition,
    pub next_question: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveLogic {
    /// Case-insensitive substrings that open the emergency protocol
    pub emotional_triggers: Vec<String>,
    /// Asked next once the protocol is resolved with "continue"
    pub escalation_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question: String,
    pub question_type: QuestionType,
    pub required: bool,
    #[serde(default)]
    pub options: Vec<String>,
    pub follow_up: Option<FollowUp>,
    pub adaptive_logic: Option<AdaptiveLogic>,
    /// Reachable only through a follow-up branch or an escalation
    #[serde(default)]
    pub detour: bool,
}

impl Question {
    fn new(id: &str, question: &str, question_type: QuestionType) -> Self {
        Self {
            id: id.to_string(),
            question: question.to_string(),
            question_type,
            required: true,
            options: Vec::new(),
            follow_up: None,
            adaptive_logic: None,
            detour: false,
        }
    }

    fn with_options(mut self, options: &[&str]) -> Self {
        self.options = options.iter().map(|o| o.to_string()).collect();
        self
    }

    fn with_follow_up(mut self, condition: Condition, next_question: &str) -> Self {
        self.follow_up = Some(FollowUp {
            condition,
            next_question: next_question.to_string(),
        });
        self
    }

    fn with_adaptive_logic(mut self, triggers: &[&str], escalations: &[&str]) -> Self {
        self.adaptive_logic = Some(AdaptiveLogic {
            emotional_triggers: triggers.iter().map(|t| t.to_string()).collect(),
            escalation_questions: escalations.iter().map(|q| q.to_string()).collect(),
        });
        self
    }

    fn as_detour(mut self) -> Self {
        self.detour = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Check and normalize an answer for this question.
    ///
    /// Scale answers become numbers in 1..=5, option answers take the
    /// canonical option spelling, and text answers are trimmed.
    pub fn validate(&self, answer: &AnswerValue) -> SosResult<AnswerValue> {
        match self.question_type {
            QuestionType::Scale => {
                let value = answer.as_number().ok_or_else(|| {
                    SosError::Validation(format!("'{}' expects a number from 1 to 5", self.id))
                })?;
                if !(1..=5).contains(&value) {
                    return Err(SosError::Validation(format!(
                        "'{}' must be between 1 and 5, got {}",
                        self.id, value
                    )));
                }
                Ok(AnswerValue::Number(value))
            }
            QuestionType::Choice | QuestionType::Emotion => {
                let raw = answer.to_string();
                let wanted = raw.trim().to_lowercase();
                self.options
                    .iter()
                    .find(|option| option.to_lowercase() == wanted)
                    .map(|option| AnswerValue::Text(option.clone()))
                    .ok_or_else(|| {
                        SosError::Validation(format!(
                            "'{}' is not an option for '{}'",
                            raw.trim(),
                            self.id
                        ))
                    })
            }
            QuestionType::Text => {
                let text = answer.to_string().trim().to_string();
                if self.required && text.is_empty() {
                    return Err(SosError::Validation(format!("'{}' requires an answer", self.id)));
                }
                Ok(AnswerValue::Text(text))
            }
        }
    }

    /// First question-specific trigger contained in the answer
    pub fn matching_trigger(&self, answer: &AnswerValue) -> Option<String> {
        let logic = self.adaptive_logic.as_ref()?;
        let haystack = answer.to_string().to_lowercase();
        logic
            .emotional_triggers
            .iter()
            .find(|trigger| haystack.contains(&trigger.to_lowercase()))
            .cloned()
    }
}

/// Where a participant is in the flow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowCursor {
    pub current: Option<String>,
    /// Last main-line question answered; detours resume after it
    pub anchor: Option<String>,
    pub pending_escalations: VecDeque<String>,
    pub answered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionFlow {
    questions: Vec<Question>,
}

impl QuestionFlow {
    /// The fight solver questionnaire
    pub fn standard() -> Self {
        let questions = vec![
            Question::new(
                EMOTIONAL_STATE,
                "First, let's check in with your emotions. How are you feeling right now?",
                QuestionType::Emotion,
            )
            .with_options(&["angry", "hurt", "confused", "frustrated", "sad"]),
            Question::new(
                SEVERITY_LEVEL,
                "On a scale of 1-5, how serious is this conflict?",
                QuestionType::Scale,
            )
            .with_follow_up(Condition::AtLeast(4), EMERGENCY_CHECK),
            Question::new(
                EMERGENCY_CHECK,
                "This seems intense. Do you feel safe and able to continue, or do you need immediate support?",
                QuestionType::Choice,
            )
            .with_options(&["I can continue", "I need immediate support", "I want to pause this"])
            .with_adaptive_logic(&["immediate support", "pause"], &[])
            .as_detour(),
            Question::new(
                TRIGGER_EVENT,
                "What specifically triggered this conflict? Be as detailed as you can.",
                QuestionType::Text,
            )
            .with_adaptive_logic(
                &["betrayal", "lying", "cheating", "abuse"],
                &[SAFETY_CHECK, "support-network"],
            ),
            Question::new(
                YOUR_PERSPECTIVE,
                "Now tell me your side of the story. What happened from your perspective?",
                QuestionType::Text,
            ),
            Question::new(
                DESIRED_OUTCOME,
                "What would you like to see happen to resolve this? What's your ideal outcome?",
                QuestionType::Text,
            ),
            Question::new(
                SAFETY_CHECK,
                "I need to ask - do you feel physically and emotionally safe in this relationship?",
                QuestionType::Choice,
            )
            .with_options(&[
                "Yes, completely safe",
                "Mostly safe",
                "Sometimes unsafe",
                "No, I don't feel safe",
            ])
            .with_adaptive_logic(&["unsafe", "don't feel safe"], &[])
            .as_detour(),
        ];
        Self { questions }
    }

    /// Append a question to the end of the main line
    pub fn with_question(mut self, question: Question) -> Self {
        self.questions.push(question);
        self
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn get(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    pub fn require(&self, id: &str) -> SosResult<&Question> {
        self.get(id)
            .ok_or_else(|| SosError::Validation(format!("Unknown question: {}", id)))
    }

    pub fn first(&self) -> Option<&Question> {
        self.questions.iter().find(|q| !q.detour)
    }

    /// Cursor positioned on the first question
    pub fn start(&self) -> FlowCursor {
        FlowCursor {
            current: self.first().map(|q| q.id.clone()),
            ..FlowCursor::default()
        }
    }

    /// Number of main-line questions, the denominator for progress
    pub fn main_line_len(&self) -> usize {
        self.questions.iter().filter(|q| !q.detour).count()
    }

    fn next_main_line(&self, cursor: &FlowCursor) -> Option<String> {
        let start = match &cursor.anchor {
            Some(anchor) => self.questions.iter().position(|q| &q.id == anchor)? + 1,
            None => 0,
        };
        self.questions[start..]
            .iter()
            .find(|q| !q.detour && !cursor.answered.contains(&q.id))
            .map(|q| q.id.clone())
    }

    /// Move the cursor past `question` and return the next question id.
    ///
    /// Order of precedence: a follow-up branch whose condition holds, then
    /// queued escalations, then the next unanswered main-line question.
    /// `answer` is `None` when an optional question was skipped. Escalation
    /// ids that are not part of the flow are ignored. `None` means the
    /// participant has finished.
    pub fn advance(
        &self,
        cursor: &mut FlowCursor,
        question: &Question,
        answer: Option<&AnswerValue>,
        escalate: bool,
    ) -> Option<String> {
        if !cursor.answered.contains(&question.id) {
            cursor.answered.push(question.id.clone());
        }
        if !question.detour {
            cursor.anchor = Some(question.id.clone());
        }

        if escalate {
            if let Some(logic) = &question.adaptive_logic {
                for id in &logic.escalation_questions {
                    let known = self.get(id).is_some();
                    let seen = cursor.answered.contains(id) || cursor.pending_escalations.contains(id);
                    if known && !seen {
                        cursor.pending_escalations.push_back(id.clone());
                    }
                }
            }
        }

        let branch = question
            .follow_up
            .as_ref()
            .zip(answer)
            .filter(|(follow_up, answer)| follow_up.condition.evaluate(answer))
            .map(|(follow_up, _)| follow_up.next_question.clone())
            .filter(|id| self.get(id).is_some() && !cursor.answered.contains(id));

        let next = branch
            .or_else(|| cursor.pending_escalations.pop_front())
            .or_else(|| self.next_main_line(cursor));

        cursor.current = next.clone();
        next
    }
}

impl Default for QuestionFlow {
    fn default() -> Self {
        Self::standard()
    }
}
