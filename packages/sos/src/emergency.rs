// ABOUTME: Emergency protocol detection, crisis resources and resolution choices
// ABOUTME: Question-specific triggers escalate; global keywords only pause the flow

use serde::{Deserialize, Serialize};

use crate::questions::{AnswerValue, Question, QuestionType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisResource {
    pub name: String,
    pub contact: String,
    pub description: String,
}

/// Support lines offered whenever the protocol opens
pub fn crisis_resources() -> Vec<CrisisResource> {
    [
        (
            "Crisis counselor",
            "Call or text 988",
            "Connect with a crisis counselor, any time of day.",
        ),
        (
            "National Domestic Violence Hotline",
            "1-800-799-7233 or text START to 88788",
            "Confidential support if you feel unsafe in your relationship.",
        ),
        (
            "Local emergency services",
            "911",
            "Get local emergency resources if you are in immediate danger.",
        ),
    ]
    .into_iter()
    .map(|(name, contact, description)| CrisisResource {
        name: name.to_string(),
        contact: contact.to_string(),
        description: description.to_string(),
    })
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyChoice {
    /// Submit the held answer and move on
    Continue,
    /// Show the support resources again, answer stays held
    Escalate,
    /// Abandon the whole session
    Abandon,
}

impl EmergencyChoice {
    pub const ALL: [EmergencyChoice; 3] = [
        EmergencyChoice::Continue,
        EmergencyChoice::Escalate,
        EmergencyChoice::Abandon,
    ];
}

/// What matched when an answer opened the protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "keyword", rename_all = "snake_case")]
pub enum TriggerMatch {
    /// One of the question's own triggers; queues its escalation questions
    Question(String),
    /// A configured keyword matched inside free text
    Global(String),
}

impl TriggerMatch {
    pub fn escalates(&self) -> bool {
        matches!(self, TriggerMatch::Question(_))
    }

    pub fn keyword(&self) -> &str {
        match self {
            TriggerMatch::Question(keyword) | TriggerMatch::Global(keyword) => keyword,
        }
    }
}

/// Question triggers win over the global list. Global keywords only
/// apply to free-text answers.
pub fn detect_trigger(
    question: &Question,
    answer: &AnswerValue,
    global_triggers: &[String],
) -> Option<TriggerMatch> {
    if let Some(keyword) = question.matching_trigger(answer) {
        return Some(TriggerMatch::Question(keyword));
    }

    if question.question_type != QuestionType::Text {
        return None;
    }

    let haystack = answer.to_string().to_lowercase();
    global_triggers
        .iter()
        .map(|keyword| keyword.trim())
        .find(|keyword| !keyword.is_empty() && haystack.contains(&keyword.to_lowercase()))
        .map(|keyword| TriggerMatch::Global(keyword.to_string()))
}

/// Payload returned to the participant while the protocol is open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyPrompt {
    pub question_id: String,
    pub message: String,
    pub resources: Vec<CrisisResource>,
    pub choices: Vec<EmergencyChoice>,
}

impl EmergencyPrompt {
    pub fn new(question_id: &str, message: String) -> Self {
        Self {
            question_id: question_id.to_string(),
            message,
            resources: crisis_resources(),
            choices: EmergencyChoice::ALL.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::questions::{QuestionFlow, SAFETY_CHECK, SEVERITY_LEVEL, TRIGGER_EVENT};

    fn globals() -> Vec<String> {
        vec!["unsafe".to_string(), "abuse".to_string(), "hurt me".to_string()]
    }

    #[test]
    fn test_question_trigger_escalates() {
        let flow = QuestionFlow::standard();
        let question = flow.get(TRIGGER_EVENT).unwrap();

        let hit = detect_trigger(question, &AnswerValue::text("This was emotional ABUSE"), &globals())
            .unwrap();
        assert_eq!(hit, TriggerMatch::Question("abuse".to_string()));
        assert!(hit.escalates());
    }

    #[test]
    fn test_global_trigger_does_not_escalate() {
        let flow = QuestionFlow::standard();
        let question = flow.get(TRIGGER_EVENT).unwrap();

        let hit = detect_trigger(question, &AnswerValue::text("He said he would hurt me"), &globals())
            .unwrap();
        assert_eq!(hit, TriggerMatch::Global("hurt me".to_string()));
        assert!(!hit.escalates());
        assert_eq!(hit.keyword(), "hurt me");
    }

    #[test]
    fn test_global_triggers_ignore_non_text_questions() {
        let flow = QuestionFlow::standard();
        let scale = flow.get(SEVERITY_LEVEL).unwrap();
        assert_eq!(detect_trigger(scale, &AnswerValue::Number(5), &globals()), None);

        let safety = flow.get(SAFETY_CHECK).unwrap();
        let hit = detect_trigger(safety, &AnswerValue::text("Sometimes unsafe"), &globals());
        assert_eq!(hit, Some(TriggerMatch::Question("unsafe".to_string())));
    }

    #[test]
    fn test_prompt_offers_all_choices() {
        let prompt = EmergencyPrompt::new(TRIGGER_EVENT, "You matter.".to_string());
        assert_eq!(prompt.choices.len(), 3);
        assert!(!prompt.resources.is_empty());
    }
}
