// ABOUTME: SOS fight solver: guided questionnaire, emergency checks and conflict analysis
// ABOUTME: Re-exports the manager and the types callers need to drive a session

pub mod analysis;
pub mod draft;
pub mod emergency;
pub mod error;
pub mod machine;
pub mod manager;
pub mod parser;
pub mod questions;
pub mod storage;
pub mod types;

pub use emergency::{crisis_resources, CrisisResource, EmergencyChoice, EmergencyPrompt};
pub use error::{SosError, SosResult};
pub use machine::{SosEvent, SosPhase};
pub use manager::{ParticipantView, Progress, SosManager, SubmitOutcome};
pub use questions::{AnswerValue, Question, QuestionFlow, QuestionType};
pub use storage::SosStorage;
pub use types::{
    CanInitiate, ConflictAnalysis, EmotionalState, SessionStatus, SosAnalysis, SosInput,
    SosSession,
};
