// ABOUTME: SOS fight solver orchestration over storage, generator and realtime events
// ABOUTME: Drives each participant's state machine and runs the analysis exactly once

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rekindle_ai::{
    AIServiceError, Backend, ConversationContext, MarcieGenerator, MarcieResponse, Mood,
    PersonaConfig, PersonaContext, SessionType, Tone,
};
use rekindle_config::SosSettings;
use rekindle_core::{new_id, EventSink, RealtimeEvent};
use rekindle_storage::challenges::{find_lowest_difficulty, insert_attempt};
use rekindle_storage::conversations::insert_conversation;
use rekindle_storage::notifications::insert_notification;
use rekindle_storage::{
    ChallengeSource, ChallengeStorage, ConversationStorage, Couple, CoupleStorage,
    NewConversationEntry, NewNotification, NotificationPriority,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::analysis::{
    analysis_persona, apology_scripts, build_analysis_prompt, build_feedback_prompt,
    feedback_persona, healing_categories, select_backend,
};
use crate::draft::InputDraft;
use crate::emergency::{detect_trigger, EmergencyChoice, EmergencyPrompt, TriggerMatch};
use crate::error::{SosError, SosResult};
use crate::machine::{transition, Effect, SosEvent, SosPhase};
use crate::parser::parse_analysis;
use crate::questions::{AnswerValue, Question, QuestionFlow, EMOTIONAL_STATE};
use crate::storage::{
    insert_analysis, insert_session, save_draft, update_status_if, BarrierOutcome, SosStorage,
};
use crate::types::{
    ApologyRequired, CanInitiate, ConflictAnalysis, EmotionalState, FaultAssignment,
    PersonalizedFeedback, Recommendations, SessionStatus, SosAnalysis, SosInput, SosSession,
};

const HISTORY_LIMIT: i64 = 10;
const RECENT_CHALLENGE_LIMIT: i64 = 5;
const SESSION_TYPE: &str = "fight-solver";

const INITIATION_PROMPT: &str = "The user just activated the SOS Fight Solver. They're in conflict with their partner. Welcome them, explain the process, and get them ready to share their side of the story. Be supportive but establish that you're going to get to the truth.";
const WAITING_PROMPT: &str = "Acknowledge that you've received their input about the conflict. Let them know you're waiting for their partner's perspective before providing analysis. Be reassuring but maintain your authority.";
const EMERGENCY_PROMPT: &str = "The user's answer suggests they may not feel safe. Pause the conflict process, thank them for being honest, and point them to immediate support. Make it clear they can continue, get support, or stop the session entirely.";
const SKIPPED_PROMPT: &str = "They chose to skip this question. Reassure them that's fine and guide them to the next one.";

const ACTIVATED_TITLE: &str = "🚨 SOS Fight Solver Activated";
const ACTIVATED_MESSAGE: &str =
    "Your partner needs help resolving a conflict. Dr. Marcie is waiting for your perspective.";
const VERDICT_TITLE: &str = "📋 Dr. Marcie Has Delivered Her Verdict";
const VERDICT_MESSAGE: &str =
    "Your conflict analysis is ready. Time to face the music and start healing!";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub answered: usize,
    pub total: usize,
}

/// What the participant should see after an answer or emergency choice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubmitOutcome {
    NextQuestion {
        question: Question,
        acknowledgment: MarcieResponse,
        progress: Progress,
    },
    Emergency {
        prompt: EmergencyPrompt,
    },
    WaitingForPartner {
        acknowledgment: MarcieResponse,
    },
    AnalysisComplete {
        analysis: SosAnalysis,
    },
    Abandoned {
        session: SosSession,
    },
}

/// One participant's view of a session; never includes partner answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub session: SosSession,
    pub phase: SosPhase,
    pub current_question: Option<Question>,
    pub progress: Progress,
    pub submitted: bool,
    pub partner_submitted: bool,
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

pub struct SosManager {
    storage: SosStorage,
    couples: CoupleStorage,
    challenges: ChallengeStorage,
    conversations: ConversationStorage,
    generator: Arc<MarcieGenerator>,
    events: Arc<dyn EventSink>,
    settings: SosSettings,
    flow: QuestionFlow,
}

impl SosManager {
    pub fn new(
        pool: SqlitePool,
        generator: Arc<MarcieGenerator>,
        events: Arc<dyn EventSink>,
        settings: SosSettings,
    ) -> Self {
        Self {
            storage: SosStorage::new(pool.clone()),
            couples: CoupleStorage::new(pool.clone()),
            challenges: ChallengeStorage::new(pool.clone()),
            conversations: ConversationStorage::new(pool),
            generator,
            events,
            settings,
            flow: QuestionFlow::standard(),
        }
    }

    /// Replace the questionnaire, e.g. to add optional questions
    pub fn with_flow(mut self, flow: QuestionFlow) -> Self {
        self.flow = flow;
        self
    }

    pub fn flow(&self) -> &QuestionFlow {
        &self.flow
    }

    fn emit_status(&self, session: &SosSession, status: SessionStatus) {
        self.events.emit(RealtimeEvent::SosStatusChanged {
            session_id: session.id.clone(),
            couple_id: session.couple_id.clone(),
            status: status.as_str().to_string(),
        });
    }

    async fn membership(&self, session_id: &str, user_id: &str) -> SosResult<(SosSession, Couple)> {
        let session = self.storage.require_session(session_id).await?;
        let couple = self.couples.require(&session.couple_id).await?;
        if !couple.is_member(user_id) {
            return Err(SosError::Authorization(format!(
                "User {} is not part of session {}",
                user_id, session_id
            )));
        }
        Ok((session, couple))
    }

    fn start_draft(&self, session_id: &str, user_id: &str) -> SosResult<InputDraft> {
        let cursor = self.flow.start();
        let first_question = cursor
            .current
            .clone()
            .ok_or_else(|| SosError::InvalidState("Question flow is empty".to_string()))?;
        let started = transition(&SosPhase::Initiation, SosEvent::Initiated { first_question })?;
        Ok(InputDraft::new(session_id, user_id, started.next, cursor))
    }

    async fn load_draft(&self, session_id: &str, user_id: &str) -> SosResult<InputDraft> {
        match self.storage.get_draft(session_id, user_id).await? {
            Some(draft) => Ok(draft),
            None => self.start_draft(session_id, user_id),
        }
    }

    fn progress(&self, draft: &InputDraft) -> Progress {
        let answered = draft
            .cursor
            .answered
            .iter()
            .filter(|id| self.flow.get(id).is_some_and(|q| !q.detour))
            .count();
        Progress {
            answered,
            total: self.flow.main_line_len(),
        }
    }

    fn mood_of(draft: &InputDraft) -> Mood {
        draft
            .answers
            .get(EMOTIONAL_STATE)
            .and_then(AnswerValue::as_text)
            .and_then(|text| text.parse::<EmotionalState>().ok())
            .map(|state| state.as_mood())
            .unwrap_or(Mood::Neutral)
    }

    /// How many sessions `user_id` may still start today
    pub async fn can_initiate(&self, user_id: &str) -> SosResult<CanInitiate> {
        let limit = self.settings.daily_initiation_limit;
        let today = self
            .storage
            .count_initiated_since(user_id, start_of_utc_day(Utc::now()))
            .await?;

        if today >= i64::from(limit) {
            debug!("User {} hit the SOS daily limit ({})", user_id, limit);
            return Ok(CanInitiate::denied(format!(
                "You have reached the daily limit of {} SOS sessions. Take some time to work on the feedback you've already received.",
                limit
            )));
        }
        Ok(CanInitiate::allowed())
    }

    /// Start a session for the couple and notify the other partner
    pub async fn initiate(&self, couple_id: &str, user_id: &str) -> SosResult<SosSession> {
        let check = self.can_initiate(user_id).await?;
        if !check.can_initiate {
            return Err(SosError::RateLimited {
                reason: check.reason.unwrap_or_default(),
            });
        }

        let couple = self
            .couples
            .get(couple_id)
            .await?
            .ok_or_else(|| SosError::NotFound(format!("Couple {}", couple_id)))?;
        let partner_id = couple
            .partner_of(user_id)
            .ok_or_else(|| {
                SosError::Authorization(format!("User {} is not part of couple {}", user_id, couple_id))
            })?
            .to_string();

        if let Some(existing) = self.storage.find_open_session(couple_id).await? {
            return Err(SosError::Conflict(format!(
                "SOS session {} is already {} for this couple",
                existing.id, existing.status
            )));
        }

        let session = SosSession {
            id: new_id("sos"),
            couple_id: couple_id.to_string(),
            initiated_by: user_id.to_string(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let draft = self.start_draft(&session.id, user_id)?;

        let context = ConversationContext::new(user_id, SessionType::FightSolver, Mood::Frustrated)
            .with_couple(couple_id);
        let persona = PersonaConfig::new(Tone::Supportive, 2, PersonaContext::FightSolver);
        let welcome = self.generator.generate(INITIATION_PROMPT, &context, &persona).await;

        let mut tx = self.storage.pool().begin().await?;
        insert_session(&mut *tx, &session).await?;
        save_draft(&mut *tx, &draft).await?;
        insert_conversation(
            &mut *tx,
            &NewConversationEntry {
                user_id: user_id.to_string(),
                couple_id: Some(couple_id.to_string()),
                session_type: SESSION_TYPE.to_string(),
                context: json!({ "sos_session_id": session.id, "phase": "initiation" }),
                user_message: "SOS_INITIATED".to_string(),
                marcie_response: welcome.message,
                tone: welcome.tone.as_str().to_string(),
            },
        )
        .await?;
        insert_notification(
            &mut *tx,
            &NewNotification {
                user_id: partner_id,
                notification_type: "sos".to_string(),
                title: ACTIVATED_TITLE.to_string(),
                message: ACTIVATED_MESSAGE.to_string(),
                action_url: Some(format!("/sos/{}", session.id)),
                priority: NotificationPriority::High,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            "SOS session {} initiated by {} for couple {}",
            session.id, user_id, couple_id
        );
        self.events.emit(RealtimeEvent::SosInitiated {
            session_id: session.id.clone(),
            couple_id: session.couple_id.clone(),
            initiated_by: session.initiated_by.clone(),
        });

        Ok(session)
    }

    /// Shared checks before a participant answers or skips `question_id`
    async fn current_question(
        &self,
        session_id: &str,
        user_id: &str,
        question_id: &str,
    ) -> SosResult<(SosSession, Couple, InputDraft, Question)> {
        let (session, couple) = self.membership(session_id, user_id).await?;
        if !session.status.is_collecting() {
            return Err(SosError::InvalidState(format!(
                "Session is {} and no longer accepts answers",
                session.status
            )));
        }
        if self.storage.get_input(session_id, user_id).await?.is_some() {
            return Err(SosError::DuplicateSubmission(session_id.to_string()));
        }

        let draft = self.load_draft(session_id, user_id).await?;
        let current = match &draft.phase {
            SosPhase::InputCollection { question_id } => question_id.clone(),
            SosPhase::EmergencyProtocol { .. } => {
                return Err(SosError::InvalidState(
                    "Resolve the safety check before answering more questions".to_string(),
                ))
            }
            SosPhase::WaitingForPartner => {
                return Err(SosError::DuplicateSubmission(session_id.to_string()))
            }
            other => {
                return Err(SosError::InvalidState(format!(
                    "Cannot answer questions while {}",
                    other.name()
                )))
            }
        };

        if current != question_id {
            return Err(SosError::Validation(format!(
                "Expected an answer to '{}', got '{}'",
                current, question_id
            )));
        }

        let question = self.flow.require(question_id)?.clone();
        Ok((session, couple, draft, question))
    }

    /// Answer the participant's current question
    pub async fn submit_answer(
        &self,
        session_id: &str,
        user_id: &str,
        question_id: &str,
        answer: AnswerValue,
    ) -> SosResult<SubmitOutcome> {
        let (session, couple, draft, question) =
            self.current_question(session_id, user_id, question_id).await?;
        let answer = question.validate(&answer)?;

        if let Some(hit) = detect_trigger(&question, &answer, &self.settings.emergency_triggers) {
            return self.open_emergency(&session, draft, &question, answer, hit).await;
        }

        self.accept_answer(&session, &couple, draft, &question, Some(answer), false, false)
            .await
    }

    /// Move past an optional question without answering it
    pub async fn skip_question(
        &self,
        session_id: &str,
        user_id: &str,
        question_id: &str,
    ) -> SosResult<SubmitOutcome> {
        let (session, couple, draft, question) =
            self.current_question(session_id, user_id, question_id).await?;
        if question.required {
            return Err(SosError::Validation(format!(
                "'{}' is required and cannot be skipped",
                question.id
            )));
        }

        self.accept_answer(&session, &couple, draft, &question, None, false, false)
            .await
    }

    async fn open_emergency(
        &self,
        session: &SosSession,
        mut draft: InputDraft,
        question: &Question,
        answer: AnswerValue,
        hit: TriggerMatch,
    ) -> SosResult<SubmitOutcome> {
        let opened = transition(
            &draft.phase,
            SosEvent::EmergencyTriggered {
                question_id: question.id.clone(),
                held_answer: answer,
                escalate: hit.escalates(),
            },
        )?;
        draft.phase = opened.next.clone();
        draft.updated_at = Utc::now();
        self.storage.put_draft(&draft).await?;

        warn!(
            "Emergency protocol opened for user {} in session {} on '{}'",
            draft.user_id, session.id, question.id
        );

        if opened.has(&Effect::NotifyEmergency) {
            self.events.emit(RealtimeEvent::EmergencyProtocolTriggered {
                session_id: session.id.clone(),
                user_id: draft.user_id.clone(),
                question_id: question.id.clone(),
            });
        }

        let prompt = self.emergency_prompt(session, &draft.user_id, &question.id).await;
        Ok(SubmitOutcome::Emergency { prompt })
    }

    async fn emergency_prompt(&self, session: &SosSession, user_id: &str, question_id: &str) -> EmergencyPrompt {
        let context = ConversationContext::new(user_id, SessionType::FightSolver, Mood::Hurt)
            .with_couple(&session.couple_id);
        let persona = PersonaConfig::new(Tone::Concerned, 1, PersonaContext::FightSolver);
        let reply = self.generator.generate(EMERGENCY_PROMPT, &context, &persona).await;
        EmergencyPrompt::new(question_id, reply.message)
    }

    async fn acknowledge(&self, draft: &InputDraft, answer: Option<&AnswerValue>) -> MarcieResponse {
        let prompt = match answer {
            Some(answer) => format!(
                "Acknowledge their answer: \"{}\". Be supportive and guide them to continue.",
                answer
            ),
            None => SKIPPED_PROMPT.to_string(),
        };
        let context = ConversationContext::new(&draft.user_id, SessionType::FightSolver, Self::mood_of(draft));
        let persona = PersonaConfig::new(Tone::Supportive, 1, PersonaContext::FightSolver);
        self.generator.generate(&prompt, &context, &persona).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_answer(
        &self,
        session: &SosSession,
        couple: &Couple,
        mut draft: InputDraft,
        question: &Question,
        answer: Option<AnswerValue>,
        escalate: bool,
        resumed: bool,
    ) -> SosResult<SubmitOutcome> {
        if let Some(answer) = &answer {
            draft.record(&question.id, answer.clone());
        }
        let next_question = self
            .flow
            .advance(&mut draft.cursor, question, answer.as_ref(), escalate);

        let event = if resumed {
            SosEvent::EmergencyContinued { next_question }
        } else {
            SosEvent::AnswerAccepted { next_question }
        };
        let step = transition(&draft.phase, event)?;
        draft.phase = step.next.clone();
        draft.updated_at = Utc::now();

        if step.has(&Effect::PersistInput) {
            return self.finish_input(session, couple, draft).await;
        }

        let next_id = step
            .effects
            .iter()
            .find_map(|effect| match effect {
                Effect::AskQuestion(id) => Some(id.clone()),
                _ => None,
            })
            .ok_or_else(|| SosError::InvalidState("No next question to ask".to_string()))?;
        let next = self.flow.require(&next_id)?.clone();

        let acknowledgment = self.acknowledge(&draft, answer.as_ref()).await;
        self.storage.put_draft(&draft).await?;

        debug!(
            "User {} advanced to '{}' in session {}",
            draft.user_id, next.id, session.id
        );
        Ok(SubmitOutcome::NextQuestion {
            question: next,
            acknowledgment,
            progress: self.progress(&draft),
        })
    }

    /// Persist the finished input and, if the partner is done too, analyze
    async fn finish_input(
        &self,
        session: &SosSession,
        couple: &Couple,
        draft: InputDraft,
    ) -> SosResult<SubmitOutcome> {
        let input = draft.assemble_input()?;
        let outcome = self.storage.submit_input(&input, &draft).await?;
        info!(
            "SOS input stored for {} in session {}",
            input.user_id, session.id
        );

        // The input is already committed, so a transcript failure must not
        // strand a claimed session in analyzing
        let acknowledgment = self.input_acknowledgment(couple, &input).await;
        if let Err(e) = self.record_input_received(couple, &input, &acknowledgment).await {
            warn!(
                "Failed to record input transcript for {} in session {}: {}",
                input.user_id, session.id, e
            );
        }

        match outcome {
            BarrierOutcome::Waiting => {
                if session.status == SessionStatus::Active {
                    self.emit_status(session, SessionStatus::PartnerPending);
                }
                Ok(SubmitOutcome::WaitingForPartner { acknowledgment })
            }
            BarrierOutcome::Claimed => {
                transition(&draft.phase, SosEvent::PartnerCompleted)?;
                self.emit_status(session, SessionStatus::Analyzing);
                let analysis = self.perform_analysis(&session.id).await?;
                Ok(SubmitOutcome::AnalysisComplete { analysis })
            }
        }
    }

    async fn input_acknowledgment(&self, couple: &Couple, input: &SosInput) -> MarcieResponse {
        let context = ConversationContext::new(
            &input.user_id,
            SessionType::FightSolver,
            input.emotional_state.as_mood(),
        )
        .with_couple(&couple.id);
        let persona = PersonaConfig::new(Tone::Supportive, 1, PersonaContext::FightSolver);
        self.generator.generate(WAITING_PROMPT, &context, &persona).await
    }

    async fn record_input_received(
        &self,
        couple: &Couple,
        input: &SosInput,
        acknowledgment: &MarcieResponse,
    ) -> SosResult<()> {
        let submitted = json!({
            "emotional_state": input.emotional_state,
            "severity_level": input.severity_level,
            "trigger_event": input.trigger_event,
            "perspective": input.perspective,
            "desired_outcome": input.desired_outcome,
        });
        self.conversations
            .record(&NewConversationEntry {
                user_id: input.user_id.clone(),
                couple_id: Some(couple.id.clone()),
                session_type: SESSION_TYPE.to_string(),
                context: json!({ "sos_session_id": input.session_id, "phase": "input_received" }),
                user_message: submitted.to_string(),
                marcie_response: acknowledgment.message.clone(),
                tone: acknowledgment.tone.as_str().to_string(),
            })
            .await?;

        Ok(())
    }

    /// Resolve an open emergency protocol for the participant
    pub async fn resolve_emergency(
        &self,
        session_id: &str,
        user_id: &str,
        choice: EmergencyChoice,
    ) -> SosResult<SubmitOutcome> {
        let (session, couple) = self.membership(session_id, user_id).await?;
        if !session.status.is_collecting() {
            return Err(SosError::InvalidState(format!(
                "Session is {} and no longer accepts answers",
                session.status
            )));
        }

        let no_emergency = || SosError::InvalidState("No safety check is open".to_string());
        let draft = self
            .storage
            .get_draft(session_id, user_id)
            .await?
            .ok_or_else(no_emergency)?;
        let (question_id, held_answer, escalate) = match &draft.phase {
            SosPhase::EmergencyProtocol {
                question_id,
                held_answer,
                escalate,
            } => (question_id.clone(), held_answer.clone(), *escalate),
            _ => return Err(no_emergency()),
        };

        match choice {
            EmergencyChoice::Continue => {
                info!("User {} continued past the safety check in session {}", user_id, session_id);
                let question = self.flow.require(&question_id)?.clone();
                self.accept_answer(&session, &couple, draft, &question, Some(held_answer), escalate, true)
                    .await
            }
            EmergencyChoice::Escalate => {
                transition(&draft.phase, SosEvent::EmergencyEscalated)?;
                info!("User {} asked for crisis support in session {}", user_id, session_id);
                let prompt = self.emergency_prompt(&session, user_id, &question_id).await;
                Ok(SubmitOutcome::Emergency { prompt })
            }
            EmergencyChoice::Abandon => {
                let step = transition(&draft.phase, SosEvent::Aborted)?;
                if step.has(&Effect::MarkAbandoned) && self.storage.abandon(session_id).await? {
                    self.emit_status(&session, SessionStatus::Abandoned);
                }
                let session = self.storage.require_session(session_id).await?;
                Ok(SubmitOutcome::Abandoned { session })
            }
        }
    }

    /// Public entry point; claims the session first if nobody has yet
    pub async fn run_analysis(&self, session_id: &str) -> SosResult<SosAnalysis> {
        let session = self.storage.require_session(session_id).await?;
        match session.status {
            SessionStatus::Analyzing => {
                return Err(SosError::Conflict(format!(
                    "Analysis for session {} is already in progress",
                    session_id
                )))
            }
            SessionStatus::Resolved | SessionStatus::Abandoned => {
                return Err(SosError::InvalidState(format!(
                    "Session {} is already {}",
                    session_id, session.status
                )))
            }
            SessionStatus::Active | SessionStatus::PartnerPending => {}
        }

        if !self.storage.claim_for_analysis(session_id).await? {
            let current = self.storage.require_session(session_id).await?;
            if current.status == SessionStatus::Analyzing {
                return Err(SosError::Conflict(format!(
                    "Analysis for session {} is already in progress",
                    session_id
                )));
            }
            return Err(SosError::InvalidState(
                "Both partners must submit their side before analysis".to_string(),
            ));
        }

        transition(&SosPhase::WaitingForPartner, SosEvent::PartnerCompleted)?;
        self.emit_status(&session, SessionStatus::Analyzing);
        self.perform_analysis(session_id).await
    }

    /// Run the claimed analysis; any failure abandons the session
    async fn perform_analysis(&self, session_id: &str) -> SosResult<SosAnalysis> {
        match self.analyze(session_id).await {
            Ok((session, analysis)) => {
                transition(&SosPhase::Analyzing, SosEvent::AnalysisSucceeded)?;
                info!(
                    "SOS session {} resolved with analysis {} via {}",
                    session_id, analysis.id, analysis.ai_provider
                );
                self.events.emit(RealtimeEvent::SosAnalysisReady {
                    session_id: session_id.to_string(),
                    analysis_id: analysis.id.clone(),
                });
                self.emit_status(&session, SessionStatus::Resolved);
                Ok(analysis)
            }
            Err(e) => {
                error!("SOS analysis failed for session {}: {}", session_id, e);
                let step = transition(&SosPhase::Analyzing, SosEvent::AnalysisFailed)?;
                if step.has(&Effect::MarkAbandoned) {
                    match self.storage.abandon(session_id).await {
                        Ok(true) => {
                            if let Ok(session) = self.storage.require_session(session_id).await {
                                self.emit_status(&session, SessionStatus::Abandoned);
                            }
                        }
                        Ok(false) => {}
                        Err(abandon_err) => {
                            error!(
                                "Failed to abandon session {} after analysis error: {}",
                                session_id, abandon_err
                            );
                        }
                    }
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn feedback(
        &self,
        backend: Backend,
        couple: &Couple,
        role: &str,
        own: &SosInput,
        other: &SosInput,
        own_fault: u8,
        other_fault: u8,
    ) -> SosResult<MarcieResponse> {
        let prompt = build_feedback_prompt(role, own, other, own_fault, other_fault);
        let context = ConversationContext::new(
            &own.user_id,
            SessionType::FightSolver,
            own.emotional_state.as_mood(),
        )
        .with_couple(&couple.id);
        let persona = feedback_persona(own_fault, other_fault);
        Ok(self
            .generator
            .generate_strict(backend, &prompt, &context, &persona)
            .await?)
    }

    async fn analyze(&self, session_id: &str) -> SosResult<(SosSession, SosAnalysis)> {
        let session = self.storage.require_session(session_id).await?;
        if session.status != SessionStatus::Analyzing {
            return Err(SosError::InvalidState(format!(
                "Session {} is {}, not analyzing",
                session_id, session.status
            )));
        }

        let couple = self.couples.require(&session.couple_id).await?;
        let inputs = self.storage.list_inputs(session_id).await?;
        let input_of = |user_id: &str| {
            inputs.iter().find(|input| input.user_id == user_id).ok_or_else(|| {
                SosError::InvalidState(format!("Missing SOS input from {}", user_id))
            })
        };
        let partner1 = input_of(&couple.partner_1_id)?;
        let partner2 = input_of(&couple.partner_2_id)?;

        let backend = select_backend(partner1, partner2, self.settings.long_perspective_chars);
        info!("Analyzing SOS session {} on the {:?} backend", session_id, backend);

        let recent = self
            .challenges
            .recent_titles(&couple.id, RECENT_CHALLENGE_LIMIT)
            .await?;
        let context = ConversationContext::new(&session.initiated_by, SessionType::FightSolver, Mood::Frustrated)
            .with_couple(&couple.id)
            .with_recent_challenges(recent);

        let prompt = build_analysis_prompt(partner1, partner2);
        let verdict = self
            .generator
            .generate_strict(backend, &prompt, &context, &analysis_persona())
            .await?;
        let ai_provider = verdict
            .provider
            .ok_or(SosError::Generation(AIServiceError::InvalidResponse))?;

        let fields = parse_analysis(&verdict.message);
        let scripts = apology_scripts(&fields, &verdict.message, partner1, partner2);

        let feedback1 = self
            .feedback(backend, &couple, "partner1", partner1, partner2, fields.partner1_fault, fields.partner2_fault)
            .await?;
        let feedback2 = self
            .feedback(backend, &couple, "partner2", partner2, partner1, fields.partner2_fault, fields.partner1_fault)
            .await?;

        let categories = healing_categories(&fields);
        let analysis = SosAnalysis {
            id: new_id("ana"),
            session_id: session_id.to_string(),
            ai_provider,
            analysis: ConflictAnalysis {
                partner1_user_id: couple.partner_1_id.clone(),
                partner2_user_id: couple.partner_2_id.clone(),
                summary: fields.summary,
                root_cause: fields.root_cause,
                fault_assignment: FaultAssignment {
                    partner1_fault: fields.partner1_fault,
                    partner2_fault: fields.partner2_fault,
                    explanation: fields.fault_explanation,
                },
                recommendations: Recommendations {
                    partner1_actions: fields.partner1_actions,
                    partner2_actions: fields.partner2_actions,
                    joint_actions: fields.joint_actions,
                },
                apology_required: ApologyRequired {
                    partner1_should_apologize: fields.partner1_should_apologize,
                    partner2_should_apologize: fields.partner2_should_apologize,
                    apology_scripts: scripts,
                },
                healing_challenges: fields.healing_challenges,
                communication_breakdown: fields.communication_breakdown,
                emotional_validation: fields.emotional_validation,
                personalized_feedback: PersonalizedFeedback {
                    partner1: feedback1,
                    partner2: feedback2,
                },
                degraded_fields: fields.degraded_fields,
            },
            raw_response: verdict.message,
            created_at: Utc::now(),
        };

        self.persist_analysis(&session, &couple, &analysis, &categories)
            .await?;
        Ok((session, analysis))
    }

    /// Analysis row, resolution, transcript, healing challenges and
    /// notifications land together or not at all
    async fn persist_analysis(
        &self,
        session: &SosSession,
        couple: &Couple,
        analysis: &SosAnalysis,
        categories: &[&str],
    ) -> SosResult<()> {
        let mut tx = self.storage.pool().begin().await?;

        insert_analysis(&mut *tx, analysis).await?;
        let resolved = update_status_if(
            &mut *tx,
            &session.id,
            SessionStatus::Analyzing,
            SessionStatus::Resolved,
        )
        .await?;
        if !resolved {
            return Err(SosError::InvalidState(format!(
                "Session {} stopped analyzing before the verdict was saved",
                session.id
            )));
        }

        let feedback = &analysis.analysis.personalized_feedback;
        for (user_id, response) in [
            (&couple.partner_1_id, &feedback.partner1),
            (&couple.partner_2_id, &feedback.partner2),
        ] {
            insert_conversation(
                &mut *tx,
                &NewConversationEntry {
                    user_id: user_id.clone(),
                    couple_id: Some(couple.id.clone()),
                    session_type: SESSION_TYPE.to_string(),
                    context: json!({
                        "sos_session_id": session.id,
                        "analysis_id": analysis.id,
                        "phase": "analysis_complete"
                    }),
                    user_message: "REQUEST_ANALYSIS_RESULTS".to_string(),
                    marcie_response: response.message.clone(),
                    tone: response.tone.as_str().to_string(),
                },
            )
            .await?;
        }

        for category in categories {
            match find_lowest_difficulty(&mut *tx, category).await? {
                Some(challenge) => {
                    insert_attempt(
                        &mut *tx,
                        &couple.id,
                        &challenge.id,
                        None,
                        ChallengeSource::SosHealing,
                    )
                    .await?;
                }
                None => warn!("No active '{}' challenge available for healing", category),
            }
        }

        for user_id in [&couple.partner_1_id, &couple.partner_2_id] {
            insert_notification(
                &mut *tx,
                &NewNotification {
                    user_id: user_id.clone(),
                    notification_type: "sos".to_string(),
                    title: VERDICT_TITLE.to_string(),
                    message: VERDICT_MESSAGE.to_string(),
                    action_url: Some(format!("/sos/{}/results", session.id)),
                    priority: NotificationPriority::Medium,
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Abandon the session; only its initiator may do this
    pub async fn abort_session(&self, session_id: &str, user_id: &str) -> SosResult<SosSession> {
        let session = self.storage.require_session(session_id).await?;
        if session.initiated_by != user_id {
            return Err(SosError::Authorization(
                "Only the partner who started the session can abort it".to_string(),
            ));
        }

        let phase = self
            .storage
            .get_draft(session_id, user_id)
            .await?
            .map(|draft| draft.phase)
            .unwrap_or(SosPhase::Initiation)
            .overlay(session.status);
        let step = transition(&phase, SosEvent::Aborted)?;

        if step.has(&Effect::MarkAbandoned) {
            if self.storage.abandon(session_id).await? {
                info!("SOS session {} aborted by {}", session_id, user_id);
                self.emit_status(&session, SessionStatus::Abandoned);
            } else {
                let current = self.storage.require_session(session_id).await?;
                if current.status == SessionStatus::Resolved {
                    return Err(SosError::InvalidState(
                        "A resolved session cannot be abandoned".to_string(),
                    ));
                }
            }
        }

        self.storage.require_session(session_id).await
    }

    pub async fn get_session(&self, session_id: &str) -> SosResult<Option<SosSession>> {
        self.storage.get_session(session_id).await
    }

    /// The verdict, visible to both partners once it exists
    pub async fn get_analysis(&self, session_id: &str, requester: &str) -> SosResult<Option<SosAnalysis>> {
        self.membership(session_id, requester).await?;
        self.storage.get_analysis(session_id).await
    }

    /// Inputs the requester may read: their own until the analysis exists
    pub async fn get_visible_inputs(&self, session_id: &str, requester: &str) -> SosResult<Vec<SosInput>> {
        self.membership(session_id, requester).await?;
        let inputs = self.storage.list_inputs(session_id).await?;

        if self.storage.get_analysis(session_id).await?.is_some() {
            return Ok(inputs);
        }
        Ok(inputs
            .into_iter()
            .filter(|input| input.user_id == requester)
            .collect())
    }

    /// Ten most recent sessions the user started
    pub async fn get_user_history(&self, user_id: &str) -> SosResult<Vec<SosSession>> {
        self.storage.list_initiated_by(user_id, HISTORY_LIMIT).await
    }

    pub async fn participant_view(&self, session_id: &str, user_id: &str) -> SosResult<ParticipantView> {
        let (session, couple) = self.membership(session_id, user_id).await?;
        let draft = self.load_draft(session_id, user_id).await?;

        let current_question = match &draft.phase {
            SosPhase::InputCollection { question_id }
            | SosPhase::EmergencyProtocol { question_id, .. }
                if session.status.is_collecting() =>
            {
                self.flow.get(question_id).cloned()
            }
            _ => None,
        };

        let submitted = self.storage.get_input(session_id, user_id).await?.is_some();
        let partner_submitted = match couple.partner_of(user_id) {
            Some(partner) => self.storage.get_input(session_id, partner).await?.is_some(),
            None => false,
        };

        Ok(ParticipantView {
            progress: self.progress(&draft),
            phase: draft.phase.overlay(session.status),
            current_question,
            submitted,
            partner_submitted,
            session,
        })
    }
}
