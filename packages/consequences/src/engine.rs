// ABOUTME: Consequence engine: rule selection, consent gating and per-type activation
// ABOUTME: Collaborators (generator, events, scheduler, randomness) are injected

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rekindle_ai::{
    truncate_chars, ConversationContext, MarcieGenerator, Mood, PersonaConfig, PersonaContext,
    SessionType, Tone,
};
use rekindle_config::ConsequenceSettings;
use rekindle_core::{new_id, EventSink, RandomSource, RealtimeEvent};
use rekindle_storage::challenges::{find_lowest_difficulty, insert_attempt};
use rekindle_storage::notifications::insert_notification;
use rekindle_storage::preferences::NOTIFICATION_FREQUENCY_RANGE;
use rekindle_storage::{
    ChallengeSource, ConsequencePreferences, NewNotification, NotificationPriority,
    PreferencesStorage,
};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::error::{ConsequenceError, ConsequenceResult};
use crate::policy::{
    apps_to_block, block_duration_minutes, makeup_category, rule_allowed, screensaver_image,
    spam_count, spam_duration_minutes, BASE_SPAM_MESSAGES, MAX_CAPTION_CHARS,
    MAX_SPAM_MESSAGE_CHARS,
};
use crate::scheduler::{JobScheduler, JobStatus, NotificationJob};
use crate::storage::{insert_consequence, set_metadata, ConsequenceStorage};
use crate::types::{
    ActiveConsequence, ConsequenceMetadata, ConsequenceRule, ConsequenceStatus, ConsequenceType,
    TriggerCause,
};

const ACTIVE_CONSEQUENCES_URL: &str = "/consequences/active";

pub struct ConsequenceEngine {
    storage: ConsequenceStorage,
    preferences: PreferencesStorage,
    generator: Arc<MarcieGenerator>,
    events: Arc<dyn EventSink>,
    scheduler: Arc<dyn JobScheduler>,
    random: Arc<dyn RandomSource>,
    settings: ConsequenceSettings,
}

impl ConsequenceEngine {
    pub fn new(
        pool: SqlitePool,
        generator: Arc<MarcieGenerator>,
        events: Arc<dyn EventSink>,
        scheduler: Arc<dyn JobScheduler>,
        random: Arc<dyn RandomSource>,
        settings: ConsequenceSettings,
    ) -> Self {
        Self {
            storage: ConsequenceStorage::new(pool.clone()),
            preferences: PreferencesStorage::new(pool),
            generator,
            events,
            scheduler,
            random,
            settings,
        }
    }

    fn context(user_id: &str) -> ConversationContext {
        ConversationContext::new(user_id, SessionType::Consequence, Mood::Frustrated)
    }

    async fn say(&self, user_id: &str, prompt: &str, tone: Tone, sass: u8) -> String {
        let persona = PersonaConfig::new(tone, sass, PersonaContext::Consequence);
        self.generator
            .generate(prompt, &Self::context(user_id), &persona)
            .await
            .message
    }

    /// Pick and create a consequence for `cause`, or `None` when the
    /// user's preferences rule out every candidate
    pub async fn trigger_consequence(
        &self,
        user_id: &str,
        couple_id: &str,
        cause: TriggerCause,
        reason: &str,
    ) -> ConsequenceResult<Option<ActiveConsequence>> {
        let preferences = self.preferences.get_preferences(user_id).await?;
        let now = Utc::now();

        let allowed: Vec<ConsequenceRule> = self
            .storage
            .active_rules(cause)
            .await?
            .into_iter()
            .filter(|rule| rule_allowed(rule, &preferences, now))
            .collect();

        if allowed.is_empty() {
            info!(
                "No consequence rule for {} is allowed by {}'s preferences",
                cause, user_id
            );
            return Ok(None);
        }
        let rule = &allowed[self.random.pick_index(allowed.len())];

        let prompt = format!(
            "The user has triggered a consequence for: {}\nConsequence type: {}\nConsequence description: {}\n\nDeliver this consequence with your signature \"sweet-but-savage\" style. Be firm but caring. Explain why this matters for their relationship growth. Keep it under 100 words.",
            reason, rule.consequence_type, rule.description
        );
        let persona = PersonaConfig::new(Tone::Direct, 4, PersonaContext::Consequence);
        let reply = self
            .generator
            .generate(&prompt, &Self::context(user_id), &persona)
            .await;
        let commentary = if reply.fallback {
            rule.persona_message.clone()
        } else {
            reply.message
        };

        let immediate = !rule.requires_consent;
        let consequence = ActiveConsequence {
            id: new_id("csq"),
            rule_id: rule.id.clone(),
            user_id: user_id.to_string(),
            couple_id: couple_id.to_string(),
            consequence_type: rule.consequence_type,
            trigger_cause: cause,
            status: if immediate {
                ConsequenceStatus::Active
            } else {
                ConsequenceStatus::PendingConsent
            },
            triggered_by: reason.to_string(),
            assigned_at: now,
            started_at: immediate.then_some(now),
            completed_at: None,
            cancelled_at: None,
            user_consent: immediate,
            metadata: ConsequenceMetadata::Pending,
            marcie_commentary: vec![commentary],
        };

        {
            let mut conn = self.storage.pool().acquire().await?;
            insert_consequence(&mut *conn, &consequence).await?;
        }
        info!(
            "Triggered {} consequence {} for {} ({})",
            rule.consequence_type, consequence.id, user_id, consequence.status
        );

        if immediate {
            self.activate_or_cancel(&consequence, &preferences).await?;
        }

        self.events.emit(RealtimeEvent::ConsequenceTriggered {
            user_id: user_id.to_string(),
            consequence_id: consequence.id.clone(),
            consequence_type: rule.consequence_type.as_str().to_string(),
            requires_consent: rule.requires_consent,
        });

        Ok(Some(self.storage.require(&consequence.id).await?))
    }

    /// Accept or decline a consequence waiting for consent
    pub async fn give_consent(&self, consequence_id: &str, consent: bool) -> ConsequenceResult<ActiveConsequence> {
        let consequence = self.storage.require(consequence_id).await?;
        if consequence.status != ConsequenceStatus::PendingConsent {
            return Err(ConsequenceError::InvalidState(format!(
                "Consequence {} is {}, not awaiting consent",
                consequence_id, consequence.status
            )));
        }

        if !self.storage.resolve_consent(consequence_id, consent).await? {
            return Err(ConsequenceError::InvalidState(format!(
                "Consequence {} was answered concurrently",
                consequence_id
            )));
        }

        let updated = self.storage.require(consequence_id).await?;
        if consent {
            info!("User {} accepted consequence {}", updated.user_id, consequence_id);
            let preferences = self.preferences.get_preferences(&updated.user_id).await?;
            self.activate_or_cancel(&updated, &preferences).await?;
            return self.storage.require(consequence_id).await;
        }

        info!("User {} declined consequence {}", updated.user_id, consequence_id);
        Ok(updated)
    }

    /// Finish an active consequence and stop anything still queued for it
    pub async fn complete_consequence(&self, consequence_id: &str) -> ConsequenceResult<ActiveConsequence> {
        let consequence = self.storage.require(consequence_id).await?;
        if !self.storage.complete(consequence_id).await? {
            return Err(ConsequenceError::InvalidState(format!(
                "Consequence {} is {} and cannot be completed",
                consequence_id, consequence.status
            )));
        }

        let cancelled = self.scheduler.cancel_for_consequence(consequence_id).await?;
        info!(
            "Completed consequence {} ({} queued reminders cancelled)",
            consequence_id, cancelled
        );

        self.events.emit(RealtimeEvent::ConsequenceCompleted {
            consequence_id: consequence_id.to_string(),
            user_id: consequence.user_id.clone(),
            consequence_type: consequence.consequence_type.as_str().to_string(),
        });

        self.storage.require(consequence_id).await
    }

    pub async fn get_active_consequences(&self, user_id: &str) -> ConsequenceResult<Vec<ActiveConsequence>> {
        self.storage.list_open_for_user(user_id).await
    }

    /// A consequence whose activation fails is cancelled along with any
    /// reminders already queued for it, so nothing active is left half set up
    async fn activate_or_cancel(
        &self,
        consequence: &ActiveConsequence,
        preferences: &ConsequencePreferences,
    ) -> ConsequenceResult<()> {
        let Err(e) = self.activate(consequence, preferences).await else {
            return Ok(());
        };

        error!(
            "Activation of {} consequence {} failed: {}",
            consequence.consequence_type, consequence.id, e
        );
        if let Err(cancel_err) = self.storage.cancel_active(&consequence.id).await {
            error!(
                "Failed to cancel consequence {} after activation error: {}",
                consequence.id, cancel_err
            );
        }
        if let Err(cancel_err) = self.scheduler.cancel_for_consequence(&consequence.id).await {
            error!(
                "Failed to cancel reminders for consequence {}: {}",
                consequence.id, cancel_err
            );
        }
        Err(e)
    }

    async fn activate(
        &self,
        consequence: &ActiveConsequence,
        preferences: &ConsequencePreferences,
    ) -> ConsequenceResult<()> {
        debug!(
            "Activating {} consequence {}",
            consequence.consequence_type, consequence.id
        );
        match consequence.consequence_type {
            ConsequenceType::Screensaver => self.activate_screensaver(consequence).await,
            ConsequenceType::AppBlock => self.activate_app_block(consequence, preferences).await,
            ConsequenceType::NotificationSpam => {
                self.activate_notification_spam(consequence, preferences).await
            }
            ConsequenceType::ChallengeAssignment => {
                self.activate_challenge_assignment(consequence).await
            }
            ConsequenceType::PrivilegeLoss => self.activate_privilege_loss(consequence).await,
        }
    }

    /// Persist metadata and the user notification together
    async fn record_activation(
        &self,
        consequence: &ActiveConsequence,
        metadata: &ConsequenceMetadata,
        notification: &NewNotification,
    ) -> ConsequenceResult<()> {
        let mut tx = self.storage.pool().begin().await?;
        set_metadata(&mut *tx, &consequence.id, metadata).await?;
        insert_notification(&mut *tx, notification).await?;
        tx.commit().await?;
        Ok(())
    }

    fn notification(
        consequence: &ActiveConsequence,
        title: &str,
        message: &str,
        action_url: &str,
        priority: NotificationPriority,
    ) -> NewNotification {
        NewNotification {
            user_id: consequence.user_id.clone(),
            notification_type: "consequence".to_string(),
            title: title.to_string(),
            message: message.to_string(),
            action_url: Some(action_url.to_string()),
            priority,
        }
    }

    async fn activate_screensaver(&self, consequence: &ActiveConsequence) -> ConsequenceResult<()> {
        let image = screensaver_image(consequence.trigger_cause);
        let prompt = format!(
            "Personalize this screensaver message for a user who {}:\nBase message: \"{}\"\n\nMake it Dr. Marcie's signature style - sweet but savage. Keep it under 50 characters for mobile display.",
            consequence.trigger_cause, image.caption
        );
        let generated = self
            .say(&consequence.user_id, &prompt, Tone::SweetSavage, 4)
            .await;
        let caption = truncate_chars(generated.trim(), MAX_CAPTION_CHARS);

        let metadata = ConsequenceMetadata::Screensaver {
            screensaver_image: image.url.to_string(),
            original_screensaver: "default".to_string(),
            caption: caption.clone(),
            image_category: image.category,
        };
        let notification = Self::notification(
            consequence,
            "📱 Dr. Marcie Has Redecorated Your Phone!",
            &caption,
            ACTIVE_CONSEQUENCES_URL,
            NotificationPriority::Medium,
        );
        self.record_activation(consequence, &metadata, &notification)
            .await?;

        self.events.emit(RealtimeEvent::ScreensaverChanged {
            user_id: consequence.user_id.clone(),
            image_url: image.url.to_string(),
            caption,
        });
        Ok(())
    }

    async fn activate_app_block(
        &self,
        consequence: &ActiveConsequence,
        preferences: &ConsequencePreferences,
    ) -> ConsequenceResult<()> {
        let apps = apps_to_block(preferences);
        let duration = block_duration_minutes(consequence.trigger_cause);
        let prompt = format!(
            "Generate a message about blocking these apps: {} for {} minutes.\n\nBe Dr. Marcie - firm but caring. Explain why this helps their relationship growth.",
            apps.join(", "),
            duration
        );
        let message = self.say(&consequence.user_id, &prompt, Tone::Direct, 3).await;

        let metadata = ConsequenceMetadata::AppBlock {
            blocked_apps: apps.clone(),
            block_duration_minutes: duration,
            block_start_time: Utc::now(),
            message: message.clone(),
        };
        let notification = Self::notification(
            consequence,
            "🚫 Apps Temporarily Blocked",
            &message,
            ACTIVE_CONSEQUENCES_URL,
            NotificationPriority::High,
        );
        self.record_activation(consequence, &metadata, &notification)
            .await?;

        self.events.emit(RealtimeEvent::AppsBlocked {
            user_id: consequence.user_id.clone(),
            blocked_apps: apps,
            duration_minutes: duration,
            message,
        });
        Ok(())
    }

    /// Base pool first, then generated reminders until there are `count`
    async fn spam_messages(&self, consequence: &ActiveConsequence, count: usize) -> Vec<String> {
        let mut messages: Vec<String> = BASE_SPAM_MESSAGES
            .iter()
            .map(|m| m.to_string())
            .collect();

        let prompt = format!(
            "Generate a short, witty reminder message for someone who {}.\nKeep it under 60 characters. Be Dr. Marcie - sweet but savage.",
            consequence.trigger_cause
        );
        while messages.len() < count {
            let generated = self
                .say(&consequence.user_id, &prompt, Tone::SweetSavage, 3)
                .await;
            messages.push(truncate_chars(generated.trim(), MAX_SPAM_MESSAGE_CHARS));
        }

        messages.truncate(count);
        messages
    }

    async fn activate_notification_spam(
        &self,
        consequence: &ActiveConsequence,
        preferences: &ConsequencePreferences,
    ) -> ConsequenceResult<()> {
        let frequency = if NOTIFICATION_FREQUENCY_RANGE.contains(&preferences.max_notification_frequency) {
            preferences.max_notification_frequency
        } else {
            self.settings.default_frequency_minutes
        };
        let duration = spam_duration_minutes(consequence.trigger_cause);
        let count = spam_count(duration, frequency);
        let scheduled = count.min(self.settings.spam_notification_cap);

        let messages = self.spam_messages(consequence, count as usize).await;
        let start: DateTime<Utc> = Utc::now();

        let metadata = ConsequenceMetadata::NotificationSpam {
            notification_count: count,
            scheduled_count: scheduled,
            frequency_minutes: frequency,
            total_duration_minutes: duration,
            messages: messages.clone(),
            start_time: start,
        };
        {
            let mut conn = self.storage.pool().acquire().await?;
            set_metadata(&mut *conn, &consequence.id, &metadata).await?;
        }

        for i in 0..scheduled {
            let Some(message) = messages.get(i as usize % messages.len().max(1)) else {
                break;
            };
            let job = NotificationJob {
                id: new_id("job"),
                consequence_id: consequence.id.clone(),
                user_id: consequence.user_id.clone(),
                title: "💕 Dr. Marcie Reminder".to_string(),
                message: message.clone(),
                action_url: Some("/challenges".to_string()),
                notification_number: i + 1,
                total_notifications: count,
                deliver_at: start + Duration::minutes(i64::from(i * frequency)),
                status: JobStatus::Queued,
            };
            self.scheduler.schedule(&job).await?;
        }

        info!(
            "Scheduled {} of {} reminders every {} minutes for consequence {}",
            scheduled, count, frequency, consequence.id
        );
        Ok(())
    }

    async fn activate_challenge_assignment(&self, consequence: &ActiveConsequence) -> ConsequenceResult<()> {
        let category = makeup_category(consequence.trigger_cause);

        let challenge = {
            let mut conn = self.storage.pool().acquire().await?;
            find_lowest_difficulty(&mut *conn, category).await?
        };
        let Some(challenge) = challenge else {
            warn!(
                "No '{}' challenge available for consequence {}",
                category, consequence.id
            );
            return Ok(());
        };

        let prompt = format!(
            "Generate a message assigning the \"{}\" challenge as a consequence for {}.\n\nBe Dr. Marcie - firm but fair. Explain why this specific challenge will help them grow.",
            challenge.title, consequence.trigger_cause
        );
        let message = self.say(&consequence.user_id, &prompt, Tone::Direct, 3).await;

        let metadata = ConsequenceMetadata::ChallengeAssignment {
            challenge_id: challenge.id.clone(),
            challenge_title: challenge.title.clone(),
            assignment_message: message.clone(),
        };

        let mut tx = self.storage.pool().begin().await?;
        insert_attempt(
            &mut *tx,
            &consequence.couple_id,
            &challenge.id,
            Some(consequence.user_id.as_str()),
            ChallengeSource::Consequence,
        )
        .await?;
        set_metadata(&mut *tx, &consequence.id, &metadata).await?;
        insert_notification(
            &mut *tx,
            &Self::notification(
                consequence,
                "📋 Makeup Challenge Assigned",
                &message,
                &format!("/challenges/{}", challenge.id),
                NotificationPriority::High,
            ),
        )
        .await?;
        tx.commit().await?;

        self.events.emit(RealtimeEvent::ChallengeAssigned {
            user_id: consequence.user_id.clone(),
            challenge_id: challenge.id,
            challenge_title: challenge.title,
            message,
        });
        Ok(())
    }

    async fn activate_privilege_loss(&self, consequence: &ActiveConsequence) -> ConsequenceResult<()> {
        let message = consequence
            .marcie_commentary
            .first()
            .cloned()
            .unwrap_or_else(|| "Some privileges are paused until you two sort this out.".to_string());

        let metadata = ConsequenceMetadata::PrivilegeLoss {
            message: message.clone(),
        };
        let notification = Self::notification(
            consequence,
            "🔒 Privileges Paused",
            &message,
            ACTIVE_CONSEQUENCES_URL,
            NotificationPriority::High,
        );
        self.record_activation(consequence, &metadata, &notification)
            .await
    }
}
