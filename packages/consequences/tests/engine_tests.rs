// ABOUTME: Consequence engine tests against an in-memory database
// ABOUTME: Offline generator and fixed rule picks keep every run deterministic

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rekindle_ai::MarcieGenerator;
use rekindle_config::{ConsequenceSettings, RuntimeSettings};
use rekindle_consequences::{
    ConsequenceEngine, ConsequenceError, ConsequenceMetadata, ConsequenceResult,
    ConsequenceStatus, ConsequenceStorage, ConsequenceType, JobScheduler, JobStatus,
    NotificationJob, SqliteJobScheduler, TriggerCause,
};
use rekindle_core::{EventSink, FixedIndex, MemoryEventSink, RandomSource};
use rekindle_storage::{
    init_memory_pool, ChallengeSource, ChallengeStorage, Couple, CoupleStorage, ExemptionWindow,
    NotificationStorage, PreferencesStorage, UpdatePreferencesRequest,
};
use sqlx::SqlitePool;

struct Harness {
    engine: ConsequenceEngine,
    scheduler: Arc<SqliteJobScheduler>,
    pool: SqlitePool,
    events: Arc<MemoryEventSink>,
    couple: Couple,
}

async fn harness(pick: usize) -> Harness {
    let pool = init_memory_pool().await.unwrap();
    let couple = CoupleStorage::new(pool.clone())
        .create("alice", "bob")
        .await
        .unwrap();

    let events = Arc::new(MemoryEventSink::new());
    let scheduler = Arc::new(SqliteJobScheduler::new(
        pool.clone(),
        events.clone() as Arc<dyn EventSink>,
    ));
    let engine = ConsequenceEngine::new(
        pool.clone(),
        Arc::new(MarcieGenerator::offline()),
        events.clone() as Arc<dyn EventSink>,
        scheduler.clone() as Arc<dyn JobScheduler>,
        Arc::new(FixedIndex(pick)) as Arc<dyn RandomSource>,
        ConsequenceSettings::default(),
    );

    Harness {
        engine,
        scheduler,
        pool,
        events,
        couple,
    }
}

async fn update_prefs(pool: &SqlitePool, request: UpdatePreferencesRequest) {
    PreferencesStorage::new(pool.clone())
        .update_preferences("alice", &request)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_streak_broken_respects_opt_outs() {
    let h = harness(0).await;
    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_notification_spam: Some(false),
            ..Default::default()
        },
    )
    .await;

    let consequence = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::StreakBroken, "broke a 12 day streak")
        .await
        .unwrap()
        .expect("screensaver should still be allowed");

    assert_eq!(consequence.consequence_type, ConsequenceType::Screensaver);
    assert_eq!(consequence.status, ConsequenceStatus::Active);
    assert!(consequence.user_consent);
    assert!(consequence.started_at.is_some());
    // Offline generator falls back, so the rule's own line is used
    assert_eq!(
        consequence.marcie_commentary,
        vec!["Streaks break. Commitment should not.".to_string()]
    );
    match &consequence.metadata {
        ConsequenceMetadata::Screensaver { caption, .. } => {
            assert!(caption.chars().count() <= 50);
        }
        other => panic!("Expected screensaver metadata, got {:?}", other),
    }
    assert_eq!(
        h.events.names(),
        vec!["screensaver_changed", "consequence_triggered"]
    );

    let notifications = NotificationStorage::new(h.pool.clone())
        .list_for_user("alice")
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "📱 Dr. Marcie Has Redecorated Your Phone!");

    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_screensaver_changes: Some(false),
            ..Default::default()
        },
    )
    .await;
    let none = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::StreakBroken, "broke it again")
        .await
        .unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn test_missed_challenge_with_only_screensaver_allowed() {
    let h = harness(3).await;
    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_app_blocking: Some(false),
            allow_notification_spam: Some(false),
            ..Default::default()
        },
    )
    .await;

    let picked = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "missed the gratitude challenge")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(picked.consequence_type, ConsequenceType::Screensaver);
    assert_eq!(picked.rule_id, "rule-mc-screensaver");

    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_screensaver_changes: Some(false),
            ..Default::default()
        },
    )
    .await;
    assert!(h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "missed another")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_declined_consent_cancels_without_side_effects() {
    let h = harness(0).await;
    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_screensaver_changes: Some(false),
            ..Default::default()
        },
    )
    .await;

    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::StreakBroken, "streak ended")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.consequence_type, ConsequenceType::NotificationSpam);
    assert_eq!(pending.status, ConsequenceStatus::PendingConsent);
    assert!(!pending.user_consent);
    assert!(matches!(pending.metadata, ConsequenceMetadata::Pending));

    let declined = h.engine.give_consent(&pending.id, false).await.unwrap();
    assert_eq!(declined.status, ConsequenceStatus::Cancelled);
    assert!(declined.cancelled_at.is_some());
    assert!(h.scheduler.jobs_for(&pending.id).await.unwrap().is_empty());

    assert!(matches!(
        h.engine.give_consent(&pending.id, true).await,
        Err(ConsequenceError::InvalidState(_))
    ));
    assert!(h.engine.get_active_consequences("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spam_campaign_is_capped_delivered_and_cancelled() {
    // missed_challenge candidates with default prefs: screensaver, spam
    let h = harness(1).await;

    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "skipped date night")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.consequence_type, ConsequenceType::NotificationSpam);
    assert_eq!(pending.status, ConsequenceStatus::PendingConsent);
    assert!(h.scheduler.jobs_for(&pending.id).await.unwrap().is_empty());

    let active = h.engine.give_consent(&pending.id, true).await.unwrap();
    assert_eq!(active.status, ConsequenceStatus::Active);
    match &active.metadata {
        ConsequenceMetadata::NotificationSpam {
            notification_count,
            scheduled_count,
            frequency_minutes,
            total_duration_minutes,
            messages,
            ..
        } => {
            assert_eq!(*notification_count, 24);
            assert_eq!(*scheduled_count, 20);
            assert_eq!(*frequency_minutes, 5);
            assert_eq!(*total_duration_minutes, 120);
            assert_eq!(messages.len(), 24);
        }
        other => panic!("Expected spam metadata, got {:?}", other),
    }

    let jobs = h.scheduler.jobs_for(&pending.id).await.unwrap();
    assert_eq!(jobs.len(), 20);
    assert_eq!(jobs[0].notification_number, 1);
    assert_eq!(jobs[19].notification_number, 20);
    assert!(jobs.iter().all(|job| job.total_notifications == 24));
    assert_eq!(jobs[1].deliver_at - jobs[0].deliver_at, Duration::minutes(5));

    let delivered = h.scheduler.deliver_due(Utc::now()).await.unwrap();
    assert_eq!(delivered, 1);
    assert_eq!(
        NotificationStorage::new(h.pool.clone())
            .count_for_user("alice", "consequence")
            .await
            .unwrap(),
        1
    );

    let completed = h.engine.complete_consequence(&pending.id).await.unwrap();
    assert_eq!(completed.status, ConsequenceStatus::Completed);
    assert!(completed.completed_at.is_some());

    let jobs = h.scheduler.jobs_for(&pending.id).await.unwrap();
    assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::Delivered).count(), 1);
    assert_eq!(jobs.iter().filter(|j| j.status == JobStatus::Cancelled).count(), 19);

    // Nothing left to deliver, even far in the future
    let later = h.scheduler.deliver_due(Utc::now() + Duration::hours(4)).await.unwrap();
    assert_eq!(later, 0);

    let names = h.events.names();
    assert_eq!(names.iter().filter(|n| **n == "spam_notification").count(), 1);
    assert_eq!(names.last(), Some(&"consequence_completed"));

    assert!(matches!(
        h.engine.complete_consequence(&pending.id).await,
        Err(ConsequenceError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_unresolved_fight_assigns_easiest_communication_challenge() {
    let h = harness(0).await;

    let consequence = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::FightUnresolved, "SOS session abandoned")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(consequence.consequence_type, ConsequenceType::ChallengeAssignment);
    assert_eq!(consequence.status, ConsequenceStatus::Active);
    match &consequence.metadata {
        ConsequenceMetadata::ChallengeAssignment { challenge_id, challenge_title, .. } => {
            assert_eq!(challenge_id, "chl-comm-1");
            assert_eq!(challenge_title, "Five Minute Check-In");
        }
        other => panic!("Expected challenge metadata, got {:?}", other),
    }

    let attempts = ChallengeStorage::new(h.pool.clone())
        .list_attempts(&h.couple.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].source, ChallengeSource::Consequence);
    assert_eq!(attempts[0].assigned_to.as_deref(), Some("alice"));

    assert_eq!(
        h.events.names(),
        vec!["challenge_assigned", "consequence_triggered"]
    );
}

#[tokio::test]
async fn test_privilege_loss_waits_for_consent_then_notifies() {
    let h = harness(1).await;

    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::FightUnresolved, "walked out")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.consequence_type, ConsequenceType::PrivilegeLoss);
    assert_eq!(pending.status, ConsequenceStatus::PendingConsent);
    assert!(matches!(
        h.engine.complete_consequence(&pending.id).await,
        Err(ConsequenceError::InvalidState(_))
    ));

    let open = h.engine.get_active_consequences("alice").await.unwrap();
    assert_eq!(open.len(), 1);

    let active = h.engine.give_consent(&pending.id, true).await.unwrap();
    match &active.metadata {
        ConsequenceMetadata::PrivilegeLoss { message } => {
            assert_eq!(message, "No new games until you two sort this out.");
        }
        other => panic!("Expected privilege metadata, got {:?}", other),
    }

    let notifications = NotificationStorage::new(h.pool.clone())
        .list_for_user("alice")
        .await
        .unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].title, "🔒 Privileges Paused");
}

#[tokio::test]
async fn test_app_block_uses_configured_apps() {
    let h = harness(0).await;
    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            allow_app_blocking: Some(true),
            blocked_app_categories: Some(vec!["reddit".to_string(), "youtube".to_string()]),
            ..Default::default()
        },
    )
    .await;

    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::GameAbandoned, "quit trivia night")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.consequence_type, ConsequenceType::AppBlock);

    let active = h.engine.give_consent(&pending.id, true).await.unwrap();
    match &active.metadata {
        ConsequenceMetadata::AppBlock {
            blocked_apps,
            block_duration_minutes,
            ..
        } => {
            assert_eq!(blocked_apps, &vec!["reddit".to_string(), "youtube".to_string()]);
            assert_eq!(*block_duration_minutes, 90);
        }
        other => panic!("Expected app block metadata, got {:?}", other),
    }
    assert_eq!(
        h.events.names(),
        vec!["consequence_triggered", "apps_blocked"]
    );
}

#[tokio::test]
async fn test_exemption_window_only_suppresses_device_consequences() {
    let h = harness(0).await;
    let all_day = vec![
        ExemptionWindow::new("00:00", "12:00").unwrap(),
        ExemptionWindow::new("12:00", "00:00").unwrap(),
    ];
    update_prefs(
        &h.pool,
        UpdatePreferencesRequest {
            exemption_hours: Some(all_day),
            ..Default::default()
        },
    )
    .await;

    let suppressed = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::StreakBroken, "streak ended")
        .await
        .unwrap();
    assert!(suppressed.is_none());

    let makeup = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::FightUnresolved, "fight left open")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(makeup.consequence_type, ConsequenceType::ChallengeAssignment);
}

#[tokio::test]
async fn test_unknown_consequence_is_not_found() {
    let h = harness(0).await;
    assert!(matches!(
        h.engine.give_consent("csq-missing", true).await,
        Err(ConsequenceError::NotFound(_))
    ));
    assert!(matches!(
        h.engine.complete_consequence("csq-missing").await,
        Err(ConsequenceError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delivery_task_sends_due_reminders() {
    let h = harness(1).await;
    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "skipped date night")
        .await
        .unwrap()
        .unwrap();
    h.engine.give_consent(&pending.id, true).await.unwrap();

    // The first tick fires immediately, so only the job due now goes out
    let task = h.scheduler.clone().start_with_settings(&RuntimeSettings::default());
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    task.abort();

    let jobs = h.scheduler.jobs_for(&pending.id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Delivered);
    assert!(jobs[1..].iter().all(|job| job.status == JobStatus::Queued));
    assert_eq!(h.events.names().last(), Some(&"spam_notification"));
}

/// Queues the first `allowed` jobs, then refuses
struct FlakyScheduler {
    inner: Arc<SqliteJobScheduler>,
    allowed: usize,
    scheduled: AtomicUsize,
}

#[async_trait]
impl JobScheduler for FlakyScheduler {
    async fn schedule(&self, job: &NotificationJob) -> ConsequenceResult<()> {
        if self.scheduled.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(ConsequenceError::InvalidState("job queue is full".to_string()));
        }
        self.inner.schedule(job).await
    }

    async fn cancel_for_consequence(&self, consequence_id: &str) -> ConsequenceResult<u64> {
        self.inner.cancel_for_consequence(consequence_id).await
    }
}

#[tokio::test]
async fn test_failed_activation_cancels_consequence_and_queued_jobs() {
    let h = harness(1).await;
    let engine = ConsequenceEngine::new(
        h.pool.clone(),
        Arc::new(MarcieGenerator::offline()),
        h.events.clone() as Arc<dyn EventSink>,
        Arc::new(FlakyScheduler {
            inner: h.scheduler.clone(),
            allowed: 3,
            scheduled: AtomicUsize::new(0),
        }) as Arc<dyn JobScheduler>,
        Arc::new(FixedIndex(1)) as Arc<dyn RandomSource>,
        ConsequenceSettings::default(),
    );

    let pending = engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "skipped date night")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.consequence_type, ConsequenceType::NotificationSpam);

    let result = engine.give_consent(&pending.id, true).await;
    assert!(matches!(result, Err(ConsequenceError::InvalidState(_))));

    let stored = ConsequenceStorage::new(h.pool.clone())
        .require(&pending.id)
        .await
        .unwrap();
    assert_eq!(stored.status, ConsequenceStatus::Cancelled);
    assert!(stored.cancelled_at.is_some());
    assert!(h.engine.get_active_consequences("alice").await.unwrap().is_empty());

    let jobs = h.scheduler.jobs_for(&pending.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Cancelled));
    assert_eq!(h.scheduler.deliver_due(Utc::now() + Duration::hours(4)).await.unwrap(), 0);

    let again = engine.complete_consequence(&pending.id).await;
    assert!(matches!(again, Err(ConsequenceError::InvalidState(_))));
}

#[tokio::test]
async fn test_corrupt_job_counter_is_a_decode_error() {
    let h = harness(1).await;
    let pending = h
        .engine
        .trigger_consequence("alice", &h.couple.id, TriggerCause::MissedChallenge, "skipped date night")
        .await
        .unwrap()
        .unwrap();
    h.engine.give_consent(&pending.id, true).await.unwrap();

    sqlx::query(
        "UPDATE scheduled_notifications SET notification_number = -1 \
         WHERE consequence_id = ? AND notification_number = 1",
    )
    .bind(&pending.id)
    .execute(&h.pool)
    .await
    .unwrap();

    match h.scheduler.jobs_for(&pending.id).await {
        Err(ConsequenceError::Database(sqlx::Error::ColumnDecode { index, .. })) => {
            assert_eq!(index, "notification_number")
        }
        other => panic!("Expected a decode error, got {:?}", other.map(|jobs| jobs.len())),
    }
}
