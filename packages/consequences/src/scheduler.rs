// ABOUTME: Delayed notification jobs for spam campaigns
// ABOUTME: SQLite-backed queue with a polling delivery task instead of in-process timers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rekindle_config::RuntimeSettings;
use rekindle_core::{EventSink, RealtimeEvent};
use rekindle_storage::notifications::insert_notification;
use rekindle_storage::{NewNotification, NotificationPriority};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::error::ConsequenceResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Delivered,
    Cancelled,
}

/// One reminder to deliver at `deliver_at`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub consequence_id: String,
    pub user_id: String,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub notification_number: u32,
    pub total_notifications: u32,
    pub deliver_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// Enqueue-with-delay abstraction used by notification spam
#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job: &NotificationJob) -> ConsequenceResult<()>;

    /// Cancel every job still queued for the consequence, returning how many
    async fn cancel_for_consequence(&self, consequence_id: &str) -> ConsequenceResult<u64>;
}

fn counter(row: &SqliteRow, column: &str) -> Result<u32, sqlx::Error> {
    let value: i64 = row.try_get(column)?;
    u32::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<NotificationJob, sqlx::Error> {
    Ok(NotificationJob {
        id: row.try_get("id")?,
        consequence_id: row.try_get("consequence_id")?,
        user_id: row.try_get("user_id")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        action_url: row.try_get("action_url")?,
        notification_number: counter(row, "notification_number")?,
        total_notifications: counter(row, "total_notifications")?,
        deliver_at: row.try_get("deliver_at")?,
        status: row.try_get("status")?,
    })
}

pub struct SqliteJobScheduler {
    pool: SqlitePool,
    events: Arc<dyn EventSink>,
}

impl SqliteJobScheduler {
    pub fn new(pool: SqlitePool, events: Arc<dyn EventSink>) -> Self {
        Self { pool, events }
    }

    /// All jobs for a consequence in delivery order
    pub async fn jobs_for(&self, consequence_id: &str) -> ConsequenceResult<Vec<NotificationJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduled_notifications
            WHERE consequence_id = ?
            ORDER BY deliver_at, notification_number
            "#,
        )
        .bind(consequence_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?)
    }

    /// Deliver every queued job due at or before `now`: write the
    /// notification row and emit `spam_notification`. Returns the count.
    pub async fn deliver_due(&self, now: DateTime<Utc>) -> ConsequenceResult<usize> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduled_notifications
            WHERE status = 'queued' AND deliver_at <= ?
            ORDER BY deliver_at, notification_number
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let due = rows.iter().map(row_to_job).collect::<Result<Vec<_>, _>>()?;

        let mut delivered = 0;
        for job in due {
            let mut tx = self.pool.begin().await?;
            let claimed = sqlx::query(
                "UPDATE scheduled_notifications SET status = 'delivered' WHERE id = ? AND status = 'queued'",
            )
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            insert_notification(
                &mut *tx,
                &NewNotification {
                    user_id: job.user_id.clone(),
                    notification_type: "consequence".to_string(),
                    title: job.title.clone(),
                    message: job.message.clone(),
                    action_url: job.action_url.clone(),
                    priority: NotificationPriority::Medium,
                },
            )
            .await?;
            tx.commit().await?;

            self.events.emit(RealtimeEvent::SpamNotification {
                user_id: job.user_id,
                message: job.message,
                notification_number: job.notification_number,
                total_notifications: job.total_notifications,
            });
            delivered += 1;
        }

        if delivered > 0 {
            debug!("Delivered {} scheduled notifications", delivered);
        }
        Ok(delivered)
    }

    /// Poll for due jobs every `every` until the handle is aborted
    pub fn start_delivery_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);

            loop {
                ticker.tick().await;

                if let Err(e) = scheduler.deliver_due(Utc::now()).await {
                    error!("Failed to deliver scheduled notifications: {}", e);
                }
            }
        });

        info!("Notification delivery task started ({}s interval)", every.as_secs());
        handle
    }

    pub fn start_with_settings(self: Arc<Self>, settings: &RuntimeSettings) -> JoinHandle<()> {
        self.start_delivery_task(Duration::from_secs(settings.delivery_interval_secs))
    }
}

#[async_trait]
impl JobScheduler for SqliteJobScheduler {
    async fn schedule(&self, job: &NotificationJob) -> ConsequenceResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_notifications (
                id, consequence_id, user_id, title, message, action_url,
                notification_number, total_notifications, deliver_at, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.consequence_id)
        .bind(&job.user_id)
        .bind(&job.title)
        .bind(&job.message)
        .bind(&job.action_url)
        .bind(i64::from(job.notification_number))
        .bind(i64::from(job.total_notifications))
        .bind(job.deliver_at)
        .bind(job.status)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_for_consequence(&self, consequence_id: &str) -> ConsequenceResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_notifications SET status = 'cancelled'
            WHERE consequence_id = ? AND status = 'queued'
            "#,
        )
        .bind(consequence_id)
        .execute(&self.pool)
        .await?;

        let cancelled = result.rows_affected();
        if cancelled > 0 {
            debug!(
                "Cancelled {} queued notifications for consequence {}",
                cancelled, consequence_id
            );
        }
        Ok(cancelled)
    }
}
