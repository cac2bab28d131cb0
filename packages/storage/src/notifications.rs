// ABOUTME: In-app notification rows shown to partners
// ABOUTME: Insert helpers usable inside a caller's transaction plus per-user listing

use chrono::{DateTime, Utc};
use rekindle_core::new_id;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

impl Default for NotificationPriority {
    fn default() -> Self {
        Self::Medium
    }
}

/// Notification to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub is_read: bool,
    pub priority: NotificationPriority,
    pub created_at: DateTime<Utc>,
}

fn row_to_notification(row: &SqliteRow) -> Result<Notification, sqlx::Error> {
    Ok(Notification {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        notification_type: row.try_get("type")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        action_url: row.try_get("action_url")?,
        is_read: row.try_get("is_read")?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a notification on an existing connection or transaction
pub async fn insert_notification(
    conn: &mut SqliteConnection,
    new: &NewNotification,
) -> StorageResult<String> {
    let id = new_id("ntf");

    sqlx::query(
        r#"
        INSERT INTO notifications (id, user_id, type, title, message, action_url, is_read, priority, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&new.user_id)
    .bind(&new.notification_type)
    .bind(&new.title)
    .bind(&new.message)
    .bind(&new.action_url)
    .bind(new.priority)
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(StorageError::Sqlx)?;

    debug!(
        "Queued {} notification {} for user {}",
        new.notification_type, id, new.user_id
    );
    Ok(id)
}

pub struct NotificationStorage {
    pool: SqlitePool,
}

impl NotificationStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: &NewNotification) -> StorageResult<String> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Sqlx)?;
        insert_notification(&mut conn, new).await
    }

    /// Newest first
    pub async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<Notification>> {
        let rows = sqlx::query(
            "SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        rows.iter()
            .map(row_to_notification)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Sqlx)
    }

    pub async fn count_for_user(&self, user_id: &str, notification_type: &str) -> StorageResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM notifications WHERE user_id = ? AND type = ?")
            .bind(user_id)
            .bind(notification_type)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;

        Ok(row.get("n"))
    }

    pub async fn mark_read(&self, notification_id: &str, user_id: &str) -> StorageResult<()> {
        let result = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
            .bind(notification_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "notification {}",
                notification_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;

    fn sample(user_id: &str, priority: NotificationPriority) -> NewNotification {
        NewNotification {
            user_id: user_id.to_string(),
            notification_type: "sos".to_string(),
            title: "SOS Fight Solver Activated".to_string(),
            message: "Your partner needs help resolving a conflict.".to_string(),
            action_url: Some("/sos/sos-1".to_string()),
            priority,
        }
    }

    #[tokio::test]
    async fn test_create_and_list_notifications() {
        let pool = init_memory_pool().await.unwrap();
        let storage = NotificationStorage::new(pool);

        storage.create(&sample("bob", NotificationPriority::High)).await.unwrap();
        storage.create(&sample("alice", NotificationPriority::Low)).await.unwrap();

        let bob = storage.list_for_user("bob").await.unwrap();
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].priority, NotificationPriority::High);
        assert!(!bob[0].is_read);
        assert_eq!(bob[0].action_url.as_deref(), Some("/sos/sos-1"));
        assert_eq!(storage.count_for_user("bob", "sos").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_mark_read_only_for_owner() {
        let pool = init_memory_pool().await.unwrap();
        let storage = NotificationStorage::new(pool);

        let id = storage.create(&sample("bob", NotificationPriority::Medium)).await.unwrap();

        assert!(matches!(
            storage.mark_read(&id, "alice").await,
            Err(StorageError::NotFound(_))
        ));
        storage.mark_read(&id, "bob").await.unwrap();
        assert!(storage.list_for_user("bob").await.unwrap()[0].is_read);
    }
}
