// ABOUTME: Persona conversation transcript storage
// ABOUTME: Records what Dr. Marcie said to each user and in which session phase

use chrono::{DateTime, Utc};
use rekindle_core::new_id;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, error};

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversationEntry {
    pub user_id: String,
    pub couple_id: Option<String>,
    pub session_type: String,
    pub context: serde_json::Value,
    pub user_message: String,
    pub marcie_response: String,
    pub tone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub id: String,
    pub user_id: String,
    pub couple_id: Option<String>,
    pub session_type: String,
    pub context: serde_json::Value,
    pub user_message: String,
    pub marcie_response: String,
    pub tone: String,
    pub created_at: DateTime<Utc>,
}

/// Append a transcript entry on an existing connection or transaction
pub async fn insert_conversation(
    conn: &mut SqliteConnection,
    entry: &NewConversationEntry,
) -> StorageResult<String> {
    let id = new_id("cnv");
    let context = serde_json::to_string(&entry.context)?;

    sqlx::query(
        r#"
        INSERT INTO marcie_conversations
            (id, user_id, couple_id, session_type, context, user_message, marcie_response, tone, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&entry.user_id)
    .bind(&entry.couple_id)
    .bind(&entry.session_type)
    .bind(context)
    .bind(&entry.user_message)
    .bind(&entry.marcie_response)
    .bind(&entry.tone)
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(|e| {
        error!("Failed to record conversation entry: {}", e);
        StorageError::Sqlx(e)
    })?;

    debug!("Recorded conversation entry {} for {}", id, entry.user_id);
    Ok(id)
}

pub struct ConversationStorage {
    pool: SqlitePool,
}

impl ConversationStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &NewConversationEntry) -> StorageResult<String> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Sqlx)?;
        insert_conversation(&mut conn, entry).await
    }

    /// Transcript for one user, oldest first
    pub async fn list_for_user(&self, user_id: &str) -> StorageResult<Vec<ConversationEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, couple_id, session_type, context, user_message, marcie_response, tone, created_at
            FROM marcie_conversations
            WHERE user_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        rows.into_iter()
            .map(|row| -> StorageResult<ConversationEntry> {
                let context: String = row.get("context");
                Ok(ConversationEntry {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    couple_id: row.get("couple_id"),
                    session_type: row.get("session_type"),
                    context: serde_json::from_str(&context)?,
                    user_message: row.get("user_message"),
                    marcie_response: row.get("marcie_response"),
                    tone: row.get("tone"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_record_and_list_transcript() {
        let pool = init_memory_pool().await.unwrap();
        let storage = ConversationStorage::new(pool);

        storage
            .record(&NewConversationEntry {
                user_id: "alice".to_string(),
                couple_id: Some("cpl-1".to_string()),
                session_type: "fight-solver".to_string(),
                context: json!({ "sos_session_id": "sos-1", "phase": "initiation" }),
                user_message: "SOS_INITIATED".to_string(),
                marcie_response: "Take a breath, we will get to the truth.".to_string(),
                tone: "supportive".to_string(),
            })
            .await
            .unwrap();

        let entries = storage.list_for_user("alice").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].context["phase"], "initiation");
        assert!(storage.list_for_user("bob").await.unwrap().is_empty());
    }
}
