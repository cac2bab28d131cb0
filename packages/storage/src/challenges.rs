// ABOUTME: Challenge catalog lookups and challenge attempt assignment
// ABOUTME: Used for SOS healing challenges and consequence makeup challenges

use chrono::{DateTime, Utc};
use rekindle_core::new_id;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub difficulty_level: i64,
    pub points: i64,
}

/// Why a challenge attempt was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChallengeSource {
    SosHealing,
    Consequence,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeAttempt {
    pub id: String,
    pub couple_id: String,
    pub challenge_id: String,
    pub challenge_title: String,
    pub category: String,
    pub assigned_to: Option<String>,
    pub source: ChallengeSource,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

fn row_to_challenge(row: &SqliteRow) -> Result<Challenge, sqlx::Error> {
    Ok(Challenge {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category: row.try_get("category")?,
        difficulty_level: row.try_get("difficulty_level")?,
        points: row.try_get("points")?,
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<ChallengeAttempt, sqlx::Error> {
    Ok(ChallengeAttempt {
        id: row.try_get("id")?,
        couple_id: row.try_get("couple_id")?,
        challenge_id: row.try_get("challenge_id")?,
        challenge_title: row.try_get("title")?,
        category: row.try_get("category")?,
        assigned_to: row.try_get("assigned_to")?,
        source: row.try_get("source")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Easiest active challenge in `category`, ties broken by id
pub async fn find_lowest_difficulty(
    conn: &mut SqliteConnection,
    category: &str,
) -> StorageResult<Option<Challenge>> {
    let row = sqlx::query(
        r#"
        SELECT * FROM challenges
        WHERE category = ? AND is_active = 1
        ORDER BY difficulty_level ASC, id ASC
        LIMIT 1
        "#,
    )
    .bind(category)
    .fetch_optional(conn)
    .await
    .map_err(StorageError::Sqlx)?;

    row.as_ref()
        .map(row_to_challenge)
        .transpose()
        .map_err(StorageError::Sqlx)
}

/// Record a pending attempt of `challenge_id` for the couple
pub async fn insert_attempt(
    conn: &mut SqliteConnection,
    couple_id: &str,
    challenge_id: &str,
    assigned_to: Option<&str>,
    source: ChallengeSource,
) -> StorageResult<String> {
    let id = new_id("att");

    sqlx::query(
        r#"
        INSERT INTO challenge_attempts (id, couple_id, challenge_id, assigned_to, source, status, created_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?)
        "#,
    )
    .bind(&id)
    .bind(couple_id)
    .bind(challenge_id)
    .bind(assigned_to)
    .bind(source)
    .bind(Utc::now())
    .execute(conn)
    .await
    .map_err(StorageError::Sqlx)?;

    debug!("Assigned challenge {} to couple {}", challenge_id, couple_id);
    Ok(id)
}

pub struct ChallengeStorage {
    pool: SqlitePool,
}

impl ChallengeStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lowest_difficulty(&self, category: &str) -> StorageResult<Option<Challenge>> {
        let mut conn = self.pool.acquire().await.map_err(StorageError::Sqlx)?;
        find_lowest_difficulty(&mut conn, category).await
    }

    pub async fn list_attempts(&self, couple_id: &str) -> StorageResult<Vec<ChallengeAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT a.*, c.title, c.category
            FROM challenge_attempts a
            JOIN challenges c ON c.id = a.challenge_id
            WHERE a.couple_id = ?
            ORDER BY a.created_at DESC, a.rowid DESC
            "#,
        )
        .bind(couple_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        rows.iter()
            .map(row_to_attempt)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StorageError::Sqlx)
    }

    /// Titles of the couple's most recent attempts, newest first
    pub async fn recent_titles(&self, couple_id: &str, limit: i64) -> StorageResult<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT c.title
            FROM challenge_attempts a
            JOIN challenges c ON c.id = a.challenge_id
            WHERE a.couple_id = ?
            ORDER BY a.created_at DESC, a.rowid DESC
            LIMIT ?
            "#,
        )
        .bind(couple_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(rows.iter().map(|row| row.get("title")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::couples::CoupleStorage;
    use crate::db::init_memory_pool;

    #[tokio::test]
    async fn test_lowest_difficulty_per_category() {
        let pool = init_memory_pool().await.unwrap();
        let storage = ChallengeStorage::new(pool);

        let comm = storage.lowest_difficulty("communication").await.unwrap().unwrap();
        assert_eq!(comm.difficulty_level, 1);
        assert_eq!(comm.category, "communication");

        assert!(storage.lowest_difficulty("knitting").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assign_and_list_attempts() {
        let pool = init_memory_pool().await.unwrap();
        let couple = CoupleStorage::new(pool.clone())
            .create("alice", "bob")
            .await
            .unwrap();
        let storage = ChallengeStorage::new(pool.clone());

        let trust = storage.lowest_difficulty("trust").await.unwrap().unwrap();
        let mut conn = pool.acquire().await.unwrap();
        insert_attempt(&mut conn, &couple.id, &trust.id, Some("alice"), ChallengeSource::Consequence)
            .await
            .unwrap();
        drop(conn);

        let attempts = storage.list_attempts(&couple.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].challenge_title, trust.title);
        assert_eq!(attempts[0].source, ChallengeSource::Consequence);
        assert_eq!(attempts[0].status, "pending");

        let titles = storage.recent_titles(&couple.id, 5).await.unwrap();
        assert_eq!(titles, vec![trust.title]);
    }
}
