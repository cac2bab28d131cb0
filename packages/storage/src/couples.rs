// ABOUTME: Couple records linking two partners
// ABOUTME: Membership checks and partner ordering used by SOS and consequences

use chrono::{DateTime, Utc};
use rekindle_core::new_id;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Couple {
    pub id: String,
    pub partner_1_id: String,
    pub partner_2_id: String,
    pub created_at: DateTime<Utc>,
}

impl Couple {
    pub fn is_member(&self, user_id: &str) -> bool {
        self.partner_1_id == user_id || self.partner_2_id == user_id
    }

    /// The other member of the couple, if `user_id` belongs to it
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if self.partner_1_id == user_id {
            Some(&self.partner_2_id)
        } else if self.partner_2_id == user_id {
            Some(&self.partner_1_id)
        } else {
            None
        }
    }
}

fn row_to_couple(row: &SqliteRow) -> Result<Couple, sqlx::Error> {
    Ok(Couple {
        id: row.try_get("id")?,
        partner_1_id: row.try_get("partner_1_id")?,
        partner_2_id: row.try_get("partner_2_id")?,
        created_at: row.try_get("created_at")?,
    })
}

pub struct CoupleStorage {
    pool: SqlitePool,
}

impl CoupleStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, partner_1_id: &str, partner_2_id: &str) -> StorageResult<Couple> {
        if partner_1_id == partner_2_id {
            return Err(StorageError::InvalidInput(
                "A couple needs two distinct partners".to_string(),
            ));
        }

        let couple = Couple {
            id: new_id("cpl"),
            partner_1_id: partner_1_id.to_string(),
            partner_2_id: partner_2_id.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO couples (id, partner_1_id, partner_2_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&couple.id)
        .bind(&couple.partner_1_id)
        .bind(&couple.partner_2_id)
        .bind(couple.created_at)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        debug!("Created couple {}", couple.id);
        Ok(couple)
    }

    pub async fn get(&self, couple_id: &str) -> StorageResult<Option<Couple>> {
        let row = sqlx::query("SELECT * FROM couples WHERE id = ?")
            .bind(couple_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;

        row.as_ref()
            .map(row_to_couple)
            .transpose()
            .map_err(StorageError::Sqlx)
    }

    /// Like `get`, but a missing couple is an error
    pub async fn require(&self, couple_id: &str) -> StorageResult<Couple> {
        self.get(couple_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("couple {}", couple_id)))
    }

    /// Most recent couple the user belongs to
    pub async fn find_for_user(&self, user_id: &str) -> StorageResult<Option<Couple>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM couples
            WHERE partner_1_id = ? OR partner_2_id = ?
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        row.as_ref()
            .map(row_to_couple)
            .transpose()
            .map_err(StorageError::Sqlx)
    }
}
