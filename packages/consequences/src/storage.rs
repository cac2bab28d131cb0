// ABOUTME: SQLite persistence for consequence rules and active consequences
// ABOUTME: Status changes are conditional updates so lifecycle races cannot double-apply

use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{ConsequenceError, ConsequenceResult};
use crate::types::{
    ActiveConsequence, ConsequenceMetadata, ConsequenceRule, ConsequenceStatus, TriggerCause,
};

fn decode_error<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn row_to_rule(row: &SqliteRow) -> Result<ConsequenceRule, sqlx::Error> {
    let max_duration: Option<i64> = row.try_get("max_duration_minutes")?;
    Ok(ConsequenceRule {
        id: row.try_get("id")?,
        triggered_by: row.try_get("triggered_by")?,
        severity: row.try_get("severity")?,
        consequence_type: row.try_get("consequence_type")?,
        description: row.try_get("description")?,
        persona_message: row.try_get("persona_message")?,
        is_active: row.try_get("is_active")?,
        requires_consent: row.try_get("requires_consent")?,
        max_duration_minutes: max_duration
            .map(u32::try_from)
            .transpose()
            .map_err(decode_error)?,
    })
}

fn row_to_consequence(row: &SqliteRow) -> Result<ActiveConsequence, sqlx::Error> {
    let metadata: String = row.try_get("metadata")?;
    let commentary: String = row.try_get("marcie_commentary")?;

    Ok(ActiveConsequence {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        user_id: row.try_get("user_id")?,
        couple_id: row.try_get("couple_id")?,
        consequence_type: row.try_get("consequence_type")?,
        trigger_cause: row.try_get("trigger_cause")?,
        status: row.try_get("status")?,
        triggered_by: row.try_get("triggered_by")?,
        assigned_at: row.try_get("assigned_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        user_consent: row.try_get("user_consent")?,
        metadata: serde_json::from_str(&metadata).map_err(decode_error)?,
        marcie_commentary: serde_json::from_str(&commentary).map_err(decode_error)?,
    })
}

pub async fn insert_consequence(
    conn: &mut SqliteConnection,
    consequence: &ActiveConsequence,
) -> ConsequenceResult<()> {
    sqlx::query(
        r#"
        INSERT INTO active_consequences (
            id, rule_id, user_id, couple_id, consequence_type, trigger_cause, status,
            triggered_by, assigned_at, started_at, completed_at, cancelled_at,
            user_consent, metadata, marcie_commentary
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&consequence.id)
    .bind(&consequence.rule_id)
    .bind(&consequence.user_id)
    .bind(&consequence.couple_id)
    .bind(consequence.consequence_type)
    .bind(consequence.trigger_cause)
    .bind(consequence.status)
    .bind(&consequence.triggered_by)
    .bind(consequence.assigned_at)
    .bind(consequence.started_at)
    .bind(consequence.completed_at)
    .bind(consequence.cancelled_at)
    .bind(consequence.user_consent)
    .bind(serde_json::to_string(&consequence.metadata)?)
    .bind(serde_json::to_string(&consequence.marcie_commentary)?)
    .execute(conn)
    .await?;

    debug!(
        "Stored {} consequence {} for user {}",
        consequence.consequence_type, consequence.id, consequence.user_id
    );
    Ok(())
}

pub async fn set_metadata(
    conn: &mut SqliteConnection,
    consequence_id: &str,
    metadata: &ConsequenceMetadata,
) -> ConsequenceResult<()> {
    sqlx::query("UPDATE active_consequences SET metadata = ? WHERE id = ?")
        .bind(serde_json::to_string(metadata)?)
        .bind(consequence_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub struct ConsequenceStorage {
    pool: SqlitePool,
}

impl ConsequenceStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Active rules for `cause` in a stable order
    pub async fn active_rules(&self, cause: TriggerCause) -> ConsequenceResult<Vec<ConsequenceRule>> {
        let rows = sqlx::query(
            "SELECT * FROM consequence_rules WHERE triggered_by = ? AND is_active = 1 ORDER BY id",
        )
        .bind(cause)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_rule)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn require_rule(&self, rule_id: &str) -> ConsequenceResult<ConsequenceRule> {
        let row = sqlx::query("SELECT * FROM consequence_rules WHERE id = ?")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref()
            .map(row_to_rule)
            .transpose()?
            .ok_or_else(|| ConsequenceError::NotFound(format!("Consequence rule {}", rule_id)))
    }

    pub async fn get(&self, consequence_id: &str) -> ConsequenceResult<Option<ActiveConsequence>> {
        let row = sqlx::query("SELECT * FROM active_consequences WHERE id = ?")
            .bind(consequence_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_consequence).transpose()?)
    }

    pub async fn require(&self, consequence_id: &str) -> ConsequenceResult<ActiveConsequence> {
        self.get(consequence_id)
            .await?
            .ok_or_else(|| ConsequenceError::NotFound(consequence_id.to_string()))
    }

    /// Record the user's answer to a pending consent request. Returns false
    /// when the consequence was no longer pending.
    pub async fn resolve_consent(&self, consequence_id: &str, accepted: bool) -> ConsequenceResult<bool> {
        let now = Utc::now();
        let (status, started_at, cancelled_at) = if accepted {
            (ConsequenceStatus::Active, Some(now), None)
        } else {
            (ConsequenceStatus::Cancelled, None, Some(now))
        };

        let result = sqlx::query(
            r#"
            UPDATE active_consequences
            SET status = ?, user_consent = ?, started_at = ?, cancelled_at = ?
            WHERE id = ? AND status = 'pending_consent'
            "#,
        )
        .bind(status)
        .bind(accepted)
        .bind(started_at)
        .bind(cancelled_at)
        .bind(consequence_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark an active consequence completed. Returns false if it was not active.
    pub async fn complete(&self, consequence_id: &str) -> ConsequenceResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE active_consequences
            SET status = 'completed', completed_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now())
        .bind(consequence_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Cancel a consequence whose activation never finished. Returns false
    /// if it was not active.
    pub async fn cancel_active(&self, consequence_id: &str) -> ConsequenceResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE active_consequences
            SET status = 'cancelled', cancelled_at = ?
            WHERE id = ? AND status = 'active'
            "#,
        )
        .bind(Utc::now())
        .bind(consequence_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Pending-consent and active consequences for the user, newest first
    pub async fn list_open_for_user(&self, user_id: &str) -> ConsequenceResult<Vec<ActiveConsequence>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM active_consequences
            WHERE user_id = ? AND status IN ('pending_consent', 'active')
            ORDER BY assigned_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_consequence)
            .collect::<Result<Vec<_>, _>>()?)
    }
}
