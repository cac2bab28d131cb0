// ABOUTME: SQLite persistence for SOS sessions, inputs, drafts and analyses
// ABOUTME: Transaction-friendly helpers plus the insert-count-claim submission barrier

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rekindle_ai::AiProvider;
use rekindle_storage::StorageError;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::draft::InputDraft;
use crate::error::{SosError, SosResult};
use crate::machine::status_transition_allowed;
use crate::questions::{AnswerValue, FlowCursor};
use crate::types::{SessionStatus, SosAnalysis, SosInput, SosSession};

/// Result of writing a participant's input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Both inputs exist and this caller owns the analysis
    Claimed,
    /// The other partner has not finished yet
    Waiting,
}

fn decode_error<E>(e: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(e))
}

fn row_to_session(row: &SqliteRow) -> Result<SosSession, sqlx::Error> {
    Ok(SosSession {
        id: row.try_get("id")?,
        couple_id: row.try_get("couple_id")?,
        initiated_by: row.try_get("initiated_by")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn row_to_input(row: &SqliteRow) -> Result<SosInput, sqlx::Error> {
    let severity: i64 = row.try_get("severity_level")?;
    Ok(SosInput {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        perspective: row.try_get("perspective")?,
        emotional_state: row.try_get("emotional_state")?,
        severity_level: u8::try_from(severity).map_err(decode_error)?,
        trigger_event: row.try_get("trigger_event")?,
        desired_outcome: row.try_get("desired_outcome")?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

fn row_to_draft(row: &SqliteRow) -> Result<InputDraft, sqlx::Error> {
    let phase: String = row.try_get("phase")?;
    let cursor: String = row.try_get("cursor")?;
    let answers: String = row.try_get("answers")?;

    Ok(InputDraft {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        phase: serde_json::from_str(&phase).map_err(decode_error)?,
        cursor: serde_json::from_str::<FlowCursor>(&cursor).map_err(decode_error)?,
        answers: serde_json::from_str::<BTreeMap<String, AnswerValue>>(&answers)
            .map_err(decode_error)?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_analysis(row: &SqliteRow) -> Result<SosAnalysis, sqlx::Error> {
    let provider: String = row.try_get("ai_provider")?;
    let analysis: String = row.try_get("analysis")?;

    Ok(SosAnalysis {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        ai_provider: provider.parse::<AiProvider>().map_err(decode_error)?,
        analysis: serde_json::from_str(&analysis).map_err(decode_error)?,
        raw_response: row.try_get("raw_response")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Insert a new session; a second open session for the couple is a `Conflict`
pub async fn insert_session(conn: &mut SqliteConnection, session: &SosSession) -> SosResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sos_sessions (id, couple_id, initiated_by, status, created_at, resolved_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&session.id)
    .bind(&session.couple_id)
    .bind(&session.initiated_by)
    .bind(session.status)
    .bind(session.created_at)
    .bind(session.resolved_at)
    .execute(conn)
    .await
    .map_err(|e| {
        let e = StorageError::Sqlx(e);
        if e.is_unique_violation() {
            SosError::Conflict("An SOS session is already active for this couple".to_string())
        } else {
            SosError::Storage(e)
        }
    })?;

    Ok(())
}

/// Create or replace a participant's draft
pub async fn save_draft(conn: &mut SqliteConnection, draft: &InputDraft) -> SosResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sos_input_drafts (session_id, user_id, phase, cursor, answers, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (session_id, user_id) DO UPDATE SET
            phase = excluded.phase,
            cursor = excluded.cursor,
            answers = excluded.answers,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&draft.session_id)
    .bind(&draft.user_id)
    .bind(serde_json::to_string(&draft.phase)?)
    .bind(serde_json::to_string(&draft.cursor)?)
    .bind(serde_json::to_string(&draft.answers)?)
    .bind(draft.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn insert_analysis(conn: &mut SqliteConnection, analysis: &SosAnalysis) -> SosResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sos_analyses (id, session_id, ai_provider, analysis, raw_response, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&analysis.id)
    .bind(&analysis.session_id)
    .bind(analysis.ai_provider.as_str())
    .bind(serde_json::to_string(&analysis.analysis)?)
    .bind(&analysis.raw_response)
    .bind(analysis.created_at)
    .execute(conn)
    .await
    .map_err(|e| {
        let e = StorageError::Sqlx(e);
        if e.is_unique_violation() {
            SosError::Conflict(format!(
                "Session {} already has an analysis",
                analysis.session_id
            ))
        } else {
            SosError::Storage(e)
        }
    })?;

    Ok(())
}

/// Move the session from `from` to `to` only if it is still in `from`.
/// Returns whether the row changed.
pub async fn update_status_if(
    conn: &mut SqliteConnection,
    session_id: &str,
    from: SessionStatus,
    to: SessionStatus,
) -> SosResult<bool> {
    if !status_transition_allowed(from, to) {
        return Err(SosError::InvalidState(format!(
            "Session cannot move from {} to {}",
            from, to
        )));
    }

    let resolved_at: Option<DateTime<Utc>> = (to == SessionStatus::Resolved).then(Utc::now);
    let result = sqlx::query(
        r#"
        UPDATE sos_sessions
        SET status = ?, resolved_at = COALESCE(?, resolved_at)
        WHERE id = ? AND status = ?
        "#,
    )
    .bind(to)
    .bind(resolved_at)
    .bind(session_id)
    .bind(from)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub struct SosStorage {
    pool: SqlitePool,
}

impl SosStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_session(&self, session_id: &str) -> SosResult<Option<SosSession>> {
        let row = sqlx::query("SELECT * FROM sos_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_session).transpose()?)
    }

    pub async fn require_session(&self, session_id: &str) -> SosResult<SosSession> {
        self.get_session(session_id)
            .await?
            .ok_or_else(|| SosError::NotFound(format!("SOS session {}", session_id)))
    }

    /// The couple's session that is still active, partner-pending or analyzing
    pub async fn find_open_session(&self, couple_id: &str) -> SosResult<Option<SosSession>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sos_sessions
            WHERE couple_id = ? AND status IN ('active', 'partner-pending', 'analyzing')
            LIMIT 1
            "#,
        )
        .bind(couple_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_session).transpose()?)
    }

    pub async fn count_initiated_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> SosResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sos_sessions WHERE initiated_by = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Most recent sessions the user initiated, newest first
    pub async fn list_initiated_by(&self, user_id: &str, limit: i64) -> SosResult<Vec<SosSession>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sos_sessions
            WHERE initiated_by = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_session)
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn get_draft(&self, session_id: &str, user_id: &str) -> SosResult<Option<InputDraft>> {
        let row = sqlx::query("SELECT * FROM sos_input_drafts WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_draft).transpose()?)
    }

    pub async fn put_draft(&self, draft: &InputDraft) -> SosResult<()> {
        let mut conn = self.pool.acquire().await?;
        save_draft(&mut conn, draft).await
    }

    pub async fn get_input(&self, session_id: &str, user_id: &str) -> SosResult<Option<SosInput>> {
        let row = sqlx::query("SELECT * FROM sos_inputs WHERE session_id = ? AND user_id = ?")
            .bind(session_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_input).transpose()?)
    }

    pub async fn list_inputs(&self, session_id: &str) -> SosResult<Vec<SosInput>> {
        let rows = sqlx::query(
            "SELECT * FROM sos_inputs WHERE session_id = ? ORDER BY submitted_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(row_to_input)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Write `input` and the finished draft, then count inputs and claim the
    /// session for analysis if both partners are in. All in one transaction,
    /// so exactly one caller per session ever sees `Claimed`.
    pub async fn submit_input(
        &self,
        input: &SosInput,
        draft: &InputDraft,
    ) -> SosResult<BarrierOutcome> {
        let mut tx = self.pool.begin().await?;

        let status: Option<SessionStatus> =
            sqlx::query_scalar("SELECT status FROM sos_sessions WHERE id = ?")
                .bind(&input.session_id)
                .fetch_optional(&mut *tx)
                .await?;
        match status {
            None => {
                return Err(SosError::NotFound(format!(
                    "SOS session {}",
                    input.session_id
                )))
            }
            Some(status) if !status.is_collecting() => {
                return Err(SosError::InvalidState(format!(
                    "Session is {} and no longer accepts input",
                    status
                )))
            }
            Some(_) => {}
        }

        sqlx::query(
            r#"
            INSERT INTO sos_inputs (
                id, session_id, user_id, perspective, emotional_state,
                severity_level, trigger_event, desired_outcome, submitted_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&input.id)
        .bind(&input.session_id)
        .bind(&input.user_id)
        .bind(&input.perspective)
        .bind(input.emotional_state)
        .bind(input.severity_level as i64)
        .bind(&input.trigger_event)
        .bind(&input.desired_outcome)
        .bind(input.submitted_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            let e = StorageError::Sqlx(e);
            if e.is_unique_violation() {
                SosError::DuplicateSubmission(input.session_id.clone())
            } else {
                SosError::Storage(e)
            }
        })?;

        save_draft(&mut *tx, draft).await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sos_inputs WHERE session_id = ?")
            .bind(&input.session_id)
            .fetch_one(&mut *tx)
            .await?;

        let outcome = if count >= 2 {
            let claimed = sqlx::query(
                r#"
                UPDATE sos_sessions SET status = 'analyzing'
                WHERE id = ? AND status IN ('active', 'partner-pending')
                "#,
            )
            .bind(&input.session_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                == 1;

            if claimed {
                BarrierOutcome::Claimed
            } else {
                BarrierOutcome::Waiting
            }
        } else {
            update_status_if(
                &mut *tx,
                &input.session_id,
                SessionStatus::Active,
                SessionStatus::PartnerPending,
            )
            .await?;
            BarrierOutcome::Waiting
        };

        tx.commit().await?;

        debug!(
            "Stored SOS input for {} in session {} ({} of 2)",
            input.user_id, input.session_id, count
        );
        Ok(outcome)
    }

    /// Claim a session whose two inputs are already stored. False when
    /// someone else claimed it first or an input is missing.
    pub async fn claim_for_analysis(&self, session_id: &str) -> SosResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sos_sessions SET status = 'analyzing'
            WHERE id = ?
              AND status IN ('active', 'partner-pending')
              AND (SELECT COUNT(*) FROM sos_inputs WHERE session_id = ?) >= 2
            "#,
        )
        .bind(session_id)
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Abandon an open session. Returns false if it was not open.
    pub async fn abandon(&self, session_id: &str) -> SosResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sos_sessions SET status = 'abandoned'
            WHERE id = ? AND status IN ('active', 'partner-pending', 'analyzing')
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() == 1;
        if changed {
            info!("Abandoned SOS session {}", session_id);
        }
        Ok(changed)
    }

    pub async fn get_analysis(&self, session_id: &str) -> SosResult<Option<SosAnalysis>> {
        let row = sqlx::query("SELECT * FROM sos_analyses WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_analysis).transpose()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::SosPhase;
    use crate::types::EmotionalState;
    use rekindle_core::new_id;
    use rekindle_storage::{init_memory_pool, CoupleStorage};

    async fn setup() -> (SosStorage, String) {
        let pool = init_memory_pool().await.unwrap();
        let couple = CoupleStorage::new(pool.clone())
            .create("alice", "bob")
            .await
            .unwrap();
        (SosStorage::new(pool), couple.id)
    }

    fn session(couple_id: &str) -> SosSession {
        SosSession {
            id: new_id("sos"),
            couple_id: couple_id.to_string(),
            initiated_by: "alice".to_string(),
            status: SessionStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    fn input(session_id: &str, user_id: &str) -> SosInput {
        SosInput {
            id: new_id("inp"),
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            perspective: "my side".to_string(),
            emotional_state: EmotionalState::Sad,
            severity_level: 2,
            trigger_event: "dishes".to_string(),
            desired_outcome: "a rota".to_string(),
            submitted_at: Utc::now(),
        }
    }

    fn finished_draft(session_id: &str, user_id: &str) -> InputDraft {
        InputDraft::new(
            session_id,
            user_id,
            SosPhase::WaitingForPartner,
            FlowCursor::default(),
        )
    }

    #[tokio::test]
    async fn test_second_open_session_conflicts() {
        let (storage, couple_id) = setup().await;
        let mut conn = storage.pool().acquire().await.unwrap();

        insert_session(&mut conn, &session(&couple_id)).await.unwrap();
        let result = insert_session(&mut conn, &session(&couple_id)).await;
        assert!(matches!(result, Err(SosError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_barrier_claims_on_second_input_only() {
        let (storage, couple_id) = setup().await;
        let s = session(&couple_id);
        {
            let mut conn = storage.pool().acquire().await.unwrap();
            insert_session(&mut conn, &s).await.unwrap();
        }

        let first = storage
            .submit_input(&input(&s.id, "alice"), &finished_draft(&s.id, "alice"))
            .await
            .unwrap();
        assert_eq!(first, BarrierOutcome::Waiting);
        assert_eq!(
            storage.require_session(&s.id).await.unwrap().status,
            SessionStatus::PartnerPending
        );

        let duplicate = storage
            .submit_input(&input(&s.id, "alice"), &finished_draft(&s.id, "alice"))
            .await;
        assert!(matches!(duplicate, Err(SosError::DuplicateSubmission(_))));

        let second = storage
            .submit_input(&input(&s.id, "bob"), &finished_draft(&s.id, "bob"))
            .await
            .unwrap();
        assert_eq!(second, BarrierOutcome::Claimed);
        assert_eq!(
            storage.require_session(&s.id).await.unwrap().status,
            SessionStatus::Analyzing
        );
        assert_eq!(storage.list_inputs(&s.id).await.unwrap().len(), 2);
        assert!(!storage.claim_for_analysis(&s.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_draft_round_trips_through_json_columns() {
        let (storage, couple_id) = setup().await;
        let s = session(&couple_id);
        {
            let mut conn = storage.pool().acquire().await.unwrap();
            insert_session(&mut conn, &s).await.unwrap();
        }

        let mut draft = InputDraft::new(
            &s.id,
            "bob",
            SosPhase::EmergencyProtocol {
                question_id: "trigger-event".to_string(),
                held_answer: AnswerValue::text("abuse"),
                escalate: true,
            },
            FlowCursor::default(),
        );
        draft.record("severity-level", AnswerValue::Number(5));
        storage.put_draft(&draft).await.unwrap();

        let loaded = storage.get_draft(&s.id, "bob").await.unwrap().unwrap();
        assert_eq!(loaded.phase, draft.phase);
        assert_eq!(loaded.answers, draft.answers);
        assert!(storage.get_draft(&s.id, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_guards() {
        let (storage, couple_id) = setup().await;
        let s = session(&couple_id);
        let mut conn = storage.pool().acquire().await.unwrap();
        insert_session(&mut conn, &s).await.unwrap();

        let invalid = update_status_if(
            &mut conn,
            &s.id,
            SessionStatus::Active,
            SessionStatus::Resolved,
        )
        .await;
        assert!(matches!(invalid, Err(SosError::InvalidState(_))));

        let stale = update_status_if(
            &mut conn,
            &s.id,
            SessionStatus::Analyzing,
            SessionStatus::Resolved,
        )
        .await
        .unwrap();
        assert!(!stale);
        drop(conn);

        assert!(storage.abandon(&s.id).await.unwrap());
        assert!(!storage.abandon(&s.id).await.unwrap());
    }
}
