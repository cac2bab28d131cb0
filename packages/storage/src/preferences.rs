// ABOUTME: Consequence preference type definitions and storage
// ABOUTME: Per-user opt-ins, notification cadence and exemption windows, created on first access

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Allowed range for the spam cadence in minutes
pub const NOTIFICATION_FREQUENCY_RANGE: std::ops::RangeInclusive<u32> = 1..=120;

/// Daily UTC window ("HH:MM" to "HH:MM") during which device-affecting
/// consequences are suppressed. A window whose end precedes its start wraps
/// past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExemptionWindow {
    pub start: String,
    pub end: String,
}

impl ExemptionWindow {
    pub fn new(start: &str, end: &str) -> StorageResult<Self> {
        let window = Self {
            start: start.to_string(),
            end: end.to_string(),
        };
        window.bounds()?;
        Ok(window)
    }

    fn bounds(&self) -> StorageResult<(NaiveTime, NaiveTime)> {
        let parse = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
                StorageError::InvalidInput(format!("Invalid exemption time: {}", value))
            })
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }

    /// Whether `at` falls inside the window; malformed windows never match
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let Ok((start, end)) = self.bounds() else {
            return false;
        };
        let Some(now) = NaiveTime::from_hms_opt(at.hour(), at.minute(), 0) else {
            return false;
        };

        if start <= end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsequencePreferences {
    pub user_id: String,
    pub allow_screensaver_changes: bool,
    pub allow_app_blocking: bool,
    pub allow_notification_spam: bool,
    /// Minutes between spam notifications
    pub max_notification_frequency: u32,
    pub blocked_app_categories: Vec<String>,
    pub exemption_hours: Vec<ExemptionWindow>,
    pub emergency_bypass: bool,
    pub updated_at: DateTime<Utc>,
}

impl ConsequencePreferences {
    pub fn is_exempt_at(&self, at: DateTime<Utc>) -> bool {
        self.exemption_hours.iter().any(|w| w.contains(at))
    }
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub allow_screensaver_changes: Option<bool>,
    pub allow_app_blocking: Option<bool>,
    pub allow_notification_spam: Option<bool>,
    pub max_notification_frequency: Option<u32>,
    pub blocked_app_categories: Option<Vec<String>>,
    pub exemption_hours: Option<Vec<ExemptionWindow>>,
    pub emergency_bypass: Option<bool>,
}

fn row_to_preferences(row: &SqliteRow) -> StorageResult<ConsequencePreferences> {
    let blocked: String = row.try_get("blocked_app_categories")?;
    let exemptions: String = row.try_get("exemption_hours")?;
    let frequency: i64 = row.try_get("max_notification_frequency")?;

    Ok(ConsequencePreferences {
        user_id: row.try_get("user_id")?,
        allow_screensaver_changes: row.try_get("allow_screensaver_changes")?,
        allow_app_blocking: row.try_get("allow_app_blocking")?,
        allow_notification_spam: row.try_get("allow_notification_spam")?,
        max_notification_frequency: u32::try_from(frequency).unwrap_or(0),
        blocked_app_categories: serde_json::from_str(&blocked)?,
        exemption_hours: serde_json::from_str(&exemptions)?,
        emergency_bypass: row.try_get("emergency_bypass")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Storage layer for consequence preferences
pub struct PreferencesStorage {
    pool: SqlitePool,
}

impl PreferencesStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get preferences for a user, creating the defaults if none exist
    pub async fn get_preferences(&self, user_id: &str) -> StorageResult<ConsequencePreferences> {
        let existing = sqlx::query("SELECT * FROM consequence_preferences WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;

        if let Some(row) = existing {
            return row_to_preferences(&row);
        }

        self.create_default_preferences(user_id).await?;

        let row = sqlx::query("SELECT * FROM consequence_preferences WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Sqlx)?;
        row_to_preferences(&row)
    }

    async fn create_default_preferences(&self, user_id: &str) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO consequence_preferences (user_id, updated_at)
            VALUES (?, ?)
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        debug!("Created default consequence preferences for {}", user_id);
        Ok(())
    }

    pub async fn update_preferences(
        &self,
        user_id: &str,
        request: &UpdatePreferencesRequest,
    ) -> StorageResult<ConsequencePreferences> {
        let mut prefs = self.get_preferences(user_id).await?;

        if let Some(frequency) = request.max_notification_frequency {
            if !NOTIFICATION_FREQUENCY_RANGE.contains(&frequency) {
                return Err(StorageError::InvalidInput(format!(
                    "Notification frequency must be between {} and {} minutes",
                    NOTIFICATION_FREQUENCY_RANGE.start(),
                    NOTIFICATION_FREQUENCY_RANGE.end()
                )));
            }
            prefs.max_notification_frequency = frequency;
        }
        if let Some(windows) = &request.exemption_hours {
            for window in windows {
                window.bounds()?;
            }
            prefs.exemption_hours = windows.clone();
        }
        if let Some(value) = request.allow_screensaver_changes {
            prefs.allow_screensaver_changes = value;
        }
        if let Some(value) = request.allow_app_blocking {
            prefs.allow_app_blocking = value;
        }
        if let Some(value) = request.allow_notification_spam {
            prefs.allow_notification_spam = value;
        }
        if let Some(apps) = &request.blocked_app_categories {
            prefs.blocked_app_categories = apps
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect();
        }
        if let Some(value) = request.emergency_bypass {
            prefs.emergency_bypass = value;
        }
        prefs.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE consequence_preferences SET
                allow_screensaver_changes = ?,
                allow_app_blocking = ?,
                allow_notification_spam = ?,
                max_notification_frequency = ?,
                blocked_app_categories = ?,
                exemption_hours = ?,
                emergency_bypass = ?,
                updated_at = ?
            WHERE user_id = ?
            "#,
        )
        .bind(prefs.allow_screensaver_changes)
        .bind(prefs.allow_app_blocking)
        .bind(prefs.allow_notification_spam)
        .bind(i64::from(prefs.max_notification_frequency))
        .bind(serde_json::to_string(&prefs.blocked_app_categories)?)
        .bind(serde_json::to_string(&prefs.exemption_hours)?)
        .bind(prefs.emergency_bypass)
        .bind(prefs.updated_at)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Sqlx)?;

        Ok(prefs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_pool;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_defaults_created_on_first_access() {
        let pool = init_memory_pool().await.unwrap();
        let storage = PreferencesStorage::new(pool);

        let prefs = storage.get_preferences("alice").await.unwrap();
        assert!(prefs.allow_screensaver_changes);
        assert!(!prefs.allow_app_blocking);
        assert!(prefs.allow_notification_spam);
        assert_eq!(prefs.max_notification_frequency, 5);
        assert!(prefs.blocked_app_categories.is_empty());
        assert!(prefs.exemption_hours.is_empty());
        assert!(prefs.emergency_bypass);

        // Second access reads the same row
        let again = storage.get_preferences("alice").await.unwrap();
        assert_eq!(again.user_id, "alice");
    }

    #[tokio::test]
    async fn test_partial_update_keeps_other_fields() {
        let pool = init_memory_pool().await.unwrap();
        let storage = PreferencesStorage::new(pool);

        let updated = storage
            .update_preferences(
                "alice",
                &UpdatePreferencesRequest {
                    allow_app_blocking: Some(true),
                    blocked_app_categories: Some(vec![" Reddit ".to_string()]),
                    exemption_hours: Some(vec![ExemptionWindow::new("22:00", "07:00").unwrap()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(updated.allow_app_blocking);
        assert!(updated.allow_screensaver_changes);
        assert_eq!(updated.blocked_app_categories, vec!["reddit"]);

        let stored = storage.get_preferences("alice").await.unwrap();
        assert_eq!(stored.exemption_hours.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_values() {
        let pool = init_memory_pool().await.unwrap();
        let storage = PreferencesStorage::new(pool);

        let bad_frequency = storage
            .update_preferences(
                "alice",
                &UpdatePreferencesRequest {
                    max_notification_frequency: Some(0),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad_frequency, Err(StorageError::InvalidInput(_))));

        let bad_window = storage
            .update_preferences(
                "alice",
                &UpdatePreferencesRequest {
                    exemption_hours: Some(vec![ExemptionWindow {
                        start: "25:00".to_string(),
                        end: "07:00".to_string(),
                    }]),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(bad_window, Err(StorageError::InvalidInput(_))));
    }

    #[test]
    fn test_exemption_window_same_day_and_overnight() {
        let work = ExemptionWindow::new("09:00", "17:00").unwrap();
        assert!(work.contains(at(9, 0)));
        assert!(work.contains(at(16, 59)));
        assert!(!work.contains(at(17, 0)));

        let night = ExemptionWindow::new("22:00", "07:00").unwrap();
        assert!(night.contains(at(23, 30)));
        assert!(night.contains(at(6, 15)));
        assert!(!night.contains(at(12, 0)));
    }
}
