// ABOUTME: Consequence engine for Rekindle
// ABOUTME: Preference-filtered rule selection, consent, activation and scheduled reminders

pub mod engine;
pub mod error;
pub mod policy;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use engine::ConsequenceEngine;
pub use error::{ConsequenceError, ConsequenceResult};
pub use scheduler::{JobScheduler, JobStatus, NotificationJob, SqliteJobScheduler};
pub use storage::ConsequenceStorage;
pub use types::{
    ActiveConsequence, ConsequenceMetadata, ConsequenceRule, ConsequenceStatus, ConsequenceType,
    ScreensaverCategory, Severity, TriggerCause,
};
