// ABOUTME: Persistence layer for Rekindle
// ABOUTME: SQLite pool setup, migrations and storage for shared tables

pub mod challenges;
pub mod conversations;
pub mod couples;
pub mod db;
pub mod error;
pub mod notifications;
pub mod preferences;

pub use challenges::{Challenge, ChallengeAttempt, ChallengeSource, ChallengeStorage};
pub use conversations::{ConversationEntry, ConversationStorage, NewConversationEntry};
pub use couples::{Couple, CoupleStorage};
pub use db::{init_memory_pool, init_pool};
pub use error::{StorageError, StorageResult};
pub use notifications::{NewNotification, Notification, NotificationPriority, NotificationStorage};
pub use preferences::{
    ConsequencePreferences, ExemptionWindow, PreferencesStorage, UpdatePreferencesRequest,
};
