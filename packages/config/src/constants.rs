// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Rekindle

// Storage
pub const REKINDLE_DATABASE_URL: &str = "REKINDLE_DATABASE_URL";

// Language model providers
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_MODEL: &str = "ANTHROPIC_MODEL";
pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const OPENAI_MODEL: &str = "OPENAI_MODEL";
pub const REKINDLE_AI_TIMEOUT_SECS: &str = "REKINDLE_AI_TIMEOUT_SECS";

// SOS flow
pub const REKINDLE_SOS_DAILY_LIMIT: &str = "REKINDLE_SOS_DAILY_LIMIT";
pub const REKINDLE_SOS_LONG_PERSPECTIVE_CHARS: &str = "REKINDLE_SOS_LONG_PERSPECTIVE_CHARS";
pub const REKINDLE_EMERGENCY_TRIGGERS: &str = "REKINDLE_EMERGENCY_TRIGGERS";

// Consequences
pub const REKINDLE_SPAM_NOTIFICATION_CAP: &str = "REKINDLE_SPAM_NOTIFICATION_CAP";
pub const REKINDLE_DEFAULT_NOTIFICATION_FREQUENCY_MINUTES: &str =
    "REKINDLE_DEFAULT_NOTIFICATION_FREQUENCY_MINUTES";

// Runtime plumbing
pub const REKINDLE_EVENT_CHANNEL_SIZE: &str = "REKINDLE_EVENT_CHANNEL_SIZE";
pub const REKINDLE_DELIVERY_INTERVAL_SECS: &str = "REKINDLE_DELIVERY_INTERVAL_SECS";
