// ABOUTME: Error types for the SOS fight solver
// ABOUTME: Maps flow, authorization and persistence failures onto one enum

use rekindle_ai::AIServiceError;
use rekindle_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SosError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Input already submitted for session {0}")]
    DuplicateSubmission(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Rate limited: {reason}")]
    RateLimited { reason: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Analysis generation failed: {0}")]
    Generation(#[from] AIServiceError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SosResult<T> = Result<T, SosError>;
