// ABOUTME: Error types for the consequence engine
// ABOUTME: Lifecycle violations plus wrapped persistence failures

use rekindle_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsequenceError {
    #[error("Consequence not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ConsequenceResult<T> = Result<T, ConsequenceError>;
