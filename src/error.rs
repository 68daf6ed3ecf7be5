//! Error types for the task hub.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Object storage errors (chunk staging).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object {key} I/O failed: {reason}")]
    Io { key: String, reason: String },
}

/// Task lifecycle errors. These are the ones surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {state}, cannot {action}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        action: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task {id} is missing chunk {missing}")]
    IncompleteChunks { id: Uuid, missing: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl TaskError {
    /// Stable machine-readable code for structured error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::NotFound { .. } => "TASK_NOT_FOUND",
            TaskError::InvalidTransition { .. } => "INVALID_TRANSITION",
            TaskError::Validation(_) => "VALIDATION_ERROR",
            TaskError::IncompleteChunks { .. } => "INCOMPLETE_CHUNKS",
            TaskError::Storage(_) => "STORAGE_ERROR",
            TaskError::Database(_) => "DATABASE_ERROR",
        }
    }
}

/// Errors raised by completion side-effect handlers.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Invalid payload for {function}: {reason}")]
    InvalidPayload { function: String, reason: String },

    #[error("Resource {id} not found")]
    ResourceNotFound { id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Quota collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("Quota request failed: {0}")]
    Request(String),

    #[error("Invalid quota response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for the task hub.
pub type Result<T> = std::result::Result<T, Error>;
