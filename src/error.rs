//! Error types for huddle.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Concurrent update lost: {entity} {key}")]
    Conflict { entity: String, key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this error is a store-level uniqueness violation.
    pub fn is_constraint(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Intent classifier errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier request failed: {0}")]
    RequestFailed(String),

    #[error("Classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid classifier response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send to {recipient} failed: {reason}")]
    SendFailed { recipient: String, reason: String },

    #[error("Send to {recipient} timed out after {timeout:?}")]
    Timeout {
        recipient: String,
        timeout: Duration,
    },

    #[error("Delivery suppressed for {recipient}: {reason}")]
    Suppressed { recipient: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Workflow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Recoverable, user-facing. The workflow stays at the same step.
    #[error("{0}")]
    Recoverable(String),

    #[error("No workflow active for continuation")]
    NoActiveWorkflow,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid slot value for {slot}: {message}")]
    InvalidSlot { slot: String, message: String },
}

/// Deferred job scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Job {id} references missing poll {poll_id}")]
    MissingPoll { id: String, poll_id: String },

    #[error("Invalid cadence expression: {0}")]
    InvalidCadence(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
