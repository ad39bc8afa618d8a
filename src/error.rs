//! Error types for Inbox Assist.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Learning error: {0}")]
    Learning(#[from] LearningError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures of the external triage / drafting oracles.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OracleError {
    #[error("Triage classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Draft generation failed: {0}")]
    DraftGenerationFailed(String),

    #[error("Oracle {oracle} timed out after {timeout:?}")]
    Timeout { oracle: String, timeout: Duration },
}

/// Workflow state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Checkpoint for message {message_id} already resolved as {status}")]
    CheckpointConflict { message_id: String, status: String },

    #[error("Message {0} not found")]
    MessageNotFound(String),

    #[error("No checkpoint for message {0}")]
    CheckpointNotFound(String),

    #[error("Message {message_id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        message_id: String,
        state: String,
        target: String,
    },

    #[error("Invalid decision: {0}")]
    InvalidDecision(String),
}

/// Preference-learning errors. Never surfaced to the delivery path.
#[derive(Debug, thiserror::Error)]
pub enum LearningError {
    #[error("Merge of feedback event {seq} failed: {reason}")]
    MergeFailure { seq: i64, reason: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Reply transport errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Failed to send reply for message {message_id}: {reason}")]
    SendFailed { message_id: String, reason: String },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
