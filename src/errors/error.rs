use std::fmt;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Database is locked")]
    Locked,

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Locked => DbError::Locked,
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, Uuid),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Cannot perform operation on deleted entity: {0} with ID {1}")]
    DeletedEntity(String, Uuid),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Service-level errors (application specific)
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Sync already running")]
    SyncAlreadyRunning,

    #[error("Offline: {0}")]
    Offline(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("External service error: {0}")]
    ExternalService(String),
}

/// Sync-specific errors.
///
/// The variants encode how the coordinator reacts: transient errors are retried
/// with backoff and never surfaced to the caller, conflicts are routed to the
/// resolver, permanent rejections stop auto-retry for the affected entry, and
/// corruption aborts the cycle without advancing the cursor.
#[derive(Debug, Error, Clone)]
pub enum SyncError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Remote conflict for {entity_type} {sync_id}")]
    RemoteConflict {
        entity_type: String,
        sync_id: Uuid,
        remote_updated_at: DateTime<Utc>,
        remote_payload: Option<serde_json::Value>,
        remote_deleted: bool,
    },

    #[error("Permanent rejection: {0}")]
    PermanentRejection(String),

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Local database error: {0}")]
    LocalDatabase(#[from] DbError),

    #[error("Invalid remote payload: {0}")]
    InvalidRemotePayload(String),

    #[error("Sync interrupted")]
    Interrupted,

    #[error("Sync error: {0}")]
    Other(String),
}

impl SyncError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }
}

/// Validation errors
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format { field: String, reason: String },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Entity is invalid: {0}")]
    Entity(String),

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn entity(message: &str) -> Self {
        Self::Entity(message.to_string())
    }

    pub fn custom<M: fmt::Display>(message: M) -> Self {
        Self::Custom(message.to_string())
    }
}
