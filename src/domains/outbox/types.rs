use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::{DomainError, ValidationError};

/// The kind of mutation a queued entry will replay against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Create => "create",
            OutboxOperation::Update => "update",
            OutboxOperation::Delete => "delete",
        }
    }
}

impl FromStr for OutboxOperation {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OutboxOperation::Create),
            "update" => Ok(OutboxOperation::Update),
            "delete" => Ok(OutboxOperation::Delete),
            _ => Err(DomainError::Validation(ValidationError::custom(format!(
                "Invalid OutboxOperation string: {}",
                s
            )))),
        }
    }
}

impl From<OutboxOperation> for String {
    fn from(op: OutboxOperation) -> Self {
        op.as_str().to_string()
    }
}

/// Queue status of an outbox entry. Acknowledged entries are deleted rather
/// than kept in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "in_flight" => Ok(OutboxStatus::InFlight),
            "failed" => Ok(OutboxStatus::Failed),
            _ => Err(DomainError::Validation(ValidationError::custom(format!(
                "Invalid OutboxStatus string: {}",
                s
            )))),
        }
    }
}

impl From<OutboxStatus> for String {
    fn from(status: OutboxStatus) -> Self {
        status.as_str().to_string()
    }
}

/// A durable record of one pending mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub entry_id: i64,
    pub entity_type: String,
    pub sync_id: Uuid,
    pub operation: OutboxOperation,
    /// Serialized entity snapshot at enqueue time; None for deletes.
    pub payload: Option<serde_json::Value>,
    /// The mutation's logical clock, captured at enqueue time and sent to the
    /// server for its last-write-wins staleness check.
    pub snapshot_updated_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: i64,
    pub status: OutboxStatus,
    pub last_error: Option<String>,
    /// Earliest wall-clock time the entry is eligible for retry. None while
    /// pending, or once the attempt cap is reached (permanent failure).
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// A failed entry that exhausted its retry budget and needs external
    /// intervention.
    pub fn is_permanently_failed(&self, max_attempts: u32) -> bool {
        self.status == OutboxStatus::Failed && self.attempt_count >= i64::from(max_attempts)
    }
}

/// Input for enqueueing a mutation. Written in the same transaction as the
/// entity mutation it describes.
#[derive(Debug, Clone)]
pub struct NewOutboxEntry {
    pub entity_type: String,
    pub sync_id: Uuid,
    pub operation: OutboxOperation,
    pub payload: Option<serde_json::Value>,
    pub snapshot_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxEntryRow {
    pub entry_id: i64,
    pub entity_type: String,
    pub sync_id: String,
    pub operation: String,
    pub payload: Option<String>,
    pub snapshot_updated_at: String,
    pub enqueued_at: String,
    pub attempt_count: i64,
    pub status: String,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<String>,
}

impl TryFrom<OutboxEntryRow> for OutboxEntry {
    type Error = DomainError;
    fn try_from(row: OutboxEntryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            entry_id: row.entry_id,
            entity_type: row.entity_type,
            sync_id: crate::domains::parse_uuid(&row.sync_id, "outbox.sync_id")?,
            operation: row.operation.parse()?,
            payload: row
                .payload
                .map(|p| {
                    serde_json::from_str(&p).map_err(|e| {
                        DomainError::Validation(ValidationError::format(
                            "outbox.payload",
                            &format!("Invalid JSON: {}", e),
                        ))
                    })
                })
                .transpose()?,
            snapshot_updated_at: crate::domains::parse_datetime(
                &row.snapshot_updated_at,
                "outbox.snapshot_updated_at",
            )?,
            enqueued_at: crate::domains::parse_datetime(&row.enqueued_at, "outbox.enqueued_at")?,
            attempt_count: row.attempt_count,
            status: row.status.parse()?,
            last_error: row.last_error,
            next_attempt_at: crate::domains::parse_optional_datetime(
                row.next_attempt_at,
                "outbox.next_attempt_at",
            )?,
        })
    }
}
