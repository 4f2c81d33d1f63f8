use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::{DomainError, ValidationError};

/// Phase of the sync state machine. `Failed` is reachable from any active
/// phase and returns to `Idle` once the next cycle starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Uploading,
    Downloading,
    Reconciling,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Uploading => "uploading",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Outcome bookkeeping for one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub uploaded: i64,
    pub downloaded: i64,
    pub conflicts: i64,
    pub failed_uploads: i64,
    pub failed_downloads: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            uploaded: 0,
            downloaded: 0,
            conflicts: 0,
            failed_uploads: 0,
            failed_downloads: 0,
            started_at,
            completed_at: None,
        }
    }

    /// True when the cycle moved no data and hit no failures.
    pub fn is_noop(&self) -> bool {
        self.uploaded == 0
            && self.downloaded == 0
            && self.conflicts == 0
            && self.failed_uploads == 0
            && self.failed_downloads == 0
    }
}

/// Result of a `sync_now` call.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncStats),
    /// A cycle was active; the request was coalesced into a follow-up run.
    AlreadyRunning,
}

/// Events emitted over the coordinator's broadcast channel. Callers receive
/// these instead of subscribing to ambient callbacks.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started {
        cycle_id: String,
    },
    Progress {
        phase: SyncPhase,
        done: usize,
        total: usize,
    },
    Conflict {
        entity_type: String,
        sync_id: Uuid,
    },
    /// An outbox entry exhausted its retries or was permanently rejected and
    /// needs external attention.
    EntryFailed {
        entity_type: String,
        sync_id: Uuid,
        attempts: i64,
        message: String,
    },
    Completed {
        stats: SyncStats,
    },
    Failed {
        message: String,
    },
}

/// One entity delta in the remote feed, and the body shape for uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub sync_id: Uuid,
    /// None for tombstones.
    pub payload: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// Server acknowledgment of an uploaded mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAck {
    pub sync_id: Uuid,
    /// The record's clock as stored server-side after the operation.
    pub updated_at: DateTime<Utc>,
}

/// Per-entity-type download watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCursor {
    pub entity_type: String,
    pub last_pulled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncCursorRow {
    pub entity_type: String,
    pub last_pulled_at: String,
    pub updated_at: String,
}

impl TryFrom<SyncCursorRow> for SyncCursor {
    type Error = DomainError;
    fn try_from(row: SyncCursorRow) -> Result<Self, Self::Error> {
        Ok(Self {
            entity_type: row.entity_type,
            last_pulled_at: crate::domains::parse_datetime(
                &row.last_pulled_at,
                "sync_cursors.last_pulled_at",
            )?,
            updated_at: crate::domains::parse_datetime(
                &row.updated_at,
                "sync_cursors.updated_at",
            )?,
        })
    }
}

/// Terminal status of a recorded sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncCycleStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl SyncCycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncCycleStatus::Running => "running",
            SyncCycleStatus::Completed => "completed",
            SyncCycleStatus::Failed => "failed",
            SyncCycleStatus::Interrupted => "interrupted",
        }
    }
}

impl FromStr for SyncCycleStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncCycleStatus::Running),
            "completed" => Ok(SyncCycleStatus::Completed),
            "failed" => Ok(SyncCycleStatus::Failed),
            "interrupted" => Ok(SyncCycleStatus::Interrupted),
            _ => Err(DomainError::Validation(ValidationError::custom(format!(
                "Invalid SyncCycleStatus string: {}",
                s
            )))),
        }
    }
}

/// Durable record of one sync cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCycle {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncCycleStatus,
    pub uploaded: i64,
    pub downloaded: i64,
    pub conflicts: i64,
    pub failed_uploads: i64,
    pub failed_downloads: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncCycleRow {
    pub cycle_id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: String,
    pub uploaded: i64,
    pub downloaded: i64,
    pub conflicts: i64,
    pub failed_uploads: i64,
    pub failed_downloads: i64,
    pub error_message: Option<String>,
}

impl TryFrom<SyncCycleRow> for SyncCycle {
    type Error = DomainError;
    fn try_from(row: SyncCycleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            cycle_id: row.cycle_id,
            started_at: crate::domains::parse_datetime(&row.started_at, "sync_cycles.started_at")?,
            completed_at: crate::domains::parse_optional_datetime(
                row.completed_at,
                "sync_cycles.completed_at",
            )?,
            status: row.status.parse()?,
            uploaded: row.uploaded,
            downloaded: row.downloaded,
            conflicts: row.conflicts,
            failed_uploads: row.failed_uploads,
            failed_downloads: row.failed_downloads,
            error_message: row.error_message,
        })
    }
}

/// Coordinator configuration. Passed explicitly to constructors; there is no
/// global registry.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote API, e.g. `https://api.example.org`.
    pub base_url: String,
    /// Bearer token for the remote API.
    pub api_token: Option<String>,
    /// Entity types to download. Empty means every type present in the local
    /// store.
    pub entity_types: Vec<String>,
    /// Timeout applied to each network call, not to the cycle.
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    /// Retry cap per outbox entry; past it the entry is a permanent failure.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Upload/download parallelism across entity types. Entries within one
    /// type always run in order.
    pub max_concurrent_types: usize,
    /// Maximum outbox entries drained per cycle.
    pub batch_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: None,
            entity_types: Vec::new(),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(5 * 60),
            max_concurrent_types: 3,
            batch_limit: 500,
        }
    }
}

impl SyncConfig {
    /// Exponential backoff with jitter for the given attempt count:
    /// `base * 2^attempt`, capped, then scaled by a random factor in
    /// [0.5, 1.5).
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exp = attempt_count.min(16);
        let raw = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_cap);

        let jitter = rand::rng().random_range(0.5..1.5);
        raw.mul_f64(jitter)
    }
}
