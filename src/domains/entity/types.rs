use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::errors::DomainError;

/// Sync bookkeeping embedded in every stored record. The application's
/// payload stays opaque JSON; nothing inherits from anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    /// Globally unique identity, assigned at creation and immutable. The join
    /// key for reconciliation against the server.
    pub sync_id: Uuid,
    /// Logical clock for last-write-wins comparisons. Strictly increases on
    /// every mutation of a given sync_id.
    pub updated_at: DateTime<Utc>,
    /// Tombstone flag. Tombstoned records are excluded from normal reads but
    /// retained until the remote deletion is confirmed.
    pub is_deleted: bool,
    /// True until the record has been acknowledged by the server at least once.
    pub is_local: bool,
    /// True while a local mutation has not completed a round-trip.
    pub is_dirty: bool,
    /// Last successful round-trip; None means never synced.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A syncable domain record: device-scoped rowid, collection name, opaque
/// payload, and sync metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub local_id: i64,
    pub entity_type: String,
    pub payload: serde_json::Value,
    pub meta: SyncMeta,
}

/// Input for a local create-or-update. `sync_id = None` assigns a fresh UUID
/// (a create); passing an existing id updates that record.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub entity_type: String,
    pub sync_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct EntityRow {
    pub local_id: i64,
    pub entity_type: String,
    pub sync_id: String,
    pub payload: String,
    pub updated_at: String,
    pub is_deleted: i64,
    pub is_local: i64,
    pub is_dirty: i64,
    pub last_synced_at: Option<String>,
}

impl TryFrom<EntityRow> for EntityRecord {
    type Error = DomainError;
    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| {
            DomainError::Internal(format!(
                "Stored payload for {} {} is not valid JSON: {}",
                row.entity_type, row.sync_id, e
            ))
        })?;

        Ok(Self {
            local_id: row.local_id,
            entity_type: row.entity_type.clone(),
            payload,
            meta: SyncMeta {
                sync_id: crate::domains::parse_uuid(&row.sync_id, "entities.sync_id")?,
                updated_at: crate::domains::parse_datetime(&row.updated_at, "entities.updated_at")?,
                is_deleted: row.is_deleted != 0,
                is_local: row.is_local != 0,
                is_dirty: row.is_dirty != 0,
                last_synced_at: crate::domains::parse_optional_datetime(
                    row.last_synced_at,
                    "entities.last_synced_at",
                )?,
            },
        })
    }
}

/// Next value for a record's logical clock. Wall clock, nudged forward when
/// the previous value is not in the past, so `updated_at` strictly increases
/// even for sub-millisecond successive writes.
pub(crate) fn next_updated_at(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}
