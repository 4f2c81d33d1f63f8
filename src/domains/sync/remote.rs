use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use uuid::Uuid;

use crate::domains::sync::types::{RemoteAck, RemoteChange, SyncConfig};
use crate::errors::{SyncError, SyncResult};

/// Contract of the authoritative server. Consumed, not owned: the engine only
/// assumes these four operations and their idempotency guarantees.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Deltas for one entity type since the given watermark, ascending by
    /// `updated_at`. `None` requests the full feed.
    async fn fetch_changes_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteChange>>;

    /// Create a record. Idempotent on `sync_id`: replaying our own create is
    /// acknowledged, while a duplicate holding different state surfaces as
    /// `RemoteConflict` carrying the server's copy.
    async fn create_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck>;

    /// Update a record. The sent `updated_at` is the client's logical clock
    /// for the snapshot; a server holding newer state rejects the write as
    /// stale (`RemoteConflict`).
    async fn update_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck>;

    /// Tombstone a record server-side. Idempotent, and deletion dominates any
    /// concurrent update.
    async fn delete_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck>;
}

/// Implementation of RemoteService that talks to an API server.
pub struct HttpRemoteService {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemoteService {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(config.call_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SyncError::Other(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn collection_url(&self, entity_type: &str) -> String {
        format!("{}/entities/{}", self.base_url, entity_type)
    }

    fn record_url(&self, entity_type: &str, sync_id: Uuid) -> String {
        format!("{}/entities/{}/{}", self.base_url, entity_type, sync_id)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn transport_error(e: reqwest::Error) -> SyncError {
        SyncError::TransientNetwork(e.to_string())
    }

    /// Map a non-success status to the failure taxonomy. 409 responses carry
    /// the server's current copy and become `RemoteConflict`.
    async fn error_from_response(
        entity_type: &str,
        sync_id: Option<Uuid>,
        response: Response,
    ) -> SyncError {
        let status = response.status();

        if status == StatusCode::CONFLICT {
            if let (Some(sync_id), Ok(current)) =
                (sync_id, response.json::<RemoteChange>().await)
            {
                return SyncError::RemoteConflict {
                    entity_type: entity_type.to_string(),
                    sync_id,
                    remote_updated_at: current.updated_at,
                    remote_payload: current.payload,
                    remote_deleted: current.is_deleted,
                };
            }
            return SyncError::InvalidRemotePayload(
                "409 response without a readable current record".to_string(),
            );
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unable to read error body".to_string());

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            SyncError::TransientNetwork(format!("Server returned {}: {}", status, body))
        } else {
            SyncError::PermanentRejection(format!("Server returned {}: {}", status, body))
        }
    }
}

#[async_trait]
impl RemoteService for HttpRemoteService {
    async fn fetch_changes_since(
        &self,
        entity_type: &str,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteChange>> {
        debug!("Fetching {} changes since {:?}", entity_type, since);

        let mut request = self.client.get(self.collection_url(entity_type));
        if let Some(since) = since {
            request = request.query(&[("since", since.to_rfc3339())]);
        }

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(entity_type, None, response).await);
        }

        response
            .json::<Vec<RemoteChange>>()
            .await
            .map_err(|e| SyncError::InvalidRemotePayload(format!(
                "Failed to parse {} delta feed: {}",
                entity_type, e
            )))
    }

    async fn create_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck> {
        debug!("Creating {} {}", entity_type, sync_id);

        let body = RemoteChange {
            sync_id,
            payload: Some(payload.clone()),
            updated_at,
            is_deleted: false,
        };

        let response = self
            .authorize(self.client.post(self.collection_url(entity_type)).json(&body))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(entity_type, Some(sync_id), response).await);
        }

        // A duplicate create returns the existing record rather than an
        // error; if its clock differs from ours the stored state is not what
        // we sent and the caller has a conflict to resolve.
        let stored = response
            .json::<RemoteChange>()
            .await
            .map_err(|e| SyncError::InvalidRemotePayload(format!(
                "Failed to parse create response for {} {}: {}",
                entity_type, sync_id, e
            )))?;

        if stored.updated_at != updated_at {
            return Err(SyncError::RemoteConflict {
                entity_type: entity_type.to_string(),
                sync_id,
                remote_updated_at: stored.updated_at,
                remote_payload: stored.payload,
                remote_deleted: stored.is_deleted,
            });
        }

        Ok(RemoteAck {
            sync_id,
            updated_at: stored.updated_at,
        })
    }

    async fn update_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        payload: &serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck> {
        debug!("Updating {} {}", entity_type, sync_id);

        let body = RemoteChange {
            sync_id,
            payload: Some(payload.clone()),
            updated_at,
            is_deleted: false,
        };

        let response = self
            .authorize(self.client.put(self.record_url(entity_type, sync_id)).json(&body))
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(entity_type, Some(sync_id), response).await);
        }

        response
            .json::<RemoteAck>()
            .await
            .map_err(|e| SyncError::InvalidRemotePayload(format!(
                "Failed to parse update response for {} {}: {}",
                entity_type, sync_id, e
            )))
    }

    async fn delete_entity(
        &self,
        entity_type: &str,
        sync_id: Uuid,
        updated_at: DateTime<Utc>,
    ) -> SyncResult<RemoteAck> {
        debug!("Deleting {} {}", entity_type, sync_id);

        let response = self
            .authorize(
                self.client
                    .delete(self.record_url(entity_type, sync_id))
                    .query(&[("updated_at", updated_at.to_rfc3339())]),
            )
            .send()
            .await
            .map_err(Self::transport_error)?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(entity_type, Some(sync_id), response).await);
        }

        // Delete responses have no required body.
        Ok(RemoteAck {
            sync_id,
            updated_at,
        })
    }
}

/// In-memory stand-in for the authoritative server, mirroring its
/// last-write-wins and delete-dominance rules.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockRemoteService {
        records: Mutex<HashMap<(String, Uuid), RemoteChange>>,
        fail_uploads: Mutex<HashMap<Uuid, SyncError>>,
        fail_fetches: Mutex<HashMap<String, SyncError>>,
        call_delay: Mutex<Option<std::time::Duration>>,
        pub fetch_calls: AtomicUsize,
        pub upload_calls: AtomicUsize,
    }

    impl MockRemoteService {
        pub fn new() -> Self {
            Self::default()
        }

        /// Delay every call, to hold a cycle open while a test probes it.
        pub async fn set_call_delay(&self, delay: std::time::Duration) {
            *self.call_delay.lock().await = Some(delay);
        }

        async fn apply_delay(&self) {
            let delay = *self.call_delay.lock().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        /// Script every delta fetch of `entity_type` to fail with `error`.
        pub async fn fail_fetches_of(&self, entity_type: &str, error: SyncError) {
            self.fail_fetches
                .lock()
                .await
                .insert(entity_type.to_string(), error);
        }

        /// Seed server-side state directly.
        pub async fn seed(&self, entity_type: &str, change: RemoteChange) {
            self.records
                .lock()
                .await
                .insert((entity_type.to_string(), change.sync_id), change);
        }

        /// Script every upload of `sync_id` to fail with `error`.
        pub async fn fail_uploads_of(&self, sync_id: Uuid, error: SyncError) {
            self.fail_uploads.lock().await.insert(sync_id, error);
        }

        pub async fn clear_failures(&self) {
            self.fail_uploads.lock().await.clear();
            self.fail_fetches.lock().await.clear();
        }

        pub async fn record(&self, entity_type: &str, sync_id: Uuid) -> Option<RemoteChange> {
            self.records
                .lock()
                .await
                .get(&(entity_type.to_string(), sync_id))
                .cloned()
        }

        pub async fn record_count(&self) -> usize {
            self.records.lock().await.len()
        }

        pub fn upload_call_count(&self) -> usize {
            self.upload_calls.load(Ordering::SeqCst)
        }

        async fn scripted_failure(&self, sync_id: Uuid) -> Option<SyncError> {
            self.fail_uploads.lock().await.get(&sync_id).cloned()
        }

        fn conflict(entity_type: &str, current: &RemoteChange) -> SyncError {
            SyncError::RemoteConflict {
                entity_type: entity_type.to_string(),
                sync_id: current.sync_id,
                remote_updated_at: current.updated_at,
                remote_payload: current.payload.clone(),
                remote_deleted: current.is_deleted,
            }
        }
    }

    #[async_trait]
    impl RemoteService for MockRemoteService {
        async fn fetch_changes_since(
            &self,
            entity_type: &str,
            since: Option<DateTime<Utc>>,
        ) -> SyncResult<Vec<RemoteChange>> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_delay().await;
            if let Some(err) = self.fail_fetches.lock().await.get(entity_type) {
                return Err(err.clone());
            }

            let records = self.records.lock().await;
            let mut changes: Vec<RemoteChange> = records
                .iter()
                .filter(|((t, _), change)| {
                    t == entity_type && since.map_or(true, |s| change.updated_at > s)
                })
                .map(|(_, change)| change.clone())
                .collect();
            changes.sort_by_key(|c| c.updated_at);
            Ok(changes)
        }

        async fn create_entity(
            &self,
            entity_type: &str,
            sync_id: Uuid,
            payload: &serde_json::Value,
            updated_at: DateTime<Utc>,
        ) -> SyncResult<RemoteAck> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_delay().await;
            if let Some(err) = self.scripted_failure(sync_id).await {
                return Err(err);
            }

            let mut records = self.records.lock().await;
            let key = (entity_type.to_string(), sync_id);

            if let Some(current) = records.get(&key) {
                if current.is_deleted || current.updated_at > updated_at {
                    return Err(Self::conflict(entity_type, current));
                }
                if current.updated_at == updated_at {
                    return Ok(RemoteAck { sync_id, updated_at });
                }
            }

            records.insert(
                key,
                RemoteChange {
                    sync_id,
                    payload: Some(payload.clone()),
                    updated_at,
                    is_deleted: false,
                },
            );
            Ok(RemoteAck { sync_id, updated_at })
        }

        async fn update_entity(
            &self,
            entity_type: &str,
            sync_id: Uuid,
            payload: &serde_json::Value,
            updated_at: DateTime<Utc>,
        ) -> SyncResult<RemoteAck> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_delay().await;
            if let Some(err) = self.scripted_failure(sync_id).await {
                return Err(err);
            }

            let mut records = self.records.lock().await;
            let key = (entity_type.to_string(), sync_id);

            if let Some(current) = records.get(&key) {
                if current.is_deleted || current.updated_at > updated_at {
                    return Err(Self::conflict(entity_type, current));
                }
            }

            records.insert(
                key,
                RemoteChange {
                    sync_id,
                    payload: Some(payload.clone()),
                    updated_at,
                    is_deleted: false,
                },
            );
            Ok(RemoteAck { sync_id, updated_at })
        }

        async fn delete_entity(
            &self,
            entity_type: &str,
            sync_id: Uuid,
            updated_at: DateTime<Utc>,
        ) -> SyncResult<RemoteAck> {
            self.upload_calls.fetch_add(1, Ordering::SeqCst);
            self.apply_delay().await;
            if let Some(err) = self.scripted_failure(sync_id).await {
                return Err(err);
            }

            let mut records = self.records.lock().await;
            let key = (entity_type.to_string(), sync_id);

            // Deletion always lands, regardless of what the server holds.
            let stamp = match records.get(&key) {
                Some(current) if current.updated_at > updated_at => current.updated_at,
                _ => updated_at,
            };
            records.insert(
                key,
                RemoteChange {
                    sync_id,
                    payload: None,
                    updated_at: stamp,
                    is_deleted: true,
                },
            );
            Ok(RemoteAck {
                sync_id,
                updated_at: stamp,
            })
        }
    }
}
