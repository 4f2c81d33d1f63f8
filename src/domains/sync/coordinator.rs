use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use uuid::Uuid;

use crate::domains::entity::repository::EntityStore;
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{OutboxEntry, OutboxOperation};
use crate::domains::sync::connectivity::ConnectivityMonitor;
use crate::domains::sync::remote::RemoteService;
use crate::domains::sync::repository::{SyncCursorRepository, SyncCycleRepository};
use crate::domains::sync::resolver::{ConflictResolver, Resolution};
use crate::domains::sync::types::{
    RemoteAck, RemoteChange, SyncConfig, SyncCycle, SyncCycleStatus, SyncEvent, SyncOutcome,
    SyncPhase, SyncStats,
};
use crate::errors::{DbError, DomainError, ServiceError, ServiceResult, SyncError, SyncResult};

const EVENT_CHANNEL_CAPACITY: usize = 64;

fn to_sync_err(e: DomainError) -> SyncError {
    match e {
        DomainError::Database(db) => SyncError::LocalDatabase(db),
        DomainError::Sync(s) => s,
        other => SyncError::Other(other.to_string()),
    }
}

fn db_err(e: sqlx::Error) -> SyncError {
    SyncError::LocalDatabase(DbError::from(e))
}

#[derive(Debug, Default)]
struct GroupOutcome {
    uploaded: i64,
    conflicts: i64,
    failed: i64,
}

enum UploadConflictOutcome {
    /// The local side won and was replayed successfully.
    Uploaded,
    /// The remote side won; local state and queue were reconciled to it.
    RemoteAccepted,
    /// The retry failed; the group stops here and the entry waits for the
    /// next cycle.
    Halted,
}

/// Orchestrates the sync state machine:
/// `Idle -> Uploading -> Downloading -> Reconciling -> Idle`, with `Failed`
/// reachable from any active phase.
///
/// One coordinator runs per process and at most one cycle at a time. Triggers
/// arriving while a cycle is active are coalesced into a follow-up run. A full
/// cycle is idempotent: re-running after a partial failure re-sends only
/// still-pending outbox entries and re-pulls from the last committed cursor.
pub struct SyncCoordinator {
    pool: SqlitePool,
    store: Arc<dyn EntityStore>,
    outbox: Arc<dyn OutboxRepository>,
    cursors: Arc<dyn SyncCursorRepository>,
    cycles: Arc<dyn SyncCycleRepository>,
    remote: Arc<dyn RemoteService>,
    resolver: Arc<dyn ConflictResolver>,
    connectivity: Arc<dyn ConnectivityMonitor>,
    config: SyncConfig,

    cycle_lock: Mutex<()>,
    rerun_requested: AtomicBool,
    consecutive_failures: AtomicU32,
    phase: watch::Sender<SyncPhase>,
    cancel: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<SyncEvent>,
    type_sem: Semaphore,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn EntityStore>,
        outbox: Arc<dyn OutboxRepository>,
        cursors: Arc<dyn SyncCursorRepository>,
        cycles: Arc<dyn SyncCycleRepository>,
        remote: Arc<dyn RemoteService>,
        resolver: Arc<dyn ConflictResolver>,
        connectivity: Arc<dyn ConnectivityMonitor>,
        config: SyncConfig,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        let (cancel, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let permits = config.max_concurrent_types.max(1);

        Self {
            pool,
            store,
            outbox,
            cursors,
            cycles,
            remote,
            resolver,
            connectivity,
            config,
            cycle_lock: Mutex::new(()),
            rerun_requested: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            phase,
            cancel,
            shutdown,
            events,
            type_sem: Semaphore::new(permits),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Backoff to apply before the next automatic cycle after failures.
    pub fn next_retry_delay(&self) -> Duration {
        self.config.backoff_delay(self.consecutive_failures())
    }

    /// Cancel the running cycle, if any. In-flight uploads stay `InFlight`
    /// and are retried next cycle; server writes are idempotent.
    pub fn cancel_cycle(&self) {
        self.cancel.send_replace(true);
    }

    /// Permanently stop the coordinator (app shutdown). Cancels the running
    /// cycle and releases the auto-sync task.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.cancel.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Run a sync cycle now, bypassing the automatic trigger but respecting
    /// the single-flight guard: if a cycle is already active the request is
    /// coalesced into one follow-up run after it finishes.
    pub async fn sync_now(&self) -> ServiceResult<SyncOutcome> {
        if !self.connectivity.is_online() {
            return Err(ServiceError::Offline(
                "sync requested while offline".to_string(),
            ));
        }

        let Ok(_guard) = self.cycle_lock.try_lock() else {
            self.rerun_requested.store(true, Ordering::SeqCst);
            debug!("Sync already running; coalescing trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        };

        let mut last_stats = SyncStats::new(Utc::now());
        loop {
            match self.run_cycle().await {
                Ok(stats) => {
                    self.consecutive_failures.store(0, Ordering::SeqCst);
                    last_stats = stats;
                }
                Err(e) => {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                    return Err(ServiceError::Domain(DomainError::Sync(e)));
                }
            }

            if !self.rerun_requested.swap(false, Ordering::SeqCst) {
                break;
            }
            debug!("Running follow-up cycle for coalesced trigger");
        }

        Ok(SyncOutcome::Completed(last_stats))
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if *self.cancel.borrow() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }

    async fn run_cycle(&self) -> SyncResult<SyncStats> {
        if *self.shutdown.borrow() {
            return Err(SyncError::Interrupted);
        }
        // A cancellation only applies to the cycle it was issued against.
        self.cancel.send_replace(false);

        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut stats = SyncStats::new(started_at);

        self.cycles
            .create_cycle(&SyncCycle {
                cycle_id: cycle_id.clone(),
                started_at,
                completed_at: None,
                status: SyncCycleStatus::Running,
                uploaded: 0,
                downloaded: 0,
                conflicts: 0,
                failed_uploads: 0,
                failed_downloads: 0,
                error_message: None,
            })
            .await
            .map_err(to_sync_err)?;

        info!("Sync cycle {} started", cycle_id);
        self.emit(SyncEvent::Started {
            cycle_id: cycle_id.clone(),
        });

        let result = self.run_phases(&mut stats).await;
        stats.completed_at = Some(Utc::now());

        match result {
            Ok(()) => {
                self.cycles
                    .finalize_cycle(&cycle_id, SyncCycleStatus::Completed, &stats, None)
                    .await
                    .map_err(to_sync_err)?;
                self.set_phase(SyncPhase::Idle);
                info!(
                    "Sync cycle {} completed: {} uploaded, {} downloaded, {} conflicts",
                    cycle_id, stats.uploaded, stats.downloaded, stats.conflicts
                );
                self.emit(SyncEvent::Completed {
                    stats: stats.clone(),
                });
                Ok(stats)
            }
            Err(SyncError::Interrupted) => {
                // In-flight entries stay in flight and are retried next cycle.
                if let Err(e) = self
                    .cycles
                    .finalize_cycle(
                        &cycle_id,
                        SyncCycleStatus::Interrupted,
                        &stats,
                        Some("sync interrupted"),
                    )
                    .await
                {
                    warn!("Failed to finalize interrupted cycle {}: {}", cycle_id, e);
                }
                self.set_phase(SyncPhase::Idle);
                warn!("Sync cycle {} interrupted", cycle_id);
                self.emit(SyncEvent::Failed {
                    message: "sync interrupted".to_string(),
                });
                Err(SyncError::Interrupted)
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(finalize_err) = self
                    .cycles
                    .finalize_cycle(&cycle_id, SyncCycleStatus::Failed, &stats, Some(&message))
                    .await
                {
                    warn!(
                        "Failed to finalize failed cycle {}: {}",
                        cycle_id, finalize_err
                    );
                }
                self.set_phase(SyncPhase::Failed);
                error!("Sync cycle {} failed: {}", cycle_id, message);
                self.emit(SyncEvent::Failed { message });
                Err(e)
            }
        }
    }

    async fn run_phases(&self, stats: &mut SyncStats) -> SyncResult<()> {
        self.check_cancelled()?;
        self.upload_phase(stats).await?;
        self.check_cancelled()?;
        let batches = self.download_phase(stats).await?;
        self.check_cancelled()?;
        self.reconcile_phase(batches, stats).await
    }

    // ---- Uploading ----------------------------------------------------

    async fn upload_phase(&self, stats: &mut SyncStats) -> SyncResult<()> {
        self.set_phase(SyncPhase::Uploading);

        let due = self
            .outbox
            .due(Utc::now(), self.config.max_attempts, self.config.batch_limit)
            .await
            .map_err(to_sync_err)?;

        if due.is_empty() {
            return Ok(());
        }

        let total = due.len();
        debug!("Uploading {} outbox entries", total);

        // Entries of one entity type replay strictly in queue order; types
        // are independent aggregates and may proceed concurrently.
        let mut groups: Vec<(String, Vec<OutboxEntry>)> = Vec::new();
        for entry in due {
            match groups.iter_mut().find(|(t, _)| *t == entry.entity_type) {
                Some((_, entries)) => entries.push(entry),
                None => groups.push((entry.entity_type.clone(), vec![entry])),
            }
        }

        let progress = Arc::new(AtomicUsize::new(0));
        let outcomes: Vec<SyncResult<GroupOutcome>> = stream::iter(
            groups
                .into_iter()
                .map(|(_, entries)| self.upload_group(entries, total, progress.clone())),
        )
        .buffer_unordered(self.config.max_concurrent_types.max(1))
        .collect()
        .await;

        for outcome in outcomes {
            let outcome = outcome?;
            stats.uploaded += outcome.uploaded;
            stats.conflicts += outcome.conflicts;
            stats.failed_uploads += outcome.failed;
        }

        Ok(())
    }

    async fn upload_group(
        &self,
        entries: Vec<OutboxEntry>,
        total: usize,
        progress: Arc<AtomicUsize>,
    ) -> SyncResult<GroupOutcome> {
        let _permit = self
            .type_sem
            .acquire()
            .await
            .map_err(|_| SyncError::Interrupted)?;

        let mut outcome = GroupOutcome::default();

        for entry in entries {
            self.check_cancelled()?;
            self.outbox
                .mark_in_flight(entry.entry_id)
                .await
                .map_err(to_sync_err)?;

            match self.send_entry(&entry).await {
                Ok(ack) => {
                    self.acknowledge_entry(&entry, &ack).await?;
                    outcome.uploaded += 1;
                    let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
                    self.emit(SyncEvent::Progress {
                        phase: SyncPhase::Uploading,
                        done,
                        total,
                    });
                }
                Err(SyncError::RemoteConflict {
                    remote_updated_at,
                    remote_payload,
                    remote_deleted,
                    ..
                }) => {
                    outcome.conflicts += 1;
                    self.emit(SyncEvent::Conflict {
                        entity_type: entry.entity_type.clone(),
                        sync_id: entry.sync_id,
                    });

                    let remote = RemoteChange {
                        sync_id: entry.sync_id,
                        payload: remote_payload,
                        updated_at: remote_updated_at,
                        is_deleted: remote_deleted,
                    };

                    match self.resolve_upload_conflict(&entry, remote).await? {
                        UploadConflictOutcome::Uploaded => {
                            outcome.uploaded += 1;
                            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
                            self.emit(SyncEvent::Progress {
                                phase: SyncPhase::Uploading,
                                done,
                                total,
                            });
                        }
                        UploadConflictOutcome::RemoteAccepted => {
                            let done = progress.fetch_add(1, Ordering::SeqCst) + 1;
                            self.emit(SyncEvent::Progress {
                                phase: SyncPhase::Uploading,
                                done,
                                total,
                            });
                        }
                        UploadConflictOutcome::Halted => {
                            outcome.failed += 1;
                            warn!(
                                "Halting {} uploads after conflict retry failure",
                                entry.entity_type
                            );
                            break;
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    outcome.failed += 1;
                    self.record_entry_failure(&entry, &e.to_string(), true).await?;
                    warn!(
                        "Transient failure uploading {} {}: {}; later {} entries wait for the next cycle",
                        entry.entity_type, entry.sync_id, e, entry.entity_type
                    );
                    break;
                }
                Err(SyncError::PermanentRejection(message)) => {
                    outcome.failed += 1;
                    self.record_entry_failure(&entry, &message, false).await?;
                    warn!(
                        "Permanent rejection uploading {} {}: {}",
                        entry.entity_type, entry.sync_id, message
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcome)
    }

    /// Replay one outbox entry against the server, bounded by the per-call
    /// timeout.
    async fn send_entry(&self, entry: &OutboxEntry) -> SyncResult<RemoteAck> {
        let call = async {
            match entry.operation {
                OutboxOperation::Create => {
                    let payload = entry.payload.as_ref().ok_or_else(|| {
                        SyncError::Other(format!(
                            "create entry {} has no payload snapshot",
                            entry.entry_id
                        ))
                    })?;
                    self.remote
                        .create_entity(
                            &entry.entity_type,
                            entry.sync_id,
                            payload,
                            entry.snapshot_updated_at,
                        )
                        .await
                }
                OutboxOperation::Update => {
                    let payload = entry.payload.as_ref().ok_or_else(|| {
                        SyncError::Other(format!(
                            "update entry {} has no payload snapshot",
                            entry.entry_id
                        ))
                    })?;
                    self.remote
                        .update_entity(
                            &entry.entity_type,
                            entry.sync_id,
                            payload,
                            entry.snapshot_updated_at,
                        )
                        .await
                }
                OutboxOperation::Delete => {
                    self.remote
                        .delete_entity(&entry.entity_type, entry.sync_id, entry.snapshot_updated_at)
                        .await
                }
            }
        };

        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::TransientNetwork(format!(
                "{} of {} {} timed out",
                entry.operation.as_str(),
                entry.entity_type,
                entry.sync_id
            ))),
        }
    }

    /// Settle an acknowledged entry: drop it from the queue and update the
    /// entity's round-trip state, in one transaction. An acknowledged Delete
    /// confirms the remote tombstone, so the local row is purged.
    async fn acknowledge_entry(&self, entry: &OutboxEntry, _ack: &RemoteAck) -> SyncResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        self.outbox
            .mark_done_with_tx(entry.entry_id, &mut tx)
            .await
            .map_err(to_sync_err)?;

        match entry.operation {
            OutboxOperation::Delete => {
                self.store
                    .purge_with_tx(&entry.entity_type, entry.sync_id, &mut tx)
                    .await
                    .map_err(to_sync_err)?;
            }
            _ => {
                self.store
                    .mark_synced_with_tx(&entry.entity_type, entry.sync_id, Utc::now(), &mut tx)
                    .await
                    .map_err(to_sync_err)?;
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn record_entry_failure(
        &self,
        entry: &OutboxEntry,
        message: &str,
        retryable: bool,
    ) -> SyncResult<()> {
        let attempts_after = entry.attempt_count + 1;
        let exhausted = attempts_after >= i64::from(self.config.max_attempts);

        let next_attempt_at = if retryable && !exhausted {
            let delay = self.config.backoff_delay(entry.attempt_count as u32);
            let delay = chrono::Duration::from_std(delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(3600));
            Some(Utc::now() + delay)
        } else {
            None
        };

        self.outbox
            .mark_failed(entry.entry_id, message, next_attempt_at)
            .await
            .map_err(to_sync_err)?;

        if next_attempt_at.is_none() {
            self.emit(SyncEvent::EntryFailed {
                entity_type: entry.entity_type.clone(),
                sync_id: entry.sync_id,
                attempts: attempts_after,
                message: message.to_string(),
            });
        }

        Ok(())
    }

    /// The server rejected an upload as stale. Resolve against its current
    /// copy: if the local side wins, replay it once against the fresh clock;
    /// if the remote side wins, adopt it and drop the queued mutation.
    async fn resolve_upload_conflict(
        &self,
        entry: &OutboxEntry,
        remote: RemoteChange,
    ) -> SyncResult<UploadConflictOutcome> {
        let local = self
            .store
            .find_with_deleted(&entry.entity_type, entry.sync_id)
            .await
            .map_err(to_sync_err)?;

        let Some(local) = local else {
            // Nothing local to defend; the server copy stands.
            self.accept_remote_over_entry(entry, &remote).await?;
            return Ok(UploadConflictOutcome::RemoteAccepted);
        };

        match self.resolver.resolve(&local, &remote) {
            Resolution::RemoteWins => {
                debug!(
                    "Remote wins upload conflict for {} {}",
                    entry.entity_type, entry.sync_id
                );
                self.accept_remote_over_entry(entry, &remote).await?;
                Ok(UploadConflictOutcome::RemoteAccepted)
            }
            Resolution::LocalWins => {
                debug!(
                    "Local wins upload conflict for {} {}; replaying",
                    entry.entity_type, entry.sync_id
                );

                let replay = if local.meta.is_deleted {
                    self.remote
                        .delete_entity(&entry.entity_type, entry.sync_id, local.meta.updated_at)
                        .await
                } else {
                    self.remote
                        .update_entity(
                            &entry.entity_type,
                            entry.sync_id,
                            &local.payload,
                            local.meta.updated_at,
                        )
                        .await
                };

                match replay {
                    Ok(ack) => {
                        self.acknowledge_entry(entry, &ack).await?;
                        Ok(UploadConflictOutcome::Uploaded)
                    }
                    Err(e) if e.is_transient() => {
                        self.record_entry_failure(entry, &e.to_string(), true).await?;
                        Ok(UploadConflictOutcome::Halted)
                    }
                    Err(SyncError::RemoteConflict { .. }) => {
                        // The server moved again mid-resolution; settle next cycle.
                        self.record_entry_failure(
                            entry,
                            "remote state changed during conflict resolution",
                            true,
                        )
                        .await?;
                        Ok(UploadConflictOutcome::Halted)
                    }
                    Err(SyncError::PermanentRejection(message)) => {
                        self.record_entry_failure(entry, &message, false).await?;
                        Ok(UploadConflictOutcome::Halted)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Adopt the server's copy of a record: cancel queued mutations for it
    /// and write the remote state (or purge, for a remote tombstone).
    async fn accept_remote_over_entry(
        &self,
        entry: &OutboxEntry,
        remote: &RemoteChange,
    ) -> SyncResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        self.outbox
            .cancel_for_entity_with_tx(&entry.entity_type, entry.sync_id, &mut tx)
            .await
            .map_err(to_sync_err)?;

        if remote.is_deleted {
            self.store
                .purge_with_tx(&entry.entity_type, entry.sync_id, &mut tx)
                .await
                .map_err(to_sync_err)?;
        } else if let Some(payload) = &remote.payload {
            self.store
                .apply_remote_with_tx(
                    &entry.entity_type,
                    entry.sync_id,
                    payload,
                    remote.updated_at,
                    &mut tx,
                )
                .await
                .map_err(to_sync_err)?;
        }
        // Without a payload in the conflict body the download phase brings
        // the server copy; dropping the queue entries is enough here.

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    // ---- Downloading --------------------------------------------------

    async fn download_phase(
        &self,
        stats: &mut SyncStats,
    ) -> SyncResult<Vec<(String, Vec<RemoteChange>)>> {
        self.set_phase(SyncPhase::Downloading);

        let mut types = self.config.entity_types.clone();
        if types.is_empty() {
            types = self.store.list_types().await.map_err(to_sync_err)?;
        }
        if types.is_empty() {
            return Ok(Vec::new());
        }

        let fetches = types.into_iter().map(|entity_type| async move {
            let _permit = self
                .type_sem
                .acquire()
                .await
                .map_err(|_| SyncError::Interrupted)?;
            self.check_cancelled()?;

            let since = self
                .cursors
                .last_pulled_at(&entity_type)
                .await
                .map_err(to_sync_err)?;

            let fetched = match tokio::time::timeout(
                self.config.call_timeout,
                self.remote.fetch_changes_since(&entity_type, since),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SyncError::TransientNetwork(format!(
                    "delta fetch for {} timed out",
                    entity_type
                ))),
            };

            Ok::<_, SyncError>((entity_type, fetched))
        });

        let results: Vec<SyncResult<(String, SyncResult<Vec<RemoteChange>>)>> =
            stream::iter(fetches)
                .buffer_unordered(self.config.max_concurrent_types.max(1))
                .collect()
                .await;

        let mut batches = Vec::new();
        for result in results {
            let (entity_type, fetched) = result?;
            match fetched {
                Ok(changes) if changes.is_empty() => {}
                Ok(changes) => {
                    debug!("Fetched {} {} deltas", changes.len(), entity_type);
                    batches.push((entity_type, changes));
                }
                Err(e) if e.is_transient() => {
                    // The cursor stays put, so these deltas are re-delivered.
                    stats.failed_downloads += 1;
                    warn!("Skipping {} download this cycle: {}", entity_type, e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(batches)
    }

    // ---- Reconciling --------------------------------------------------

    /// Apply fetched deltas per entity type, one transaction per type. The
    /// cursor advances inside the same transaction as the batch, so a partial
    /// failure rolls both back and the deltas are re-delivered.
    async fn reconcile_phase(
        &self,
        batches: Vec<(String, Vec<RemoteChange>)>,
        stats: &mut SyncStats,
    ) -> SyncResult<()> {
        if batches.is_empty() {
            return Ok(());
        }

        self.set_phase(SyncPhase::Reconciling);

        let total: usize = batches.iter().map(|(_, changes)| changes.len()).sum();
        let mut done = 0usize;

        for (entity_type, changes) in batches {
            self.check_cancelled()?;

            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let mut last_applied = None;

            for change in &changes {
                self.apply_remote_change(&entity_type, change, &mut tx, stats)
                    .await?;
                last_applied = Some(change.updated_at);
                done += 1;
            }

            // The feed is ascending, so the last delta is the high-water mark.
            if let Some(pulled_at) = last_applied {
                self.cursors
                    .advance_with_tx(&entity_type, pulled_at, &mut tx)
                    .await
                    .map_err(to_sync_err)?;
            }

            tx.commit().await.map_err(db_err)?;

            stats.downloaded += changes.len() as i64;
            self.emit(SyncEvent::Progress {
                phase: SyncPhase::Reconciling,
                done,
                total,
            });
        }

        Ok(())
    }

    async fn apply_remote_change<'t>(
        &self,
        entity_type: &str,
        change: &RemoteChange,
        tx: &mut sqlx::Transaction<'t, sqlx::Sqlite>,
        stats: &mut SyncStats,
    ) -> SyncResult<()> {
        let local = self
            .store
            .find_with_deleted_with_tx(entity_type, change.sync_id, tx)
            .await
            .map_err(to_sync_err)?;

        match local {
            None => {
                if change.is_deleted {
                    // Never seen locally; nothing to resurrect or remove.
                    return Ok(());
                }
                let payload = change.payload.as_ref().ok_or_else(|| {
                    SyncError::InvalidRemotePayload(format!(
                        "{} {} delta has no payload",
                        entity_type, change.sync_id
                    ))
                })?;
                self.store
                    .apply_remote_with_tx(entity_type, change.sync_id, payload, change.updated_at, tx)
                    .await
                    .map_err(to_sync_err)
            }
            Some(local) if !local.meta.is_dirty && !local.meta.is_deleted => {
                if change.is_deleted {
                    // Remote tombstone with no local changes to defend.
                    self.store
                        .purge_with_tx(entity_type, change.sync_id, tx)
                        .await
                        .map_err(to_sync_err)
                } else if change.updated_at > local.meta.updated_at {
                    let payload = change.payload.as_ref().ok_or_else(|| {
                        SyncError::InvalidRemotePayload(format!(
                            "{} {} delta has no payload",
                            entity_type, change.sync_id
                        ))
                    })?;
                    self.store
                        .apply_remote_with_tx(
                            entity_type,
                            change.sync_id,
                            payload,
                            change.updated_at,
                            tx,
                        )
                        .await
                        .map_err(to_sync_err)
                } else {
                    // Already applied; re-delivery short-circuits here.
                    Ok(())
                }
            }
            Some(local) => {
                // Locally dirty or tombstoned: a genuine conflict.
                stats.conflicts += 1;
                self.emit(SyncEvent::Conflict {
                    entity_type: entity_type.to_string(),
                    sync_id: change.sync_id,
                });

                match self.resolver.resolve(&local, change) {
                    Resolution::LocalWins => {
                        // The queued outbox entry replays the local state.
                        debug!(
                            "Local wins download conflict for {} {}",
                            entity_type, change.sync_id
                        );
                        Ok(())
                    }
                    Resolution::RemoteWins => {
                        debug!(
                            "Remote wins download conflict for {} {}",
                            entity_type, change.sync_id
                        );
                        self.outbox
                            .cancel_for_entity_with_tx(entity_type, change.sync_id, tx)
                            .await
                            .map_err(to_sync_err)?;

                        if change.is_deleted {
                            self.store
                                .purge_with_tx(entity_type, change.sync_id, tx)
                                .await
                                .map_err(to_sync_err)
                        } else {
                            let payload = change.payload.as_ref().ok_or_else(|| {
                                SyncError::InvalidRemotePayload(format!(
                                    "{} {} delta has no payload",
                                    entity_type, change.sync_id
                                ))
                            })?;
                            self.store
                                .apply_remote_with_tx(
                                    entity_type,
                                    change.sync_id,
                                    payload,
                                    change.updated_at,
                                    tx,
                                )
                                .await
                                .map_err(to_sync_err)
                        }
                    }
                }
            }
        }
    }
}
