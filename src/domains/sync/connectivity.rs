use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domains::sync::coordinator::SyncCoordinator;
use crate::domains::sync::types::SyncOutcome;

/// Network reachability as observed by the host application. The engine never
/// probes the network itself; the platform layer feeds transitions in.
pub trait ConnectivityMonitor: Send + Sync {
    fn is_online(&self) -> bool;
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Watch-channel backed monitor fed via `set_online`.
pub struct SharedConnectivityMonitor {
    sender: watch::Sender<bool>,
}

impl SharedConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(initially_online);
        Self { sender }
    }

    /// Record a reachability change. Redundant reports are dropped so
    /// subscribers only see edges.
    pub fn set_online(&self, online: bool) {
        self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }
}

impl ConnectivityMonitor for SharedConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

/// Start the automatic trigger: every offline→online transition runs a sync
/// cycle, retrying with the coordinator's backoff while the connection holds.
/// Triggers during a running cycle are coalesced by the coordinator's
/// single-flight guard. Going offline mid-cycle cancels the cycle; shutting
/// the coordinator down stops the task.
pub fn spawn_auto_sync(
    monitor: Arc<dyn ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
) -> JoinHandle<()> {
    let mut connectivity = monitor.subscribe();
    let mut shutdown = coordinator.shutdown_signal();

    tokio::spawn(async move {
        let mut was_online = *connectivity.borrow();

        loop {
            tokio::select! {
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *connectivity.borrow_and_update();

                    if online && !was_online {
                        info!("Connectivity restored; starting sync");
                        run_with_backoff(&monitor, &coordinator, &mut shutdown).await;
                    } else if !online && was_online {
                        debug!("Connectivity lost; cancelling any running cycle");
                        coordinator.cancel_cycle();
                    }

                    was_online = online;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Auto-sync task stopped");
    })
}

/// Run cycles until one succeeds, the connection drops, or shutdown.
/// Transient cycle failures back off exponentially and are never surfaced.
async fn run_with_backoff(
    monitor: &Arc<dyn ConnectivityMonitor>,
    coordinator: &Arc<SyncCoordinator>,
    shutdown: &mut watch::Receiver<bool>,
) {
    loop {
        if !monitor.is_online() || *shutdown.borrow() {
            return;
        }

        match coordinator.sync_now().await {
            Ok(SyncOutcome::Completed(stats)) => {
                debug!(
                    "Auto sync finished: {} uploaded, {} downloaded",
                    stats.uploaded, stats.downloaded
                );
                return;
            }
            Ok(SyncOutcome::AlreadyRunning) => {
                // Coalesced into the running cycle.
                return;
            }
            Err(e) => {
                let delay = coordinator.next_retry_delay();
                warn!("Sync cycle failed: {}; retrying in {:?}", e, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_reports_edges_only() {
        let monitor = SharedConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        assert!(!monitor.is_online());
        assert!(!rx.has_changed().expect("channel open"));

        // Redundant report: no edge, no wakeup.
        monitor.set_online(false);
        assert!(!rx.has_changed().expect("channel open"));

        monitor.set_online(true);
        assert!(rx.has_changed().expect("channel open"));
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_online());
    }
}
