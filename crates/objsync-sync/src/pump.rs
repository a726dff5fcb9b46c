//! Watch pump - feeds settled local changes into the sync manager
//!
//! The [`WatchPump`] sits between the [`FileWatcher`](super::watcher::FileWatcher)
//! and the [`SyncManager`]. It receives raw watch events, feeds them through a
//! [`DebouncedChangeQueue`], and hands settled events to
//! [`SyncManager::handle_local_event`].
//!
//! ## Flow
//!
//! ```text
//! FileWatcher ──→ mpsc::Receiver ──→ WatchPump ──→ SyncManager
//!                                        │
//!                                  DebouncedChangeQueue
//! ```
//!
//! When the watcher reports [`WatchEvent::Ready`] the pump can request the
//! initial reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::SyncManager;
use crate::watcher::{DebouncedChangeQueue, WatchEvent};

/// Drives local change propagation until shutdown
pub struct WatchPump {
    /// Receiver for events from the FileWatcher
    change_rx: mpsc::Receiver<WatchEvent>,
    /// Debounced queue that coalesces rapid-fire events
    queue: DebouncedChangeQueue,
    manager: Arc<SyncManager>,
    /// How often the debounce queue is polled for settled events
    poll_interval: Duration,
    /// Run a reconciliation pass when the initial scan completes
    sync_on_ready: bool,
    shutdown: CancellationToken,
}

impl WatchPump {
    /// Creates a new `WatchPump`
    ///
    /// # Arguments
    /// * `change_rx` - Channel receiver for watch events
    /// * `manager` - Sync manager receiving settled events
    /// * `stability` - How long a path must be quiet before it is dispatched
    /// * `poll_interval` - How often to check the debounce queue
    /// * `shutdown` - Token that stops the loop
    pub fn new(
        change_rx: mpsc::Receiver<WatchEvent>,
        manager: Arc<SyncManager>,
        stability: Duration,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        info!(
            stability_ms = stability.as_millis() as u64,
            poll_ms = poll_interval.as_millis() as u64,
            "Creating watch pump"
        );

        Self {
            change_rx,
            queue: DebouncedChangeQueue::new(stability),
            manager,
            poll_interval,
            sync_on_ready: false,
            shutdown,
        }
    }

    /// Request a reconciliation once the watcher reports `Ready`
    pub fn sync_on_ready(mut self, enabled: bool) -> Self {
        self.sync_on_ready = enabled;
        self
    }

    /// Main event loop
    ///
    /// Runs until the shutdown token is cancelled or the change channel
    /// closes. On channel close every pending event is dispatched before
    /// returning; on cancellation pending events are dropped.
    pub async fn run(mut self) {
        info!("Watch pump starting");

        let mut poll_timer = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(
                        pending = self.queue.pending_count(),
                        "Shutdown requested, watch pump stopping"
                    );
                    break;
                }

                event = self.change_rx.recv() => {
                    match event {
                        Some(WatchEvent::Ready) => self.on_ready(),
                        Some(change) => {
                            debug!(event = ?change, "Pump received watch event");
                            self.queue.push(change);
                        }
                        None => {
                            info!("Watch channel closed, flushing pending events");
                            for change in self.queue.drain() {
                                self.dispatch(change).await;
                            }
                            break;
                        }
                    }
                }

                _ = poll_timer.tick() => {
                    for change in self.queue.poll() {
                        self.dispatch(change).await;
                    }
                }
            }
        }

        info!("Watch pump stopped");
    }

    fn on_ready(&self) {
        info!("Initial scan complete");
        if !self.sync_on_ready {
            return;
        }
        match self.manager.sync() {
            // Failures are reported by the queue; the pass runs without us waiting
            Ok(Some(_completion)) => info!("Initial reconciliation queued"),
            Ok(None) => debug!("Initial reconciliation skipped"),
            Err(e) => error!(error = %e, "Cannot start initial reconciliation"),
        }
    }

    async fn dispatch(&self, event: WatchEvent) {
        debug!(event = ?event, "Dispatching settled event");
        if let Err(e) = self.manager.handle_local_event(event).await {
            warn!(error = %e, "Failed to dispatch local change");
        }
    }
}
