//! Sync overview and tag sync
//!
//! Tracks what the remote says about pending work (last sync time, pending
//! and conflict counts) and runs keyword/tag syncs, including the debounced
//! auto-sync that follows local edits.

use crate::client::CapsuleApi;
use crate::error::{SyncError, SyncResult};
use capsule_common::api::TagSyncData;
use capsule_common::events::{CapsuleEvent, EventBus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client-side summary of the sync state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncOverview {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub synced_count: u64,
    pub pending_count: u64,
    pub conflict_count: u64,
    /// Cloud-side changes waiting to be downloaded
    pub remote_pending: u64,
    pub is_syncing: bool,
    /// Percentage of the running sync (0-100)
    pub progress: u8,
    pub step: String,
    pub last_error: Option<String>,
}

/// Held while a sync runs; clears the syncing flag on drop
pub struct SyncingGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for SyncingGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct SyncMonitor {
    api: Arc<dyn CapsuleApi>,
    bus: EventBus,
    overview: RwLock<SyncOverview>,
    syncing: Arc<AtomicBool>,
}

impl SyncMonitor {
    pub fn new(api: Arc<dyn CapsuleApi>, bus: EventBus) -> Self {
        Self {
            api,
            bus,
            overview: RwLock::new(SyncOverview::default()),
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn overview(&self) -> SyncOverview {
        let mut overview = self.overview.read().await.clone();
        overview.is_syncing = self.is_syncing();
        overview
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Claim the syncing flag; `None` if another sync is running
    pub fn try_begin(&self) -> Option<SyncingGuard> {
        self.syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncingGuard {
                flag: Arc::clone(&self.syncing),
            })
    }

    pub async fn set_progress(&self, progress: u8, step: impl Into<String>) {
        let mut overview = self.overview.write().await;
        overview.progress = progress.min(100);
        overview.step = step.into();
    }

    pub async fn set_error(&self, error: Option<String>) {
        self.overview.write().await.last_error = error;
    }

    /// Re-read `GET /api/sync/status`
    ///
    /// Skipped when signed out. On failure the previous overview is kept and
    /// the error recorded.
    pub async fn refresh(&self) -> SyncResult<SyncOverview> {
        if !self.api.is_authenticated().await {
            debug!("Not signed in, skipping sync status refresh");
            return Ok(self.overview().await);
        }

        match self.api.sync_status().await {
            Ok(data) => {
                {
                    let mut overview = self.overview.write().await;
                    overview.last_sync_at = data.last_sync_time();
                    overview.synced_count = data.synced_count;
                    overview.pending_count = data.pending_count;
                    overview.conflict_count = data.conflict_count;
                    overview.remote_pending = data.remote_pending;
                }
                Ok(self.overview().await)
            }
            Err(err) => {
                warn!(error = %err, "Sync status refresh failed");
                self.set_error(Some(err.user_message())).await;
                Err(err)
            }
        }
    }

    /// Run a tag/keyword sync (`POST /api/sync/sync-tags`)
    ///
    /// A 207 or `success: false` answer is logged as a warning but still
    /// counts as a completed sync.
    pub async fn sync_tags(&self) -> SyncResult<TagSyncData> {
        let Some(_guard) = self.try_begin() else {
            debug!("Sync already running, skipping tag sync");
            return Err(SyncError::Busy("sync in progress".to_string()));
        };

        if !self.api.is_authenticated().await {
            return Err(SyncError::NotConfigured("not signed in".to_string()));
        }

        self.set_error(None).await;
        self.set_progress(10, "Syncing tags").await;
        info!("Tag sync started");

        let result = self.api.sync_tags().await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                let message = err.user_message();
                warn!(error = %message, "Tag sync failed");
                self.set_error(Some(message.clone())).await;
                self.set_progress(0, "").await;
                self.bus.emit_lossy(CapsuleEvent::sync_failed(message));
                return Err(err);
            }
        };

        if !response.envelope.success {
            warn!(
                status = response.status,
                error = response.error_text().unwrap_or(""),
                "Tag sync finished with warnings"
            );
        }

        self.set_progress(90, "Verifying").await;
        // Overview failures are recorded by refresh itself
        let _ = self.refresh().await;
        self.set_progress(100, "Done").await;

        let data = response.envelope.data.unwrap_or_default();
        info!(uploaded = data.uploaded, downloaded = data.downloaded, "Tag sync completed");
        self.bus.emit_lossy(CapsuleEvent::sync_completed());
        Ok(data)
    }

    /// Listen for bus events: debounce a tag sync `delay` after the last
    /// `DataChanged`, and refresh the overview after every `SyncCompleted`
    pub fn spawn_auto_sync(
        self: &Arc<Self>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let mut rx = self.bus.subscribe();

        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;

            loop {
                let wake_at = deadline;
                let timer = async move {
                    match wake_at {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(CapsuleEvent::DataChanged { .. }) => {
                            debug!(?delay, "Data changed, auto-sync scheduled");
                            deadline = Some(Instant::now() + delay);
                        }
                        Ok(CapsuleEvent::SyncCompleted { .. }) => {
                            let _ = monitor.refresh().await;
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, "Auto-sync listener lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = timer => {
                        deadline = None;
                        info!("Auto-sync triggered");
                        if let Err(err) = monitor.sync_tags().await {
                            debug!(error = %err, "Auto-sync did not run");
                        }
                    }
                }
            }
            debug!("Auto-sync listener stopped");
        })
    }
}
