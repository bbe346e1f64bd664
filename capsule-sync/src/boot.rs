//! Boot-time reconciliation
//!
//! A single download-only sync run after sign-in and before the main view is
//! shown. It never uploads, runs at most once per process, and never blocks
//! entry: a failure is reported and the user carries on.

use crate::client::CapsuleApi;
use crate::status::AssetStatusResolver;
use crate::sync_status::SyncMonitor;
use capsule_common::events::{CapsuleEvent, EventBus, NoticeLevel};
use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAuthenticated,
    UserSkipped,
    SyncInProgress,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    Completed {
        downloaded_count: u64,
        preview_downloaded: u64,
    },
    Skipped(SkipReason),
    /// Sync failed; entry continues and the user can retry manually
    Failed(String),
    AlreadyRan,
}

pub struct BootSync {
    api: Arc<dyn CapsuleApi>,
    monitor: Arc<SyncMonitor>,
    resolver: Arc<AssetStatusResolver>,
    bus: EventBus,
    include_previews: bool,
    skip_after: Duration,
    started: AtomicBool,
    started_at: OnceLock<Instant>,
    finished: AtomicBool,
}

impl BootSync {
    pub fn new(
        api: Arc<dyn CapsuleApi>,
        monitor: Arc<SyncMonitor>,
        resolver: Arc<AssetStatusResolver>,
        bus: EventBus,
        include_previews: bool,
        skip_after: Duration,
    ) -> Self {
        Self {
            api,
            monitor,
            resolver,
            bus,
            include_previews,
            skip_after,
            started: AtomicBool::new(false),
            started_at: OnceLock::new(),
            finished: AtomicBool::new(false),
        }
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// True once the run has been going for `skip_after` without finishing
    pub fn skip_available(&self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.started_at
            .get()
            .is_some_and(|at| at.elapsed() >= self.skip_after)
    }

    /// Run the boot sync; later calls return [`BootOutcome::AlreadyRan`]
    pub async fn run(&self) -> BootOutcome {
        if self.started.swap(true, Ordering::AcqRel) {
            info!("Boot sync already ran in this session");
            return BootOutcome::AlreadyRan;
        }
        let _ = self.started_at.set(Instant::now());

        let outcome = self.execute().await;
        self.finished.store(true, Ordering::Release);
        info!(?outcome, "Boot sync finished");
        outcome
    }

    /// Run the boot sync in the background and return early if the user
    /// skips
    ///
    /// A skip request is only honoured once `skip_after` has elapsed; an
    /// earlier request takes effect at that point. Skipping does not abort
    /// the sync, which keeps running and still emits its events.
    pub async fn run_with_skip<S>(self: &Arc<Self>, skip: S) -> BootOutcome
    where
        S: Future<Output = ()> + Send,
    {
        let entered = Instant::now();
        let skip_after = self.skip_after;
        let boot = Arc::clone(self);
        let mut task = tokio::spawn(async move { boot.run().await });

        let skip_requested = async move {
            skip.await;
            tokio::time::sleep_until(entered + skip_after).await;
        };

        tokio::select! {
            joined = &mut task => joined.unwrap_or_else(|err| {
                error!(error = %err, "Boot sync task aborted");
                BootOutcome::Failed(err.to_string())
            }),
            _ = skip_requested => {
                info!("Boot sync skipped by user");
                BootOutcome::Skipped(SkipReason::UserSkipped)
            }
        }
    }

    async fn execute(&self) -> BootOutcome {
        if !self.api.is_authenticated().await {
            info!("Not signed in, skipping boot sync");
            return BootOutcome::Skipped(SkipReason::NotAuthenticated);
        }

        let Some(_guard) = self.monitor.try_begin() else {
            info!("A sync is already running, skipping boot sync");
            return BootOutcome::Skipped(SkipReason::SyncInProgress);
        };

        self.monitor.set_error(None).await;
        self.progress(5, "Connecting to cloud").await;
        self.progress(10, "Downloading capsule metadata").await;

        let response = match self.api.download_only(self.include_previews).await {
            Ok(response) => response,
            Err(err) => return self.fail(err.user_message()).await,
        };

        if !response.envelope.success {
            let message = response
                .error_text()
                .unwrap_or("Download-only sync failed")
                .to_string();
            return self.fail(message).await;
        }

        let partial = response.is_partial();
        let data = response.envelope.data.unwrap_or_default();
        if partial || !data.errors.is_empty() {
            warn!(failures = data.errors.len(), "Boot sync completed with warnings");
        }

        self.progress(90, "Verifying synced data").await;
        // Overview failures are recorded by refresh itself
        let _ = self.monitor.refresh().await;
        self.resolver.invalidate_all().await;
        self.progress(100, "Sync complete").await;

        info!(
            downloaded = data.downloaded_count,
            previews = data.preview_downloaded,
            "Boot sync downloaded remote changes"
        );
        self.bus.emit_lossy(CapsuleEvent::sync_completed());

        BootOutcome::Completed {
            downloaded_count: data.downloaded_count,
            preview_downloaded: data.preview_downloaded,
        }
    }

    async fn progress(&self, percentage: u8, phase: &str) {
        self.monitor.set_progress(percentage, phase).await;
        self.bus.emit_lossy(CapsuleEvent::BootSyncProgress {
            phase: phase.to_string(),
            percentage,
            timestamp: Utc::now(),
        });
    }

    async fn fail(&self, message: String) -> BootOutcome {
        error!(error = %message, "Boot sync failed");
        self.monitor.set_error(Some(message.clone())).await;
        self.bus.emit_lossy(CapsuleEvent::sync_failed(message.clone()));
        self.bus.notify(
            NoticeLevel::Warning,
            format!("Startup sync failed: {}. You can sync manually later.", message),
        );
        BootOutcome::Failed(message)
    }
}
