//! Upload/sync orchestrator
//!
//! Runs a lightweight sync (metadata + previews) for selected capsules while
//! an `Upload` poll session reports per-capsule progress. A capsule can only
//! be part of one upload at a time.

use crate::client::{CapsuleApi, SyncResponse};
use crate::error::{SyncError, SyncResult};
use crate::scheduler::{PollHandle, PollKey, PollScheduler};
use crate::status::AssetStatusResolver;
use capsule_common::api::{
    error_entry_text, AssetStatus, Capsule, CapsuleId, CloudStatus, LightweightSyncData,
    LightweightSyncRequest,
};
use capsule_common::events::{CapsuleEvent, EventBus, NoticeLevel};
use chrono::Utc;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of an upload that made forward progress
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Synced {
        synced_count: u64,
        preview_downloaded: u64,
        duration_seconds: f64,
    },
    /// Remote answered 207: some capsules synced, some did not
    PartialWarning {
        message: String,
        synced_count: u64,
        errors: Vec<String>,
    },
}

impl UploadOutcome {
    pub fn level(&self) -> NoticeLevel {
        match self {
            UploadOutcome::Synced { .. } => NoticeLevel::Success,
            UploadOutcome::PartialWarning { .. } => NoticeLevel::Warning,
        }
    }
}

/// What the cloud button should do for a capsule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudAction {
    /// Never uploaded, or audio still missing from the cloud
    Upload,
    /// Cloud copy is newer
    Pull,
    /// Already synced; upload again on request
    Reupload,
    Unknown,
}

/// Pick the cloud action for a capsule from its cloud status
///
/// A capsule whose files exist only locally but whose audio never reached
/// the cloud still needs a real upload, whatever its metadata status says.
pub fn cloud_action(capsule: &Capsule) -> CloudAction {
    if capsule.asset_status == AssetStatus::Local
        && !capsule.audio_uploaded
        && capsule.cloud_status != CloudStatus::RemoteNewer
    {
        return CloudAction::Upload;
    }
    match capsule.cloud_status {
        CloudStatus::NotUploaded => CloudAction::Upload,
        CloudStatus::RemoteNewer => CloudAction::Pull,
        CloudStatus::Synced => CloudAction::Reupload,
        CloudStatus::Unknown => CloudAction::Unknown,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadMode {
    Upload,
    Reupload,
}

type InFlightSet = Arc<Mutex<HashSet<CapsuleId>>>;

fn lock(set: &InFlightSet) -> MutexGuard<'_, HashSet<CapsuleId>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Marks capsules as uploading until dropped
struct InFlightGuard {
    set: InFlightSet,
    ids: Vec<CapsuleId>,
}

impl InFlightGuard {
    /// Claim every id, or none if any is already uploading
    fn acquire(set: &InFlightSet, ids: &[CapsuleId]) -> Result<Self, CapsuleId> {
        let mut in_flight = lock(set);
        if let Some(busy) = ids.iter().find(|id| in_flight.contains(*id)) {
            return Err(*busy);
        }
        in_flight.extend(ids.iter().copied());
        Ok(Self {
            set: Arc::clone(set),
            ids: ids.to_vec(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.set);
        for id in &self.ids {
            in_flight.remove(id);
        }
    }
}

pub struct UploadOrchestrator {
    api: Arc<dyn CapsuleApi>,
    resolver: Arc<AssetStatusResolver>,
    scheduler: Arc<PollScheduler>,
    bus: EventBus,
    interval: Duration,
    include_previews: bool,
    in_flight: InFlightSet,
}

impl UploadOrchestrator {
    pub fn new(
        api: Arc<dyn CapsuleApi>,
        resolver: Arc<AssetStatusResolver>,
        scheduler: Arc<PollScheduler>,
        bus: EventBus,
        interval: Duration,
        include_previews: bool,
    ) -> Self {
        Self {
            api,
            resolver,
            scheduler,
            bus,
            interval,
            include_previews,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Upload capsules that have not been synced yet
    pub async fn upload(&self, ids: &[CapsuleId]) -> SyncResult<UploadOutcome> {
        self.run(ids, UploadMode::Upload).await
    }

    /// Upload an already-synced capsule again
    pub async fn reupload(&self, id: CapsuleId) -> SyncResult<UploadOutcome> {
        self.run(&[id], UploadMode::Reupload).await
    }

    pub fn is_uploading(&self, id: CapsuleId) -> bool {
        lock(&self.in_flight).contains(&id)
    }

    /// Pull newer cloud data for every capsule (no upload selection)
    pub async fn pull_remote(&self) -> SyncResult<LightweightSyncData> {
        let request = LightweightSyncRequest {
            include_previews: self.include_previews,
            force: false,
            capsule_ids: None,
        };
        info!("Pulling remote changes");

        match self.api.lightweight_sync(&request).await {
            // Anything synced counts as progress even when the remote reports failure
            Ok(response)
                if response.envelope.success
                    || response
                        .envelope
                        .data
                        .as_ref()
                        .is_some_and(|d| d.synced_count > 0) =>
            {
                self.resolver.invalidate_all().await;
                if response.envelope.success {
                    self.bus
                        .notify(NoticeLevel::Success, "Pulled latest changes from the cloud");
                } else {
                    let message = response
                        .error_text()
                        .unwrap_or("Pulled with warnings")
                        .to_string();
                    warn!(error = %message, "Pull partially succeeded");
                    self.bus.notify(NoticeLevel::Warning, message);
                }
                self.bus.emit_lossy(CapsuleEvent::sync_completed());
                Ok(response.envelope.data.unwrap_or_default())
            }
            Ok(response) => {
                let message = response.error_text().unwrap_or("Pull failed").to_string();
                self.fail(&message);
                Err(SyncError::Remote(message))
            }
            Err(err) => {
                self.fail(&err.user_message());
                Err(err)
            }
        }
    }

    fn fail(&self, message: &str) {
        error!(error = %message, "Sync failed");
        self.bus.notify(NoticeLevel::Error, format!("Sync failed: {}", message));
        self.bus.emit_lossy(CapsuleEvent::sync_failed(message));
    }

    async fn run(&self, ids: &[CapsuleId], mode: UploadMode) -> SyncResult<UploadOutcome> {
        if ids.is_empty() {
            return Err(SyncError::InvalidInput("no capsules selected".to_string()));
        }

        let _guard = match InFlightGuard::acquire(&self.in_flight, ids) {
            Ok(guard) => guard,
            Err(busy) => {
                warn!(capsule_id = %busy, "Upload already in progress");
                self.bus.notify(
                    NoticeLevel::Warning,
                    format!("Capsule {} is already uploading, please wait", busy),
                );
                return Err(SyncError::Busy(format!("capsule {} is uploading", busy)));
            }
        };

        info!(capsules = ?ids, ?mode, "Upload started");
        self.bus.notify(
            NoticeLevel::Info,
            match mode {
                UploadMode::Upload => format!("Uploading {} capsule(s)...", ids.len()),
                UploadMode::Reupload => format!("Re-uploading capsule {}...", ids[0]),
            },
        );

        let progress = self.start_progress_polls(ids);

        let request = LightweightSyncRequest {
            include_previews: self.include_previews,
            force: false,
            capsule_ids: Some(ids.to_vec()),
        };
        let result = self.api.lightweight_sync(&request).await;

        for handle in progress {
            handle.cancel();
        }

        let outcome = self.interpret(ids, mode, result).await;
        let (level, message) = match &outcome {
            Ok(UploadOutcome::Synced { .. }) => (NoticeLevel::Success, "Upload complete".to_string()),
            Ok(UploadOutcome::PartialWarning { message, .. }) => (NoticeLevel::Warning, message.clone()),
            Err(err) => (NoticeLevel::Error, err.user_message()),
        };
        self.bus.emit_lossy(CapsuleEvent::UploadFinished {
            capsule_ids: ids.to_vec(),
            level,
            message,
            timestamp: Utc::now(),
        });
        outcome
    }

    fn start_progress_polls(&self, ids: &[CapsuleId]) -> Vec<PollHandle> {
        let mut handles = Vec::with_capacity(ids.len());
        for &id in ids {
            let api = Arc::clone(&self.api);
            let bus = self.bus.clone();
            let started = self.scheduler.start(PollKey::upload(id), self.interval, move || {
                let api = Arc::clone(&api);
                let bus = bus.clone();
                async move { upload_progress_tick(api.as_ref(), &bus, id).await }
            });
            match started {
                Ok(handle) => handles.push(handle),
                Err(err) => debug!(capsule_id = %id, error = %err, "Upload progress poll not started"),
            }
        }
        handles
    }

    async fn interpret(
        &self,
        ids: &[CapsuleId],
        mode: UploadMode,
        result: SyncResult<SyncResponse<LightweightSyncData>>,
    ) -> SyncResult<UploadOutcome> {
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.fail(&err.user_message());
                return Err(err);
            }
        };

        if response.envelope.success {
            let data = response.envelope.data.unwrap_or_default();
            info!(synced = data.synced_count, "Upload completed");
            self.resolver.invalidate_many(ids).await;
            self.bus.notify(
                NoticeLevel::Success,
                match mode {
                    UploadMode::Upload => "Uploaded to cloud".to_string(),
                    UploadMode::Reupload => format!("Capsule {} re-uploaded", ids[0]),
                },
            );
            self.bus.emit_lossy(CapsuleEvent::sync_completed());
            return Ok(UploadOutcome::Synced {
                synced_count: data.synced_count,
                preview_downloaded: data.preview_downloaded,
                duration_seconds: data.duration_seconds,
            });
        }

        let message = response
            .error_text()
            .unwrap_or("Sync finished with warnings")
            .to_string();

        if response.is_partial() {
            let data = response.envelope.data.unwrap_or_default();
            let errors: Vec<String> = data.errors.iter().map(error_entry_text).collect();
            warn!(error = %message, failures = errors.len(), "Upload partially succeeded");
            self.resolver.invalidate_many(ids).await;
            self.bus.notify(
                NoticeLevel::Warning,
                format!("Upload complete with warnings: {}", message),
            );
            self.bus.emit_lossy(CapsuleEvent::sync_completed());
            return Ok(UploadOutcome::PartialWarning {
                message,
                synced_count: data.synced_count,
                errors,
            });
        }

        self.fail(&message);
        Err(SyncError::Remote(message))
    }
}

async fn upload_progress_tick(api: &dyn CapsuleApi, bus: &EventBus, id: CapsuleId) -> ControlFlow<()> {
    match api.upload_progress(id).await {
        Ok(Some(progress)) => {
            let text = progress.status_text();
            debug!(capsule_id = %id, status = %text, "Upload progress");
            let terminal = progress.status.is_terminal();
            bus.emit_lossy(CapsuleEvent::UploadProgress {
                progress,
                text,
                timestamp: Utc::now(),
            });
            if terminal {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
        Ok(None) => ControlFlow::Continue(()),
        Err(err) => {
            warn!(capsule_id = %id, error = %err, "Upload progress poll failed, retrying");
            ControlFlow::Continue(())
        }
    }
}
