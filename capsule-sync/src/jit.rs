//! Just-in-time decision gate
//!
//! Decides what "open capsule" means given where its files are:
//!
//! | asset status                 | action                           |
//! |------------------------------|----------------------------------|
//! | `synced`, `local`, `full`    | open now                         |
//! | `downloading`                | tell the user, do nothing        |
//! | `cloud_only`, `partial`      | ask: download first, or offline  |
//! | anything else                | same as `cloud_only`             |
//!
//! Unknown states are treated as the least capable one so the gate never
//! silently opens a capsule with missing files.

use crate::client::CapsuleApi;
use crate::download::DownloadTracker;
use crate::error::{SyncError, SyncResult};
use crate::status::AssetStatusResolver;
use async_trait::async_trait;
use capsule_common::api::{AssetStatus, Capsule, CapsuleId, DownloadState};
use capsule_common::events::{EventBus, NoticeLevel};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitDecision {
    OpenNow,
    AlreadyDownloading,
    AskUser,
}

/// Answer to the download-or-offline prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitChoice {
    /// Fetch every asset, then open
    DownloadThenOpen,
    /// Open with only the files already on disk
    OpenOffline,
    Dismiss,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JitOutcome {
    Opened { offline: bool },
    AlreadyDownloading,
    Dismissed,
    DownloadFailed { state: DownloadState, message: String },
}

/// Asks the user how to open a capsule whose assets are not all local
#[async_trait]
pub trait DecisionPrompt: Send + Sync {
    async fn choose(&self, capsule: &Capsule, status: AssetStatus) -> JitChoice;
}

/// Performs the actual "open" action
#[async_trait]
pub trait CapsuleOpener: Send + Sync {
    async fn open(&self, id: CapsuleId, offline: bool) -> SyncResult<()>;
}

/// Opens capsules through the remote service's open endpoint
pub struct RemoteOpener {
    api: Arc<dyn CapsuleApi>,
}

impl RemoteOpener {
    pub fn new(api: Arc<dyn CapsuleApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl CapsuleOpener for RemoteOpener {
    async fn open(&self, id: CapsuleId, offline: bool) -> SyncResult<()> {
        self.api.open_capsule(id, offline).await
    }
}

/// Prompt with a predetermined answer (non-interactive use)
pub struct FixedPrompt(pub JitChoice);

#[async_trait]
impl DecisionPrompt for FixedPrompt {
    async fn choose(&self, _capsule: &Capsule, _status: AssetStatus) -> JitChoice {
        self.0
    }
}

/// Label of the capsule's primary action button
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionLabel {
    Get,
    Downloading,
    Open,
    Repair,
}

impl ActionLabel {
    pub fn for_status(status: AssetStatus) -> Self {
        match status {
            AssetStatus::Synced | AssetStatus::Local | AssetStatus::Full => ActionLabel::Open,
            AssetStatus::Downloading => ActionLabel::Downloading,
            AssetStatus::Partial => ActionLabel::Repair,
            _ => ActionLabel::Get,
        }
    }

    pub fn text(&self) -> &'static str {
        match self {
            ActionLabel::Get => "Get",
            ActionLabel::Downloading => "Downloading...",
            ActionLabel::Open => "Open",
            ActionLabel::Repair => "Repair",
        }
    }
}

pub struct JitGate {
    resolver: Arc<AssetStatusResolver>,
    downloads: Arc<DownloadTracker>,
    opener: Arc<dyn CapsuleOpener>,
    bus: EventBus,
}

impl JitGate {
    pub fn new(
        resolver: Arc<AssetStatusResolver>,
        downloads: Arc<DownloadTracker>,
        opener: Arc<dyn CapsuleOpener>,
        bus: EventBus,
    ) -> Self {
        Self {
            resolver,
            downloads,
            opener,
            bus,
        }
    }

    pub fn decide(status: AssetStatus) -> JitDecision {
        match status {
            AssetStatus::Synced | AssetStatus::Local | AssetStatus::Full => JitDecision::OpenNow,
            AssetStatus::Downloading => JitDecision::AlreadyDownloading,
            AssetStatus::CloudOnly | AssetStatus::Partial => JitDecision::AskUser,
            AssetStatus::Remote | AssetStatus::Unknown => JitDecision::AskUser,
        }
    }

    /// Status used for the decision: the capsule's own field when it is
    /// meaningful, otherwise the resolver's answer
    async fn effective_status(&self, capsule: &Capsule) -> AssetStatus {
        if capsule.asset_status != AssetStatus::Unknown {
            return capsule.asset_status;
        }
        self.resolver.status(capsule.id).await
    }

    /// Run the open flow for a capsule
    pub async fn open(&self, capsule: &Capsule, prompt: &dyn DecisionPrompt) -> SyncResult<JitOutcome> {
        let status = self.effective_status(capsule).await;
        let decision = Self::decide(status);
        info!(capsule_id = %capsule.id, %status, ?decision, "Open requested");

        match decision {
            JitDecision::OpenNow => self.open_once(capsule.id, false).await,
            JitDecision::AlreadyDownloading => {
                self.bus.notify(
                    NoticeLevel::Info,
                    format!("{} is still downloading, please wait", capsule.display_name()),
                );
                Ok(JitOutcome::AlreadyDownloading)
            }
            JitDecision::AskUser => match prompt.choose(capsule, status).await {
                JitChoice::DownloadThenOpen => self.download_then_open(capsule).await,
                JitChoice::OpenOffline => self.open_once(capsule.id, true).await,
                JitChoice::Dismiss => Ok(JitOutcome::Dismissed),
            },
        }
    }

    async fn open_once(&self, id: CapsuleId, offline: bool) -> SyncResult<JitOutcome> {
        match self.opener.open(id, offline).await {
            Ok(()) => {
                info!(capsule_id = %id, offline, "Capsule opened");
                Ok(JitOutcome::Opened { offline })
            }
            Err(err) => {
                warn!(capsule_id = %id, error = %err, "Open failed");
                self.bus.notify(
                    NoticeLevel::Error,
                    format!("Could not open capsule {}: {}", id, err.user_message()),
                );
                Err(err)
            }
        }
    }

    async fn download_then_open(&self, capsule: &Capsule) -> SyncResult<JitOutcome> {
        let mut handle = self.downloads.start_download(capsule.id).await?;
        let task = match handle.wait().await {
            Ok(task) => task,
            Err(SyncError::Cancelled) => {
                return Ok(JitOutcome::DownloadFailed {
                    state: DownloadState::Cancelled,
                    message: "Download tracking stopped".to_string(),
                })
            }
            Err(err) => return Err(err),
        };

        if task.state != DownloadState::Completed {
            let message = task
                .error_message
                .unwrap_or_else(|| format!("Download {}", task.state));
            return Ok(JitOutcome::DownloadFailed {
                state: task.state,
                message,
            });
        }

        // The tracker already evicted the entry; make sure a racing read did not re-cache it
        self.resolver.invalidate(capsule.id).await;
        self.open_once(capsule.id, false).await
    }
}
