//! API module for the remote capsule service
//!
//! Contains only serde types and pure helpers; the HTTP client lives in
//! `capsule-sync`.

pub mod types;

pub use types::{
    error_entry_text, ActionResponse, AssetStatus, AssetStatusReport, Capsule, CapsuleId,
    CloudStatus, DownloadOnlyData, DownloadOnlyRequest, DownloadPoll, DownloadState,
    DownloadStatusBody, DownloadTask, LightweightSyncData, LightweightSyncRequest, OpenRequest,
    RefreshData, RefreshRequest, StartDownloadRequest, StartDownloadResponse, SyncEnvelope,
    SyncStatusData, TagSyncData, UploadProgressBody, UploadProgressEvent, UploadStage,
};
