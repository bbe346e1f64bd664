//! Request/response types for the remote capsule service
//!
//! The remote service owns every capsule; the client only holds projections of
//! these payloads. Two independent status axes exist on the wire:
//!
//! - `asset_status`: where the capsule's *files* are (`local`, `cloud_only`,
//!   `downloading`, `partial`, `full`, `synced`, `remote`).
//! - `cloud_status`: whether the capsule's *metadata* is uploaded
//!   (`local` = never uploaded, `remote` = cloud is newer, `synced`).
//!
//! Both axes use the word `local` with different meanings, so they are parsed
//! into distinct enums ([`AssetStatus`] and [`CloudStatus`]) and never compared
//! with each other.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

// ========================================
// Identifiers
// ========================================

/// Remote capsule identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapsuleId(pub i64);

impl fmt::Display for CapsuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CapsuleId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(CapsuleId)
            .map_err(|_| crate::Error::InvalidInput(format!("Invalid capsule id: {}", s)))
    }
}

// ========================================
// Status Axes
// ========================================

/// Where a capsule's files live, as reported by the remote service
///
/// Derived, never authoritative: always re-derivable from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AssetStatus {
    /// Files are on disk (created locally)
    Local,
    /// Only metadata is local; files are in the cloud
    CloudOnly,
    /// A download is in flight
    Downloading,
    /// Some files are present, others missing
    Partial,
    /// All files downloaded
    Full,
    /// Files present and identical to the cloud copy
    Synced,
    /// Cloud copy is newer than the local one
    Remote,
    /// Missing or unrecognised value
    Unknown,
}

impl AssetStatus {
    /// Parse a wire value. Total: unrecognised values become `Unknown`.
    ///
    /// `cached` is an older server spelling of a fully downloaded capsule.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => AssetStatus::Local,
            "cloud_only" => AssetStatus::CloudOnly,
            "downloading" => AssetStatus::Downloading,
            "partial" => AssetStatus::Partial,
            "full" | "cached" => AssetStatus::Full,
            "synced" => AssetStatus::Synced,
            "remote" => AssetStatus::Remote,
            _ => AssetStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Local => "local",
            AssetStatus::CloudOnly => "cloud_only",
            AssetStatus::Downloading => "downloading",
            AssetStatus::Partial => "partial",
            AssetStatus::Full => "full",
            AssetStatus::Synced => "synced",
            AssetStatus::Remote => "remote",
            AssetStatus::Unknown => "unknown",
        }
    }

    /// All files needed to open the capsule are on disk
    pub fn is_openable(&self) -> bool {
        matches!(self, AssetStatus::Local | AssetStatus::Full | AssetStatus::Synced)
    }
}

impl From<String> for AssetStatus {
    fn from(value: String) -> Self {
        AssetStatus::parse(&value)
    }
}

impl From<AssetStatus> for String {
    fn from(status: AssetStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a capsule's metadata has been uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CloudStatus {
    /// Exists only on this machine (wire value `local`)
    NotUploaded,
    /// Cloud has a newer version (wire value `remote`)
    RemoteNewer,
    /// Local metadata matches the cloud
    Synced,
    Unknown,
}

impl CloudStatus {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => CloudStatus::NotUploaded,
            "remote" => CloudStatus::RemoteNewer,
            "synced" => CloudStatus::Synced,
            _ => CloudStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloudStatus::NotUploaded => "local",
            CloudStatus::RemoteNewer => "remote",
            CloudStatus::Synced => "synced",
            CloudStatus::Unknown => "unknown",
        }
    }
}

impl From<String> for CloudStatus {
    fn from(value: String) -> Self {
        CloudStatus::parse(&value)
    }
}

impl From<CloudStatus> for String {
    fn from(status: CloudStatus) -> Self {
        status.as_str().to_string()
    }
}

fn unknown_asset_status() -> AssetStatus {
    AssetStatus::Unknown
}

fn unknown_cloud_status() -> CloudStatus {
    CloudStatus::Unknown
}

/// Accept `null` for status fields (becomes `Unknown`)
fn lenient_status<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: From<String>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(T::from(raw.unwrap_or_default()))
}

// ========================================
// Capsules
// ========================================

/// Read-mostly projection of a remote capsule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capsule {
    pub id: CapsuleId,
    #[serde(default)]
    pub name: String,
    /// Capsule type tag
    #[serde(default)]
    pub capsule_type: Option<String>,
    #[serde(default = "unknown_asset_status", deserialize_with = "lenient_status")]
    pub asset_status: AssetStatus,
    #[serde(default = "unknown_cloud_status", deserialize_with = "lenient_status")]
    pub cloud_status: CloudStatus,
    /// Full source audio has been uploaded (metadata upload alone does not set this)
    #[serde(default)]
    pub audio_uploaded: bool,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Capsule {
    /// Display name, falling back to the type tag and then the id
    pub fn display_name(&self) -> String {
        if !self.name.trim().is_empty() {
            return self.name.clone();
        }
        match &self.capsule_type {
            Some(kind) if !kind.is_empty() => kind.clone(),
            _ => format!("capsule {}", self.id),
        }
    }
}

/// Response of `GET /api/capsules/{id}/asset-status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetStatusReport {
    pub capsule_id: CapsuleId,
    #[serde(default = "unknown_asset_status", deserialize_with = "lenient_status")]
    pub asset_status: AssetStatus,
    #[serde(default = "unknown_cloud_status", deserialize_with = "lenient_status")]
    pub cloud_status: CloudStatus,
    /// Download progress percentage (0-100)
    #[serde(default)]
    pub download_progress: f64,
    #[serde(default)]
    pub local_wav_size: Option<u64>,
    #[serde(default)]
    pub is_cache_pinned: bool,
}

impl AssetStatusReport {
    /// Conservative report used when the remote cannot be reached
    pub fn fallback(capsule_id: CapsuleId) -> Self {
        Self {
            capsule_id,
            asset_status: AssetStatus::Local,
            cloud_status: CloudStatus::Unknown,
            download_progress: 0.0,
            local_wav_size: None,
            is_cache_pinned: false,
        }
    }
}

// ========================================
// Downloads
// ========================================

/// Lifecycle of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    /// Unrecognised wire values are treated as `Pending` so polling continues
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "downloading" => DownloadState::Downloading,
            "paused" => DownloadState::Paused,
            "completed" => DownloadState::Completed,
            "failed" => DownloadState::Failed,
            "cancelled" | "canceled" => DownloadState::Cancelled,
            _ => DownloadState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DownloadState::Pending => "pending",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Client-side view of an in-flight transfer for one capsule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub capsule_id: CapsuleId,
    pub state: DownloadState,
    /// Percentage (0-100)
    pub progress: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Bytes per second
    pub speed: f64,
    pub eta_seconds: Option<u64>,
    pub error_message: Option<String>,
}

impl DownloadTask {
    pub fn pending(capsule_id: CapsuleId) -> Self {
        Self {
            capsule_id,
            state: DownloadState::Pending,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: 0.0,
            eta_seconds: None,
            error_message: None,
        }
    }

    pub fn completed(capsule_id: CapsuleId) -> Self {
        Self {
            state: DownloadState::Completed,
            progress: 100.0,
            ..Self::pending(capsule_id)
        }
    }
}

/// Result of one download status read
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadPoll {
    /// The remote has no task for this capsule (yet)
    NotStarted,
    Task(DownloadTask),
}

/// Raw body of `GET /api/downloads/status/{id}`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadStatusBody {
    pub status: String,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub downloaded_bytes: u64,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub eta_seconds: Option<u64>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl DownloadStatusBody {
    pub fn into_poll(self, capsule_id: CapsuleId) -> DownloadPoll {
        if self.status.eq_ignore_ascii_case("not_started") {
            return DownloadPoll::NotStarted;
        }
        DownloadPoll::Task(DownloadTask {
            capsule_id,
            state: DownloadState::parse(&self.status),
            progress: self.progress.clamp(0.0, 100.0),
            downloaded_bytes: self.downloaded_bytes,
            total_bytes: self.total_bytes,
            speed: self.speed.max(0.0),
            eta_seconds: self.eta_seconds,
            error_message: self.error_message,
        })
    }
}

/// Request body of `POST /api/capsules/{id}/download-assets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDownloadRequest {
    pub force: bool,
    /// Queue priority (0-10)
    pub priority: u8,
}

impl Default for StartDownloadRequest {
    fn default() -> Self {
        Self {
            force: false,
            priority: 5,
        }
    }
}

/// Response of `POST /api/capsules/{id}/download-assets`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StartDownloadResponse {
    pub success: bool,
    #[serde(default)]
    pub task_id: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub already_downloaded: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Generic `{ success, error }` response of control endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Request body of `POST /api/capsules/{id}/open`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Open with only the files already present (offline mode)
    pub skip_wav_check: bool,
}

// ========================================
// Sync Envelopes
// ========================================

/// `{ success, error?, data? }` envelope used by the sync endpoints
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub data: Option<T>,
}

/// Request body of `POST /api/sync/lightweight`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LightweightSyncRequest {
    pub include_previews: bool,
    #[serde(default)]
    pub force: bool,
    /// Restrict the sync to these capsules; `None` syncs everything
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capsule_ids: Option<Vec<CapsuleId>>,
}

/// `data` of a lightweight sync response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LightweightSyncData {
    #[serde(default)]
    pub synced_count: u64,
    #[serde(default)]
    pub preview_downloaded: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    /// Free-form per-capsule errors (strings or objects)
    #[serde(default)]
    pub errors: Vec<Value>,
}

/// Request body of `POST /api/sync/download-only`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOnlyRequest {
    pub include_previews: bool,
}

/// `data` of a download-only sync response
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DownloadOnlyData {
    #[serde(default)]
    pub downloaded_count: u64,
    #[serde(default)]
    pub preview_downloaded: u64,
    #[serde(default)]
    pub duration_seconds: f64,
    #[serde(default)]
    pub errors: Vec<Value>,
}

/// `data` of `POST /api/sync/sync-tags`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TagSyncData {
    #[serde(default)]
    pub uploaded: u64,
    #[serde(default)]
    pub downloaded: u64,
}

/// `data` of `GET /api/sync/status`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SyncStatusData {
    #[serde(default)]
    pub last_sync_at: Option<String>,
    #[serde(default)]
    pub synced_count: u64,
    #[serde(default)]
    pub pending_count: u64,
    #[serde(default)]
    pub conflict_count: u64,
    /// Cloud-side changes waiting to be downloaded
    #[serde(default)]
    pub remote_pending: u64,
}

impl SyncStatusData {
    /// Parse `last_sync_at`, accepting RFC 3339 and naive ISO timestamps (assumed UTC)
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        let raw = self.last_sync_at.as_deref()?.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

// ========================================
// Upload Progress
// ========================================

/// Terminal-ness of an upload progress report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStage {
    Uploading,
    Completed,
    Error,
}

impl UploadStage {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "completed" => UploadStage::Completed,
            "error" | "failed" => UploadStage::Error,
            _ => UploadStage::Uploading,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStage::Uploading)
    }
}

/// Raw `data` of `GET /api/sync/upload-progress`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UploadProgressBody {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub current_file: Option<String>,
    #[serde(default)]
    pub percent: Option<f64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One polled upload progress report for a capsule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgressEvent {
    pub capsule_id: CapsuleId,
    pub stage: Option<String>,
    pub current_file: Option<String>,
    pub percent: Option<f64>,
    pub status: UploadStage,
    pub message: Option<String>,
}

impl UploadProgressEvent {
    pub fn from_body(capsule_id: CapsuleId, body: UploadProgressBody) -> Self {
        Self {
            capsule_id,
            stage: body.stage,
            current_file: body.current_file,
            percent: body.percent,
            status: body
                .status
                .as_deref()
                .map(UploadStage::parse)
                .unwrap_or(UploadStage::Uploading),
            message: body.message,
        }
    }

    /// User-facing line: `"<stage> · <file> NN%"`
    pub fn status_text(&self) -> String {
        let mut text = self
            .stage
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "Uploading".to_string());
        if let Some(file) = self.current_file.as_deref().filter(|f| !f.is_empty()) {
            text.push_str(" · ");
            text.push_str(file);
        }
        if let Some(percent) = self.percent {
            text.push_str(&format!(" {}%", percent.round() as i64));
        }
        text
    }
}

// ========================================
// Authentication
// ========================================

/// Request body of `POST /api/auth/refresh`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// `data` of a token refresh response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RefreshData {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Render a free-form sync error entry as text
pub fn error_entry_text(entry: &Value) -> String {
    match entry {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("error")
            .or_else(|| map.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| entry.to_string()),
        other => other.to_string(),
    }
}
